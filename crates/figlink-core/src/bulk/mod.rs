//! Bulk command expansion.
//!
//! A command whose declared bulk parameters hold arrays fans out into one
//! command per item. Shorter arrays and scalars are cycled to the longest
//! array's length:
//!
//! ```text
//! {nodeId: [a, b, c], color: [red, blue], opacity: 0.5}
//!   -> {nodeId: a, color: red,  opacity: 0.5}
//!   -> {nodeId: b, color: blue, opacity: 0.5}
//!   -> {nodeId: c, color: red,  opacity: 0.5}
//! ```
//!
//! Items run one after another, in order. With `failFast` the first failure
//! stops the rest.

mod plan;
mod result;

pub use plan::{extract_single_values, fanout_length, is_bulk, BulkPlan, Params};
pub use result::{BulkResult, ItemOutcome};

use crate::config::BulkConfig;
use crate::Result;
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info, warn};

/// Options that ride along with the bulk parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Stop at the first failed item.
    pub fail_fast: bool,
}

impl BulkOptions {
    pub fn fail_fast() -> Self {
        Self { fail_fast: true }
    }

    /// Read options from the command parameters. Accepts `failFast` and
    /// `fail_fast`; anything that is not a boolean counts as false.
    pub fn from_params(params: &Params) -> Self {
        let fail_fast = [BulkConfig::FAIL_FAST_PARAM_CAMEL, BulkConfig::FAIL_FAST_PARAM]
            .iter()
            .find_map(|key| params.get(*key).and_then(Value::as_bool))
            .unwrap_or(false);
        Self { fail_fast }
    }

    /// Remove the option keys so they are not forwarded to the peer.
    pub fn strip_from(params: &mut Params) {
        params.remove(BulkConfig::FAIL_FAST_PARAM_CAMEL);
        params.remove(BulkConfig::FAIL_FAST_PARAM);
    }
}

/// Fan `params` out and run `send` once per item.
///
/// `validate` sees every item before it is sent; a rejected item counts as a
/// failure without reaching `send`. Planning errors (an empty bulk array next
/// to a non-empty one) fail the whole call before anything is sent.
pub async fn expand_and_execute<S, V, F, Fut>(
    params: &Params,
    bulk_params: &[S],
    mut validate: V,
    mut send: F,
    options: BulkOptions,
) -> Result<BulkResult>
where
    S: AsRef<str>,
    V: FnMut(&Params) -> std::result::Result<(), String>,
    F: FnMut(Params) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let mut params = params.clone();
    BulkOptions::strip_from(&mut params);
    let plan = BulkPlan::build(&params, bulk_params)?;
    let mut result = BulkResult::with_planned(plan.fanout_length());
    debug!(
        items = plan.fanout_length(),
        fail_fast = options.fail_fast,
        "Expanding bulk command"
    );

    let planned = result.planned;
    for (index, item) in plan.into_items().into_iter().enumerate() {
        let failed = match validate(&item) {
            Err(reason) => {
                debug!(index, "Bulk item rejected: {}", reason);
                result.record_failure(index, reason);
                true
            }
            Ok(()) => match send(item).await {
                Ok(data) => {
                    result.record_success(index, data);
                    false
                }
                Err(e) => {
                    debug!(index, "Bulk item failed: {}", e);
                    result.record_failure(index, e.to_string());
                    true
                }
            },
        };

        if failed && options.fail_fast && index + 1 < planned {
            warn!(
                index,
                skipped = planned - index - 1,
                "Bulk command stopped at first failure"
            );
            result.aborted = true;
            break;
        }
    }

    info!(
        planned,
        succeeded = result.success_count,
        failed = result.error_count,
        "Bulk command finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    const BULK: &[&str] = &["nodeId", "color"];

    fn accept_all(_: &Params) -> std::result::Result<(), String> {
        Ok(())
    }

    #[test]
    fn test_options_from_params() {
        assert!(BulkOptions::from_params(&params(json!({"failFast": true}))).fail_fast);
        assert!(BulkOptions::from_params(&params(json!({"fail_fast": true}))).fail_fast);
        assert!(!BulkOptions::from_params(&params(json!({"failFast": "yes"}))).fail_fast);
        assert!(!BulkOptions::from_params(&params(json!({}))).fail_fast);
    }

    #[tokio::test]
    async fn test_option_keys_are_not_forwarded() {
        let command = params(json!({"nodeId": ["1:1", "1:2"], "failFast": true, "fail_fast": true}));
        let options = BulkOptions::from_params(&command);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();

        let result = expand_and_execute(
            &command,
            BULK,
            accept_all,
            move |item: Params| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(item);
                    Ok(json!(null))
                }
            },
            options,
        )
        .await
        .unwrap();

        assert!(options.fail_fast);
        assert_eq!(result.success_count, 2);
        for item in sent.lock().unwrap().iter() {
            assert!(!item.contains_key("failFast"));
            assert!(!item.contains_key("fail_fast"));
            assert!(item.contains_key("nodeId"));
        }
    }

    #[tokio::test]
    async fn test_every_item_runs_in_order() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let result = expand_and_execute(
            &params(json!({"nodeId": ["1:1", "1:2", "1:3"], "color": ["#f00", "#0f0"]})),
            BULK,
            accept_all,
            move |item: Params| {
                let log = log.clone();
                async move {
                    let id = item["nodeId"].clone();
                    log.lock().unwrap().push((id.clone(), item["color"].clone()));
                    Ok(json!({"id": id}))
                }
            },
            BulkOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.success_count, 3);
        assert_eq!(result.error_count, 0);
        assert!(result.all_succeeded());
        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (json!("1:1"), json!("#f00")),
                (json!("1:2"), json!("#0f0")),
                (json!("1:3"), json!("#f00")),
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_first_failure() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let result = expand_and_execute(
            &params(json!({"nodeId": ["ok", "bad", "never"]})),
            BULK,
            accept_all,
            move |item: Params| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    if item["nodeId"] == "bad" {
                        Err(BridgeError::PeerRejected("Node not found".into()))
                    } else {
                        Ok(json!(true))
                    }
                }
            },
            BulkOptions::fail_fast(),
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.planned, 3);
        assert!(result.aborted);
        assert_eq!(result.outcomes[1].error.as_deref(), Some("Node not found"));
    }

    #[tokio::test]
    async fn test_without_fail_fast_failures_do_not_stop_the_rest() {
        let result = expand_and_execute(
            &params(json!({"nodeId": ["bad", "ok", "bad"]})),
            BULK,
            accept_all,
            |item: Params| async move {
                if item["nodeId"] == "bad" {
                    Err(BridgeError::PeerRejected("nope".into()))
                } else {
                    Ok(json!(null))
                }
            },
            BulkOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.attempted(), 3);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.error_count, 2);
        assert!(!result.aborted);
    }

    #[tokio::test]
    async fn test_validation_failure_counts_without_sending() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let result = expand_and_execute(
            &params(json!({"nodeId": ["1:1", ""]})),
            BULK,
            |item: &Params| match item["nodeId"].as_str() {
                Some(id) if !id.is_empty() => Ok(()),
                _ => Err("nodeId must not be empty".to_string()),
            },
            move |_item: Params| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(json!(true))
                }
            },
            BulkOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(result.error_count, 1);
        assert_eq!(
            result.outcomes[1].error.as_deref(),
            Some("nodeId must not be empty")
        );
    }

    #[tokio::test]
    async fn test_failure_on_last_item_is_not_an_abort() {
        let result = expand_and_execute(
            &params(json!({"nodeId": ["ok", "bad"]})),
            BULK,
            accept_all,
            |item: Params| async move {
                if item["nodeId"] == "bad" {
                    Err(BridgeError::PeerRejected("nope".into()))
                } else {
                    Ok(json!(null))
                }
            },
            BulkOptions::fail_fast(),
        )
        .await
        .unwrap();

        assert_eq!(result.attempted(), 2);
        assert!(!result.aborted);
    }

    #[tokio::test]
    async fn test_planning_error_sends_nothing() {
        let result = expand_and_execute(
            &params(json!({"nodeId": ["a", "b"], "color": []})),
            BULK,
            accept_all,
            |_item: Params| async move { Ok(json!(null)) },
            BulkOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::Validation { .. })));
    }
}
