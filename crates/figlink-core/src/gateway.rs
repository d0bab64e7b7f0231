//! The bridge as domain handlers see it.
//!
//! `PeerGateway` owns the listener, the correlation table and the port it
//! ended up on. Construct one at startup and pass it (or an `Arc` of it) to
//! whatever needs to talk to the plugin; there is no process-wide instance.

use crate::bulk::{self, BulkOptions, BulkResult, Params};
use crate::channel::{
    CommandOutcome, CommandRequest, ConnectionState, CorrelationTable, PeerCommand, PeerIdentity,
    PeerSender, RpcChannel, TableEvents, TransportHandle, TransportListener,
};
use crate::config::BridgeConfig;
use crate::port::{PortPolicy, PortReservation, ProcessInspector, SystemProcessInspector};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Point-in-time view of the bridge for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub port: u16,
    pub active_peer_count: usize,
    pub pending_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_heartbeat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerIdentity>,
}

/// What happened to a command that declares bulk parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandExecution {
    /// Not bulk: sent once, one-element arrays unwrapped.
    Single(CommandOutcome),
    /// Fanned out into one command per item.
    Bulk(BulkResult),
}

/// Request/response access to the plugin peer.
pub struct PeerGateway {
    transport: Arc<TransportHandle>,
    channel: RpcChannel,
}

impl PeerGateway {
    /// Reserve the peer port, start listening and return the gateway.
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        Self::start_with_inspector(config, Arc::new(SystemProcessInspector)).await
    }

    /// Like `start`, with custom port-owner lookup and termination.
    pub async fn start_with_inspector(
        config: BridgeConfig,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        let port = if config.preferred_port == 0 {
            0
        } else {
            PortReservation::new(PortPolicy::from(&config), inspector)
                .acquire(config.preferred_port)
                .await?
        };

        let table = Arc::new(CorrelationTable::new());
        let events = Arc::new(TableEvents::new(table.clone()));
        let transport = Arc::new(TransportListener::start(&config, port, events).await?);
        let channel = RpcChannel::new(table, transport.clone())
            .with_default_timeout(config.request_timeout);

        info!(
            port = transport.port(),
            preferred = config.preferred_port,
            "Plugin gateway started"
        );

        Ok(Self { transport, channel })
    }

    /// Port the plugin should connect to. May differ from the preferred one.
    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.transport.state();
        ConnectionSnapshot {
            connected: state.connected,
            port: self.port(),
            active_peer_count: state.active_peer_count,
            pending_requests: self.channel.pending_count(),
            seconds_since_heartbeat: state
                .last_heartbeat_at
                .map(|at| at.elapsed().as_secs_f64()),
            peer: self.transport.peer_identity(),
        }
    }

    /// Wait until a peer has identified itself.
    pub async fn wait_for_peer(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.transport.subscribe_connected();
        let wait = async {
            loop {
                let is_connected = *connected.borrow_and_update();
                if is_connected {
                    return Ok(());
                }
                if connected.changed().await.is_err() {
                    return Err(BridgeError::connection_closed("listener stopped"));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::NotConnected),
        }
    }

    /// Send `kind` with the configured default timeout.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<Value> {
        self.channel.send(kind, payload).await
    }

    pub async fn send_with_timeout(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.channel.send_with_timeout(kind, payload, timeout).await
    }

    /// Send a typed command and decode the reply data.
    pub async fn call<C: PeerCommand>(&self, command: &C) -> Result<C::Output> {
        let payload = serde_json::to_value(command)?;
        let data = self.send(C::KIND, payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Fan a bulk command out into one `send` per item.
    pub async fn send_bulk<S, V>(
        &self,
        kind: &str,
        params: &Params,
        bulk_params: &[S],
        validate: V,
        options: BulkOptions,
    ) -> Result<BulkResult>
    where
        S: AsRef<str>,
        V: FnMut(&Params) -> std::result::Result<(), String>,
    {
        bulk::expand_and_execute(
            params,
            bulk_params,
            validate,
            move |item| self.send(kind, Value::Object(item)),
            options,
        )
        .await
    }

    /// Send `kind` as a bulk command if its bulk parameters call for it,
    /// otherwise as a single command with one-element arrays unwrapped.
    pub async fn execute<S: AsRef<str>>(
        &self,
        kind: &str,
        params: &Params,
        bulk_params: &[S],
        options: BulkOptions,
    ) -> Result<CommandExecution> {
        if bulk::is_bulk(params, bulk_params) {
            let result = self
                .send_bulk(kind, params, bulk_params, |_| Ok(()), options)
                .await?;
            return Ok(CommandExecution::Bulk(result));
        }

        let mut single = bulk::extract_single_values(params, bulk_params);
        BulkOptions::strip_from(&mut single);
        let outcome = self
            .send_to_peer(CommandRequest::new(kind, Value::Object(single)))
            .await;
        Ok(CommandExecution::Single(outcome))
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.channel.pending_count()
    }

    /// Reject everything pending and stop the listener.
    pub fn shutdown(&self) {
        self.channel
            .table()
            .reject_all(&crate::channel::DisconnectReason::Shutdown.to_string());
        self.transport.shutdown();
    }
}

impl std::fmt::Debug for PeerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGateway")
            .field("port", &self.port())
            .field("channel", &self.channel)
            .finish()
    }
}

#[async_trait]
impl PeerSender for PeerGateway {
    async fn send_to_peer(&self, request: CommandRequest) -> CommandOutcome {
        self.send(&request.kind, request.payload).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Ping;
    use serde_json::json;

    fn config() -> BridgeConfig {
        BridgeConfig::default()
            .with_preferred_port(0)
            .with_heartbeat_interval(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port() {
        let gateway = PeerGateway::start(config()).await.unwrap();

        assert_ne!(gateway.port(), 0);
        assert!(!gateway.is_connected());

        let snapshot = gateway.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.pending_requests, 0);
        assert_eq!(snapshot.port, gateway.port());
    }

    #[tokio::test]
    async fn test_send_without_peer_fails_fast() {
        let gateway = PeerGateway::start(config()).await.unwrap();

        assert!(matches!(
            gateway.send("PING", json!({})).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(gateway.call(&Ping {}).await, Err(BridgeError::NotConnected)));
        assert_eq!(gateway.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_sender_outcome_without_peer() {
        let gateway = PeerGateway::start(config()).await.unwrap();

        let outcome = gateway
            .send_to_peer(CommandRequest::new("PING", json!({})))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Plugin peer is not connected"));
    }

    #[tokio::test]
    async fn test_wait_for_peer_times_out() {
        let gateway = PeerGateway::start(config()).await.unwrap();

        let result = gateway.wait_for_peer(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_execute_picks_single_or_bulk() {
        let gateway = PeerGateway::start(config()).await.unwrap();
        let single: Params = serde_json::from_value(json!({"nodeId": ["1:2"]})).unwrap();
        let fanned: Params = serde_json::from_value(json!({"nodeId": ["1:2", "1:3"]})).unwrap();

        match gateway
            .execute("DELETE_NODE", &single, &["nodeId"], BulkOptions::default())
            .await
            .unwrap()
        {
            CommandExecution::Single(outcome) => assert!(!outcome.success),
            other => panic!("Expected a single command, got: {:?}", other),
        }

        match gateway
            .execute("DELETE_NODE", &fanned, &["nodeId"], BulkOptions::default())
            .await
            .unwrap()
        {
            CommandExecution::Bulk(result) => {
                assert_eq!(result.planned, 2);
                assert_eq!(result.error_count, 2);
            }
            other => panic!("Expected a bulk command, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_serializes_camel_case() {
        let gateway = PeerGateway::start(config()).await.unwrap();
        let json = serde_json::to_value(gateway.snapshot()).unwrap();

        assert_eq!(json["connected"], false);
        assert_eq!(json["activePeerCount"], 0);
        assert_eq!(json["pendingRequests"], 0);
        assert!(json.get("secondsSinceHeartbeat").is_none());
    }
}
