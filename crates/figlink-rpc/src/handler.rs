//! JSON-RPC request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use figlink_core::{
    BridgeError, BulkOptions, CommandOutcome, CommandRequest, PeerSender, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND: i32 = -32601;

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "pluginConnected": state.gateway.is_connected(),
    }))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method.as_str();
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id;

    debug!("RPC call: {}({:?})", method, params);

    let result = match method {
        "health_check" => Ok(json!({"status": "ok"})),
        "plugin_status" => plugin_status(&state),
        "send_command" => send_command(&state, &params).await,
        "bulk_command" => bulk_command(&state, &params).await,
        _ => {
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )),
            );
        }
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

// ============================================================================
// Helper macros for extracting parameters
// ============================================================================

/// Extract a required string parameter or return an error.
macro_rules! require_str_param {
    ($params:expr, $name:literal) => {
        match $params.get($name).and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => {
                return Err(BridgeError::InvalidParams {
                    message: format!("Missing required parameter: {}", $name),
                });
            }
        }
    };
}

/// Extract an optional parameter, supporting both snake_case and camelCase.
macro_rules! get_param {
    ($params:expr, $snake:literal, $camel:literal) => {
        $params.get($snake).or_else(|| $params.get($camel))
    };
}

// ============================================================================
// Methods
// ============================================================================

fn plugin_status(state: &AppState) -> Result<Value> {
    Ok(serde_json::to_value(state.gateway.snapshot())?)
}

/// `{type, payload?, timeoutMs?}` -> `{success, data?, error?}`
async fn send_command(state: &AppState, params: &Value) -> Result<Value> {
    let kind = require_str_param!(params, "type");
    let payload = params
        .get("payload")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let timeout = get_param!(params, "timeout_ms", "timeoutMs").and_then(Value::as_u64);

    let outcome: CommandOutcome = match timeout {
        Some(ms) => state
            .gateway
            .send_with_timeout(&kind, payload, Duration::from_millis(ms))
            .await
            .into(),
        None => {
            state
                .gateway
                .send_to_peer(CommandRequest::new(kind, payload))
                .await
        }
    };
    Ok(serde_json::to_value(outcome)?)
}

/// `{type, params, bulkParams, failFast?}` -> bulk result, or a single
/// command outcome when no bulk parameter holds several values
async fn bulk_command(state: &AppState, params: &Value) -> Result<Value> {
    let kind = require_str_param!(params, "type");
    let command = match params.get("params") {
        Some(Value::Object(map)) => map.clone(),
        _ => {
            return Err(BridgeError::InvalidParams {
                message: "Missing required parameter: params (object)".into(),
            })
        }
    };
    let bulk_params: Vec<String> = match get_param!(params, "bulk_params", "bulkParams") {
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(|name| name.as_str().map(str::to_string))
            .collect(),
        _ => {
            return Err(BridgeError::InvalidParams {
                message: "Missing required parameter: bulkParams (array of names)".into(),
            })
        }
    };

    let options = match get_param!(params, "fail_fast", "failFast").and_then(Value::as_bool) {
        Some(fail_fast) => BulkOptions { fail_fast },
        None => BulkOptions::from_params(&command),
    };

    let execution = state
        .gateway
        .execute(&kind, &command, &bulk_params, options)
        .await?;
    Ok(serde_json::to_value(execution)?)
}
