//! Wire frames exchanged with the plugin peer.
//!
//! Every frame is a single JSON object carried in one WebSocket text message.
//!
//! ```text
//! bridge -> peer   {"id": "...", "type": "CREATE_RECTANGLE", "payload": {...}}
//! peer -> bridge   {"id": "...", "success": true,  "data": {...}}
//! peer -> bridge   {"id": "...", "success": false, "error": "..."}
//! peer -> bridge   {"type": "PLUGIN_HELLO", "payload": {"name": "...", ...}}
//! either way       {"type": "HEARTBEAT", "payload": {"timestamp": 1700000000000}}
//! ```

use crate::config::TransportConfig;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

/// `type` of the identification frame sent once by the peer.
pub const HELLO_FRAME_TYPE: &str = "PLUGIN_HELLO";

/// `type` of liveness frames.
pub const HEARTBEAT_FRAME_TYPE: &str = "HEARTBEAT";

/// Token matching a request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, process-unique id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub id: CorrelationId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl PeerRequest {
    /// Create a request under a freshly generated correlation id.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: CorrelationId::new(),
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize to the text carried on the socket.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reply from the peer to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerReply {
    /// Create a success reply.
    pub fn success(id: CorrelationId, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create a failure reply.
    pub fn failure(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Turn the reply into what the caller of `send` receives.
    ///
    /// The peer's error string is surfaced verbatim.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::PeerRejected(self.error.unwrap_or_else(|| {
                "peer reported failure without an error message".to_string()
            })))
        }
    }
}

/// Details the peer announces in its hello frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Document the plugin is running in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Discriminant of an inbound frame, used as the router key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Hello,
    Heartbeat,
    Reply,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Hello => f.write_str("hello"),
            FrameKind::Heartbeat => f.write_str("heartbeat"),
            FrameKind::Reply => f.write_str("reply"),
        }
    }
}

/// A validated frame received from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Hello(PeerIdentity),
    Heartbeat { timestamp: Option<i64> },
    Reply(PeerReply),
}

impl InboundFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            InboundFrame::Hello(_) => FrameKind::Hello,
            InboundFrame::Heartbeat { .. } => FrameKind::Heartbeat,
            InboundFrame::Reply(_) => FrameKind::Reply,
        }
    }

    /// Classify raw socket text into one of the known frame shapes.
    ///
    /// Anything that is not a JSON object of a known shape is a
    /// `MalformedFrame`.
    pub fn parse(text: &str) -> Result<Self> {
        if text.len() > TransportConfig::MAX_FRAME_BYTES {
            return Err(malformed(format!(
                "frame size {} exceeds maximum {}",
                text.len(),
                TransportConfig::MAX_FRAME_BYTES
            )));
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(malformed("frame is not a JSON object"));
        };

        match object.get("type").and_then(Value::as_str) {
            Some(HEARTBEAT_FRAME_TYPE) => {
                let timestamp = object
                    .get("payload")
                    .and_then(|p| p.get("timestamp"))
                    .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)));
                return Ok(InboundFrame::Heartbeat { timestamp });
            }
            Some(HELLO_FRAME_TYPE) => {
                let identity = object
                    .remove("payload")
                    .and_then(|p| serde_json::from_value(p).ok())
                    .unwrap_or_default();
                return Ok(InboundFrame::Hello(identity));
            }
            _ => {}
        }

        let has_id = object.get("id").is_some_and(Value::is_string);
        let has_success = object.get("success").is_some_and(Value::is_boolean);
        if has_id && has_success {
            let reply: PeerReply = serde_json::from_value(Value::Object(object))
                .map_err(|e| malformed(format!("invalid reply: {}", e)))?;
            return Ok(InboundFrame::Reply(reply));
        }

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<none>")
            .to_string();
        Err(malformed(format!("unrecognized frame (type {})", kind)))
    }
}

/// Encode a heartbeat frame (also used to echo one).
pub fn heartbeat_frame(timestamp: i64) -> String {
    json!({
        "type": HEARTBEAT_FRAME_TYPE,
        "payload": { "timestamp": timestamp },
    })
    .to_string()
}

fn malformed(message: impl Into<String>) -> BridgeError {
    BridgeError::MalformedFrame {
        message: message.into(),
    }
}
