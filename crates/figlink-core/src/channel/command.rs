//! Command shapes used by domain handlers.
//!
//! Domain handlers own their payload schemas. The core only needs a command
//! kind, a serializable payload and, for typed calls, the shape of the data
//! the peer answers with.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command with a fixed kind and a typed reply.
pub trait PeerCommand: Serialize {
    /// Value of the `type` field on the wire.
    const KIND: &'static str;

    /// Shape of the reply's `data`.
    type Output: DeserializeOwned;
}

/// Liveness round trip through the peer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ping {}

/// Reply to [`Ping`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

impl PeerCommand for Ping {
    const KIND: &'static str = "PING";
    type Output = Pong;
}

/// Untyped command as domain handlers build it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl CommandRequest {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Settled outcome of one command; never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl From<crate::Result<Value>> for CommandOutcome {
    fn from(result: crate::Result<Value>) -> Self {
        match result {
            Ok(data) => CommandOutcome::ok(data),
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }
}

/// The one integration point domain handlers use to reach the peer.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_to_peer(&self, request: CommandRequest) -> CommandOutcome;
}
