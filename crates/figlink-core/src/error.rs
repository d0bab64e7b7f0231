//! Error types for the plugin bridge.
//!
//! Per-request failures (`NotConnected`, `Timeout`, `PeerRejected`,
//! `ConnectionClosed`) reach the caller of `send`; `PortExhausted` aborts
//! startup; `MalformedFrame` never leaves the transport listener.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Per-request errors
    #[error("Plugin peer is not connected")]
    NotConnected,

    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("{0}")]
    PeerRejected(String),

    #[error("Connection to plugin peer closed: {reason}")]
    ConnectionClosed { reason: String },

    // Startup errors
    #[error("No free port in range {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    // Transport-internal errors
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    // Process management errors
    #[error("Failed to terminate process {pid}: {message}")]
    ProcessTermination { pid: u32, message: String },

    // File system / socket errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Build a `ConnectionClosed` error with the given reason.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        BridgeError::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Peer not connected / connection closed
    /// - -32001: Request timed out
    /// - -32002: Peer rejected the command
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::NotConnected | BridgeError::ConnectionClosed { .. } => -32000,

            BridgeError::Timeout { .. } => -32001,

            BridgeError::PeerRejected(_) => -32002,

            BridgeError::Validation { .. } => -32005,

            BridgeError::InvalidParams { .. } => -32602,

            _ => -32603,
        }
    }

    /// Check if the caller could reasonably retry the request.
    ///
    /// The core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::NotConnected
                | BridgeError::Timeout { .. }
                | BridgeError::ConnectionClosed { .. }
        )
    }
}
