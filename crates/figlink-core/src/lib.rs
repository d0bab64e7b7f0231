//! Figlink Core - request/response channel between automation clients and a
//! Figma plugin.
//!
//! The plugin runs inside Figma's sandbox and connects out over a WebSocket.
//! This crate listens for it, pairs every command with its reply through a
//! correlation id, detects a silently dead plugin with heartbeats and fans
//! bulk commands out into per-item requests.
//!
//! # Example
//!
//! ```rust,ignore
//! use figlink_core::{BridgeConfig, PeerGateway};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> figlink_core::Result<()> {
//!     let gateway = PeerGateway::start(BridgeConfig::default()).await?;
//!     println!("Plugin should connect to port {}", gateway.port());
//!
//!     gateway.wait_for_peer(Duration::from_secs(60)).await?;
//!     let node = gateway.send("GET_NODE_INFO", json!({"nodeId": "1:2"})).await?;
//!     println!("{}", node);
//!
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod channel;
pub mod config;
pub mod error;
pub mod platform;
pub mod port;

mod gateway;

// Re-export commonly used types
pub use bulk::{expand_and_execute, BulkOptions, BulkPlan, BulkResult, ItemOutcome, Params};
pub use channel::{
    CommandOutcome, CommandRequest, ConnectionState, CorrelationId, DisconnectReason,
    PeerCommand, PeerIdentity, PeerReply, PeerRequest, PeerSender, Ping, Pong,
};
pub use config::{BridgeConfig, BulkConfig, PortConfig, TransportConfig};
pub use error::{BridgeError, Result};
pub use gateway::{CommandExecution, ConnectionSnapshot, PeerGateway};
pub use port::{PortOwner, PortPolicy, PortReservation, ProcessInspector, SystemProcessInspector};
