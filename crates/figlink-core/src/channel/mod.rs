//! Correlated request/response channel to the plugin peer.
//!
//! Layers, bottom up:
//! - `protocol`: frame shapes and classification
//! - `transport`: WebSocket listener, peer slot and heartbeat liveness
//! - `router`: inbound frame kind -> handler
//! - `correlation`: pending requests keyed by correlation id
//! - `rpc`: `send` on top of the above
//! - `command`: typed commands and the handler-facing `PeerSender` seam

pub mod command;
pub mod correlation;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod transport;

pub use command::{CommandOutcome, CommandRequest, PeerCommand, PeerSender, Ping, Pong};
pub use correlation::{CorrelationTable, PendingReceiver, PendingRequest};
pub use protocol::{
    heartbeat_frame, CorrelationId, FrameKind, InboundFrame, PeerIdentity, PeerReply, PeerRequest,
    HEARTBEAT_FRAME_TYPE, HELLO_FRAME_TYPE,
};
pub use router::{FrameRouter, Route, RouteContext};
pub use rpc::{FrameTransport, RpcChannel, TableEvents};
pub use transport::{
    ConnectionHandle, ConnectionState, DisconnectReason, ListenerCore, PeerEvents, TransportHandle,
    TransportListener,
};
