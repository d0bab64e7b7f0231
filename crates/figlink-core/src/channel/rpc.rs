//! Request/response over the fire-and-forget transport.
//!
//! `RpcChannel::send` allocates a correlation id, registers it with its
//! deadline, hands the frame to the transport and waits. The reply, the
//! deadline and a disconnect race to settle the request; the correlation
//! table guarantees exactly one of them wins.

use super::correlation::CorrelationTable;
use super::protocol::{PeerIdentity, PeerReply, PeerRequest};
use super::transport::{DisconnectReason, PeerEvents, TransportHandle};
use crate::config::TransportConfig;
use crate::{BridgeError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where outbound frames go.
pub trait FrameTransport: Send + Sync {
    /// Queue one frame for the peer. Does not wait for a reply.
    fn transmit(&self, frame: String) -> Result<()>;

    fn is_connected(&self) -> bool;
}

impl FrameTransport for TransportHandle {
    fn transmit(&self, frame: String) -> Result<()> {
        self.send(frame)
    }

    fn is_connected(&self) -> bool {
        TransportHandle::is_connected(self)
    }
}

/// Correlated request/response on top of a [`FrameTransport`].
#[derive(Clone)]
pub struct RpcChannel {
    table: Arc<CorrelationTable>,
    transport: Arc<dyn FrameTransport>,
    default_timeout: Duration,
}

impl RpcChannel {
    pub fn new(table: Arc<CorrelationTable>, transport: Arc<dyn FrameTransport>) -> Self {
        Self {
            table,
            transport,
            default_timeout: TransportConfig::REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send with the default timeout.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<Value> {
        self.send_with_timeout(kind, payload, self.default_timeout)
            .await
    }

    /// Send one command and wait for its reply.
    ///
    /// Fails with `NotConnected` without registering anything when no peer
    /// has identified itself.
    pub async fn send_with_timeout(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.transport.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let request = PeerRequest::new(kind, payload);
        let frame = request.encode()?;
        let id = request.id;
        let receiver = self.table.register(id.clone(), kind, timeout)?;

        if let Err(e) = self.transport.transmit(frame) {
            self.table.cancel(&id);
            debug!(%id, kind, "Failed to transmit request: {}", e);
            return Err(e);
        }
        debug!(%id, kind, ?timeout, "Request sent");

        match receiver.await {
            Ok(outcome) => outcome,
            // The table was dropped with the request still in it.
            Err(_) => Err(BridgeError::connection_closed("request abandoned")),
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("pending", &self.table.len())
            .field("connected", &self.transport.is_connected())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Listener events routed into the correlation table.
pub struct TableEvents {
    table: Arc<CorrelationTable>,
}

impl TableEvents {
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self { table }
    }
}

impl PeerEvents for TableEvents {
    fn on_peer_connected(&self, identity: &PeerIdentity) {
        info!(
            name = identity.name.as_deref().unwrap_or("unknown"),
            "Gateway ready for requests"
        );
    }

    fn on_peer_disconnected(&self, reason: DisconnectReason) {
        self.table.reject_all(&reason.to_string());
    }

    fn on_reply(&self, reply: PeerReply) {
        self.table.resolve(reply);
    }
}
