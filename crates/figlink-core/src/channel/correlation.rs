//! Pending-request bookkeeping.
//!
//! Each in-flight request owns one entry: a oneshot sender for the caller
//! and the abort handle of its deadline timer. An entry leaves the table
//! through `claim`, which is the only removal primitive. The reply path,
//! the deadline timer and teardown all go through it, so whichever observes
//! the entry first settles the request and the others become no-ops.

use super::protocol::{CorrelationId, PeerReply};
use crate::{BridgeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Receiving half handed to the caller of `send`.
pub type PendingReceiver = oneshot::Receiver<Result<Value>>;

/// One in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    kind: String,
    sender: oneshot::Sender<Result<Value>>,
    deadline: Option<AbortHandle>,
    registered_at: Instant,
}

impl PendingRequest {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Deliver the outcome. Consumes the entry, so it can run only once.
    fn settle(mut self, outcome: Result<Value>) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.sender.send(outcome);
    }
}

/// Map from correlation id to pending request.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending request and arm its deadline.
    ///
    /// Must be called from within a tokio runtime. Fails if `id` is still
    /// pending.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        kind: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingReceiver> {
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(BridgeError::Validation {
                field: "id".to_string(),
                message: format!("correlation id {} is already pending", id),
            });
        }

        let (sender, receiver) = oneshot::channel();
        let table = Arc::downgrade(self);
        let timer_id = id.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(&timer_id, timeout);
            }
        });

        pending.insert(
            id,
            PendingRequest {
                kind: kind.into(),
                sender,
                deadline: Some(deadline.abort_handle()),
                registered_at: Instant::now(),
            },
        );

        Ok(receiver)
    }

    /// Atomically remove the entry for `id`, returning it if it was present.
    pub fn claim(&self, id: &CorrelationId) -> Option<PendingRequest> {
        self.lock().remove(id)
    }

    /// Settle the matching request with the peer's reply.
    ///
    /// Returns false when nothing was pending under that id (late reply
    /// after a timeout, or a stray id).
    pub fn resolve(&self, reply: PeerReply) -> bool {
        match self.claim(&reply.id) {
            Some(request) => {
                debug!(
                    id = %reply.id,
                    kind = request.kind(),
                    success = reply.success,
                    elapsed_ms = request.age().as_millis() as u64,
                    "Reply matched pending request"
                );
                request.settle(reply.into_result());
                true
            }
            None => {
                debug!(id = %reply.id, "Dropping reply with no pending request");
                false
            }
        }
    }

    /// Deadline path: reject with `Timeout` if still pending.
    pub fn expire(&self, id: &CorrelationId, timeout: Duration) -> bool {
        match self.claim(id) {
            Some(request) => {
                warn!(id = %id, kind = request.kind(), ?timeout, "Request timed out");
                request.settle(Err(BridgeError::Timeout {
                    id: id.to_string(),
                    timeout,
                }));
                true
            }
            None => false,
        }
    }

    /// Drop a request without notifying anyone; used when the frame never
    /// left and the caller already has the error.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        match self.claim(id) {
            Some(mut request) => {
                if let Some(deadline) = request.deadline.take() {
                    deadline.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with `ConnectionClosed`.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, request)| request).collect();
        let count = drained.len();
        if count > 0 {
            warn!(count, reason, "Rejecting pending requests");
        }
        for request in drained {
            request.settle(Err(BridgeError::connection_closed(reason)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }
}
