//! WebSocket listener for the plugin peer.
//!
//! Accepts any number of sockets, but only a connection that sent the hello
//! frame becomes *the* peer. Other sockets (probes, health checks) can still
//! exchange heartbeats without touching the peer slot.
//!
//! # Liveness
//!
//! A background task probes the peer every heartbeat interval and flags it
//! stale once `2 x interval` passes without a heartbeat. A stale peer is
//! disconnected right away so pending requests fail fast instead of waiting
//! for their deadlines.
//!
//! # Identification policy
//!
//! The most recent hello wins. When a second connection identifies itself
//! the previous peer is demoted and closed, and requests sent to it are
//! rejected as `ConnectionClosed`.

use super::protocol::{heartbeat_frame, InboundFrame, PeerIdentity, PeerReply};
use super::router::{FrameRouter, RouteContext};
use crate::config::{BridgeConfig, TransportConfig};
use crate::{BridgeError, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why the peer slot was emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The socket closed.
    Closed,
    /// No heartbeat within twice the heartbeat interval.
    Stale,
    /// Another connection identified itself as the peer.
    Replaced,
    /// The listener is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("peer disconnected"),
            DisconnectReason::Stale => f.write_str("peer heartbeat lost"),
            DisconnectReason::Replaced => f.write_str("peer replaced by a new connection"),
            DisconnectReason::Shutdown => f.write_str("bridge shutting down"),
        }
    }
}

/// Callbacks from the listener to whoever owns the pending requests.
///
/// Called outside the listener's state lock, never concurrently for the
/// same event.
pub trait PeerEvents: Send + Sync + 'static {
    fn on_peer_connected(&self, _identity: &PeerIdentity) {}

    fn on_peer_disconnected(&self, _reason: DisconnectReason) {}

    fn on_reply(&self, reply: PeerReply);
}

/// Snapshot of the peer slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    /// A peer has identified itself and has not gone away since.
    pub connected: bool,
    /// Last heartbeat (or hello) received from the peer.
    pub last_heartbeat_at: Option<Instant>,
    /// Open sockets on the listener, identified or not.
    pub active_peer_count: usize,
}

/// One accepted socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    remote: SocketAddr,
    outbound: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn push(&self, frame: String) -> Result<()> {
        self.outbound
            .try_send(Message::Text(frame))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BridgeError::Other(format!("outbound queue full for connection {}", self.id))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    BridgeError::connection_closed("socket writer stopped")
                }
            })
    }

    fn close(&self) {
        let _ = self.outbound.try_send(Message::Close(None));
    }
}

#[derive(Debug)]
struct PeerSlot {
    connection: ConnectionHandle,
    identity: PeerIdentity,
}

#[derive(Debug, Default)]
struct ListenerState {
    connection: ConnectionState,
    peer: Option<PeerSlot>,
    sockets: HashMap<Uuid, ConnectionHandle>,
    /// Stamps of heartbeats we sent recently (probes and echoes). A
    /// heartbeat carrying one of them is never echoed again.
    sent_heartbeats: VecDeque<i64>,
}

impl ListenerState {
    fn remember_heartbeat(&mut self, stamp: i64) {
        if self.sent_heartbeats.contains(&stamp) {
            return;
        }
        if self.sent_heartbeats.len() >= TransportConfig::RECENT_HEARTBEATS {
            self.sent_heartbeats.pop_front();
        }
        self.sent_heartbeats.push_back(stamp);
    }
}

/// State shared by the accept loop, socket tasks and the liveness task.
pub struct ListenerCore {
    state: Mutex<ListenerState>,
    events: Arc<dyn PeerEvents>,
    router: FrameRouter,
    stale_after: Duration,
    connected_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerCore {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_peer(state: &ListenerState, connection: &ConnectionHandle) -> bool {
        state
            .peer
            .as_ref()
            .is_some_and(|slot| slot.connection.id == connection.id)
    }

    fn connection_opened(&self, connection: &ConnectionHandle) {
        let mut state = self.lock();
        state.sockets.insert(connection.id, connection.clone());
        state.connection.active_peer_count = state.sockets.len();
        info!(
            connection = %connection.id,
            remote = %connection.remote,
            open = state.sockets.len(),
            "Socket connected"
        );
    }

    fn connection_closed(&self, connection: &ConnectionHandle) {
        let was_peer = {
            let mut state = self.lock();
            state.sockets.remove(&connection.id);
            state.connection.active_peer_count = state.sockets.len();
            if Self::is_peer(&state, connection) {
                state.peer = None;
                state.connection.connected = false;
                state.connection.last_heartbeat_at = None;
                true
            } else {
                false
            }
        };

        info!(connection = %connection.id, was_peer, "Socket closed");
        if was_peer {
            self.connected_tx.send_replace(false);
            self.events.on_peer_disconnected(DisconnectReason::Closed);
        }
    }

    /// Parse one text frame and hand it to the router. Bad frames are
    /// logged and dropped.
    fn handle_text(&self, connection: &ConnectionHandle, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %connection.id, "Dropping frame: {}", e);
                return;
            }
        };

        let ctx = RouteContext {
            listener: self,
            connection,
        };
        self.router.dispatch(&ctx, frame);
    }

    /// Make `connection` the peer.
    ///
    /// A previous peer is unset and its requests rejected before the new
    /// one is installed.
    pub fn identify_peer(&self, connection: &ConnectionHandle, identity: PeerIdentity) {
        loop {
            let previous = {
                let mut state = self.lock();
                if Self::is_peer(&state, connection) {
                    debug!(connection = %connection.id, "Repeated hello from current peer");
                    state.connection.last_heartbeat_at = Some(Instant::now());
                    if let Some(slot) = state.peer.as_mut() {
                        slot.identity = identity;
                    }
                    return;
                }

                match state.peer.take() {
                    Some(previous) => {
                        state.connection.connected = false;
                        state.connection.last_heartbeat_at = None;
                        previous
                    }
                    None => {
                        state.peer = Some(PeerSlot {
                            connection: connection.clone(),
                            identity: identity.clone(),
                        });
                        state.connection.connected = true;
                        state.connection.last_heartbeat_at = Some(Instant::now());
                        break;
                    }
                }
            };

            warn!(
                old = %previous.connection.id,
                new = %connection.id,
                "New peer identified; closing previous peer connection"
            );
            previous.connection.close();
            self.events.on_peer_disconnected(DisconnectReason::Replaced);
        }

        info!(
            connection = %connection.id,
            name = identity.name.as_deref().unwrap_or("unknown"),
            version = identity.version.as_deref().unwrap_or("unknown"),
            "Plugin peer identified"
        );
        self.connected_tx.send_replace(true);
        self.events.on_peer_connected(&identity);
    }

    /// Stamp liveness and echo heartbeats that did not start on our side.
    pub fn record_heartbeat(&self, connection: &ConnectionHandle, timestamp: Option<i64>) {
        let stamp = {
            let mut state = self.lock();
            if Self::is_peer(&state, connection) {
                state.connection.last_heartbeat_at = Some(Instant::now());
            }
            match timestamp {
                Some(stamp) if state.sent_heartbeats.contains(&stamp) => None,
                Some(stamp) => {
                    state.remember_heartbeat(stamp);
                    Some(stamp)
                }
                None => {
                    let stamp = chrono::Utc::now().timestamp_millis();
                    state.remember_heartbeat(stamp);
                    Some(stamp)
                }
            }
        };

        let Some(stamp) = stamp else {
            debug!(connection = %connection.id, "Heartbeat echo received");
            return;
        };
        if let Err(e) = connection.push(heartbeat_frame(stamp)) {
            debug!(connection = %connection.id, "Failed to echo heartbeat: {}", e);
        }
    }

    /// Forward a reply to the gateway if it came from the peer.
    pub fn deliver_reply(&self, connection: &ConnectionHandle, reply: PeerReply) {
        let from_peer = Self::is_peer(&self.lock(), connection);
        if from_peer {
            self.events.on_reply(reply);
        } else {
            warn!(
                connection = %connection.id,
                id = %reply.id,
                "Ignoring reply from a connection that is not the peer"
            );
        }
    }

    /// Queue a frame for the peer.
    fn send_to_peer(&self, frame: String) -> Result<()> {
        let state = self.lock();
        match state.peer.as_ref() {
            Some(slot) if state.connection.connected => slot.connection.push(frame),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Send a heartbeat probe to the peer, if any.
    fn probe_peer(&self) {
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut state = self.lock();
        let Some(slot) = state.peer.as_ref() else {
            return;
        };
        if let Err(e) = slot.connection.push(heartbeat_frame(stamp)) {
            debug!("Failed to send heartbeat probe: {}", e);
        }
        state.remember_heartbeat(stamp);
    }

    /// Drop the peer if its last heartbeat is too old.
    fn check_liveness(&self) -> bool {
        let stale = {
            let mut state = self.lock();
            let silent_for = state
                .connection
                .last_heartbeat_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if !state.connection.connected || silent_for <= self.stale_after {
                return false;
            }

            warn!(
                silent_ms = silent_for.as_millis() as u64,
                limit_ms = self.stale_after.as_millis() as u64,
                "Plugin peer heartbeat lost; marking connection stale"
            );
            state.connection.connected = false;
            state.connection.last_heartbeat_at = None;
            state.peer.take()
        };

        match stale {
            Some(slot) => {
                slot.connection.close();
                self.connected_tx.send_replace(false);
                self.events.on_peer_disconnected(DisconnectReason::Stale);
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        let had_peer = {
            let mut state = self.lock();
            state.connection.connected = false;
            state.connection.last_heartbeat_at = None;
            state.peer.take().is_some()
        };

        self.shutdown_tx.send_replace(true);
        self.connected_tx.send_replace(false);
        if had_peer {
            self.events.on_peer_disconnected(DisconnectReason::Shutdown);
        }
    }
}

/// Handle to a running listener. Dropping it shuts the listener down.
pub struct TransportHandle {
    core: Arc<ListenerCore>,
    addr: SocketAddr,
    server_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queue a frame for the peer. Fire-and-forget.
    pub fn send(&self, frame: String) -> Result<()> {
        self.core.send_to_peer(frame)
    }

    pub fn is_connected(&self) -> bool {
        self.core.lock().connection.connected
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().connection.clone()
    }

    /// Identity from the current peer's hello frame.
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.core.lock().peer.as_ref().map(|slot| slot.identity.clone())
    }

    /// Receiver that flips whenever the peer connects or disconnects.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.core.connected_tx.subscribe()
    }

    /// Stop accepting, close every socket and empty the peer slot.
    pub fn shutdown(&self) {
        if let Some(tx) = self
            .server_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            info!(addr = %self.addr, "Transport listener shutting down");
            let _ = tx.send(());
            self.core.shutdown();
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry point for starting the peer listener.
pub struct TransportListener;

impl TransportListener {
    /// Bind `host:port` and start serving in background tasks.
    pub async fn start(
        config: &BridgeConfig,
        port: u16,
        events: Arc<dyn PeerEvents>,
    ) -> Result<TransportHandle> {
        Self::start_with_router(config, port, events, FrameRouter::with_default_routes()).await
    }

    /// Like `start`, with a custom dispatch table.
    pub async fn start_with_router(
        config: &BridgeConfig,
        port: u16,
        events: Arc<dyn PeerEvents>,
        router: FrameRouter,
    ) -> Result<TransportHandle> {
        let listener = TcpListener::bind((config.host.as_str(), port)).await?;
        let addr = listener.local_addr()?;

        let (connected_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new(ListenerCore {
            state: Mutex::new(ListenerState::default()),
            events,
            router,
            stale_after: config.stale_after(),
            connected_tx,
            shutdown_tx,
        });

        let app = Router::new()
            .route("/health", get(handle_health))
            .fallback(handle_upgrade)
            .with_state(core.clone());

        let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = server_shutdown_rx.await;
            })
            .await;
            if let Err(e) = result {
                error!("Transport listener stopped with error: {}", e);
            }
        });

        let mut tasks = vec![server];
        if config.heartbeat_interval.is_zero() {
            debug!("Heartbeat interval is zero; liveness checks disabled");
        } else {
            tasks.push(tokio::spawn(liveness_loop(
                Arc::downgrade(&core),
                config.heartbeat_interval,
            )));
        }

        info!(%addr, "Transport listener waiting for plugin peer");

        Ok(TransportHandle {
            core,
            addr,
            server_shutdown: Mutex::new(Some(server_shutdown_tx)),
            tasks,
        })
    }
}

async fn liveness_loop(core: std::sync::Weak<ListenerCore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(core) = core.upgrade() else {
            break;
        };
        if !core.check_liveness() {
            core.probe_peer();
        }
    }
}

async fn handle_health(State(core): State<Arc<ListenerCore>>) -> impl IntoResponse {
    let connection = core.lock().connection.clone();
    Json(json!({
        "status": "ok",
        "connected": connection.connected,
        "sockets": connection.active_peer_count,
    }))
}

async fn handle_upgrade(
    State(core): State<Arc<ListenerCore>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(TransportConfig::SOCKET_READ_LIMIT)
        .max_message_size(TransportConfig::SOCKET_READ_LIMIT)
        .on_upgrade(move |socket| serve_socket(core, socket, remote))
}

async fn serve_socket(core: Arc<ListenerCore>, socket: WebSocket, remote: SocketAddr) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(TransportConfig::OUTBOUND_QUEUE_DEPTH);
    let connection = ConnectionHandle {
        id: Uuid::new_v4(),
        remote,
        outbound: outbound_tx,
    };
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    core.connection_opened(&connection);
    let mut shutdown_rx = core.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => core.handle_text(&connection, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => core.handle_text(&connection, &text),
                    Err(_) => warn!(connection = %connection.id, "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the WebSocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection.id, "Socket read error: {}", e);
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                connection.close();
                break;
            }
        }
    }

    core.connection_closed(&connection);
    drop(connection);
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!("Socket writer did not finish in time");
    }
}
