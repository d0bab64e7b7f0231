//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use figlink_core::PeerGateway;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// RPC calls handled at once. The plugin answers one command at a time, so
/// more would only queue inside the gateway.
const MAX_CONCURRENT_CALLS: usize = 32;

/// Application state shared across handlers.
pub struct AppState {
    pub gateway: Arc<PeerGateway>,
}

/// Build the JSON-RPC router.
pub fn build_router(gateway: Arc<PeerGateway>) -> Router {
    let state = Arc::new(AppState { gateway });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_CALLS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    gateway: Arc<PeerGateway>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(gateway);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figlink_core::BridgeConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_starts() {
        let gateway = PeerGateway::start(
            BridgeConfig::default()
                .with_preferred_port(0)
                .with_heartbeat_interval(Duration::ZERO),
        )
        .await
        .unwrap();

        let addr = start_server(Arc::new(gateway), "127.0.0.1", 0)
            .await
            .unwrap();
        assert!(addr.port() > 0);
    }
}
