//! Figlink RPC Server - JSON-RPC front door for the Figma plugin bridge.
//!
//! Reserves the plugin port, waits for the plugin to connect and exposes
//! the gateway to automation clients over JSON-RPC 2.0.

mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use figlink_core::{BridgeConfig, PeerGateway, PortConfig, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "figlink-rpc")]
#[command(about = "JSON-RPC server bridging automation clients to the Figma plugin")]
struct Args {
    /// Port the plugin connects to; the next free port is used if taken
    #[arg(short, long, default_value_t = TransportConfig::DEFAULT_PORT)]
    port: u16,

    /// Port for the JSON-RPC endpoint (0 = auto-assign)
    #[arg(long, default_value = "0")]
    rpc_port: u16,

    /// Host to bind both listeners to
    #[arg(long, default_value = TransportConfig::DEFAULT_HOST)]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Default per-request timeout in seconds
    #[arg(long, default_value_t = TransportConfig::REQUEST_TIMEOUT.as_secs())]
    request_timeout_secs: u64,

    /// Expected plugin heartbeat interval in seconds (0 disables liveness checks)
    #[arg(long, default_value_t = TransportConfig::HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,

    /// How many ports above the preferred one may be tried
    #[arg(long, default_value_t = PortConfig::SCAN_LIMIT)]
    scan_limit: u16,
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::default()
            .with_host(self.host.clone())
            .with_preferred_port(self.port)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_secs))
            .with_port_scan_limit(self.scan_limit)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the port lines for the parent process.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Figlink RPC Server");

    let gateway = Arc::new(PeerGateway::start(args.bridge_config()).await?);
    let addr = server::start_server(gateway.clone(), &args.host, args.rpc_port).await?;

    // Intentional stdout for the parent process
    println!("PEER_PORT={}", gateway.port());
    println!("RPC_PORT={}", addr.port());

    info!(
        rpc = %addr,
        plugin_port = gateway.port(),
        "RPC server running; waiting for plugin"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    gateway.shutdown();

    Ok(())
}
