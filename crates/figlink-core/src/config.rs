//! Centralized configuration for the plugin bridge.
//!
//! Constants are grouped by concern; `BridgeConfig` carries the values a
//! running gateway actually uses and defaults to those constants.

use std::time::Duration;

/// Transport and correlation settings.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 3055;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
    /// A peer is stale once this many heartbeat intervals pass in silence.
    pub const HEARTBEAT_MISS_FACTOR: u32 = 2;
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16MB
    /// Read limit of the WebSocket layer. Frames between `MAX_FRAME_BYTES`
    /// and this limit reach the frame parser and are dropped there; only
    /// larger ones close the socket.
    pub const SOCKET_READ_LIMIT: usize = 2 * Self::MAX_FRAME_BYTES;
    /// Heartbeat stamps we sent that are not echoed when they come back.
    pub const RECENT_HEARTBEATS: usize = 16;
    pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
}

/// Port reservation settings.
pub struct PortConfig;

impl PortConfig {
    /// How many ports after the preferred one are tried before giving up.
    pub const SCAN_LIMIT: u16 = 100;
    /// Grace period handed to a zombie before it is force-killed.
    pub const TERMINATE_TIMEOUT: Duration = Duration::from_millis(1500);
    pub const RELEASE_PROBES: u32 = 5;
    pub const RELEASE_PROBE_INTERVAL: Duration = Duration::from_millis(100);
    /// Process names/command lines that mark a leftover bridge instance.
    pub const ZOMBIE_SIGNATURES: &'static [&'static str] = &["figlink"];
}

/// Bulk command settings.
pub struct BulkConfig;

impl BulkConfig {
    pub const FAIL_FAST_PARAM: &'static str = "fail_fast";
    pub const FAIL_FAST_PARAM_CAMEL: &'static str = "failFast";
}

/// Runtime configuration for a `PeerGateway`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interface the peer listener binds to.
    pub host: String,
    /// Port the peer is expected on. `0` lets the OS pick and skips reservation.
    pub preferred_port: u16,
    /// Deadline applied by `send` when the caller does not pick one.
    pub request_timeout: Duration,
    /// Expected heartbeat cadence of the peer.
    pub heartbeat_interval: Duration,
    /// Highest offset from `preferred_port` the port scan may reach.
    pub port_scan_limit: u16,
    /// Signatures identifying a stale instance of this service.
    pub zombie_signatures: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: TransportConfig::DEFAULT_HOST.to_string(),
            preferred_port: TransportConfig::DEFAULT_PORT,
            request_timeout: TransportConfig::REQUEST_TIMEOUT,
            heartbeat_interval: TransportConfig::HEARTBEAT_INTERVAL,
            port_scan_limit: PortConfig::SCAN_LIMIT,
            zombie_signatures: PortConfig::ZOMBIE_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl BridgeConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the preferred peer port.
    pub fn with_preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the port scan ceiling.
    pub fn with_port_scan_limit(mut self, limit: u16) -> Self {
        self.port_scan_limit = limit;
        self
    }

    /// Replace the zombie signatures.
    pub fn with_zombie_signatures(mut self, signatures: Vec<String>) -> Self {
        self.zombie_signatures = signatures;
        self
    }

    /// Silence after which the peer is considered gone.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(TransportConfig::HEARTBEAT_MISS_FACTOR)
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.preferred_port, 3055);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.zombie_signatures, vec!["figlink".to_string()]);
    }

    #[test]
    fn test_stale_after_is_twice_the_interval() {
        let config = BridgeConfig::new().with_heartbeat_interval(Duration::from_millis(40));
        assert_eq!(config.stale_after(), Duration::from_millis(80));
    }

    #[test]
    fn test_stale_after_saturates() {
        let config = BridgeConfig::new().with_heartbeat_interval(Duration::from_secs(u64::MAX));
        assert_eq!(config.stale_after(), Duration::MAX);
    }

    #[test]
    fn test_socket_limit_leaves_room_for_oversized_frames() {
        assert!(TransportConfig::SOCKET_READ_LIMIT > TransportConfig::MAX_FRAME_BYTES);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(TransportConfig::REQUEST_TIMEOUT > TransportConfig::HEARTBEAT_INTERVAL);
        assert!(PortConfig::SCAN_LIMIT > 0);
    }
}
