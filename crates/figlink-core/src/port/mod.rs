//! Port reservation for the peer listener.
//!
//! `acquire(preferred)` returns a port that is free to bind:
//! 1. the preferred port, if a throwaway bind succeeds;
//! 2. otherwise the preferred port again, after terminating listeners on it
//!    that look like a stale instance of this service;
//! 3. otherwise the first free port in `preferred+1 ..= preferred+scan_limit`.
//!
//! Termination is best-effort. Only running out of ports is an error.

mod inspector;

pub use inspector::{PortOwner, ProcessInspector, SystemProcessInspector};

use crate::config::{BridgeConfig, PortConfig};
use crate::{BridgeError, Result};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How far reservation is allowed to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPolicy {
    pub host: String,
    /// Ports above the preferred one the scan may try.
    pub scan_limit: u16,
    /// Substrings identifying a stale instance of this service.
    pub zombie_signatures: Vec<String>,
    /// Pause between re-probes after terminating an owner.
    pub release_wait: Duration,
}

impl From<&BridgeConfig> for PortPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            host: config.host.clone(),
            scan_limit: config.port_scan_limit,
            zombie_signatures: config.zombie_signatures.clone(),
            release_wait: PortConfig::RELEASE_PROBE_INTERVAL,
        }
    }
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

/// Whether `host:port` can be bound right now.
pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Finds a bindable port for the peer listener.
pub struct PortReservation {
    policy: PortPolicy,
    inspector: Arc<dyn ProcessInspector>,
}

impl PortReservation {
    pub fn new(policy: PortPolicy, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { policy, inspector }
    }

    /// Reservation against the real operating system.
    pub fn system(policy: PortPolicy) -> Self {
        Self::new(policy, Arc::new(SystemProcessInspector))
    }

    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }

    /// Pick the port the listener should bind.
    pub async fn acquire(&self, preferred: u16) -> Result<u16> {
        if is_port_free(&self.policy.host, preferred) {
            debug!(port = preferred, "Preferred port is free");
            return Ok(preferred);
        }

        info!(port = preferred, "Preferred port is in use; looking for stale owners");
        if self.reclaim(preferred).await {
            info!(port = preferred, "Reclaimed preferred port from stale process");
            return Ok(preferred);
        }

        self.scan(preferred)
    }

    /// Terminate stale owners of `port` and wait for the port to come free.
    async fn reclaim(&self, port: u16) -> bool {
        let owners = {
            let inspector = self.inspector.clone();
            match tokio::task::spawn_blocking(move || inspector.listeners_on_port(port)).await {
                Ok(owners) => owners,
                Err(e) => {
                    warn!(port, "Port owner lookup failed: {}", e);
                    return false;
                }
            }
        };

        let own_pid = std::process::id();
        let zombies: Vec<PortOwner> = owners
            .into_iter()
            .filter(|owner| {
                if owner.pid == own_pid {
                    return false;
                }
                let stale = owner.matches_any(&self.policy.zombie_signatures);
                if !stale {
                    info!(
                        port,
                        pid = owner.pid,
                        name = %owner.name,
                        "Port held by an unrelated process; leaving it alone"
                    );
                }
                stale
            })
            .collect();

        if zombies.is_empty() {
            return false;
        }

        let mut terminated = 0usize;
        for zombie in zombies {
            let inspector = self.inspector.clone();
            let pid = zombie.pid;
            match tokio::task::spawn_blocking(move || inspector.terminate(pid)).await {
                Ok(Ok(true)) => {
                    info!(port, pid, name = %zombie.name, "Terminated stale process");
                    terminated += 1;
                }
                Ok(Ok(false)) => warn!(port, pid, "Stale process survived termination"),
                Ok(Err(e)) => warn!(port, pid, "Failed to terminate stale process: {}", e),
                Err(e) => warn!(port, pid, "Termination task failed: {}", e),
            }
        }

        if terminated == 0 {
            return false;
        }

        // The OS may release the socket a little after the process exits.
        for _ in 0..PortConfig::RELEASE_PROBES {
            if is_port_free(&self.policy.host, port) {
                return true;
            }
            tokio::time::sleep(self.policy.release_wait).await;
        }
        is_port_free(&self.policy.host, port)
    }

    /// First free port above `preferred`, within the scan limit.
    fn scan(&self, preferred: u16) -> Result<u16> {
        for offset in 1..=self.policy.scan_limit {
            let Some(candidate) = preferred.checked_add(offset) else {
                break;
            };
            if is_port_free(&self.policy.host, candidate) {
                info!(preferred, port = candidate, "Using fallback port");
                return Ok(candidate);
            }
        }

        Err(BridgeError::PortExhausted {
            start: preferred,
            end: preferred.saturating_add(self.policy.scan_limit),
        })
    }
}

impl std::fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReservation")
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const HOST: &str = "127.0.0.1";

    /// Holds a real socket and pretends a process owns it.
    struct MockInspector {
        owner: PortOwner,
        socket: Mutex<Option<TcpListener>>,
        port: u16,
        killable: bool,
        terminated: Mutex<Vec<u32>>,
    }

    impl MockInspector {
        fn occupying(name: &str, killable: bool) -> Arc<Self> {
            let socket = TcpListener::bind((HOST, 0)).unwrap();
            let port = socket.local_addr().unwrap().port();
            Arc::new(Self {
                owner: PortOwner {
                    pid: 4242,
                    name: name.to_string(),
                    cmdline: format!("{} --port {}", name, port),
                },
                socket: Mutex::new(Some(socket)),
                port,
                killable,
                terminated: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessInspector for MockInspector {
        fn listeners_on_port(&self, port: u16) -> Vec<PortOwner> {
            if port == self.port && self.socket.lock().unwrap().is_some() {
                vec![self.owner.clone()]
            } else {
                vec![]
            }
        }

        fn terminate(&self, pid: u32) -> Result<bool> {
            self.terminated.lock().unwrap().push(pid);
            if self.killable {
                self.socket.lock().unwrap().take();
            }
            Ok(self.killable)
        }
    }

    fn policy() -> PortPolicy {
        PortPolicy {
            host: HOST.to_string(),
            scan_limit: 20,
            zombie_signatures: vec!["figlink".to_string()],
            release_wait: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_free_port_is_returned_as_is() {
        let port = TcpListener::bind((HOST, 0)).unwrap().local_addr().unwrap().port();
        let inspector = MockInspector::occupying("figlink-rpc", true);
        let reservation = PortReservation::new(policy(), inspector.clone());

        assert_eq!(reservation.acquire(port).await.unwrap(), port);
        assert!(inspector.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_instance_is_terminated_and_port_reclaimed() {
        let inspector = MockInspector::occupying("figlink-rpc", true);
        let reservation = PortReservation::new(policy(), inspector.clone());

        let port = reservation.acquire(inspector.port).await.unwrap();

        assert_eq!(port, inspector.port);
        assert_eq!(*inspector.terminated.lock().unwrap(), vec![4242]);
    }

    #[tokio::test]
    async fn test_unrelated_owner_is_left_alone() {
        let inspector = MockInspector::occupying("postgres", true);
        let reservation = PortReservation::new(policy(), inspector.clone());

        let port = reservation.acquire(inspector.port).await.unwrap();

        assert!(port > inspector.port);
        assert!(inspector.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_termination_falls_through_to_scan() {
        let inspector = MockInspector::occupying("figlink-rpc", false);
        let reservation = PortReservation::new(policy(), inspector.clone());

        let port = reservation.acquire(inspector.port).await.unwrap();

        assert!(port > inspector.port);
        assert_eq!(*inspector.terminated.lock().unwrap(), vec![4242]);
    }

    #[tokio::test]
    async fn test_exhausted_scan_is_an_error() {
        let inspector = MockInspector::occupying("postgres", false);
        let reservation = PortReservation::new(
            PortPolicy {
                scan_limit: 0,
                ..policy()
            },
            inspector.clone(),
        );

        match reservation.acquire(inspector.port).await {
            Err(BridgeError::PortExhausted { start, end }) => {
                assert_eq!(start, inspector.port);
                assert_eq!(end, inspector.port);
            }
            other => panic!("Expected PortExhausted, got: {:?}", other),
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = BridgeConfig::default().with_port_scan_limit(7);
        let policy = PortPolicy::from(&config);
        assert_eq!(policy.scan_limit, 7);
        assert_eq!(policy.host, "127.0.0.1");
        assert_eq!(policy.zombie_signatures, vec!["figlink".to_string()]);
    }
}
