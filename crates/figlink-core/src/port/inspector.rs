//! OS primitives the port reservation manager depends on.

use crate::config::PortConfig;
use crate::platform;
use crate::Result;

/// A process holding a listening socket on a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
}

impl PortOwner {
    /// Whether the owner looks like a stale instance of this bridge.
    ///
    /// Matches case-insensitively against the name and command line. An
    /// empty signature list treats every owner as stale.
    pub fn matches_any<S: AsRef<str>>(&self, signatures: &[S]) -> bool {
        if signatures.is_empty() {
            return true;
        }
        let name = self.name.to_lowercase();
        let cmdline = self.cmdline.to_lowercase();
        signatures.iter().any(|signature| {
            let signature = signature.as_ref().to_lowercase();
            !signature.is_empty() && (name.contains(&signature) || cmdline.contains(&signature))
        })
    }
}

/// Port-owner lookup and termination, replaceable in tests.
///
/// Both calls may block.
pub trait ProcessInspector: Send + Sync {
    /// Processes listening on `port`.
    fn listeners_on_port(&self, port: u16) -> Vec<PortOwner>;

    /// Terminate `pid`; `Ok(true)` once it is gone.
    fn terminate(&self, pid: u32) -> Result<bool>;
}

/// [`ProcessInspector`] backed by the real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessInspector;

impl ProcessInspector for SystemProcessInspector {
    fn listeners_on_port(&self, port: u16) -> Vec<PortOwner> {
        platform::find_listening_pids(port)
            .into_iter()
            .map(|pid| {
                let description = platform::describe_process(pid).unwrap_or_default();
                PortOwner {
                    pid,
                    name: description.name,
                    cmdline: description.cmdline,
                }
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<bool> {
        platform::terminate_process(pid, PortConfig::TERMINATE_TIMEOUT.as_millis() as u64)
    }
}
