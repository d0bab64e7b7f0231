//! Platform-specific process management.
//!
//! Liveness checks, termination and port-owner lookup. Everything here
//! blocks; async callers go through `spawn_blocking`.

use crate::error::{BridgeError, Result};
use std::process::Command;
use tracing::{debug, warn};

/// Name and command line of a running process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDescription {
    pub name: String,
    pub cmdline: String,
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Unix**: `kill(pid, 0)`; `EPERM` means it exists under another user
/// - **Other**: looks the pid up with `sysinfo`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );
        system.process(pid).is_some()
    }
}

/// Terminate a process gracefully, then forcefully if needed.
///
/// # Platform Behavior
/// - **Unix**: Sends SIGTERM, waits up to `timeout_ms`, then SIGKILL
/// - **Windows**: `taskkill /PID {pid} /F /T`
///
/// # Returns
/// `true` if the process is gone (or was never running).
pub fn terminate_process(pid: u32, timeout_ms: u64) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!(pid, "Process is not running");
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_process_unix(pid, timeout_ms)
    }

    #[cfg(windows)]
    {
        let _ = timeout_ms;
        terminate_process_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = timeout_ms;
        Err(BridgeError::ProcessTermination {
            pid,
            message: "process termination not implemented for this platform".into(),
        })
    }
}

#[cfg(unix)]
fn terminate_process_unix(pid: u32, timeout_ms: u64) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;
    use std::time::Duration;

    let raw = i32::try_from(pid).map_err(|_| BridgeError::ProcessTermination {
        pid,
        message: "pid out of range".into(),
    })?;
    let nix_pid = Pid::from_raw(raw);

    debug!(pid, "Sending SIGTERM");
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        warn!(pid, "Failed to send SIGTERM: {}", e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (timeout_ms / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Only reaps when the owner is our child
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!(pid, "Process terminated gracefully");
            return Ok(true);
        }
    }

    debug!(pid, "Process still running, sending SIGKILL");
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        return Err(BridgeError::ProcessTermination {
            pid,
            message: format!("SIGKILL failed: {}", e),
        });
    }

    sleep(wait_interval);
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!(pid, "Reaped process: {:?}", status),
        Err(e) if e != Errno::ECHILD => debug!(pid, "waitpid failed: {}", e),
        Err(_) => {}
    }

    Ok(!is_process_alive(pid))
}

#[cfg(windows)]
fn terminate_process_windows(pid: u32) -> Result<bool> {
    debug!(pid, "Terminating process with taskkill");

    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .output()
        .map_err(|e| BridgeError::ProcessTermination {
            pid,
            message: format!("failed to run taskkill: {}", e),
        })?;

    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not found") || stderr.contains("not running") {
        Ok(true)
    } else {
        warn!(pid, "taskkill failed: {}", stderr);
        Ok(false)
    }
}

/// PIDs of processes with a TCP socket listening on `port`.
///
/// # Platform Behavior
/// - **Unix**: `lsof -nP -t -iTCP:{port} -sTCP:LISTEN`
/// - **Windows**: `netstat -ano -p tcp`
///
/// An unavailable tool yields an empty list; the caller then treats the port
/// as held by a process it cannot identify.
pub fn find_listening_pids(port: u16) -> Vec<u32> {
    #[cfg(unix)]
    {
        let output = match Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .output()
        {
            Ok(o) => o,
            Err(e) => {
                debug!("Failed to run lsof: {}", e);
                return vec![];
            }
        };
        // lsof exits 1 when nothing matches
        parse_lsof_pids(&String::from_utf8_lossy(&output.stdout))
    }

    #[cfg(windows)]
    {
        let output = match Command::new("netstat").args(["-ano", "-p", "tcp"]).output() {
            Ok(o) => o,
            Err(e) => {
                debug!("Failed to run netstat: {}", e);
                return vec![];
            }
        };
        if !output.status.success() {
            return vec![];
        }
        parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), port)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = port;
        vec![]
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Rows look like `TCP  127.0.0.1:3055  0.0.0.0:0  LISTENING  1234`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listeners(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 5 || !parts[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !parts[1].ends_with(&suffix) || !parts[3].eq_ignore_ascii_case("listening") {
                return None;
            }
            parts[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Name and command line of `pid`, if it is still running.
pub fn describe_process(pid: u32) -> Option<ProcessDescription> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

    let sysinfo_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        true,
        ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
    );

    system.process(sysinfo_pid).map(|process| ProcessDescription {
        name: process.name().to_string_lossy().into_owned(),
        cmdline: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" "),
    })
}
