//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than in the
//! port reservation logic.
//!
//! # Supported Platforms
//!
//! - **Linux / macOS**: signals via `nix`, port owners via `lsof`
//! - **Windows**: `taskkill` and `netstat`

pub mod process;

pub use process::{
    describe_process, find_listening_pids, is_process_alive, terminate_process, ProcessDescription,
};
