//! Supervisor daemon
//!
//! Keeps the supervisor, its stdio connections and the health loop in one
//! long-lived process and exposes the control plane on a Unix socket.
//!
//! ```text
//! ┌─────────────┐     Unix Socket     ┌──────────────────────┐
//! │ CLI client  │ ←────────────────→  │  mcp-supervisor      │
//! └─────────────┘                     │  daemon              │
//!                                     └──────────┬───────────┘
//!                   ┌────────────────────────────┼───────────────────┐
//!                   ↓                            ↓                   ↓
//!           ┌───────────────┐          ┌───────────────┐    ┌───────────────┐
//!           │  github       │          │  filesystem   │    │  log-watcher  │
//!           │  (stdio)      │          │  (stdio)      │    │  (systemd)    │
//!           └───────────────┘          └───────────────┘    └───────────────┘
//! ```

mod client;
mod protocol;
mod server;

pub use client::DaemonClient;
pub use protocol::{DaemonRequest, DaemonResponse};
pub use server::SupervisorDaemon;

use std::path::PathBuf;

/// Default socket path for the daemon
pub fn default_socket_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(crate::config::APP_DIR)
        .join("supervisor.sock")
}
