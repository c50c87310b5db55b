//! Command handlers module
//!
//! Handler functions for CLI commands. Everything except `daemon` talks to a
//! running daemon through [`DaemonClient`].

use std::path::PathBuf;

use mcp_supervisor::config::SupervisorFileConfig;
use mcp_supervisor::daemon::DaemonClient;

pub mod daemon;
pub mod process;
pub mod tools;

pub use daemon::{run_daemon, run_ping, run_shutdown};
pub use process::{run_list, run_restart, run_start, run_status, run_stop, StartArgs};
pub use tools::{run_call_tool, run_tools};

/// Shared state for command handlers
pub struct CommandContext {
    pub socket_path: PathBuf,
    pub file_config: SupervisorFileConfig,
}

impl CommandContext {
    /// Resolve with priority: CLI/env > config file > default
    pub fn new(socket: Option<PathBuf>, file_config: SupervisorFileConfig) -> Self {
        let socket_path = socket.unwrap_or_else(|| file_config.supervisor.socket_path());
        Self {
            socket_path,
            file_config,
        }
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::with_socket_path(self.socket_path.clone())
    }
}
