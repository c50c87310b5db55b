//! CLI argument definitions
//!
//! Contains the main CLI struct and Commands enum for clap parsing.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcp-supervisor")]
#[command(about = "Supervise long-lived MCP tool servers speaking JSON-RPC over stdio")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Daemon socket (default: from .supervisor.toml or the cache dir)
    #[arg(long, env = "MCP_SUPERVISOR_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    // =========================================================================
    // Daemon
    // =========================================================================
    /// Run the supervisor daemon in the foreground
    Daemon {
        /// Skip starting the autostart processes from .mcp.json
        #[arg(long)]
        no_autostart: bool,
    },
    /// Check that the daemon is reachable
    Ping,
    /// Stop every process and shut the daemon down
    Shutdown,

    // =========================================================================
    // Process control
    // =========================================================================
    /// Start a process (omit the command to use its .mcp.json definition)
    Start {
        /// Process name
        name: String,
        /// Command and arguments, after `--`
        #[arg(last = true)]
        command: Vec<String>,
        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment variables (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Launch under the service manager (systemd-run)
        #[arg(long)]
        systemd: bool,
        /// Process kind, selects health policy and application check
        #[arg(long)]
        kind: Option<String>,
        /// Log file watched by the log-watcher check
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Process does not speak JSON-RPC on stdio
        #[arg(long)]
        no_stdio: bool,
    },
    /// Stop a process
    Stop {
        /// Process name
        name: String,
    },
    /// Restart a process with its last command
    Restart {
        /// Process name
        name: String,
    },
    /// Show one process
    Status {
        /// Process name
        name: String,
    },
    /// List every known process
    List,

    // =========================================================================
    // Tools
    // =========================================================================
    /// Call a tool on a running process
    Call {
        /// Process name
        name: String,
        /// Tool name
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// List the tools a running process offers
    Tools {
        /// Process name
        name: String,
    },
}
