//! Supervision of long-lived MCP tool servers
//!
//! [`supervisor::ProcessSupervisor`] owns process lifecycles and keeps one
//! persistent [`connection::StdioRpcConnection`] per stdio server.
//! [`health::HealthMonitor`] scores every running process on an interval and
//! restarts unhealthy ones within a rolling-hour quota. State survives
//! restarts of the supervisor itself in [`registry::ProcessRegistry`].
//! [`control::ControlPlane`] and [`daemon`] put a structured API in front.

pub mod config;
pub mod connection;
pub mod control;
pub mod daemon;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod supervisor;

pub use control::ControlPlane;
pub use error::{Result, SupervisorError};
pub use health::HealthMonitor;
pub use supervisor::ProcessSupervisor;
