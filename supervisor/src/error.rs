//! Error taxonomy for the supervisor
//!
//! Every fallible library operation returns [`SupervisorError`]. The control
//! plane converts these into structured results, so nothing in here ever
//! reaches an external caller as a panic or an untyped error.

use std::time::Duration;

use thiserror::Error;

use crate::registry::ProcessStatus;

/// Type alias for supervisor results
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors raised by the supervisor, its connections and its registry
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A live record (Starting/Running/Stopping) already exists for the name
    #[error("process '{name}' is already running (pid {pid:?})")]
    AlreadyRunning { name: String, pid: Option<u32> },

    /// No running record exists for the name
    #[error("process '{0}' is not running")]
    NotRunning(String),

    /// Nothing is known about the name (no record, no command to restart)
    #[error("process '{0}' not found")]
    NotFound(String),

    /// The OS could not create the process, or it died during the settle delay
    #[error("failed to spawn '{name}': {message}")]
    SpawnFailed { name: String, message: String },

    /// The process started but did not complete the initialize exchange
    #[error("handshake with '{name}' failed: {message}")]
    HandshakeFailed { name: String, message: String },

    /// A request got no correlated response in time
    #[error("request '{method}' to '{name}' timed out after {timeout:?}")]
    RequestTimeout {
        name: String,
        method: String,
        timeout: Duration,
    },

    /// The process vanished while a call was pending or while believed running
    #[error("process '{0}' died")]
    ProcessDied(String),

    /// Health-driven restart suppressed by the rolling-hour quota
    #[error("restart quota exceeded for '{name}': {attempts} restarts in the last hour (max {max})")]
    RestartQuotaExceeded { name: String, attempts: u32, max: u32 },

    /// The process has no stdio transport to send requests over
    #[error("process '{0}' has no stdio connection")]
    NotConnected(String),

    /// The peer answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A status change not allowed by the lifecycle state machine
    #[error("invalid transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl SupervisorError {
    /// Short machine-friendly label, used in events and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning { .. } => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::SpawnFailed { .. } => "spawn_failed",
            SupervisorError::HandshakeFailed { .. } => "handshake_failed",
            SupervisorError::RequestTimeout { .. } => "request_timeout",
            SupervisorError::ProcessDied(_) => "process_died",
            SupervisorError::RestartQuotaExceeded { .. } => "restart_quota_exceeded",
            SupervisorError::NotConnected(_) => "not_connected",
            SupervisorError::Rpc { .. } => "rpc_error",
            SupervisorError::InvalidTransition { .. } => "invalid_transition",
            SupervisorError::Store(_) => "store",
            SupervisorError::Io(_) => "io",
            SupervisorError::Json(_) => "json",
            SupervisorError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_process() {
        let err = SupervisorError::AlreadyRunning {
            name: "github".to_string(),
            pid: Some(42),
        };
        assert!(err.to_string().contains("github"));
        assert!(err.to_string().contains("42"));

        let err = SupervisorError::RequestTimeout {
            name: "github".to_string(),
            method: "tools/call".to_string(),
            timeout: Duration::from_secs(15),
        };
        assert!(err.to_string().contains("tools/call"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            SupervisorError::NotRunning("x".into()).kind(),
            "not_running"
        );
        assert_eq!(
            SupervisorError::ProcessDied("x".into()).kind(),
            "process_died"
        );
    }
}
