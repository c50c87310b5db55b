//! Process records and the lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Result, SupervisorError};

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawned, handshake not finished
    Starting,
    /// Handshake done (or not needed); believed alive
    Running,
    /// Termination requested, waiting for exit
    Stopping,
    /// Stopped on request
    Stopped,
    /// Vanished without a stop request
    Died,
    /// Spawn or handshake error
    Failed,
}

impl ProcessStatus {
    /// Whether the OS process was believed alive in this state
    pub fn implies_alive(self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.implies_alive()
    }

    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Died)
                | (Stopping, Stopped)
        )
    }

    /// Where a record lands when its pid turns out to be gone
    pub fn when_found_dead(self) -> ProcessStatus {
        match self {
            ProcessStatus::Starting => ProcessStatus::Failed,
            ProcessStatus::Stopping => ProcessStatus::Stopped,
            ProcessStatus::Running => ProcessStatus::Died,
            terminal => terminal,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Died => write!(f, "died"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(ProcessStatus::Starting),
            "running" => Ok(ProcessStatus::Running),
            "stopping" => Ok(ProcessStatus::Stopping),
            "stopped" => Ok(ProcessStatus::Stopped),
            "died" => Ok(ProcessStatus::Died),
            "failed" => Ok(ProcessStatus::Failed),
            _ => Err(format!("Unknown process status: {}", s)),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// How the supervisor talks to the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// JSON-RPC over the child's stdin/stdout
    #[default]
    Stdio,
    /// No protocol channel; lifecycle management only
    None,
}

/// Per-process launch options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOptions {
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub use_systemd: bool,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub transport: Transport,
}

impl ProcessOptions {
    /// Effective transport; service-manager processes never expose stdio
    pub fn effective_transport(&self) -> Transport {
        if self.use_systemd {
            Transport::None
        } else {
            self.transport
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// Outcome of the most recent health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub score: u8,
    pub healthy: bool,
    /// Raw per-layer results
    pub results: serde_json::Value,
}

/// The authoritative record for one process name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub command: Vec<String>,
    pub options: ProcessOptions,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_health_check: Option<HealthSnapshot>,
    pub error_log: Option<String>,
}

impl ProcessRecord {
    /// Fresh record in `Starting`
    pub fn new(name: impl Into<String>, command: Vec<String>, options: ProcessOptions) -> Self {
        Self {
            name: name.into(),
            command,
            options,
            status: ProcessStatus::Starting,
            pid: None,
            started_at: Some(Utc::now()),
            stopped_at: None,
            restart_count: 0,
            last_health_check: None,
            error_log: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.implies_alive()
    }

    /// Move to `next`, enforcing the state machine
    ///
    /// Leaving the live states clears the pid and stamps `stopped_at`.
    pub fn transition(&mut self, next: ProcessStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.pid = None;
            self.stopped_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Transition to a failure state and keep the message
    pub fn fail(&mut self, next: ProcessStatus, message: impl Into<String>) -> Result<()> {
        self.transition(next)?;
        self.error_log = Some(message.into());
        Ok(())
    }

    /// Apply the self-heal table for a pid found dead
    ///
    /// Returns the new status, or `None` if the record was already terminal.
    pub fn mark_found_dead(&mut self) -> Option<ProcessStatus> {
        let next = self.status.when_found_dead();
        if next == self.status {
            return None;
        }
        self.transition(next).ok()?;
        if next != ProcessStatus::Stopped {
            self.error_log = Some(format!("process exited unexpectedly ({})", next));
        }
        Some(next)
    }

    /// Time since start while running
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.started_at) {
            (ProcessStatus::Running, Some(started)) => Some(now - started),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProcessRecord {
        ProcessRecord::new("git", vec!["git-mcp".into()], ProcessOptions::default())
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ProcessStatus::Starting,
            ProcessStatus::Running,
            ProcessStatus::Stopping,
            ProcessStatus::Stopped,
            ProcessStatus::Died,
            ProcessStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ProcessStatus>(), Ok(status));
        }
        assert!("zombie".parse::<ProcessStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut rec = record();
        rec.pid = Some(10);
        rec.transition(ProcessStatus::Running).unwrap();
        assert_eq!(rec.pid, Some(10));
        rec.transition(ProcessStatus::Stopping).unwrap();
        rec.transition(ProcessStatus::Stopped).unwrap();
        assert_eq!(rec.pid, None);
        assert!(rec.stopped_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut rec = record();
        rec.fail(ProcessStatus::Failed, "spawn failed").unwrap();
        assert_eq!(rec.error_log.as_deref(), Some("spawn failed"));
        let err = rec.transition(ProcessStatus::Running).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { .. }));
    }

    #[test]
    fn test_running_cannot_skip_stopping() {
        let mut rec = record();
        rec.transition(ProcessStatus::Running).unwrap();
        assert!(rec.transition(ProcessStatus::Stopped).is_err());
    }

    #[test]
    fn test_self_heal_table() {
        let mut rec = record();
        rec.pid = Some(1);
        assert_eq!(rec.mark_found_dead(), Some(ProcessStatus::Failed));

        let mut rec = record();
        rec.transition(ProcessStatus::Running).unwrap();
        assert_eq!(rec.mark_found_dead(), Some(ProcessStatus::Died));
        assert!(rec.error_log.is_some());
        assert_eq!(rec.mark_found_dead(), None);

        let mut rec = record();
        rec.transition(ProcessStatus::Running).unwrap();
        rec.transition(ProcessStatus::Stopping).unwrap();
        assert_eq!(rec.mark_found_dead(), Some(ProcessStatus::Stopped));
        assert!(rec.error_log.is_none());
    }

    #[test]
    fn test_systemd_processes_have_no_stdio() {
        let options = ProcessOptions {
            use_systemd: true,
            ..Default::default()
        };
        assert_eq!(options.effective_transport(), Transport::None);
        assert_eq!(
            ProcessOptions::default().effective_transport(),
            Transport::Stdio
        );
    }

    #[test]
    fn test_uptime_only_while_running() {
        let mut rec = record();
        assert!(rec.uptime(Utc::now()).is_none());
        rec.transition(ProcessStatus::Running).unwrap();
        assert!(rec.uptime(Utc::now()).is_some());
    }
}
