//! Lifecycle events for downstream display
//!
//! The supervisor and health monitor emit these at every transition. What
//! happens to them afterwards (UI push, pub/sub, logs) belongs to whoever
//! holds the receiving end of the channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::health::HealthMetrics;

// ============================================================================
// Supervisor Events
// ============================================================================

/// Events emitted by the supervisor and the health monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// Process spawned and handshake completed
    ProcessStarted {
        name: String,
        pid: u32,
        command: Vec<String>,
    },

    /// Process stopped on request
    ProcessStopped { name: String, pid: Option<u32> },

    /// Something went wrong with the process (spawn, handshake, crash, quota)
    ProcessError { name: String, message: String },

    /// Result of one health evaluation
    ProcessHealthCheck {
        name: String,
        healthy: bool,
        metrics: HealthMetrics,
    },
}

impl SupervisorEvent {
    pub fn name(&self) -> &str {
        match self {
            SupervisorEvent::ProcessStarted { name, .. }
            | SupervisorEvent::ProcessStopped { name, .. }
            | SupervisorEvent::ProcessError { name, .. }
            | SupervisorEvent::ProcessHealthCheck { name, .. } => name,
        }
    }
}

// ============================================================================
// Event Channel
// ============================================================================

/// Receiver for supervisor events
pub type EventReceiver = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Sink the supervisor writes events into
///
/// Cloneable; a sink built with [`EventSink::none`] discards everything.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl EventSink {
    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// Create a no-op sink (events are discarded)
    pub fn none() -> Self {
        Self { sender: None }
    }

    /// Emit an event; a closed receiver is not an error
    pub fn emit(&self, event: SupervisorEvent) {
        if let Some(ref sender) = self.sender {
            if sender.send(event).is_err() {
                tracing::trace!("Event receiver dropped");
            }
        }
    }

    pub fn started(&self, name: &str, pid: u32, command: &[String]) {
        self.emit(SupervisorEvent::ProcessStarted {
            name: name.to_string(),
            pid,
            command: command.to_vec(),
        });
    }

    pub fn stopped(&self, name: &str, pid: Option<u32>) {
        self.emit(SupervisorEvent::ProcessStopped {
            name: name.to_string(),
            pid,
        });
    }

    pub fn error(&self, name: &str, message: impl Into<String>) {
        self.emit(SupervisorEvent::ProcessError {
            name: name.to_string(),
            message: message.into(),
        });
    }

    pub fn health(&self, name: &str, healthy: bool, metrics: HealthMetrics) {
        self.emit(SupervisorEvent::ProcessHealthCheck {
            name: name.to_string(),
            healthy,
            metrics,
        });
    }
}

/// Drain a receiver into the log until every sender is gone
pub async fn log_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match &event {
            SupervisorEvent::ProcessStarted { name, pid, .. } => {
                tracing::info!(process = %name, pid, "process started");
            }
            SupervisorEvent::ProcessStopped { name, pid } => {
                tracing::info!(process = %name, pid = ?pid, "process stopped");
            }
            SupervisorEvent::ProcessError { name, message } => {
                tracing::error!(process = %name, "{}", message);
            }
            SupervisorEvent::ProcessHealthCheck {
                name,
                healthy,
                metrics,
            } => {
                tracing::debug!(process = %name, healthy, score = metrics.score, "health check");
            }
        }
    }
}
