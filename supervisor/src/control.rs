//! Control-plane API
//!
//! Thin layer over [`ProcessSupervisor`] that turns every outcome into a
//! structured response. Nothing here returns `Err`; callers branch on
//! `success` and read `error` for the message.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::error::{Result, SupervisorError};
use crate::registry::{ProcessOptions, ProcessRecord, ProcessStatus};
use crate::supervisor::ProcessSupervisor;

/// Outcome of Start, Stop and Restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl LifecycleResponse {
    fn from_result(result: Result<Option<u32>>) -> Self {
        match result {
            Ok(pid) => Self {
                success: true,
                pid,
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                pid: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
            },
        }
    }
}

/// One process as shown to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub uptime_secs: Option<i64>,
    pub health_score: Option<u8>,
    pub error: Option<String>,
}

impl StatusReport {
    pub fn from_record(record: &ProcessRecord, now: DateTime<Utc>) -> Self {
        Self {
            name: record.name.clone(),
            status: record.status,
            pid: record.pid,
            started_at: record.started_at,
            restart_count: record.restart_count,
            uptime_secs: record.uptime(now).map(|d| d.num_seconds()),
            health_score: record.last_health_check.as_ref().map(|h| h.score),
            error: record.error_log.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<StatusReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub success: bool,
    #[serde(default)]
    pub processes: Vec<StatusReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of CallTool and ListTools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolResponse {
    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                result: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
            },
        }
    }
}

/// Structured front door to the supervisor
#[derive(Clone)]
pub struct ControlPlane {
    supervisor: Arc<ProcessSupervisor>,
    /// Process definitions from `.mcp.json`, used when Start gives no command
    definitions: Arc<HashMap<String, McpServerConfig>>,
}

impl ControlPlane {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            definitions: Arc::new(HashMap::new()),
        }
    }

    pub fn with_definitions(mut self, definitions: HashMap<String, McpServerConfig>) -> Self {
        self.definitions = Arc::new(definitions);
        self
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Start `name`; an empty `command` falls back to its configured definition
    pub async fn start_process(
        &self,
        name: &str,
        command: Vec<String>,
        options: ProcessOptions,
    ) -> LifecycleResponse {
        let result: Result<Option<u32>> = async {
            let (command, options) = if command.is_empty() {
                let definition = self
                    .definitions
                    .get(name)
                    .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
                (definition.argv(), definition.options())
            } else {
                (command, options)
            };
            self.supervisor.start(name, command, options).await.map(Some)
        }
        .await;
        LifecycleResponse::from_result(result)
    }

    pub async fn stop_process(&self, name: &str) -> LifecycleResponse {
        LifecycleResponse::from_result(self.supervisor.stop(name).await.map(|()| None))
    }

    pub async fn restart_process(&self, name: &str) -> LifecycleResponse {
        LifecycleResponse::from_result(self.supervisor.restart(name).await.map(Some))
    }

    pub async fn get_process_status(&self, name: &str) -> StatusResponse {
        match self.supervisor.status(name).await {
            Ok(record) => StatusResponse {
                success: true,
                process: Some(StatusReport::from_record(&record, Utc::now())),
                error: None,
            },
            Err(e) => StatusResponse {
                success: false,
                process: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn list_processes(&self) -> ListResponse {
        match self.supervisor.list().await {
            Ok(records) => {
                let now = Utc::now();
                ListResponse {
                    success: true,
                    processes: records
                        .iter()
                        .map(|record| StatusReport::from_record(record, now))
                        .collect(),
                    error: None,
                }
            }
            Err(e) => ListResponse {
                success: false,
                processes: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn call_tool(&self, name: &str, tool: &str, arguments: Value) -> ToolResponse {
        ToolResponse::from_result(self.supervisor.call_tool(name, tool, arguments).await)
    }

    pub async fn list_tools(&self, name: &str) -> ToolResponse {
        ToolResponse::from_result(self.supervisor.list_tools(name).await)
    }

    /// Start every configured process marked `autostart`; returns how many started
    pub async fn autostart(&self) -> usize {
        let mut names: Vec<&String> = self
            .definitions
            .iter()
            .filter(|(_, def)| def.autostart)
            .map(|(name, _)| name)
            .collect();
        names.sort();

        let mut started = 0;
        for name in names {
            let response = self.start_process(name, Vec::new(), ProcessOptions::default()).await;
            match (response.success, response.error) {
                (true, _) => started += 1,
                (false, Some(error)) if response.error_kind.as_deref() == Some("already_running") => {
                    tracing::debug!(process = %name, "autostart skipped: {}", error);
                }
                (false, error) => {
                    tracing::warn!(process = %name, "autostart failed: {}", error.unwrap_or_default());
                }
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorSettings;
    use crate::events::EventSink;
    use crate::registry::{ProcessRegistry, SqliteStore};

    fn control() -> ControlPlane {
        let registry = ProcessRegistry::new(SqliteStore::open_in_memory().unwrap(), None);
        let supervisor = ProcessSupervisor::new(registry, EventSink::none(), SupervisorSettings::default());
        ControlPlane::new(Arc::new(supervisor))
    }

    #[tokio::test]
    async fn test_errors_become_responses() {
        let control = control();

        let stop = control.stop_process("ghost").await;
        assert!(!stop.success);
        assert_eq!(stop.error_kind.as_deref(), Some("not_running"));
        assert!(stop.error.unwrap().contains("ghost"));

        let restart = control.restart_process("ghost").await;
        assert!(!restart.success);
        assert_eq!(restart.error_kind.as_deref(), Some("not_found"));

        let status = control.get_process_status("ghost").await;
        assert!(!status.success && status.process.is_none());

        let call = control.call_tool("ghost", "echo", Value::Null).await;
        assert!(!call.success && call.result.is_none());
    }

    #[tokio::test]
    async fn test_start_without_command_needs_definition() {
        let control = control();
        let response = control
            .start_process("unknown", Vec::new(), ProcessOptions::default())
            .await;
        assert!(!response.success);
        assert_eq!(response.error_kind.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_list_empty() {
        let response = control().list_processes().await;
        assert!(response.success);
        assert!(response.processes.is_empty());
    }

    #[test]
    fn test_status_report_uptime_only_when_running() {
        let mut record = ProcessRecord::new("a", vec!["x".into()], ProcessOptions::default());
        let now = Utc::now();
        record.started_at = Some(now - chrono::Duration::seconds(90));
        assert_eq!(StatusReport::from_record(&record, now).uptime_secs, None);

        record.pid = Some(7);
        record.transition(ProcessStatus::Running).unwrap();
        let report = StatusReport::from_record(&record, now);
        assert_eq!(report.uptime_secs, Some(90));
        assert_eq!(report.pid, Some(7));
        assert_eq!(report.health_score, None);
    }
}
