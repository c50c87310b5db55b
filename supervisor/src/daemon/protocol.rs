//! IPC protocol between the CLI and the supervisor daemon
//!
//! One JSON object per line in each direction; one request per connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::{LifecycleResponse, ListResponse, StatusResponse, ToolResponse};
use crate::registry::ProcessOptions;

/// Request from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonRequest {
    /// Start a process; an empty command uses the configured definition
    Start {
        name: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        options: ProcessOptions,
    },

    Stop { name: String },

    Restart { name: String },

    Status { name: String },

    List,

    CallTool {
        name: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
    },

    ListTools { name: String },

    /// Check that the daemon is alive
    Ping,

    /// Stop every process and exit
    Shutdown,
}

/// Response from the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    Lifecycle(LifecycleResponse),

    Status(StatusResponse),

    List(ListResponse),

    Tool(ToolResponse),

    Pong,

    /// Acknowledgement with no payload
    Ok,

    /// The request itself could not be handled
    Error { message: String },
}
