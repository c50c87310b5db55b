//! Client for the supervisor daemon

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::default_socket_path;
use super::protocol::{DaemonRequest, DaemonResponse};
use crate::control::{LifecycleResponse, ListResponse, StatusResponse, ToolResponse};
use crate::registry::ProcessOptions;

/// Talks to a running daemon over its Unix socket
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Client for the default socket path
    pub fn new() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub async fn ping(&self) -> Result<()> {
        match self.send_request(DaemonRequest::Ping).await? {
            DaemonResponse::Pong => Ok(()),
            other => unexpected(other),
        }
    }

    pub async fn start(
        &self,
        name: &str,
        command: Vec<String>,
        options: ProcessOptions,
    ) -> Result<LifecycleResponse> {
        let request = DaemonRequest::Start {
            name: name.to_string(),
            command,
            options,
        };
        match self.send_request(request).await? {
            DaemonResponse::Lifecycle(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<LifecycleResponse> {
        let request = DaemonRequest::Stop {
            name: name.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Lifecycle(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn restart(&self, name: &str) -> Result<LifecycleResponse> {
        let request = DaemonRequest::Restart {
            name: name.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Lifecycle(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn status(&self, name: &str) -> Result<StatusResponse> {
        let request = DaemonRequest::Status {
            name: name.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Status(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn list(&self) -> Result<ListResponse> {
        match self.send_request(DaemonRequest::List).await? {
            DaemonResponse::List(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn call_tool(&self, name: &str, tool: &str, arguments: Value) -> Result<ToolResponse> {
        let request = DaemonRequest::CallTool {
            name: name.to_string(),
            tool: tool.to_string(),
            arguments,
        };
        match self.send_request(request).await? {
            DaemonResponse::Tool(response) => Ok(response),
            other => unexpected(other),
        }
    }

    pub async fn list_tools(&self, name: &str) -> Result<ToolResponse> {
        let request = DaemonRequest::ListTools {
            name: name.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Tool(response) => Ok(response),
            other => unexpected(other),
        }
    }

    /// Ask the daemon to stop every process and exit
    pub async fn shutdown(&self) -> Result<()> {
        match self.send_request(DaemonRequest::Shutdown).await? {
            DaemonResponse::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    /// Send one request and read one response line
    async fn send_request(&self, request: DaemonRequest) -> Result<DaemonResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context(format!(
                "Failed to connect to daemon at {:?}",
                self.socket_path
            ))?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request_json = serde_json::to_string(&request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.is_empty() {
            anyhow::bail!("daemon closed the connection without responding");
        }

        serde_json::from_str(&line).context("Failed to parse daemon response")
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected<T>(response: DaemonResponse) -> Result<T> {
    match response {
        DaemonResponse::Error { message } => anyhow::bail!("{}", message),
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}
