//! Unix-socket server for the control plane

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use super::protocol::{DaemonRequest, DaemonResponse};
use super::DaemonClient;
use crate::control::ControlPlane;

/// Serves [`ControlPlane`] requests until shutdown
pub struct SupervisorDaemon {
    control: ControlPlane,
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl SupervisorDaemon {
    pub fn new(control: ControlPlane, socket_path: PathBuf) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            control,
            socket_path,
            shutdown,
        }
    }

    /// Flips to `true` when the daemon begins shutting down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve until Shutdown, SIGINT or SIGTERM
    ///
    /// On the way out every running process is stopped and the socket removed.
    pub async fn run(self) -> Result<()> {
        if DaemonClient::with_socket_path(self.socket_path.clone())
            .is_running()
            .await
        {
            anyhow::bail!("a daemon is already listening on {:?}", self.socket_path);
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Stale socket from a crashed daemon
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        let listener = UnixListener::bind(&self.socket_path)
            .context(format!("Failed to bind to socket: {:?}", self.socket_path))?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::info!("supervisor daemon listening on {:?}", self.socket_path);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let control = self.control.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, control, shutdown).await {
                                tracing::warn!("connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                },
                _ = shutdown_rx.changed() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    break;
                }
            }
        }

        self.shutdown.send_replace(true);
        self.control.supervisor().stop_all().await;
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        tracing::info!("supervisor daemon stopped");
        Ok(())
    }
}

/// Read one request line, answer it, close
async fn handle_connection(
    stream: UnixStream,
    control: ControlPlane,
    shutdown: watch::Sender<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let (response, stop_after) = match serde_json::from_str::<DaemonRequest>(&line) {
        Ok(DaemonRequest::Shutdown) => (DaemonResponse::Ok, true),
        Ok(request) => {
            tracing::debug!(?request, "daemon request");
            (handle_request(&control, request).await, false)
        }
        Err(e) => (
            DaemonResponse::Error {
                message: format!("invalid request: {}", e),
            },
            false,
        ),
    };

    let response_json = serde_json::to_string(&response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    if stop_after {
        shutdown.send_replace(true);
    }
    Ok(())
}

async fn handle_request(control: &ControlPlane, request: DaemonRequest) -> DaemonResponse {
    match request {
        DaemonRequest::Start {
            name,
            command,
            options,
        } => DaemonResponse::Lifecycle(control.start_process(&name, command, options).await),
        DaemonRequest::Stop { name } => DaemonResponse::Lifecycle(control.stop_process(&name).await),
        DaemonRequest::Restart { name } => {
            DaemonResponse::Lifecycle(control.restart_process(&name).await)
        }
        DaemonRequest::Status { name } => {
            DaemonResponse::Status(control.get_process_status(&name).await)
        }
        DaemonRequest::List => DaemonResponse::List(control.list_processes().await),
        DaemonRequest::CallTool {
            name,
            tool,
            arguments,
        } => DaemonResponse::Tool(control.call_tool(&name, &tool, arguments).await),
        DaemonRequest::ListTools { name } => DaemonResponse::Tool(control.list_tools(&name).await),
        DaemonRequest::Ping => DaemonResponse::Pong,
        DaemonRequest::Shutdown => DaemonResponse::Ok,
    }
}
