//! Spawn strategies
//!
//! Both strategies hand back a [`Spawned`] with the same contract: a pid that
//! was alive after the settle delay. The direct strategy also returns the
//! child's stdio pipes; the service-manager strategy never does.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};

use super::{stop_unit, systemctl, ProcessHandle};
use crate::error::{Result, SupervisorError};
use crate::registry::{ProcessOptions, Transport};

/// Number of stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Bound on clearing a leftover unit before launch
const UNIT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a strategy needs to launch one process
#[derive(Debug, Clone)]
pub struct SpawnSpec<'a> {
    pub name: &'a str,
    pub command: &'a [String],
    pub options: &'a ProcessOptions,
    /// Resolved working directory (option or application root)
    pub working_directory: Option<PathBuf>,
    pub settle_delay: Duration,
}

impl SpawnSpec<'_> {
    fn spawn_failed(&self, message: impl Into<String>) -> SupervisorError {
        SupervisorError::SpawnFailed {
            name: self.name.to_string(),
            message: message.into(),
        }
    }

    fn program(&self) -> Result<(&String, &[String])> {
        self.command
            .split_first()
            .ok_or_else(|| self.spawn_failed("empty command"))
    }
}

/// The child's protocol pipes
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Last few lines a child wrote to stderr
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Captured lines joined with newlines; empty if nothing was written
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// `message`, followed by captured stderr when there is any
    pub fn annotate(&self, message: impl Into<String>) -> String {
        let message = message.into();
        let tail = self.snapshot();
        if tail.is_empty() {
            message
        } else {
            format!("{}\nstderr:\n{}", message, tail)
        }
    }
}

/// Result of a successful spawn
#[derive(Debug)]
pub struct Spawned {
    pub handle: ProcessHandle,
    pub stdio: Option<ChildStdio>,
    pub stderr: StderrTail,
}

/// A way of starting a process
#[async_trait]
pub trait SpawnStrategy: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec<'_>) -> Result<Spawned>;
}

// ============================================================================
// Direct
// ============================================================================

/// Spawns the process as our own child
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSpawner;

#[async_trait]
impl SpawnStrategy for DirectSpawner {
    async fn spawn(&self, spec: &SpawnSpec<'_>) -> Result<Spawned> {
        let (program, args) = spec.program()?;
        let with_stdio = spec.options.effective_transport() == Transport::Stdio;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.options.environment)
            .stderr(Stdio::piped());
        if with_stdio {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::null());
        }
        if let Some(ref dir) = spec.working_directory {
            cmd.current_dir(dir);
        }
        // Own process group: a terminal ^C reaches the daemon, not the children
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| spec.spawn_failed(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| spec.spawn_failed("process exited before reporting a pid"))?;

        let stdio = if with_stdio {
            match (child.stdin.take(), child.stdout.take()) {
                (Some(stdin), Some(stdout)) => Some(ChildStdio { stdin, stdout }),
                _ => return Err(spec.spawn_failed("child stdio pipes unavailable")),
            }
        } else {
            None
        };

        let stderr = StderrTail::default();
        if let Some(pipe) = child.stderr.take() {
            drain_stderr(spec.name.to_string(), pipe, stderr.clone());
        }

        let handle = ProcessHandle::from_child(pid, child);
        tracing::debug!(process = %spec.name, pid, "spawned, settling for {:?}", spec.settle_delay);
        tokio::time::sleep(spec.settle_delay).await;

        if let Some(status) = handle.exit_status() {
            // Give the drain task a moment to capture the last words
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(spec.spawn_failed(
                stderr.annotate(format!("exited during startup ({})", status)),
            ));
        }

        Ok(Spawned {
            handle,
            stdio,
            stderr,
        })
    }
}

/// Re-emit child stderr as debug events so the pipe never fills
fn drain_stderr(name: String, pipe: ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(process = %name, "stderr: {}", line);
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(process = %name, "stderr read failed: {}", e);
                    break;
                }
            }
        }
    });
}

// ============================================================================
// Service manager
// ============================================================================

/// Unit name used for a process
pub fn unit_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("mcp-{}", safe)
}

/// Hands the process to systemd via a transient unit
///
/// Restart-on-crash becomes the service manager's job; we only learn the
/// main pid after the unit is up.
#[derive(Debug, Clone, Copy)]
pub struct SystemdSpawner {
    /// Use the per-user manager (`--user`)
    pub user: bool,
}

impl SystemdSpawner {
    pub fn new(user: bool) -> Self {
        Self { user }
    }

    async fn main_pid(&self, unit: &str) -> std::io::Result<u32> {
        let output = systemctl(self.user)
            .args(["show", "--property=MainPID", "--value", unit])
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse::<u32>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected MainPID '{}': {}", text.trim(), e),
            )
        })
    }

    /// Stop and forget any unit left under `unit`
    ///
    /// systemd may have restarted a crashed unit on its own; `systemd-run`
    /// refuses a name that is still loaded.
    async fn clear_stale_unit(&self, unit: &str, timeout: Duration) {
        if let Err(e) = stop_unit(unit, self.user, timeout).await {
            tracing::debug!(unit = %unit, "no unit to stop: {}", e);
        }
        match systemctl(self.user).args(["reset-failed", unit]).output().await {
            Ok(output) if !output.status.success() => {
                tracing::debug!(
                    unit = %unit,
                    "reset-failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(unit = %unit, "reset-failed: {}", e),
        }
    }
}

#[async_trait]
impl SpawnStrategy for SystemdSpawner {
    async fn spawn(&self, spec: &SpawnSpec<'_>) -> Result<Spawned> {
        spec.program()?;
        let unit = unit_name(spec.name);
        self.clear_stale_unit(&unit, UNIT_STOP_TIMEOUT).await;

        let mut cmd = Command::new("systemd-run");
        if self.user {
            cmd.arg("--user");
        }
        cmd.arg(format!("--unit={}", unit))
            .arg("--collect")
            .arg("--property=Restart=on-failure");
        if let Some(ref dir) = spec.working_directory {
            cmd.arg(format!("--working-directory={}", dir.display()));
        }
        for (key, value) in &spec.options.environment {
            cmd.arg(format!("--setenv={}={}", key, value));
        }
        cmd.arg("--").args(spec.command);

        let output = cmd
            .output()
            .await
            .map_err(|e| spec.spawn_failed(format!("systemd-run: {}", e)))?;
        if !output.status.success() {
            return Err(spec.spawn_failed(format!(
                "systemd-run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tokio::time::sleep(spec.settle_delay).await;

        let pid = self
            .main_pid(&unit)
            .await
            .map_err(|e| spec.spawn_failed(format!("querying {}: {}", unit, e)))?;
        if pid == 0 {
            return Err(spec.spawn_failed(format!("unit {} has no main process", unit)));
        }

        tracing::debug!(process = %spec.name, pid, unit = %unit, "unit started");
        Ok(Spawned {
            handle: ProcessHandle::unit(pid, unit, self.user),
            stdio: None,
            stderr: StderrTail::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(name: &'a str, command: &'a [String], options: &'a ProcessOptions) -> SpawnSpec<'a> {
        SpawnSpec {
            name,
            command,
            options,
            working_directory: None,
            settle_delay: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_unit_name_is_sanitized() {
        assert_eq!(unit_name("git"), "mcp-git");
        assert_eq!(unit_name("my server/1"), "mcp-my-server-1");
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        assert_eq!(tail.annotate("boom"), "boom");
        for i in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {}", i));
        }
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 4\n"));
        assert!(snapshot.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[tokio::test]
    async fn test_direct_spawn_empty_command() {
        let options = ProcessOptions::default();
        let err = DirectSpawner.spawn(&spec("e", &[], &options)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_direct_spawn_captures_early_exit_stderr() {
        let options = ProcessOptions::default();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo missing-config >&2; exit 3".to_string(),
        ];
        let err = DirectSpawner
            .spawn(&spec("bad", &command, &options))
            .await
            .unwrap_err();
        match err {
            SupervisorError::SpawnFailed { message, .. } => {
                assert!(message.contains("exited during startup"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_spawn_without_stdio() {
        let options = ProcessOptions {
            transport: Transport::None,
            ..Default::default()
        };
        let command = vec!["sleep".to_string(), "30".to_string()];
        let spawned = DirectSpawner
            .spawn(&spec("sleeper", &command, &options))
            .await
            .unwrap();
        assert!(spawned.stdio.is_none());
        assert!(spawned.handle.is_alive());
        spawned
            .handle
            .terminate(Duration::from_secs(5))
            .await
            .unwrap();
    }
}
