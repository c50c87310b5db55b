//! OS process handles and spawn strategies

pub mod os;
pub mod spawn;

pub use spawn::{
    unit_name, ChildStdio, DirectSpawner, SpawnSpec, SpawnStrategy, Spawned, StderrTail,
    SystemdSpawner,
};

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Lower bound of the exit-poll backoff
const POLL_MIN: Duration = Duration::from_millis(10);
/// Upper bound of the exit-poll backoff
const POLL_MAX: Duration = Duration::from_millis(250);
/// How long to wait for exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Shared liveness check, handed to connections for fast-fail
pub type LivenessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum HandleKind {
    /// Our own child; a reaper task publishes its exit status
    Direct {
        exit: watch::Receiver<Option<ExitStatus>>,
    },
    /// Managed by the service manager under `unit`
    Unit { unit: String, user: bool },
    /// Found alive at startup; no exit notification available
    Adopted,
}

/// A started OS process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    kind: HandleKind,
}

impl ProcessHandle {
    /// Take ownership of a spawned child and start reaping it
    pub fn from_child(pid: u32, mut child: Child) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::debug!(pid, %status, "child exited");
                    tx.send_replace(Some(status));
                }
                Err(e) => tracing::warn!(pid, "failed to wait on child: {}", e),
            }
        });
        Self {
            pid,
            kind: HandleKind::Direct { exit: rx },
        }
    }

    pub fn unit(pid: u32, unit: impl Into<String>, user: bool) -> Self {
        Self {
            pid,
            kind: HandleKind::Unit {
                unit: unit.into(),
                user,
            },
        }
    }

    pub fn adopted(pid: u32) -> Self {
        Self {
            pid,
            kind: HandleKind::Adopted,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, when known (direct children only)
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match &self.kind {
            HandleKind::Direct { exit } => *exit.borrow(),
            _ => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        if self.exit_status().is_some() {
            return false;
        }
        os::is_alive(self.pid)
    }

    /// Cloneable liveness check for use outside the handle
    pub fn liveness_probe(&self) -> LivenessProbe {
        let handle = self.clone();
        Arc::new(move || handle.is_alive())
    }

    /// Wait until the process is gone; returns false on timeout
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        match &self.kind {
            HandleKind::Direct { exit } => {
                let mut exit = exit.clone();
                let outcome = tokio::time::timeout(timeout, exit.wait_for(|s| s.is_some()))
                    .await
                    .map(|seen| seen.is_ok());
                match outcome {
                    Ok(true) => true,
                    // Reaper gone without a status; fall back to the OS view
                    Ok(false) => poll_until_dead(self.pid, timeout).await,
                    Err(_) => false,
                }
            }
            _ => poll_until_dead(self.pid, timeout).await,
        }
    }

    /// Whether `terminate` has anything to do
    ///
    /// A unit is always stopped through the service manager: after an
    /// on-failure restart it runs under a pid we never saw.
    fn needs_stop(&self) -> bool {
        matches!(self.kind, HandleKind::Unit { .. }) || self.is_alive()
    }

    /// Graceful stop: SIGTERM (or unit stop), bounded wait, then SIGKILL
    pub async fn terminate(&self, grace: Duration) -> io::Result<()> {
        if !self.needs_stop() {
            return Ok(());
        }

        if let HandleKind::Unit { unit, user } = &self.kind {
            if let Err(e) = stop_unit(unit, *user, grace).await {
                tracing::warn!(unit = %unit, "service manager stop failed: {}", e);
            }
        } else {
            os::send_signal(self.pid, os::Signal::Term)?;
        }

        if self.wait_for_exit(grace).await {
            return Ok(());
        }

        tracing::warn!(pid = self.pid, ?grace, "graceful stop timed out, sending SIGKILL");
        os::send_signal(self.pid, os::Signal::Kill)?;
        if self.wait_for_exit(KILL_WAIT).await {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("pid {} survived SIGKILL", self.pid),
            ))
        }
    }
}

/// Poll the OS with exponential backoff until `pid` disappears
async fn poll_until_dead(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = POLL_MIN;
    loop {
        if !os::is_alive(pid) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(POLL_MAX);
    }
}

pub(crate) fn systemctl(user: bool) -> Command {
    let mut cmd = Command::new("systemctl");
    if user {
        cmd.arg("--user");
    }
    cmd
}

pub(crate) async fn stop_unit(unit: &str, user: bool, timeout: Duration) -> io::Result<()> {
    let mut cmd = systemctl(user);
    cmd.arg("stop").arg(unit);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "systemctl stop timed out"))??;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn_sleep(secs: &str) -> ProcessHandle {
        let child = Command::new("sleep")
            .arg(secs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        ProcessHandle::from_child(pid, child)
    }

    #[tokio::test]
    async fn test_terminate_direct_child() {
        let handle = spawn_sleep("30");
        assert!(handle.is_alive());
        handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!handle.is_alive());
        assert!(handle.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_exit_is_observed_without_polling_os() {
        let handle = spawn_sleep("0");
        assert!(handle.wait_for_exit(Duration::from_secs(5)).await);
        assert!(!handle.is_alive());
        assert!(!(handle.liveness_probe())());
    }

    #[tokio::test]
    async fn test_terminate_dead_process_is_ok() {
        let handle = spawn_sleep("0");
        handle.wait_for_exit(Duration::from_secs(5)).await;
        handle.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_handle_always_needs_stop() {
        let exited = spawn_sleep("0");
        exited.wait_for_exit(Duration::from_secs(5)).await;

        let unit = ProcessHandle::unit(exited.pid(), "mcp-test", true);
        assert!(!unit.is_alive());
        assert!(unit.needs_stop());

        let adopted = ProcessHandle::adopted(exited.pid());
        assert!(!adopted.needs_stop());
        assert!(!exited.needs_stop());
    }

    #[tokio::test]
    async fn test_adopted_handle_polls_os() {
        let child = spawn_sleep("30");
        let adopted = ProcessHandle::adopted(child.pid());
        assert!(adopted.is_alive());
        adopted.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(child.wait_for_exit(Duration::from_secs(5)).await);
    }
}
