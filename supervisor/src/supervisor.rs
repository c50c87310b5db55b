//! Process supervisor: start, stop, restart and status for named processes
//!
//! Start/Stop/Restart for one name are serialized by a per-name async lock;
//! different names proceed in parallel. Status answers always re-check the
//! OS before trusting a stored or cached status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::config::SupervisorSettings;
use crate::connection::{ConnectionSettings, StdioRpcConnection};
use crate::error::{Result, SupervisorError};
use crate::events::EventSink;
use crate::health::ProcessController;
use crate::process::{
    os, unit_name, DirectSpawner, ProcessHandle, SpawnSpec, SpawnStrategy, SystemdSpawner,
};
use crate::registry::{ProcessOptions, ProcessRecord, ProcessRegistry, ProcessStatus, Transport};

/// Runtime state for a process this supervisor controls
struct LiveProcess {
    handle: ProcessHandle,
    connection: Option<Arc<StdioRpcConnection>>,
}

/// One async mutex per process name
///
/// Entries are dropped once the last holder or waiter lets go.
#[derive(Default)]
struct NameLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock for one name; releases its map entry on drop when unused
struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut inner = self.locks.map();
        let unused = inner
            .get(&self.name)
            .map(|entry| Arc::ptr_eq(entry, &self.slot) && Arc::strong_count(&self.slot) == 2)
            .unwrap_or(false);
        if unused {
            inner.remove(&self.name);
        }
    }
}

impl NameLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.map().entry(name.to_string()).or_default().clone()
    }

    fn wrap(
        &self,
        name: &str,
        slot: Arc<tokio::sync::Mutex<()>>,
        guard: OwnedMutexGuard<()>,
    ) -> NameGuard<'_> {
        NameGuard {
            locks: self,
            name: name.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    async fn acquire(&self, name: &str) -> NameGuard<'_> {
        let slot = self.slot(name);
        let guard = slot.clone().lock_owned().await;
        self.wrap(name, slot, guard)
    }

    fn try_acquire(&self, name: &str) -> Option<NameGuard<'_>> {
        let slot = self.slot(name);
        let guard = slot.clone().try_lock_owned().ok()?;
        Some(self.wrap(name, slot, guard))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// What startup reconciliation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Records whose pid was gone
    pub healed: usize,
    /// Live service-manager processes taken back under supervision
    pub adopted: usize,
    /// Live direct children of a previous supervisor, now stopped
    pub terminated: usize,
}

pub struct ProcessSupervisor {
    registry: ProcessRegistry,
    events: EventSink,
    settings: SupervisorSettings,
    direct: Arc<dyn SpawnStrategy>,
    systemd: Arc<dyn SpawnStrategy>,
    live: RwLock<HashMap<String, Arc<LiveProcess>>>,
    locks: NameLocks,
}

impl ProcessSupervisor {
    pub fn new(registry: ProcessRegistry, events: EventSink, settings: SupervisorSettings) -> Self {
        let systemd = Arc::new(SystemdSpawner::new(settings.systemd_user));
        Self {
            registry,
            events,
            settings,
            direct: Arc::new(DirectSpawner),
            systemd,
            live: RwLock::new(HashMap::new()),
            locks: NameLocks::default(),
        }
    }

    /// Replace the spawn strategies
    pub fn with_spawners(
        mut self,
        direct: Arc<dyn SpawnStrategy>,
        systemd: Arc<dyn SpawnStrategy>,
    ) -> Self {
        self.direct = direct;
        self.systemd = systemd;
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            request_timeout: self.settings.request_timeout(),
            handshake_timeout: self.settings.handshake_timeout(),
            poll_min: self.settings.poll_interval(),
            poll_max: self.settings.max_poll_interval(),
        }
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Spawn `command` under `name`, handshake if it speaks stdio, and return its pid
    pub async fn start(
        &self,
        name: &str,
        command: Vec<String>,
        options: ProcessOptions,
    ) -> Result<u32> {
        let _guard = self.locks.acquire(name).await;
        let pid = self.start_locked(name, command, options, false).await?;
        self.registry.clear_restart_attempts(name)?;
        Ok(pid)
    }

    async fn start_locked(
        &self,
        name: &str,
        command: Vec<String>,
        options: ProcessOptions,
        is_restart: bool,
    ) -> Result<u32> {
        let previous = self.registry.get(name)?;
        if let Some(prev) = previous.as_ref().filter(|p| p.is_live()) {
            if self.verify_alive(prev) {
                return Err(SupervisorError::AlreadyRunning {
                    name: name.to_string(),
                    pid: prev.pid,
                });
            }
            self.heal_dead(prev.clone())?;
        }

        let mut record = ProcessRecord::new(name, command, options);
        record.restart_count = previous.map(|p| p.restart_count).unwrap_or(0);
        if is_restart {
            record.restart_count += 1;
        }
        self.registry.save(&record)?;
        tracing::info!(process = %name, command = ?record.command, "starting process");

        let strategy = if record.options.use_systemd {
            &self.systemd
        } else {
            &self.direct
        };
        let spec = SpawnSpec {
            name,
            command: &record.command,
            options: &record.options,
            working_directory: record
                .options
                .working_directory
                .clone()
                .or_else(|| self.settings.application_root.clone()),
            settle_delay: self.settings.settle_delay(),
        };
        let spawned = match strategy.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail_start(record, e)),
        };

        let pid = spawned.handle.pid();
        record.pid = Some(pid);
        if let Err(e) = self.registry.save(&record) {
            self.abandon(&spawned.handle).await;
            return Err(e);
        }

        let connection = match spawned.stdio {
            Some(stdio) => {
                let conn = StdioRpcConnection::builder(name)
                    .settings(self.connection_settings())
                    .liveness(spawned.handle.liveness_probe())
                    .connect(stdio.stdout, stdio.stdin);
                if let Err(e) = conn.initialize().await {
                    conn.close();
                    self.abandon(&spawned.handle).await;
                    let e = match e {
                        SupervisorError::HandshakeFailed { name, message } => {
                            SupervisorError::HandshakeFailed {
                                name,
                                message: spawned.stderr.annotate(message),
                            }
                        }
                        other => other,
                    };
                    return Err(self.fail_start(record, e));
                }
                Some(Arc::new(conn))
            }
            None => None,
        };

        record.transition(ProcessStatus::Running)?;
        record.error_log = None;
        if let Err(e) = self.registry.save(&record) {
            if let Some(conn) = connection {
                conn.close();
            }
            self.abandon(&spawned.handle).await;
            return Err(e);
        }

        self.live_map_mut().insert(
            name.to_string(),
            Arc::new(LiveProcess {
                handle: spawned.handle,
                connection,
            }),
        );
        self.events.started(name, pid, &record.command);
        Ok(pid)
    }

    /// Record a start failure and hand the error back
    fn fail_start(&self, mut record: ProcessRecord, err: SupervisorError) -> SupervisorError {
        let message = err.to_string();
        tracing::error!(process = %record.name, "start failed: {}", message);
        if let Err(e) = record.fail(ProcessStatus::Failed, message.clone()) {
            tracing::warn!(process = %record.name, "{}", e);
        }
        if let Err(e) = self.registry.save(&record) {
            tracing::warn!(process = %record.name, "failed to persist start failure: {}", e);
        }
        self.events.error(&record.name, message);
        err
    }

    /// Kill a process we are giving up on mid-start
    async fn abandon(&self, handle: &ProcessHandle) {
        if let Err(e) = handle.terminate(self.settings.stop_timeout()).await {
            tracing::warn!(pid = handle.pid(), "failed to terminate abandoned process: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------------

    /// Graceful stop with forced-kill fallback
    ///
    /// A process that already exited on its own is cleaned up and reported
    /// as stopped.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(name).await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let mut record = match self.registry.get(name)? {
            Some(record) if record.is_live() => record,
            _ => return Err(SupervisorError::NotRunning(name.to_string())),
        };

        let live = self.live_map_mut().remove(name);
        let pid = record.pid;
        let handle = match (&live, pid) {
            (Some(live), _) => Some(live.handle.clone()),
            (None, Some(pid)) => Some(self.handle_for(&record, pid)),
            (None, None) => None,
        };
        if let Some(conn) = live.as_ref().and_then(|l| l.connection.as_ref()) {
            conn.close();
        }

        let was_running = record.status == ProcessStatus::Running;
        if was_running {
            record.transition(ProcessStatus::Stopping)?;
            self.registry.save(&record)?;
        }

        tracing::info!(process = %name, ?pid, "stopping process");
        if let Some(handle) = handle {
            if let Err(e) = handle.terminate(self.settings.stop_timeout()).await {
                let message = format!("failed to stop: {}", e);
                record.error_log = Some(message.clone());
                self.registry.save(&record)?;
                self.events.error(name, message);
                return Err(e.into());
            }
        }

        if was_running {
            record.transition(ProcessStatus::Stopped)?;
        } else {
            // Leftover Starting/Stopping record from an interrupted operation
            record.mark_found_dead();
        }
        self.registry.save(&record)?;
        self.events.stopped(name, pid);
        Ok(())
    }

    /// Stop every live process; errors are logged, not returned
    pub async fn stop_all(&self) {
        let names: Vec<String> = match self.registry.list_live() {
            Ok(records) => records.into_iter().map(|r| r.name).collect(),
            Err(e) => {
                tracing::error!("failed to list processes for shutdown: {}", e);
                self.live_map().keys().cloned().collect()
            }
        };
        for name in names {
            match self.stop(&name).await {
                Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => tracing::warn!(process = %name, "stop during shutdown failed: {}", e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------------

    /// Stop (if running) then start with the last known command and options
    ///
    /// This is the operator path: success also lifts any restart-quota
    /// escalation for `name`.
    pub async fn restart(&self, name: &str) -> Result<u32> {
        let pid = self.restart_inner(name).await?;
        self.registry.clear_restart_attempts(name)?;
        Ok(pid)
    }

    async fn restart_inner(&self, name: &str) -> Result<u32> {
        let _guard = self.locks.acquire(name).await;
        let record = self
            .registry
            .get(name)?
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        match self.stop_locked(name).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        tracing::info!(process = %name, "restarting process");
        self.start_locked(name, record.command, record.options, true)
            .await
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Cache-first running check, verified against the OS
    ///
    /// A dead pid heals the record (Running -> Died) unless another operation
    /// currently holds the name.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let Some(cached) = self.registry.cached_status(name)? else {
            return Ok(false);
        };
        if cached.status != ProcessStatus::Running {
            return Ok(false);
        }

        let alive = match cached.pid {
            Some(pid) => self.pid_alive(name, pid),
            None => false,
        };
        if alive {
            return Ok(true);
        }

        match self.locks.try_acquire(name) {
            Some(_guard) => {
                if let Some(record) = self.registry.get(name)? {
                    if record.is_live() && !self.verify_alive(&record) {
                        self.heal_dead(record)?;
                    }
                }
            }
            None => self.registry.evict(name),
        }
        Ok(false)
    }

    /// Record snapshot with liveness re-verified
    pub async fn status(&self, name: &str) -> Result<ProcessRecord> {
        let record = self
            .registry
            .get(name)?
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        self.reverify(record)
    }

    /// Every known record, each re-verified
    pub async fn list(&self) -> Result<Vec<ProcessRecord>> {
        self.registry
            .list()?
            .into_iter()
            .map(|record| self.reverify(record))
            .collect()
    }

    fn reverify(&self, record: ProcessRecord) -> Result<ProcessRecord> {
        if !record.is_live() || self.verify_alive(&record) {
            return Ok(record);
        }
        match self.locks.try_acquire(&record.name) {
            Some(_guard) => self.heal_dead(record),
            None => {
                // Busy name: report what the OS says without persisting it
                let mut view = record;
                view.mark_found_dead();
                Ok(view)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Tool calls
    // ------------------------------------------------------------------------

    /// The live connection for `name`
    pub fn connection(&self, name: &str) -> Result<Arc<StdioRpcConnection>> {
        if let Some(live) = self.live_map().get(name) {
            return live
                .connection
                .clone()
                .ok_or_else(|| SupervisorError::NotConnected(name.to_string()));
        }
        match self.registry.get(name)? {
            Some(record)
                if record.is_live() && record.options.effective_transport() == Transport::None =>
            {
                Err(SupervisorError::NotConnected(name.to_string()))
            }
            Some(_) => Err(SupervisorError::NotRunning(name.to_string())),
            None => Err(SupervisorError::NotFound(name.to_string())),
        }
    }

    /// `tools/call` on the process's connection
    pub async fn call_tool(&self, name: &str, tool: &str, arguments: Value) -> Result<Value> {
        let connection = self.connection(name)?;
        connection.call_tool(tool, arguments).await
    }

    /// `tools/list` on the process's connection
    pub async fn list_tools(&self, name: &str) -> Result<Value> {
        let connection = self.connection(name)?;
        connection.list_tools().await
    }

    // ------------------------------------------------------------------------
    // Startup reconciliation
    // ------------------------------------------------------------------------

    /// Re-verify records left live by a previous supervisor instance
    pub async fn reconcile(&self) -> Result<Reconciled> {
        let mut report = Reconciled::default();

        for record in self.registry.list_live()? {
            let name = record.name.clone();
            let _guard = self.locks.acquire(&name).await;
            if self.live_map().contains_key(&name) {
                continue;
            }

            let pid = match record.pid.filter(|pid| os::is_alive(*pid)) {
                Some(pid) => pid,
                None => {
                    self.heal_dead(record)?;
                    report.healed += 1;
                    continue;
                }
            };

            if record.options.use_systemd && record.status != ProcessStatus::Stopping {
                self.adopt(record, pid)?;
                report.adopted += 1;
            } else {
                self.terminate_orphan(record, pid).await?;
                report.terminated += 1;
            }
        }

        if report != Reconciled::default() {
            tracing::info!(
                healed = report.healed,
                adopted = report.adopted,
                terminated = report.terminated,
                "reconciled stale records"
            );
        }
        Ok(report)
    }

    fn adopt(&self, mut record: ProcessRecord, pid: u32) -> Result<()> {
        if record.status == ProcessStatus::Starting {
            record.transition(ProcessStatus::Running)?;
            self.registry.save(&record)?;
        }
        tracing::info!(process = %record.name, pid, "adopted service-manager process");
        self.live_map_mut().insert(
            record.name.clone(),
            Arc::new(LiveProcess {
                handle: self.handle_for(&record, pid),
                connection: None,
            }),
        );
        Ok(())
    }

    async fn terminate_orphan(&self, mut record: ProcessRecord, pid: u32) -> Result<()> {
        tracing::warn!(process = %record.name, pid, "terminating orphaned process");
        self.handle_for(&record, pid)
            .terminate(self.settings.stop_timeout())
            .await?;

        match record.status {
            ProcessStatus::Running => {
                record.transition(ProcessStatus::Stopping)?;
                record.transition(ProcessStatus::Stopped)?;
            }
            ProcessStatus::Starting => {
                record.fail(ProcessStatus::Failed, "orphaned during startup")?;
            }
            _ => {
                record.mark_found_dead();
            }
        }
        self.registry.save(&record)?;
        self.events.stopped(&record.name, Some(pid));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn live_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LiveProcess>>> {
        self.live.read().unwrap_or_else(|p| p.into_inner())
    }

    fn live_map_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LiveProcess>>> {
        self.live.write().unwrap_or_else(|p| p.into_inner())
    }

    fn handle_for(&self, record: &ProcessRecord, pid: u32) -> ProcessHandle {
        if record.options.use_systemd {
            ProcessHandle::unit(pid, unit_name(&record.name), self.settings.systemd_user)
        } else {
            ProcessHandle::adopted(pid)
        }
    }

    /// Liveness of `pid`, preferring our own handle when it is the same process
    fn pid_alive(&self, name: &str, pid: u32) -> bool {
        match self.live_map().get(name) {
            Some(live) if live.handle.pid() == pid => live.handle.is_alive(),
            _ => os::is_alive(pid),
        }
    }

    fn verify_alive(&self, record: &ProcessRecord) -> bool {
        record
            .pid
            .map(|pid| self.pid_alive(&record.name, pid))
            .unwrap_or(false)
    }

    /// Apply the self-heal table to a record whose process is gone
    fn heal_dead(&self, mut record: ProcessRecord) -> Result<ProcessRecord> {
        let name = record.name.clone();
        let pid = record.pid;
        if let Some(live) = self.live_map_mut().remove(&name) {
            if let Some(conn) = live.connection.as_ref() {
                conn.close();
            }
        }
        let Some(next) = record.mark_found_dead() else {
            return Ok(record);
        };
        self.registry.save(&record)?;
        tracing::warn!(process = %name, ?pid, status = %next, "process found dead");
        if next == ProcessStatus::Died {
            self.events.error(&name, "process exited unexpectedly");
        }
        Ok(record)
    }
}

#[async_trait]
impl ProcessController for ProcessSupervisor {
    /// Health-driven restart; leaves the quota bookkeeping alone
    async fn restart(&self, name: &str) -> Result<u32> {
        self.restart_inner(name).await
    }

    fn connection(&self, name: &str) -> Option<Arc<StdioRpcConnection>> {
        ProcessSupervisor::connection(self, name).ok()
    }

    async fn mark_dead(&self, name: &str) -> Result<()> {
        let Some(_guard) = self.locks.try_acquire(name) else {
            return Ok(());
        };
        if let Some(record) = self.registry.get(name)? {
            if record.is_live() && !self.verify_alive(&record) {
                self.heal_dead(record)?;
            }
        }
        Ok(())
    }
}
