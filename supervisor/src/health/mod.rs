//! Periodic health evaluation and quota-gated restarts
//!
//! Each pass evaluates every Running record concurrently, each under its own
//! timeout. Died records are picked up too, so a crash first noticed by a
//! status query still gets restarted; once a Died record hits the quota it is
//! left alone until the window rolls forward or an operator starts it.
//! Evaluation runs four layers in order:
//!
//! 1. liveness: the recorded pid exists (a dead pid short-circuits to score 0)
//! 2. responsiveness: per-kind policy (CPU time advancing, JSON-RPC ping, or off)
//! 3. resources: memory and thread count under their thresholds
//! 4. application: the kind's own check; unknown kinds pass
//!
//! A score below the threshold asks the controller for a restart, at most
//! `max_restarts_per_hour` times per name in any trailing 60 minutes.

pub mod checks;
pub mod probe;

pub use checks::{AppCheck, AppCheckResult, AppChecks, LogWatcherCheck, LOG_WATCHER_KIND};
pub use probe::{ProcessProbe, ResourceSample, SysinfoProbe};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::{HealthSettings, ResponsivenessMode};
use crate::connection::StdioRpcConnection;
use crate::error::{Result, SupervisorError};
use crate::events::EventSink;
use crate::registry::{HealthSnapshot, ProcessRecord, ProcessRegistry, ProcessStatus};

/// Rolling window for the restart quota
pub const RESTART_WINDOW: Duration = Duration::from_secs(60 * 60);

/// What the monitor needs from the supervisor
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Stop-then-start the named process; returns the new pid
    async fn restart(&self, name: &str) -> Result<u32>;

    /// Live stdio connection, if the process has one
    fn connection(&self, name: &str) -> Option<Arc<StdioRpcConnection>>;

    /// Move a record whose pid vanished to its dead state
    async fn mark_dead(&self, name: &str) -> Result<()>;
}

/// Result of one evaluation, as sent with health events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Percentage of the four layers that passed
    pub score: u8,
    pub liveness: bool,
    pub responsive: bool,
    pub resource_healthy: bool,
    pub app_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    /// Reasons for failed layers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<String>,
}

impl HealthMetrics {
    /// Metrics for a process whose pid is gone
    pub fn dead(reason: impl Into<String>) -> Self {
        Self {
            detail: vec![reason.into()],
            ..Default::default()
        }
    }

    /// Metrics for an evaluation that did not finish in time
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            detail: vec![format!("health check timed out after {:?}", timeout)],
            ..Default::default()
        }
    }

    /// All four layers passed
    pub fn healthy(&self) -> bool {
        self.liveness && self.responsive && self.resource_healthy && self.app_healthy
    }

    fn compute_score(&mut self) {
        let layers = [
            self.liveness,
            self.responsive,
            self.resource_healthy,
            self.app_healthy,
        ];
        let passed = layers.iter().filter(|ok| **ok).count();
        self.score = (passed * 100 / layers.len()) as u8;
    }
}

/// What happened to one process during a pass
#[derive(Debug)]
pub struct Evaluation {
    pub name: String,
    pub metrics: HealthMetrics,
    /// `None` when no restart was needed
    pub restart: Option<Result<u32>>,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    pid: u32,
    cpu_time: Duration,
    taken_at: Instant,
}

pub struct HealthMonitor {
    registry: ProcessRegistry,
    controller: Arc<dyn ProcessController>,
    probe: Arc<dyn ProcessProbe>,
    checks: AppChecks,
    events: EventSink,
    settings: HealthSettings,
    cpu_samples: Mutex<HashMap<String, CpuSample>>,
    /// Names whose quota ran out; cleared once attempts drop below the max
    escalated: Mutex<HashSet<String>>,
}

impl HealthMonitor {
    pub fn new(
        registry: ProcessRegistry,
        controller: Arc<dyn ProcessController>,
        events: EventSink,
        settings: HealthSettings,
    ) -> Self {
        Self {
            checks: AppChecks::with_defaults(&settings),
            registry,
            controller,
            probe: Arc::new(SysinfoProbe::new()),
            events,
            settings,
            cpu_samples: Mutex::new(HashMap::new()),
            escalated: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_checks(mut self, checks: AppChecks) -> Self {
        self.checks = checks;
        self
    }

    /// Evaluate on every interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; give fresh processes one interval
        ticker.tick().await;

        tracing::info!(interval = ?self.settings.interval(), "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evaluations = self.clone().evaluate_all().await;
                    tracing::debug!(count = evaluations.len(), "health pass complete");
                    if let Err(e) = self.registry.prune_restart_attempts(RESTART_WINDOW) {
                        tracing::debug!("failed to prune restart attempts: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("health monitor stopped");
    }

    /// One pass over every Running record and every Died record not escalated
    pub async fn evaluate_all(self: Arc<Self>) -> Vec<Evaluation> {
        let records = match self.registry.list() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("health pass could not list processes: {}", e);
                return Vec::new();
            }
        };

        let mut tasks = JoinSet::new();
        let due = records.into_iter().filter(|r| match r.status {
            ProcessStatus::Running => true,
            ProcessStatus::Died => !self.still_escalated(&r.name),
            _ => false,
        });
        for record in due {
            let monitor = self.clone();
            tasks.spawn(async move { monitor.evaluate_and_act(record).await });
        }

        let mut evaluations = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(evaluation)) => evaluations.push(evaluation),
                Ok(None) => {}
                Err(e) => tracing::error!("health evaluation task failed: {}", e),
            }
        }
        evaluations
    }

    /// Evaluate one record under the per-process timeout, then apply the restart policy
    async fn evaluate_and_act(&self, record: ProcessRecord) -> Option<Evaluation> {
        let name = record.name.clone();
        let metrics =
            match tokio::time::timeout(self.settings.check_timeout(), self.evaluate(&record)).await
            {
                Ok(metrics) => metrics,
                Err(_) => {
                    let timeout = self.settings.check_timeout();
                    tracing::warn!(process = %name, ?timeout, "health check timed out");
                    // Unhealthy on record, but an unfinished check never restarts
                    let metrics = HealthMetrics::timed_out(timeout);
                    self.record(&name, &metrics);
                    return Some(Evaluation {
                        name,
                        metrics,
                        restart: None,
                    });
                }
            };

        self.record(&name, &metrics);

        let restart = if metrics.score < self.settings.restart_score_threshold {
            Some(self.request_restart(&name, metrics.score).await)
        } else {
            None
        };

        Some(Evaluation {
            name,
            metrics,
            restart,
        })
    }

    /// Run the four layers for one record
    pub async fn evaluate(&self, record: &ProcessRecord) -> HealthMetrics {
        let name = &record.name;
        if record.status == ProcessStatus::Died {
            return HealthMetrics::dead(
                record
                    .error_log
                    .clone()
                    .unwrap_or_else(|| "process exited unexpectedly".to_string()),
            );
        }
        let pid = match record.pid {
            Some(pid) if self.probe.is_alive(pid) => pid,
            other => {
                if let Err(e) = self.controller.mark_dead(name).await {
                    tracing::warn!(process = %name, "failed to mark process dead: {}", e);
                }
                return HealthMetrics::dead(match other {
                    Some(pid) => format!("pid {} is not running", pid),
                    None => "no pid recorded".to_string(),
                });
            }
        };

        let mut metrics = HealthMetrics {
            liveness: true,
            ..Default::default()
        };

        // Responsiveness
        let policy = self.settings.policy_for(record.options.kind.as_deref());
        let cpu_time = self.probe.cpu_time(pid);
        metrics.cpu_time_ms = cpu_time.map(|t| t.as_millis() as u64);
        metrics.responsive = match policy.responsiveness {
            ResponsivenessMode::Disabled => true,
            ResponsivenessMode::CpuTime => self.cpu_advanced(name, pid, cpu_time),
            ResponsivenessMode::Ping => match self.controller.connection(name) {
                Some(conn) => match conn.ping(self.settings.check_timeout() / 2).await {
                    Ok(()) => true,
                    Err(e) => {
                        metrics.detail.push(format!("ping failed: {}", e));
                        false
                    }
                },
                // No protocol channel to ping; CPU time is all we have
                None => self.cpu_advanced(name, pid, cpu_time),
            },
        };
        if !metrics.responsive && policy.responsiveness != ResponsivenessMode::Ping {
            metrics.detail.push("cpu time did not advance".to_string());
        }

        // Resources
        match self.probe.resources(pid) {
            Some(sample) => {
                metrics.memory_mb = Some(sample.memory_mb);
                metrics.threads = Some(sample.threads);
                let memory_ok = sample.memory_mb <= self.settings.max_memory_mb;
                let threads_ok = sample.threads <= self.settings.max_threads;
                if !memory_ok {
                    metrics.detail.push(format!(
                        "memory {}MB over {}MB",
                        sample.memory_mb, self.settings.max_memory_mb
                    ));
                }
                if !threads_ok {
                    metrics.detail.push(format!(
                        "{} threads over {}",
                        sample.threads, self.settings.max_threads
                    ));
                }
                metrics.resource_healthy = memory_ok && threads_ok;
            }
            None => {
                metrics.resource_healthy = true;
                metrics.detail.push("resource sample unavailable".to_string());
            }
        }

        // Application
        let app = self.checks.run(record);
        metrics.app_healthy = app.passed;
        if let Some(detail) = app.detail {
            metrics.detail.push(detail);
        }

        metrics.compute_score();
        metrics
    }

    /// CPU time moved since the previous sample (first sample counts as responsive)
    fn cpu_advanced(&self, name: &str, pid: u32, current: Option<Duration>) -> bool {
        let Some(current) = current else {
            return true;
        };
        let now = Instant::now();
        let mut samples = self.cpu_samples.lock().unwrap_or_else(|p| p.into_inner());
        let previous = samples
            .get(name)
            .filter(|s| s.pid == pid && now.duration_since(s.taken_at) < self.settings.cpu_sample_ttl())
            .copied();
        samples.insert(
            name.to_string(),
            CpuSample {
                pid,
                cpu_time: current,
                taken_at: now,
            },
        );
        match previous {
            Some(previous) => current > previous.cpu_time,
            None => true,
        }
    }

    /// Persist the snapshot and emit the health event
    fn record(&self, name: &str, metrics: &HealthMetrics) {
        let healthy = metrics.healthy();
        let snapshot = HealthSnapshot {
            checked_at: Utc::now(),
            score: metrics.score,
            healthy,
            results: serde_json::to_value(metrics).unwrap_or_default(),
        };
        if let Err(e) = self.registry.update_health(name, &snapshot) {
            tracing::warn!(process = %name, "failed to store health result: {}", e);
        }
        if !healthy {
            tracing::warn!(process = %name, score = metrics.score, detail = ?metrics.detail, "process unhealthy");
        }
        self.events.health(name, healthy, metrics.clone());
    }

    /// Escalated and still over quota
    fn still_escalated(&self, name: &str) -> bool {
        let mut escalated = self.escalated.lock().unwrap_or_else(|p| p.into_inner());
        if !escalated.contains(name) {
            return false;
        }
        match self.registry.restart_attempts_within(name, RESTART_WINDOW) {
            Ok(attempts) if attempts >= self.settings.max_restarts_per_hour => true,
            Ok(_) => {
                escalated.remove(name);
                false
            }
            Err(e) => {
                tracing::debug!(process = %name, "failed to read restart attempts: {}", e);
                true
            }
        }
    }

    /// Restart unless the rolling-hour quota is used up
    async fn request_restart(&self, name: &str, score: u8) -> Result<u32> {
        let max = self.settings.max_restarts_per_hour;
        let attempts = self.registry.restart_attempts_within(name, RESTART_WINDOW)?;
        if attempts >= max {
            let err = SupervisorError::RestartQuotaExceeded {
                name: name.to_string(),
                attempts,
                max,
            };
            let newly = self
                .escalated
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(name.to_string());
            if newly {
                tracing::error!(process = %name, "{}; manual intervention required", err);
                self.events
                    .error(name, format!("{}; manual intervention required", err));
            } else {
                tracing::debug!(process = %name, "{}", err);
            }
            return Err(err);
        }
        self.escalated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);

        self.registry.record_restart_attempt(name, Utc::now())?;
        tracing::warn!(process = %name, score, attempt = attempts + 1, max, "restarting unhealthy process");
        match self.controller.restart(name).await {
            Ok(pid) => Ok(pid),
            Err(e) => {
                self.events
                    .error(name, format!("health-driven restart failed: {}", e));
                Err(e)
            }
        }
    }
}
