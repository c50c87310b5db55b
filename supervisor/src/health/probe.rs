//! OS probes used by the health layers

use std::sync::Mutex;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::process::os;

/// Memory and thread usage at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub memory_mb: u64,
    pub threads: u64,
}

/// Source of per-pid measurements
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Cumulative user + system CPU time; `None` when unavailable
    fn cpu_time(&self, pid: u32) -> Option<Duration>;

    fn resources(&self, pid: u32) -> Option<ResourceSample>;
}

/// Probe backed by `sysinfo` for memory and `/proc` for CPU time and threads
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn memory_bytes(&self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn is_alive(&self, pid: u32) -> bool {
        os::is_alive(pid)
    }

    fn cpu_time(&self, pid: u32) -> Option<Duration> {
        os::read_proc_stat(pid).ok().map(|stat| stat.cpu_time)
    }

    fn resources(&self, pid: u32) -> Option<ResourceSample> {
        let memory = self.memory_bytes(pid)?;
        let threads = os::read_proc_stat(pid).map(|stat| stat.threads).unwrap_or(1);
        Some(ResourceSample {
            memory_mb: memory / (1024 * 1024),
            threads,
        })
    }
}
