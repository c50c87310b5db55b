//! Shared fixtures for the e2e tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_supervisor::config::SupervisorSettings;
use mcp_supervisor::events::EventSink;
use mcp_supervisor::process::os;
use mcp_supervisor::registry::{ProcessOptions, ProcessRegistry, SqliteStore, Transport};
use mcp_supervisor::ProcessSupervisor;

/// Settings with short timeouts so failures surface quickly
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        request_timeout_secs: 5,
        handshake_timeout_secs: 3,
        stop_timeout_secs: 2,
        settle_delay_ms: 150,
        ..Default::default()
    }
}

/// Supervisor over an in-memory store with a TTL cache
pub fn supervisor() -> Arc<ProcessSupervisor> {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    let registry = ProcessRegistry::with_memory_cache(store, Duration::from_secs(20));
    Arc::new(ProcessSupervisor::new(
        registry,
        EventSink::none(),
        fast_settings(),
    ))
}

/// Options for a process that does not speak JSON-RPC
pub fn plain() -> ProcessOptions {
    ProcessOptions {
        transport: Transport::None,
        ..Default::default()
    }
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn echo_server() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_mcp-echo").to_string()]
}

/// SIGKILL a pid behind the supervisor's back
pub fn kill_externally(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("run kill");
    assert!(status.success(), "kill -9 {} failed", pid);
}

/// Wait until the OS no longer reports `pid` alive
pub async fn wait_for_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while os::is_alive(pid) {
        assert!(Instant::now() < deadline, "pid {} still alive", pid);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
