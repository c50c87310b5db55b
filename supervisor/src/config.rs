//! Configuration loading
//!
//! Two files drive the supervisor:
//!
//! - `.mcp.json` lists the managed processes (the usual `mcpServers` map)
//! - `.supervisor.toml` holds runtime settings; every key is optional

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::{ProcessOptions, Transport};

/// Directory name used under the platform config/cache dirs
pub const APP_DIR: &str = "mcp-supervisor";

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/mcp-supervisor/
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join(APP_DIR).join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Process definitions (.mcp.json)
// ============================================================================

/// Managed process definitions
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Hand the process to the service manager instead of spawning it directly
    #[serde(default)]
    pub use_systemd: bool,
    /// Selects the application-specific health check and responsiveness policy
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub transport: Transport,
    /// Start this process when the daemon boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl McpServerConfig {
    /// Full argv: command followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Process options with `$VAR` references in env values expanded
    pub fn options(&self) -> ProcessOptions {
        let environment = self
            .env
            .iter()
            .map(|(key, value)| {
                let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                (key.clone(), expanded.into_owned())
            })
            .collect();

        ProcessOptions {
            working_directory: self.working_directory.clone(),
            environment,
            use_systemd: self.use_systemd,
            kind: self.kind.clone(),
            log_file: self.log_file.clone(),
            transport: self.transport,
        }
    }
}

impl McpConfig {
    /// Load process definitions from .mcp.json
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .mcp.json
    /// 2. Check ~/.config/mcp-supervisor/.mcp.json (global fallback)
    pub fn load() -> Result<Option<Self>> {
        if let Some(config_path) = find_config_file(".mcp.json") {
            tracing::debug!("Loading MCP config from: {}", config_path.display());
            return Self::load_from_path(&config_path).map(Some);
        }

        tracing::debug!("No .mcp.json found");
        Ok(None)
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: McpConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

// ============================================================================
// Runtime settings (.supervisor.toml)
// ============================================================================

/// Top-level settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisorFileConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

impl SupervisorFileConfig {
    /// Load `.supervisor.toml`, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        match find_config_file(".supervisor.toml") {
            Some(path) => {
                tracing::debug!("Loading supervisor config from: {}", path.display());
                Self::load_from_path(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Control-plane and connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Working directory for processes that do not set one
    #[serde(default)]
    pub application_root: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Talk to the per-user service manager rather than the system one
    #[serde(default = "default_systemd_user")]
    pub systemd_user: bool,
}

fn default_request_timeout() -> u64 {
    20
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_stop_timeout() -> u64 {
    5
}
fn default_settle_delay() -> u64 {
    250
}
fn default_cache_ttl() -> u64 {
    20
}
fn default_poll_interval() -> u64 {
    10
}
fn default_max_poll_interval() -> u64 {
    250
}
fn default_systemd_user() -> bool {
    true
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            socket_path: None,
            application_root: None,
            request_timeout_secs: default_request_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            settle_delay_ms: default_settle_delay(),
            cache_ttl_secs: default_cache_ttl(),
            poll_interval_ms: default_poll_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            systemd_user: default_systemd_user(),
        }
    }
}

impl SupervisorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1))
    }

    /// Database location (~/.mcp-supervisor/processes.db unless overridden)
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.database_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".mcp-supervisor").join("processes.db"))
    }

    /// Daemon socket location
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::daemon::default_socket_path)
    }
}

/// How the responsiveness layer judges a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsivenessMode {
    /// Cumulative CPU time must advance between checks
    #[default]
    CpuTime,
    /// A JSON-RPC `ping` over the live connection must succeed
    Ping,
    /// Always passes; for processes that are idle by design
    Disabled,
}

/// Per-kind overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KindPolicy {
    #[serde(default)]
    pub responsiveness: ResponsivenessMode,
    #[serde(default)]
    pub log_max_age_secs: Option<u64>,
}

/// Health monitor settings
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_threads")]
    pub max_threads: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_hour: u32,
    /// Restart is considered when the score drops below this
    #[serde(default = "default_restart_threshold")]
    pub restart_score_threshold: u8,
    #[serde(default = "default_cpu_sample_ttl")]
    pub cpu_sample_ttl_secs: u64,
    #[serde(default = "default_log_max_age")]
    pub log_max_age_secs: u64,
    #[serde(default)]
    pub kinds: HashMap<String, KindPolicy>,
}

fn default_health_interval() -> u64 {
    30
}
fn default_check_timeout() -> u64 {
    10
}
fn default_max_memory_mb() -> u64 {
    512
}
fn default_max_threads() -> u64 {
    50
}
fn default_max_restarts() -> u32 {
    3
}
fn default_restart_threshold() -> u8 {
    30
}
fn default_cpu_sample_ttl() -> u64 {
    300
}
fn default_log_max_age() -> u64 {
    300
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            check_timeout_secs: default_check_timeout(),
            max_memory_mb: default_max_memory_mb(),
            max_threads: default_max_threads(),
            max_restarts_per_hour: default_max_restarts(),
            restart_score_threshold: default_restart_threshold(),
            cpu_sample_ttl_secs: default_cpu_sample_ttl(),
            log_max_age_secs: default_log_max_age(),
            kinds: HashMap::new(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs.max(1))
    }

    pub fn cpu_sample_ttl(&self) -> Duration {
        Duration::from_secs(self.cpu_sample_ttl_secs)
    }

    /// Policy for a process kind; unknown or missing kinds get the defaults
    pub fn policy_for(&self, kind: Option<&str>) -> KindPolicy {
        kind.and_then(|k| self.kinds.get(k))
            .cloned()
            .unwrap_or_default()
    }

    pub fn log_max_age(&self, kind: Option<&str>) -> Duration {
        let secs = self
            .policy_for(kind)
            .log_max_age_secs
            .unwrap_or(self.log_max_age_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcp_config_defaults() {
        let config: McpConfig = serde_json::from_str(
            r#"{"mcpServers": {"echo": {"command": "mcp-echo", "args": ["--quiet"]}}}"#,
        )
        .unwrap();
        let echo = &config.mcp_servers["echo"];
        assert_eq!(echo.argv(), vec!["mcp-echo", "--quiet"]);
        assert!(echo.autostart);
        assert!(!echo.use_systemd);
        assert_eq!(echo.transport, Transport::Stdio);
    }

    #[test]
    fn test_env_values_are_expanded() {
        std::env::set_var("MCP_SUPERVISOR_TEST_TOKEN", "s3cret");
        let config: McpConfig = serde_json::from_str(
            r#"{"mcpServers": {"gh": {"command": "gh-mcp", "env": {"TOKEN": "$MCP_SUPERVISOR_TEST_TOKEN"}}}}"#,
        )
        .unwrap();
        let options = config.mcp_servers["gh"].options();
        assert_eq!(options.environment["TOKEN"], "s3cret");
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        let config: SupervisorFileConfig = toml::from_str("").unwrap();
        assert_eq!(config.supervisor.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.health.max_memory_mb, 512);
        assert_eq!(config.health.max_threads, 50);
        assert_eq!(config.health.max_restarts_per_hour, 3);
        assert!(config.supervisor.cache_ttl() < config.health.interval());
    }

    #[test]
    fn test_kind_policies() {
        let config: SupervisorFileConfig = toml::from_str(
            r#"
            [health]
            log_max_age_secs = 120

            [health.kinds.idle-server]
            responsiveness = "disabled"

            [health.kinds.log-watcher]
            log_max_age_secs = 30
            "#,
        )
        .unwrap();
        let health = &config.health;
        assert_eq!(
            health.policy_for(Some("idle-server")).responsiveness,
            ResponsivenessMode::Disabled
        );
        assert_eq!(
            health.policy_for(Some("unknown")).responsiveness,
            ResponsivenessMode::CpuTime
        );
        assert_eq!(health.log_max_age(Some("log-watcher")), Duration::from_secs(30));
        assert_eq!(health.log_max_age(None), Duration::from_secs(120));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".supervisor.toml");
        std::fs::write(&path, "[supervisor]\nstop_timeout_secs = 2\n").unwrap();
        let config = SupervisorFileConfig::load_from_path(&path).unwrap();
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(2));
    }
}
