//! Application-specific checks keyed by process kind

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::HealthSettings;
use crate::registry::ProcessRecord;

/// Kind served by [`LogWatcherCheck`]
pub const LOG_WATCHER_KIND: &str = "log-watcher";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCheckResult {
    pub passed: bool,
    pub detail: Option<String>,
}

impl AppCheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

pub trait AppCheck: Send + Sync {
    fn check(&self, record: &ProcessRecord) -> AppCheckResult;
}

/// The process's log file must have been written recently
pub struct LogWatcherCheck {
    settings: HealthSettings,
}

impl LogWatcherCheck {
    pub fn new(settings: HealthSettings) -> Self {
        Self { settings }
    }
}

impl AppCheck for LogWatcherCheck {
    fn check(&self, record: &ProcessRecord) -> AppCheckResult {
        let Some(ref path) = record.options.log_file else {
            return AppCheckResult::fail("no log_file configured");
        };
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => return AppCheckResult::fail(format!("{}: {}", path.display(), e)),
        };

        let max_age = self.settings.log_max_age(record.options.kind.as_deref());
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age <= max_age {
            AppCheckResult::pass()
        } else {
            AppCheckResult::fail(format!(
                "{} last modified {}s ago (max {}s)",
                path.display(),
                age.as_secs(),
                max_age.as_secs()
            ))
        }
    }
}

/// Registry of checks by kind; unknown kinds pass
#[derive(Default)]
pub struct AppChecks {
    checks: HashMap<String, Arc<dyn AppCheck>>,
}

impl AppChecks {
    /// Built-in checks
    pub fn with_defaults(settings: &HealthSettings) -> Self {
        let mut checks = Self::default();
        checks.register(LOG_WATCHER_KIND, Arc::new(LogWatcherCheck::new(settings.clone())));
        checks
    }

    pub fn register(&mut self, kind: impl Into<String>, check: Arc<dyn AppCheck>) {
        self.checks.insert(kind.into(), check);
    }

    pub fn run(&self, record: &ProcessRecord) -> AppCheckResult {
        record
            .options
            .kind
            .as_deref()
            .and_then(|kind| self.checks.get(kind))
            .map(|check| check.check(record))
            .unwrap_or_else(AppCheckResult::pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcessOptions;
    use std::time::Duration;

    fn record(kind: Option<&str>, log_file: Option<std::path::PathBuf>) -> ProcessRecord {
        ProcessRecord::new(
            "w",
            vec!["watch".into()],
            ProcessOptions {
                kind: kind.map(str::to_string),
                log_file,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_unknown_kind_passes() {
        let checks = AppChecks::with_defaults(&HealthSettings::default());
        assert!(checks.run(&record(None, None)).passed);
        assert!(checks.run(&record(Some("database"), None)).passed);
    }

    #[test]
    fn test_log_watcher_requires_fresh_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("watch.log");
        std::fs::write(&log, "line\n").unwrap();

        let checks = AppChecks::with_defaults(&HealthSettings::default());
        assert!(checks.run(&record(Some(LOG_WATCHER_KIND), Some(log.clone()))).passed);

        let missing = checks.run(&record(Some(LOG_WATCHER_KIND), Some(dir.path().join("nope"))));
        assert!(!missing.passed);
        assert!(!checks.run(&record(Some(LOG_WATCHER_KIND), None)).passed);
    }

    #[test]
    fn test_log_watcher_stale_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("watch.log");
        std::fs::write(&log, "line\n").unwrap();

        let settings = HealthSettings {
            log_max_age_secs: 0,
            ..Default::default()
        };
        std::thread::sleep(Duration::from_millis(1100));
        let result = LogWatcherCheck::new(settings).check(&record(Some(LOG_WATCHER_KIND), Some(log)));
        assert!(!result.passed);
        assert!(result.detail.unwrap().contains("last modified"));
    }
}
