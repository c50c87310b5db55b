//! Process registry: durable store plus fast-lookup cache
//!
//! Precedence is OS ground truth > durable store > cache. Writes go to the
//! store first, then best-effort to the cache. Reads prefer the cache and
//! re-populate it on a store hit. Cache failures are logged at debug and
//! treated as misses.

pub mod cache;
pub mod record;
pub mod schema;
pub mod store;

pub use cache::{CacheError, CachedStatus, MemoryCache, StatusCache};
pub use record::{HealthSnapshot, ProcessOptions, ProcessRecord, ProcessStatus, Transport};
pub use store::SqliteStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Registry handle; cheap to clone
#[derive(Clone)]
pub struct ProcessRegistry {
    store: SqliteStore,
    cache: Option<Arc<dyn StatusCache>>,
}

impl ProcessRegistry {
    pub fn new(store: SqliteStore, cache: Option<Arc<dyn StatusCache>>) -> Self {
        Self { store, cache }
    }

    /// Registry backed by an in-process TTL cache
    pub fn with_memory_cache(store: SqliteStore, ttl: Duration) -> Self {
        Self::new(store, Some(Arc::new(MemoryCache::new(ttl))))
    }

    pub fn get(&self, name: &str) -> Result<Option<ProcessRecord>> {
        self.store.get(name)
    }

    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        self.store.list()
    }

    pub fn list_live(&self) -> Result<Vec<ProcessRecord>> {
        self.store.list_live()
    }

    /// Write-through save
    pub fn save(&self, record: &ProcessRecord) -> Result<()> {
        self.store.put(record)?;
        if record.is_live() {
            self.cache_set(
                &record.name,
                CachedStatus {
                    status: record.status,
                    pid: record.pid,
                },
            );
        } else {
            self.evict(&record.name);
        }
        Ok(())
    }

    /// Status lookup: cache first, then the store (re-populating the cache)
    pub fn cached_status(&self, name: &str) -> Result<Option<CachedStatus>> {
        if let Some(hit) = self.cache_get(name) {
            return Ok(Some(hit));
        }

        let Some(record) = self.store.get(name)? else {
            return Ok(None);
        };
        let status = CachedStatus {
            status: record.status,
            pid: record.pid,
        };
        if record.is_live() {
            self.cache_set(name, status);
        }
        Ok(Some(status))
    }

    pub fn update_health(&self, name: &str, snapshot: &HealthSnapshot) -> Result<()> {
        if !self.store.update_health(name, snapshot)? {
            tracing::debug!(process = %name, "health update for unknown record");
        }
        Ok(())
    }

    pub fn record_restart_attempt(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.store.record_restart_attempt(name, at)
    }

    /// Restart attempts for `name` within the trailing `window`
    pub fn restart_attempts_within(&self, name: &str, window: Duration) -> Result<u32> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let since = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.restart_attempts_since(name, since)
    }

    /// Lift a quota escalation after operator intervention
    pub fn clear_restart_attempts(&self, name: &str) -> Result<()> {
        let removed = self.store.clear_restart_attempts(name)?;
        if removed > 0 {
            tracing::info!(process = %name, removed, "restart quota reset");
        }
        Ok(())
    }

    pub fn prune_restart_attempts(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let before = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.prune_restart_attempts(before)
    }

    /// Best-effort cache eviction
    pub fn evict(&self, name: &str) {
        if let Some(ref cache) = self.cache {
            if let Err(e) = cache.evict(name) {
                tracing::debug!(process = %name, "cache evict failed: {}", e);
            }
        }
    }

    fn cache_get(&self, name: &str) -> Option<CachedStatus> {
        let cache = self.cache.as_ref()?;
        match cache.get(name) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::debug!(process = %name, "cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    fn cache_set(&self, name: &str, status: CachedStatus) {
        if let Some(ref cache) = self.cache {
            if let Err(e) = cache.set(name, status) {
                tracing::debug!(process = %name, "cache write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::cache::tests::BrokenCache;
    use super::*;

    fn running(name: &str, pid: u32) -> ProcessRecord {
        let mut rec = ProcessRecord::new(name, vec!["sleep".into()], ProcessOptions::default());
        rec.pid = Some(pid);
        rec.transition(ProcessStatus::Running).unwrap();
        rec
    }

    #[test]
    fn test_save_populates_cache_and_stop_evicts() {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let registry = ProcessRegistry::new(
            SqliteStore::open_in_memory().unwrap(),
            Some(cache.clone()),
        );

        let mut rec = running("a", 11);
        registry.save(&rec).unwrap();
        assert_eq!(
            cache.get("a").unwrap(),
            Some(CachedStatus {
                status: ProcessStatus::Running,
                pid: Some(11)
            })
        );

        rec.transition(ProcessStatus::Stopping).unwrap();
        rec.transition(ProcessStatus::Stopped).unwrap();
        registry.save(&rec).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
        assert_eq!(
            registry.cached_status("a").unwrap().unwrap().status,
            ProcessStatus::Stopped
        );
    }

    #[test]
    fn test_store_hit_repopulates_cache() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&running("a", 5)).unwrap();

        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let registry = ProcessRegistry::new(store, Some(cache.clone()));
        assert_eq!(cache.get("a").unwrap(), None);
        assert_eq!(registry.cached_status("a").unwrap().unwrap().pid, Some(5));
        assert_eq!(cache.get("a").unwrap().unwrap().pid, Some(5));
    }

    #[test]
    fn test_broken_cache_degrades_to_store() {
        let registry = ProcessRegistry::new(
            SqliteStore::open_in_memory().unwrap(),
            Some(Arc::new(BrokenCache)),
        );
        registry.save(&running("a", 9)).unwrap();
        assert_eq!(
            registry.cached_status("a").unwrap().unwrap().status,
            ProcessStatus::Running
        );
        registry.evict("a");
        assert!(registry.cached_status("missing").unwrap().is_none());
    }

    #[test]
    fn test_registry_without_cache() {
        let registry = ProcessRegistry::new(SqliteStore::open_in_memory().unwrap(), None);
        registry.save(&running("a", 3)).unwrap();
        assert_eq!(registry.list_live().unwrap().len(), 1);
    }

    #[test]
    fn test_restart_attempt_window() {
        let registry = ProcessRegistry::new(SqliteStore::open_in_memory().unwrap(), None);
        let now = Utc::now();
        registry
            .record_restart_attempt("a", now - chrono::Duration::minutes(61))
            .unwrap();
        registry.record_restart_attempt("a", now).unwrap();
        assert_eq!(
            registry
                .restart_attempts_within("a", Duration::from_secs(3600))
                .unwrap(),
            1
        );
    }
}
