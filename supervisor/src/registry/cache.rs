//! Fast-lookup status cache
//!
//! An accelerator in front of the durable store. Entries expire after a TTL
//! shorter than the health interval, and every caller treats a cache error as
//! a miss.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::record::ProcessStatus;

/// Cached view of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedStatus {
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

#[derive(Debug, Error)]
#[error("cache unavailable: {0}")]
pub struct CacheError(pub String);

/// Status cache seam; implementations may live out of process
pub trait StatusCache: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<CachedStatus>, CacheError>;
    fn set(&self, name: &str, status: CachedStatus) -> Result<(), CacheError>;
    fn evict(&self, name: &str) -> Result<(), CacheError>;
}

/// In-process cache with per-entry expiry
pub struct MemoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (CachedStatus, Instant)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (CachedStatus, Instant)>>, CacheError>
    {
        self.entries
            .lock()
            .map_err(|_| CacheError("cache lock poisoned".to_string()))
    }
}

impl StatusCache for MemoryCache {
    fn get(&self, name: &str) -> Result<Option<CachedStatus>, CacheError> {
        let mut entries = self.entries()?;
        match entries.get(name) {
            Some((status, inserted)) if inserted.elapsed() < self.ttl => Ok(Some(*status)),
            Some(_) => {
                entries.remove(name);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, name: &str, status: CachedStatus) -> Result<(), CacheError> {
        self.entries()?
            .insert(name.to_string(), (status, Instant::now()));
        Ok(())
    }

    fn evict(&self, name: &str) -> Result<(), CacheError> {
        self.entries()?.remove(name);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Cache that fails every operation
    pub(crate) struct BrokenCache;

    impl StatusCache for BrokenCache {
        fn get(&self, _: &str) -> Result<Option<CachedStatus>, CacheError> {
            Err(CacheError("connection refused".into()))
        }
        fn set(&self, _: &str, _: CachedStatus) -> Result<(), CacheError> {
            Err(CacheError("connection refused".into()))
        }
        fn evict(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError("connection refused".into()))
        }
    }

    const RUNNING: CachedStatus = CachedStatus {
        status: ProcessStatus::Running,
        pid: Some(7),
    };

    #[test]
    fn test_set_get_evict() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("a").unwrap(), None);
        cache.set("a", RUNNING).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(RUNNING));
        cache.evict("a").unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache = MemoryCache::new(Duration::from_millis(20));
        cache.set("a", RUNNING).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a").unwrap(), None);
    }
}
