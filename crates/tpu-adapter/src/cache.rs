//! Time-bounded memoization of chip discovery

use crate::discovery::{ChipDiscovery, DiscoveryResult};
use crate::Result;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time a discovery result stays fresh
pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    result: DiscoveryResult,
    captured_at: Instant,
}

/// Caches the last successful [`DiscoveryResult`] for a fixed TTL
///
/// The lock is held across a rescan, so concurrent callers never trigger
/// more than one scan at a time. Failed scans are never cached.
pub struct DiscoveryCache {
    source: Box<dyn ChipDiscovery>,
    ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl DiscoveryCache {
    /// Create a cache in front of `source`
    pub fn new(source: Box<dyn ChipDiscovery>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached result, rescanning when it is older than the TTL
    pub fn get(&self) -> Result<DiscoveryResult> {
        let mut entry = self.lock();

        if let Some(cached) = entry.as_ref() {
            if cached.captured_at.elapsed() < self.ttl {
                return Ok(cached.result);
            }
            debug!("Discovery cache expired after {:?}", cached.captured_at.elapsed());
        }

        let result = self.source.discover()?;
        *entry = Some(CacheEntry {
            result,
            captured_at: Instant::now(),
        });
        Ok(result)
    }

    /// Drop the cached result so the next [`get`](Self::get) rescans
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<CacheEntry>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("ttl", &self.ttl)
            .field("entry", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ChipModel;
    use crate::mock::MockDiscovery;
    use crate::TpuError;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_result_reused_within_ttl() {
        let mock = Arc::new(MockDiscovery::new(DiscoveryResult::new(ChipModel::V4, 4)));
        let cache = DiscoveryCache::new(Box::new(Arc::clone(&mock)), Duration::from_secs(60));

        assert_eq!(cache.get().unwrap().chip_count, 4);
        mock.set_result(DiscoveryResult::new(ChipModel::V4, 2));
        assert_eq!(cache.get().unwrap().chip_count, 4);
        assert_eq!(mock.scan_count(), 1);
    }

    #[test]
    fn test_rescan_after_ttl() {
        let mock = Arc::new(MockDiscovery::new(DiscoveryResult::new(ChipModel::V4, 4)));
        let cache = DiscoveryCache::new(Box::new(Arc::clone(&mock)), Duration::from_millis(20));

        assert_eq!(cache.get().unwrap().chip_count, 4);
        mock.set_result(DiscoveryResult::new(ChipModel::V4, 2));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get().unwrap().chip_count, 2);
        assert_eq!(mock.scan_count(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let mock = Arc::new(MockDiscovery::new(DiscoveryResult::none()));
        mock.fail_with(TpuError::ClassificationInconsistency("v4=1, v5e=1".to_string()));
        let cache = DiscoveryCache::new(Box::new(Arc::clone(&mock)), Duration::from_secs(60));

        assert!(cache.get().is_err());
        mock.set_result(DiscoveryResult::new(ChipModel::V5e, 1));
        assert_eq!(cache.get().unwrap(), DiscoveryResult::new(ChipModel::V5e, 1));
        assert_eq!(mock.scan_count(), 2);
    }

    #[test]
    fn test_invalidate_forces_rescan() {
        let mock = Arc::new(MockDiscovery::new(DiscoveryResult::new(ChipModel::V6e, 8)));
        let cache = DiscoveryCache::new(Box::new(Arc::clone(&mock)), Duration::from_secs(60));

        cache.get().unwrap();
        cache.invalidate();
        cache.get().unwrap();
        assert_eq!(mock.scan_count(), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_scan() {
        let mock = Arc::new(MockDiscovery::new(DiscoveryResult::new(ChipModel::V4, 4)));
        let cache = Arc::new(DiscoveryCache::new(
            Box::new(Arc::clone(&mock)),
            Duration::from_secs(60),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get().unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().chip_count, 4);
        }
        assert_eq!(mock.scan_count(), 1);
    }
}
