//! LRU cache of indexed approval views.
//!
//! A cached view is trusted only while its `total_count` matches the length
//! of the history it is asked about and it is younger than the configured age
//! ceiling. Anything else is rebuilt from the instance in one pass. Writers
//! call [`ApprovalIndexCache::invalidate`] after every committed history
//! change; other processes fall back on the count check.

mod index;

pub use index::IndexedApprovalView;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::domain::{EntityKey, WorkflowInstance};
use crate::logging::OpTimer;

struct CacheEntry {
    instance_id: Uuid,
    view: Arc<IndexedApprovalView>,
    inserted_at: Instant,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Views rebuilt.
    pub rebuilds: u64,
    /// Entries pushed out by capacity.
    pub evictions: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Per-instance cache of [`IndexedApprovalView`]s.
pub struct ApprovalIndexCache {
    entries: Mutex<LruCache<EntityKey, CacheEntry>>,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ApprovalIndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalIndexCache")
            .field("max_age", &self.max_age)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ApprovalIndexCache {
    /// Create a cache from configuration.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_age: config.max_age(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Indexed view of `instance`'s history, rebuilt when stale.
    pub fn get(&self, instance: &WorkflowInstance) -> Arc<IndexedApprovalView> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(&instance.key) {
                if entry.instance_id == instance.id
                    && entry.view.is_valid_for(instance)
                    && entry.inserted_at.elapsed() < self.max_age
                {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Arc::clone(&entry.view);
                }
                tracing::trace!(entity = %instance.key, "Cached approval view is stale");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.rebuild(instance)
    }

    fn rebuild(&self, instance: &WorkflowInstance) -> Arc<IndexedApprovalView> {
        let timer = OpTimer::new("cache", "rebuild");
        let view = Arc::new(IndexedApprovalView::build(&instance.approval_history));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        let entry = CacheEntry {
            instance_id: instance.id,
            view: Arc::clone(&view),
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.lock().push(instance.key.clone(), entry) {
            if evicted != instance.key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(entity = %evicted, "Evicted approval view");
            }
        }

        tracing::debug!(
            entity = %instance.key,
            records = view.total_count,
            "Rebuilt approval index"
        );
        timer.finish();
        view
    }

    /// Drop the cached view for `key`.
    pub fn invalidate(&self, key: &EntityKey) {
        if self.entries.lock().pop(key).is_some() {
            tracing::trace!(entity = %key, "Invalidated approval view");
        }
    }

    /// Drop every cached view.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop views older than the age ceiling. Returns entries removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<EntityKey> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}
