use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kedge_backend::{BackendResult, CacheBackend, DeleteStatus};
use kedge_core::{CacheKey, CachedEntry};
use moka::future::Cache;

/// LRU backend with per-entry TTL derived from the entry's directives.
///
/// Capacity-bounded by entry count; least recently used entries are
/// evicted first. Entries whose directives grant a finite lifetime
/// (`max-age` plus the wider of the stale grace windows) expire on their
/// own, see [`builder`](MokaBackend::builder).
pub struct MokaBackend {
    pub(crate) cache: Cache<CacheKey, CachedEntry>,
    pub(crate) label: String,
    pub(crate) closed: AtomicBool,
}

impl MokaBackend {
    /// Creates a builder with the specified maximum entry count.
    pub fn builder(max_capacity: u64) -> crate::builder::MokaBackendBuilder {
        crate::builder::MokaBackendBuilder::new(max_capacity)
    }
}

impl std::fmt::Debug for MokaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaBackend")
            .field("label", &self.label)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    fn available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &CacheKey) -> BackendResult<Option<CachedEntry>> {
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, entry: CachedEntry) -> BackendResult<bool> {
        if let Some(existing) = self.cache.get(&entry.key).await {
            if existing.updated > entry.updated {
                return Ok(false);
            }
        }
        self.cache.insert(entry.key.clone(), entry).await;
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        match self.cache.remove(key).await {
            Some(_) => Ok(DeleteStatus::Deleted(1)),
            None => Ok(DeleteStatus::Missing),
        }
    }

    async fn clear(&self, table: &str) -> BackendResult<u64> {
        let keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.table() == table)
            .map(|(key, _)| (*key).clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.cache.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, table: &str) -> BackendResult<Vec<String>> {
        Ok(self
            .cache
            .iter()
            .filter(|(key, _)| key.table() == table)
            .map(|(key, _)| key.key().to_owned())
            .collect())
    }

    async fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cache.invalidate_all();
        // Pending invalidations drain here, so close is ordered after the
        // last write.
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}
