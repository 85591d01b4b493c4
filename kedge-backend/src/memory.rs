//! In-memory FIFO backend.
//!
//! A bounded per-table map with first-in-first-out eviction. Useful as the
//! default provider and in tests; production deployments usually prefer
//! the LRU+TTL backend from `kedge-moka`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kedge_core::{CacheKey, CachedEntry};

use crate::backend::{BackendResult, CacheBackend, DeleteStatus};
use crate::error::BackendError;
use crate::provider::CacheProvider;

/// Configuration for [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryBackendConfig {
    /// Entries kept per table before FIFO eviction kicks in.
    pub max_entries_per_table: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_entries_per_table: 1024,
        }
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, CachedEntry>,
    // Insertion order; existing keys keep their slot on overwrite.
    order: VecDeque<String>,
}

/// Bounded in-memory FIFO store of cached entries.
pub struct MemoryBackend {
    config: MemoryBackendConfig,
    tables: Mutex<HashMap<String, Table>>,
    available: AtomicBool,
}

impl MemoryBackend {
    /// Empty backend with the given configuration.
    pub fn new(config: MemoryBackendConfig) -> Self {
        MemoryBackend {
            config,
            tables: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability (used by tests and by `close`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> BackendResult<std::sync::MutexGuard<'_, HashMap<String, Table>>> {
        self.tables
            .lock()
            .map_err(|_| BackendError::Internal("memory backend poisoned".into()))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &CacheKey) -> BackendResult<Option<CachedEntry>> {
        let tables = self.lock()?;
        Ok(tables
            .get(key.table())
            .and_then(|table| table.entries.get(key.key()))
            .cloned())
    }

    async fn set(&self, entry: CachedEntry) -> BackendResult<bool> {
        let mut tables = self.lock()?;
        let table = tables.entry(entry.key.table().to_owned()).or_default();

        if let Some(existing) = table.entries.get(entry.key.key()) {
            if existing.updated > entry.updated {
                return Ok(false);
            }
            table.entries.insert(entry.key.key().to_owned(), entry);
            return Ok(true);
        }

        table.order.push_back(entry.key.key().to_owned());
        table.entries.insert(entry.key.key().to_owned(), entry);

        while table.entries.len() > self.config.max_entries_per_table {
            match table.order.pop_front() {
                Some(oldest) => {
                    table.entries.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        let mut tables = self.lock()?;
        let Some(table) = tables.get_mut(key.table()) else {
            return Ok(DeleteStatus::Missing);
        };
        match table.entries.remove(key.key()) {
            Some(_) => {
                table.order.retain(|k| k != key.key());
                Ok(DeleteStatus::Deleted(1))
            }
            None => Ok(DeleteStatus::Missing),
        }
    }

    async fn clear(&self, table: &str) -> BackendResult<u64> {
        let mut tables = self.lock()?;
        match tables.remove(table) {
            Some(removed) => Ok(removed.entries.len() as u64),
            None => Ok(0),
        }
    }

    async fn keys(&self, table: &str) -> BackendResult<Vec<String>> {
        let tables = self.lock()?;
        Ok(tables
            .get(table)
            .map(|t| t.order.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> BackendResult<()> {
        // All operations complete synchronously under the lock, so closing
        // after the lock is acquired is totally ordered after the last one.
        let mut tables = self.lock()?;
        tables.clear();
        self.set_available(false);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Provider wrapping [`MemoryBackend`], one backend per table.
pub struct MemoryProvider {
    id: String,
    config: MemoryBackendConfig,
}

impl MemoryProvider {
    /// Provider registered under `id`.
    pub fn new(id: impl Into<String>, config: MemoryBackendConfig) -> Self {
        MemoryProvider {
            id: id.into(),
            config,
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new("memory", MemoryBackendConfig::default())
    }
}

#[async_trait]
impl CacheProvider for MemoryProvider {
    fn cache_id(&self) -> &str {
        &self.id
    }

    async fn create(&self, _table: &str) -> BackendResult<Arc<dyn CacheBackend>> {
        Ok(Arc::new(MemoryBackend::new(self.config.clone())))
    }
}
