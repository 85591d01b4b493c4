//! The cache backend contract.

use std::sync::Arc;

use async_trait::async_trait;
use kedge_core::{CacheKey, CachedEntry};

use crate::error::BackendError;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Outcome of a delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// The number of deleted records.
    Deleted(u64),
    /// The key was not present.
    Missing,
}

/// Keyed store of [`CachedEntry`] values.
///
/// Implementations must uphold the monotonic-`updated` invariant: a write
/// whose `updated` is older than the stored entry's is rejected
/// (`set` returns `false`) rather than applied.
///
/// `close` must be totally ordered after the backend's last in-flight
/// operation; callers await it instead of sleeping.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Whether the backend can currently serve requests.
    ///
    /// The registry skips unavailable backends when resolving a provider
    /// for a request.
    fn available(&self) -> bool;

    /// Look up an entry.
    async fn get(&self, key: &CacheKey) -> BackendResult<Option<CachedEntry>>;

    /// Store an entry.
    ///
    /// Returns `false` when the write was rejected by the
    /// monotonic-`updated` guard.
    async fn set(&self, entry: CachedEntry) -> BackendResult<bool>;

    /// Remove an entry.
    async fn delete(&self, key: &CacheKey) -> BackendResult<DeleteStatus>;

    /// Remove every entry in `table`, returning how many were removed.
    async fn clear(&self, table: &str) -> BackendResult<u64>;

    /// Enumerate the keys currently stored in `table`.
    async fn keys(&self, table: &str) -> BackendResult<Vec<String>>;

    /// Release the backend's resources.
    async fn close(&self) -> BackendResult<()>;

    /// Label for diagnostics.
    fn name(&self) -> &str {
        "backend"
    }
}

#[async_trait]
impl CacheBackend for Arc<dyn CacheBackend> {
    fn available(&self) -> bool {
        (**self).available()
    }

    async fn get(&self, key: &CacheKey) -> BackendResult<Option<CachedEntry>> {
        (**self).get(key).await
    }

    async fn set(&self, entry: CachedEntry) -> BackendResult<bool> {
        (**self).set(entry).await
    }

    async fn delete(&self, key: &CacheKey) -> BackendResult<DeleteStatus> {
        (**self).delete(key).await
    }

    async fn clear(&self, table: &str) -> BackendResult<u64> {
        (**self).clear(table).await
    }

    async fn keys(&self, table: &str) -> BackendResult<Vec<String>> {
        (**self).keys(table).await
    }

    async fn close(&self) -> BackendResult<()> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
