//! Background task manager for revalidation and write-through.
//!
//! Keeps a handle to every task it spawns so that `close()` can drain or
//! cancel them. Keyed spawns deduplicate: a second revalidation for the
//! same cache key is skipped while the first is in flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct OffloadInner {
    tasks: DashMap<String, JoinHandle<()>>,
    counter: AtomicU64,
}

/// Manager for offloading tasks to background execution.
#[derive(Debug, Clone, Default)]
pub(crate) struct OffloadManager {
    inner: Arc<OffloadInner>,
}

impl OffloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task under an auto-generated key.
    pub fn spawn<F>(&self, kind: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        self.insert(format!("{kind}#{id}"), task);
    }

    /// Spawn a task under a specific key, skipping it when a task with the
    /// same key is still in flight.
    ///
    /// Returns `true` if the task was spawned.
    pub fn spawn_keyed<F>(&self, key: String, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = self.inner.tasks.get(&key) {
            if !handle.is_finished() {
                debug!(key, "background task deduplicated; already in flight");
                return false;
            }
        }
        self.insert(key, task);
        true
    }

    /// Number of tasks still running.
    pub fn active_len(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| !entry.is_finished())
            .count()
    }

    /// Abort every tracked task.
    pub fn cancel_all(&self) {
        for entry in self.inner.tasks.iter() {
            entry.abort();
        }
    }

    /// Wait for all tracked tasks, polling with a small tick.
    pub async fn wait_all(&self) {
        loop {
            self.inner.tasks.retain(|_, handle| !handle.is_finished());
            if self.inner.tasks.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait for all tracked tasks up to `timeout`.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn wait_all_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_all()).await.is_ok()
    }

    fn insert<F>(&self, key: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        let cleanup_key = key.clone();
        let handle = tokio::spawn(async move {
            task.await;
            inner.tasks.remove(&cleanup_key);
        });
        self.inner.tasks.insert(key, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn waits_for_spawned_tasks() {
        let manager = OffloadManager::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            manager.spawn("test", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        manager.wait_all().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(manager.active_len(), 0);
    }

    #[tokio::test]
    async fn keyed_spawns_deduplicate_while_in_flight() {
        let manager = OffloadManager::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            manager.spawn_keyed("revalidate:k".into(), async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        manager.wait_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // After completion the key is free again.
        let runs2 = runs.clone();
        assert!(manager.spawn_keyed("revalidate:k".into(), async move {
            runs2.fetch_add(1, Ordering::SeqCst);
        }));
        manager.wait_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_all_aborts_stragglers() {
        let manager = OffloadManager::new();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        manager.spawn("slow", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            done2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!manager.wait_all_timeout(Duration::from_millis(40)).await);
        manager.cancel_all();
        manager.wait_all().await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
