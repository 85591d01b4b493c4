//! Bulkhead admission control.
//!
//! A fixed number of running slots plus a bounded FIFO wait queue. A
//! request that finds no free slot and no queue room fails immediately;
//! a queued waiter that is cancelled leaves the queue as soon as its
//! acquire future is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::FetchError;

/// Bulkhead capacity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Simultaneously executing requests.
    #[serde(default = "default_parallel")]
    pub max_parallel_requests: usize,
    /// Requests allowed to wait for a slot.
    #[serde(default = "default_queued")]
    pub max_queued_requests: usize,
}

fn default_parallel() -> usize {
    10
}

fn default_queued() -> usize {
    10
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: default_parallel(),
            max_queued_requests: default_queued(),
        }
    }
}

pub(crate) struct Bulkhead {
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_queued: usize,
}

/// Occupies one queue slot until dropped.
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub fn new(config: &BulkheadConfig) -> Self {
        Bulkhead {
            slots: Arc::new(Semaphore::new(config.max_parallel_requests)),
            queued: Arc::new(AtomicUsize::new(0)),
            max_queued: config.max_queued_requests,
        }
    }

    /// Take a running slot, queueing when all are busy.
    ///
    /// Returns `BulkheadRejected` without suspending when the queue is
    /// full. The semaphore hands out permits in FIFO order, so queued
    /// waiters run in arrival order.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, FetchError> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                let admitted = self
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                        (queued < self.max_queued).then_some(queued + 1)
                    });
                if admitted.is_err() {
                    return Err(FetchError::BulkheadRejected);
                }
                let _slot = QueueSlot(self.queued.clone());
                self.slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| FetchError::BulkheadRejected)
            }
            Err(TryAcquireError::Closed) => Err(FetchError::BulkheadRejected),
        }
    }

    #[cfg(test)]
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
