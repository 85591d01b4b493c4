//! Provider plugin for [`MokaBackend`].

use std::sync::Arc;

use async_trait::async_trait;
use kedge_backend::{BackendResult, CacheBackend, CacheProvider};

use crate::backend::MokaBackend;

/// Provider that creates one [`MokaBackend`] per table.
pub struct MokaProvider {
    id: String,
    max_capacity: u64,
}

impl MokaProvider {
    /// Provider registered under `id`; each table gets a cache bounded to
    /// `max_capacity` entries.
    pub fn new(id: impl Into<String>, max_capacity: u64) -> Self {
        MokaProvider {
            id: id.into(),
            max_capacity,
        }
    }
}

#[async_trait]
impl CacheProvider for MokaProvider {
    fn cache_id(&self) -> &str {
        &self.id
    }

    async fn create(&self, table: &str) -> BackendResult<Arc<dyn CacheBackend>> {
        Ok(Arc::new(
            MokaBackend::builder(self.max_capacity)
                .label(format!("{}:{}", self.id, table))
                .build(),
        ))
    }
}
