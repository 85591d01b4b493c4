//! Cache provider plugins and their registry.
//!
//! A provider is a named factory for backends: `(provider id, table)`
//! resolves to one backend instance. The registry keeps providers in
//! registration order and memoizes the backends it has created, so a
//! request that names an `active_cache` restriction (or none, meaning all
//! providers) gets the first provider whose backend reports
//! [`available`](crate::CacheBackend::available).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;

use crate::backend::{BackendResult, CacheBackend};

/// Factory for cache backends, one per table.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Stable identifier of this provider.
    ///
    /// Must match `^[A-Za-z][A-Za-z0-9_-]{0,63}$`.
    fn cache_id(&self) -> &str;

    /// Create (or connect) the backend for `table`.
    async fn create(&self, table: &str) -> BackendResult<Arc<dyn CacheBackend>>;
}

/// Errors raised by [`ProviderRegistry::register`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The provider id does not match the required pattern.
    #[error("invalid cache provider id: {0:?}")]
    InvalidProviderId(String),

    /// A different provider is already registered under this id.
    #[error("cache provider {0:?} is already registered with a different loader")]
    DuplicateProviderId(String),
}

/// Ordered set of registered providers plus memoized backend instances.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn CacheProvider>>,
    instances: DashMap<(String, String), Arc<dyn CacheBackend>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider.
    ///
    /// Registering the same provider instance under the same id twice is a
    /// no-op; registering a *different* instance under an existing id is
    /// an error.
    pub fn register(&mut self, provider: Arc<dyn CacheProvider>) -> Result<(), RegistryError> {
        let id = provider.cache_id().to_owned();
        if !valid_provider_id(&id) {
            return Err(RegistryError::InvalidProviderId(id));
        }
        if let Some(existing) = self.providers.iter().find(|p| p.cache_id() == id) {
            return if same_provider(existing, &provider) {
                Ok(())
            } else {
                Err(RegistryError::DuplicateProviderId(id))
            };
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Registered provider ids, in registration order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.cache_id().to_owned())
            .collect()
    }

    /// True when no provider has been registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve the backend for a request.
    ///
    /// Walks `active` (or all providers, in registration order) and
    /// returns the first backend that reports available. Providers that
    /// fail to create a backend are skipped with a warning.
    pub async fn backend_for(
        &self,
        active: Option<&[String]>,
        table: &str,
    ) -> Option<Arc<dyn CacheBackend>> {
        let candidates: Vec<&Arc<dyn CacheProvider>> = match active {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.providers.iter().find(|p| p.cache_id() == id))
                .collect(),
            None => self.providers.iter().collect(),
        };

        for provider in candidates {
            match self.instance(provider, table).await {
                Ok(backend) if backend.available() => return Some(backend),
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        provider = provider.cache_id(),
                        table,
                        %error,
                        "cache provider failed to create backend; skipping"
                    );
                }
            }
        }
        None
    }

    /// Close every instantiated backend.
    pub async fn close_all(&self) {
        for entry in self.instances.iter() {
            if let Err(error) = entry.value().close().await {
                warn!(%error, "error closing cache backend");
            }
        }
        self.instances.clear();
    }

    async fn instance(
        &self,
        provider: &Arc<dyn CacheProvider>,
        table: &str,
    ) -> BackendResult<Arc<dyn CacheBackend>> {
        let slot = (provider.cache_id().to_owned(), table.to_owned());
        if let Some(backend) = self.instances.get(&slot) {
            return Ok(backend.clone());
        }
        let backend = provider.create(table).await?;
        self.instances.insert(slot, backend.clone());
        Ok(backend)
    }
}

fn valid_provider_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    id.len() <= 64
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn same_provider(a: &Arc<dyn CacheProvider>, b: &Arc<dyn CacheProvider>) -> bool {
    // Compare the data pointers only; vtable addresses are not stable
    // across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
