//! # kedge-backend
//!
//! Cache backend contract and provider registry for the kedge HTTP client.
//!
//! A *backend* is a keyed store of [`CachedEntry`](kedge_core::CachedEntry)
//! values ([`CacheBackend`]). A *provider* is a named factory that creates
//! one backend per table ([`CacheProvider`]); providers are registered in a
//! [`ProviderRegistry`] and resolved per request, first-available wins.
//!
//! This crate ships one concrete backend, the bounded in-memory FIFO
//! [`MemoryBackend`]; `kedge-moka` adds an LRU+TTL backend.

mod backend;
mod error;
mod memory;
mod provider;

pub use backend::{BackendResult, CacheBackend, DeleteStatus};
pub use error::BackendError;
pub use memory::{MemoryBackend, MemoryBackendConfig, MemoryProvider};
pub use provider::{CacheProvider, ProviderRegistry, RegistryError};
