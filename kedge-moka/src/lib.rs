//! # kedge-moka
//!
//! LRU + TTL in-memory cache backend for the kedge HTTP client, built on
//! [moka](https://docs.rs/moka).
//!
//! Entries are bounded by count with least-recently-used eviction, and
//! individually expire once their directives can no longer serve them
//! (`max-age` plus the wider stale grace window).
//!
//! ```
//! use kedge_moka::{MokaBackend, MokaProvider};
//!
//! let backend = MokaBackend::builder(10_000).build();
//! let provider = MokaProvider::new("lru", 10_000);
//! # let _ = (backend, provider);
//! ```

mod backend;
mod builder;
mod provider;

pub use backend::MokaBackend;
pub use builder::MokaBackendBuilder;
pub use provider::MokaProvider;
