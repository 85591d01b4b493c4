#![warn(missing_docs)]
//! # kedge
//!
//! A client-side HTTP convenience layer with two independently useful
//! capabilities:
//!
//! 1. A **resilience pipeline** composing an overall deadline, retry with
//!    exponential backoff and `Retry-After` hints, a bulkhead, a circuit
//!    breaker and a per-attempt timeout around a pluggable transport,
//!    with coherent cancellation propagation.
//! 2. A **caching coordinator** for JSON requests that interprets
//!    `Cache-Control` semantics (`Expires`, `ETag` / `Last-Modified`,
//!    `stale-while-revalidate`, `stale-if-error`) and multiplexes between
//!    cache and transport under three strategies, with an optional
//!    "return stale now, deliver the update later" mode.
//!
//! ```no_run
//! use kedge::{CacheMode, CacheOptions, HttpClient, JsonOptions, ResilienceConfig, RetryPolicy};
//! use kedge_backend::MemoryProvider;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct User { name: String }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::builder()
//!     .base_url("https://api.example.com")
//!     .resilience(ResilienceConfig {
//!         retry: Some(RetryPolicy::default()),
//!         ..Default::default()
//!     })
//!     .provider(MemoryProvider::default())?
//!     .build();
//!
//! let user = client
//!     .fetch_json::<User>(
//!         "/users/42",
//!         JsonOptions::new()
//!             .use_cache(CacheOptions::new("user-42").mode(CacheMode::Race).update(true)),
//!     )
//!     .await?;
//! println!("{}", user.value.name);
//! # Ok(())
//! # }
//! ```

/// Caching coordinator: strategies, request options, the update channel.
///
/// Engaged for JSON requests whose options carry
/// [`CacheOptions`](cache::CacheOptions); see the module docs for the
/// strategy semantics.
pub mod cache;

/// The HTTP client and its request options.
pub mod client;

/// Error types surfaced to callers.
///
/// Defines [`FetchError`] covering HTTP failures, content-type mismatches,
/// timeouts, bulkhead rejections, open circuits, aborts and network
/// failures, plus the non-fatal [`NoUpdate`](FetchError::NoUpdate) signal
/// carried on update channels.
pub mod error;

/// The resilience pipeline.
///
/// Deadline, retry, bulkhead, circuit breaker and per-attempt timeout,
/// nested in a fixed order around the transport.
pub mod resilience;

/// Abort signalling.
///
/// [`AbortHandle`] is the cancellation primitive every layer of the
/// pipeline observes; `abort_all` and `close` on the client drive it.
pub mod signal;

/// The transport seam and the `reqwest` adapter.
pub mod transport;

pub use cache::{CacheMode, CacheOptions, EqualFn, JsonBody, JsonFetch, UpdateChannel};
pub use client::{FetchOptions, HttpClient, HttpClientBuilder, JsonOptions};
pub use error::{FetchError, HttpErrorParts, NoUpdateReason, TimeoutKind};
pub use resilience::{
    BulkheadConfig, CircuitBreakerConfig, ResilienceConfig, RetryPolicy,
};
pub use signal::AbortHandle;
pub use transport::{
    ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
};

pub use kedge_core::{CacheControl, CacheState, CachedEntry, Directive, Raw};

/// The `kedge` prelude.
///
/// ```rust
/// use kedge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cache::{CacheMode, CacheOptions};
    pub use crate::client::{FetchOptions, HttpClient, JsonOptions};
    pub use crate::error::FetchError;
}
