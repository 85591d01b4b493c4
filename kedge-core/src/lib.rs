#![warn(missing_docs)]
//! # kedge-core
//!
//! Core cache data model for the kedge HTTP client.
//!
//! This crate holds the pieces that interpret HTTP freshness semantics and
//! carry cached payloads around, with no I/O of its own:
//!
//! - **Parse** `Cache-Control` / `Expires` / `Age` headers into a
//!   normalized [`CacheControl`] record
//! - **Merge** directive records with request-default / response /
//!   request-override precedence
//! - **Evaluate** a cached entry's freshness into a [`CacheState`]
//! - **Address** entries through a two-level [`CacheKey`] (table, key)
//!
//! Backend implementations (`kedge-backend`, `kedge-moka`) store
//! [`CachedEntry`] values under these keys; the coordinator in `kedge`
//! drives the evaluator to decide between cache and transport.

pub mod directives;
pub mod entry;
pub mod key;
pub mod state;

pub use directives::{CacheControl, Directive};
pub use entry::CachedEntry;
pub use key::{CacheKey, DEFAULT_TABLE};
pub use state::CacheState;

/// Raw byte data type used for cached payloads.
///
/// `Bytes` gives cheap reference-counted cloning, so handing a cached body
/// to a caller never copies the payload.
pub type Raw = bytes::Bytes;
