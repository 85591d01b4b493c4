//! Cached entry type.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::{ETAG, LAST_MODIFIED};

use crate::directives::CacheControl;
use crate::key::CacheKey;
use crate::Raw;

/// One cached payload with the metadata needed to judge its freshness and
/// to build conditional requests.
///
/// `updated` is monotonically non-decreasing per key: backends reject
/// writes that would move it backwards.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// Address of the entry within its backend.
    pub key: CacheKey,
    /// When the payload was written.
    pub updated: DateTime<Utc>,
    /// The payload (serialized JSON).
    pub value: Raw,
    /// Response headers captured at write time.
    pub headers: HeaderMap,
    /// Directive record parsed from those headers.
    pub cache_control: CacheControl,
}

impl CachedEntry {
    /// Entry written now.
    pub fn new(key: CacheKey, value: Raw, headers: HeaderMap, cache_control: CacheControl) -> Self {
        CachedEntry {
            key,
            updated: Utc::now(),
            value,
            headers,
            cache_control,
        }
    }

    /// The stored `ETag` validator, if the response carried one.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|v| v.to_str().ok())
    }

    /// The stored `Last-Modified` validator, if the response carried one.
    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok())
    }
}
