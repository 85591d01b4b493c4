//! Builder for configuring [`MokaBackend`].

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use kedge_core::{CacheKey, CachedEntry, Directive};
use moka::future::{Cache, CacheBuilder};
use moka::Expiry;

use crate::backend::MokaBackend;

/// Expiration policy computing per-entry TTL from the entry's directives.
///
/// The lifetime is `max-age` plus the wider of the two stale grace
/// windows, measured from the entry's `updated` timestamp: a stale entry
/// must survive in the cache for as long as a relaxation could still
/// serve it. Entries without a finite `max-age` never expire on their own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Expiration;

impl Expiry<CacheKey, CachedEntry> for Expiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        entry: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Self::calculate_ttl(entry)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        entry: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // Always recompute from the NEW entry. The default implementation
        // returns `duration_until_expiry`, which would keep the OLD
        // lifetime and expire refreshed entries prematurely.
        Self::calculate_ttl(entry)
    }
}

impl Expiration {
    fn calculate_ttl(entry: &CachedEntry) -> Option<Duration> {
        let record = &entry.cache_control;
        let max_age = record.max_age?.seconds()?;
        let grace = [record.stale_while_revalidate, record.stale_if_error]
            .into_iter()
            .flatten()
            .map(|directive| match directive {
                // A boolean grace keeps the entry alive indefinitely.
                Directive::Flag(true) => return u64::MAX,
                other => other.seconds().unwrap_or(0),
            })
            .max()
            .unwrap_or(0);
        if grace == u64::MAX {
            return None;
        }

        let lifetime = max_age.saturating_add(grace).min(i64::MAX as u64) as i64;
        let expires_at = entry.updated.checked_add_signed(TimeDelta::seconds(lifetime))?;
        let remaining = expires_at.signed_duration_since(Utc::now());
        // Millisecond precision; already-expired entries get zero.
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis(millis as u64))
        }
    }
}

/// Builder for creating and configuring a [`MokaBackend`].
///
/// ```
/// use kedge_moka::MokaBackend;
///
/// let backend = MokaBackend::builder(10_000).label("l1").build();
/// ```
pub struct MokaBackendBuilder {
    builder: CacheBuilder<CacheKey, CachedEntry, Cache<CacheKey, CachedEntry>>,
    label: String,
}

impl MokaBackendBuilder {
    /// Creates a new builder with the specified maximum entry count.
    ///
    /// When the cache exceeds `max_capacity` entries, least recently used
    /// entries are evicted.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            builder: CacheBuilder::new(max_capacity),
            label: "moka".to_owned(),
        }
    }

    /// Sets a custom label for this backend.
    ///
    /// The label identifies the backend in diagnostics. Defaults to
    /// `"moka"`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Builds the [`MokaBackend`] with the configured settings.
    pub fn build(self) -> MokaBackend {
        let cache = self.builder.expire_after(Expiration).build();
        MokaBackend {
            cache,
            label: self.label,
            closed: AtomicBool::new(false),
        }
    }
}
