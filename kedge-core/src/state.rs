//! Freshness evaluation.
//!
//! Maps an effective [`CacheControl`] record plus a cached entry's
//! `updated` timestamp to a [`CacheState`]. This is a pure timestamp
//! comparison; the coordinator decides what to *do* with the state.

use chrono::{DateTime, TimeDelta, Utc};

use crate::directives::{CacheControl, Directive};

/// Freshness classification of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Caching is disabled for this entry (`no-store`).
    Disabled,
    /// The entry is usable without revalidation.
    Fresh,
    /// The entry is past its freshness window.
    ///
    /// The three flags are *evaluated* relaxations: whether each grace
    /// applies right now, not merely whether it was configured.
    Stale {
        /// Serving without revalidation is forbidden.
        must_revalidate: bool,
        /// The entry may be served while a background revalidation runs.
        stale_while_revalidate: bool,
        /// The entry may be served when revalidation fails upstream.
        stale_if_error: bool,
    },
}

impl CacheState {
    /// True for the `Fresh` variant.
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheState::Fresh)
    }
}

impl CacheControl {
    /// Evaluate this record against an entry written at `updated`.
    pub fn state(&self, updated: DateTime<Utc>, now: DateTime<Utc>) -> CacheState {
        if self.no_store == Some(true) {
            return CacheState::Disabled;
        }

        let must_revalidate = self.must_revalidate == Some(true);
        let max_age_zero = self.max_age.is_some_and(|d| d.is_zero());

        // max-age=0 + must-revalidate is the header-level spelling of
        // no-cache; no-cache itself always demands revalidation.
        if self.no_cache == Some(true) || (max_age_zero && must_revalidate) {
            return CacheState::Stale {
                must_revalidate: true,
                stale_while_revalidate: false,
                stale_if_error: false,
            };
        }

        let max_age = match self.max_age {
            None | Some(Directive::Flag(true)) => return CacheState::Fresh,
            Some(directive) => directive.seconds().unwrap_or(0),
        };

        if within(updated, max_age, 0, now) {
            return CacheState::Fresh;
        }

        CacheState::Stale {
            must_revalidate,
            stale_while_revalidate: relaxation_applies(
                self.stale_while_revalidate,
                updated,
                max_age,
                now,
            ),
            stale_if_error: relaxation_applies(self.stale_if_error, updated, max_age, now),
        }
    }
}

/// `updated + (max_age + grace) >= now`, saturating on overflow.
fn within(updated: DateTime<Utc>, max_age: u64, grace: u64, now: DateTime<Utc>) -> bool {
    let window = max_age.saturating_add(grace).min(i64::MAX as u64) as i64;
    match updated.checked_add_signed(TimeDelta::seconds(window)) {
        Some(limit) => limit >= now,
        None => true,
    }
}

fn relaxation_applies(
    directive: Option<Directive>,
    updated: DateTime<Utc>,
    max_age: u64,
    now: DateTime<Utc>,
) -> bool {
    match directive {
        None | Some(Directive::Flag(false)) => false,
        Some(Directive::Flag(true)) => true,
        Some(Directive::Secs(grace)) => within(updated, max_age, grace, now),
    }
}
