//! Normalized `Cache-Control` directive records.
//!
//! This module provides:
//!
//! - [`Directive`] - the "seconds or boolean" value shape shared by
//!   `max-age`, `stale-while-revalidate` and `stale-if-error`
//! - [`CacheControl`] - the normalized record parsed from response headers
//!   or supplied as request defaults/overrides
//!
//! ## Precedence
//!
//! A request's *effective* record is built field-wise from three layers:
//! request defaults, then the response-derived record, then request
//! overrides - later layers win. See [`CacheControl::merge`].

use std::fmt;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::{AGE, CACHE_CONTROL, EXPIRES};

/// A directive value that is either a boolean flag or a duration in seconds.
///
/// Several caching directives accept both shapes when configured by the
/// caller: `Flag(true)` means "unbounded / always applies", `Flag(false)`
/// means "zero / never applies", and `Secs(n)` is an explicit window.
/// Headers only ever parse to `Secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Boolean form: `true` is unbounded, `false` is zero.
    Flag(bool),
    /// Explicit duration in seconds.
    Secs(u64),
}

impl Directive {
    /// True for `Flag(false)` and `Secs(0)`: the directive grants nothing.
    pub fn is_zero(&self) -> bool {
        matches!(self, Directive::Flag(false) | Directive::Secs(0))
    }

    /// True only for the unbounded boolean form.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Directive::Flag(true))
    }

    /// The window in seconds, when one is expressible.
    ///
    /// `Flag(false)` maps to zero; `Flag(true)` has no finite window.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            Directive::Flag(true) => None,
            Directive::Flag(false) => Some(0),
            Directive::Secs(secs) => Some(*secs),
        }
    }
}

impl From<bool> for Directive {
    fn from(flag: bool) -> Self {
        Directive::Flag(flag)
    }
}

impl From<u64> for Directive {
    fn from(secs: u64) -> Self {
        Directive::Secs(secs)
    }
}

/// Normalized cache directive record.
///
/// All fields are optional so that records can be merged field-wise without
/// an unset field clobbering a set one. Parsed from response headers by
/// [`CacheControl::from_headers`], or built literally for request defaults
/// and overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `max-age` seconds, or the boolean forms (`true` = infinite,
    /// `false` = zero).
    pub max_age: Option<Directive>,
    /// `no-cache`: the entry must be revalidated before use.
    pub no_cache: Option<bool>,
    /// `no-store`: the entry must not be cached at all.
    pub no_store: Option<bool>,
    /// `must-revalidate`: stale entries must not be served without
    /// revalidation.
    pub must_revalidate: Option<bool>,
    /// `stale-while-revalidate` window.
    pub stale_while_revalidate: Option<Directive>,
    /// `stale-if-error` window.
    pub stale_if_error: Option<Directive>,
}

impl CacheControl {
    /// Record with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a record from response headers at time `now`.
    ///
    /// If `Cache-Control` is absent the `Expires` header is consulted
    /// instead (`max_age = max(0, round(expires - now))`). When `max-age`
    /// is present and the `Age` header carries a finite integer, the age is
    /// subtracted from the window, floored at zero. Unrecognized directives
    /// and unparseable values are ignored.
    pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let mut record = Self::default();

        let tokens: Vec<String> = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect();

        if tokens.is_empty() {
            if let Some(expires) = header_str(headers, &EXPIRES)
                .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            {
                let remaining_ms = expires
                    .with_timezone(&Utc)
                    .signed_duration_since(now)
                    .num_milliseconds();
                let secs = ((remaining_ms as f64) / 1000.0).round().max(0.0) as u64;
                record.max_age = Some(Directive::Secs(secs));
            }
            return record;
        }

        for token in tokens {
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (token.as_str(), None),
            };
            match name {
                "no-cache" => record.no_cache = Some(true),
                "no-store" => record.no_store = Some(true),
                "must-revalidate" => record.must_revalidate = Some(true),
                "max-age" => {
                    if let Some(secs) = value.and_then(|v| v.parse::<u64>().ok()) {
                        record.max_age = Some(Directive::Secs(secs));
                    }
                }
                "stale-while-revalidate" => {
                    if let Some(secs) = value.and_then(|v| v.parse::<u64>().ok()) {
                        record.stale_while_revalidate = Some(Directive::Secs(secs));
                    }
                }
                "stale-if-error" => {
                    if let Some(secs) = value.and_then(|v| v.parse::<u64>().ok()) {
                        record.stale_if_error = Some(Directive::Secs(secs));
                    }
                }
                _ => {}
            }
        }

        if let Some(Directive::Secs(max_age)) = record.max_age {
            if let Some(age) = header_str(headers, &AGE).and_then(|v| v.parse::<u64>().ok()) {
                record.max_age = Some(Directive::Secs(max_age.saturating_sub(age)));
            }
        }

        record
    }

    /// Overlay `stronger` on top of `self`, field-wise.
    ///
    /// Fields set in `stronger` replace the corresponding field of `self`;
    /// unset fields leave `self` untouched.
    pub fn merge(&self, stronger: &CacheControl) -> CacheControl {
        CacheControl {
            max_age: stronger.max_age.or(self.max_age),
            no_cache: stronger.no_cache.or(self.no_cache),
            no_store: stronger.no_store.or(self.no_store),
            must_revalidate: stronger.must_revalidate.or(self.must_revalidate),
            stale_while_revalidate: stronger
                .stale_while_revalidate
                .or(self.stale_while_revalidate),
            stale_if_error: stronger.stale_if_error.or(self.stale_if_error),
        }
    }

    /// True when every field is unset.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &http::header::HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

impl fmt::Display for CacheControl {
    /// Serialize the recognized directives back to header syntax.
    ///
    /// Boolean directive values render as their second-count equivalents
    /// where headers have no boolean form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, token: String| -> fmt::Result {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(&token)
        };

        if self.no_store == Some(true) {
            put(f, "no-store".into())?;
        }
        if self.no_cache == Some(true) {
            put(f, "no-cache".into())?;
        }
        if self.must_revalidate == Some(true) {
            put(f, "must-revalidate".into())?;
        }
        if let Some(max_age) = self.max_age.and_then(|d| d.seconds()) {
            put(f, format!("max-age={max_age}"))?;
        }
        if let Some(secs) = self.stale_while_revalidate.and_then(|d| d.seconds()) {
            put(f, format!("stale-while-revalidate={secs}"))?;
        }
        if let Some(secs) = self.stale_if_error.and_then(|d| d.seconds()) {
            put(f, format!("stale-if-error={secs}"))?;
        }
        Ok(())
    }
}
