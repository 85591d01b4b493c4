//! Retry classification, backoff and `Retry-After` interpretation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::resilience::breaker::DEFAULT_FAILURE_STATUS_CODES;

/// Headers consulted for a server-directed retry instant, in priority
/// order.
const RETRY_AFTER_HEADERS: [&str; 4] = [
    "retry-after",
    "ratelimit-reset",
    "x-ratelimit-reset",
    "x-rate-limit-reset",
];

/// Methods safe to retry without an explicit opt-in.
const RETRIABLE_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
];

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first (the transport is invoked at
    /// most `max_retries + 1` times).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Backoff growth factor.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// Backoff ceiling.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// HTTP statuses worth retrying.
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    /// Also retry POST requests.
    #[serde(default)]
    pub retry_posts: bool,
    /// Retry per-attempt timeouts.
    #[serde(default = "default_true")]
    pub retry_timeout: bool,
    /// Retry network errors.
    #[serde(default = "default_true")]
    pub retry_network_errors: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(128)
}

fn default_exponent() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_status_codes() -> Vec<u16> {
    DEFAULT_FAILURE_STATUS_CODES.to_vec()
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            exponent: default_exponent(),
            max_delay: default_max_delay(),
            retry_status_codes: default_retry_status_codes(),
            retry_posts: false,
            retry_timeout: true,
            retry_network_errors: true,
        }
    }
}

impl RetryPolicy {
    /// Whether a failed attempt may be retried under this policy.
    ///
    /// The overall deadline firing is never retriable; neither are
    /// bulkhead rejections, open circuits, aborts or content errors.
    pub(crate) fn is_retriable(&self, error: &FetchError, method: &Method) -> bool {
        match error {
            FetchError::HttpResponse(parts) => {
                self.retry_status_codes.contains(&parts.status.as_u16())
                    && self.method_retriable(method)
            }
            FetchError::Timeout(crate::error::TimeoutKind::Attempt) => self.retry_timeout,
            FetchError::Network(_) => {
                self.retry_network_errors && error.is_retriable_network()
            }
            _ => false,
        }
    }

    fn method_retriable(&self, method: &Method) -> bool {
        RETRIABLE_METHODS.contains(method) || (self.retry_posts && *method == Method::POST)
    }

    /// Full-jitter exponential backoff: uniform in
    /// `[0, min(max_delay, initial_delay * exponent^attempt)]`.
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let uncapped = self.initial_delay.as_secs_f64() * self.exponent.powi(attempt as i32);
        let capped = uncapped.min(self.max_delay.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }
}

/// Extract a server-directed retry delay from failure response headers.
///
/// The first header of the known set wins. A finite number is seconds from
/// now (fractions allowed); anything else is tried as an HTTP-date whose
/// distance from `now` becomes the delay, floored at zero.
pub(crate) fn retry_after_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = RETRY_AFTER_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())?;

    if let Ok(seconds) = value.trim().parse::<f64>() {
        if seconds.is_finite() {
            return Some(Duration::from_secs_f64(seconds.max(0.0)));
        }
        return None;
    }

    let instant = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = instant.with_timezone(&Utc).signed_duration_since(now);
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
