//! Circuit breaker.
//!
//! Counts *consecutive* matching failures; at the threshold the circuit
//! opens and admitted requests fail fast with `BrokenCircuit` until the
//! cool-down elapses. The first request after the cool-down runs as a
//! single half-open probe: success closes the circuit, a matching failure
//! re-opens it.

use std::sync::Mutex;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Status codes that trip the breaker / are worth retrying by default.
pub(crate) const DEFAULT_FAILURE_STATUS_CODES: [u16; 7] = [408, 420, 429, 500, 502, 503, 504];

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive matching failures before the circuit opens.
    #[serde(default = "default_open_after")]
    pub open_after_failed_attempts: u32,
    /// Cool-down before a half-open probe is admitted.
    #[serde(default = "default_half_open_after", with = "humantime_serde")]
    pub half_open_after: Duration,
    /// HTTP statuses counted as failures.
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
    /// Methods whose HTTP failures are counted; `None` means all.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Count timeouts as failures.
    #[serde(default = "default_true")]
    pub trigger_on_timeout: bool,
    /// Count network errors as failures.
    #[serde(default = "default_true")]
    pub trigger_on_network_error: bool,
}

fn default_open_after() -> u32 {
    5
}

fn default_half_open_after() -> Duration {
    Duration::from_secs(10)
}

fn default_status_codes() -> Vec<u16> {
    DEFAULT_FAILURE_STATUS_CODES.to_vec()
}

fn default_true() -> bool {
    true
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            open_after_failed_attempts: default_open_after(),
            half_open_after: default_half_open_after(),
            status_codes: default_status_codes(),
            methods: None,
            trigger_on_timeout: true,
            trigger_on_network_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

pub(crate) struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Gate a request before it reaches the transport.
    ///
    /// While open, everything fails fast. Once the cool-down has elapsed
    /// exactly one caller transitions to half-open and proceeds as the
    /// probe; concurrent callers keep failing fast until the probe
    /// settles.
    pub fn admit(&self) -> Result<(), FetchError> {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::HalfOpen => Err(FetchError::BrokenCircuit),
            BreakerState::Open { until } => {
                if Instant::now() < until {
                    Err(FetchError::BrokenCircuit)
                } else {
                    *state = BreakerState::HalfOpen;
                    debug!("circuit breaker half-open, admitting probe");
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.lock();
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a failed attempt.
    ///
    /// Non-matching failures do not advance the counter; in half-open they
    /// close the circuit, since the upstream demonstrably answered.
    pub fn on_failure(&self, error: &FetchError, method: &Method) {
        let matched = self.matches(error, method);
        let mut state = self.lock();
        match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                if !matched {
                    return;
                }
                let failures = consecutive_failures + 1;
                if failures >= self.config.open_after_failed_attempts {
                    warn!(
                        failures,
                        cooldown = ?self.config.half_open_after,
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.half_open_after,
                    };
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            BreakerState::HalfOpen => {
                if matched {
                    warn!("circuit breaker probe failed, re-opening");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.half_open_after,
                    };
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn matches(&self, error: &FetchError, method: &Method) -> bool {
        match error {
            FetchError::HttpResponse(parts) => {
                self.config.status_codes.contains(&parts.status.as_u16())
                    && self.method_matches(method)
            }
            FetchError::Timeout(_) => self.config.trigger_on_timeout,
            FetchError::Network(_) => self.config.trigger_on_network_error,
            _ => false,
        }
    }

    fn method_matches(&self, method: &Method) -> bool {
        match &self.config.methods {
            None => true,
            Some(methods) => methods
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(method.as_str())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // A poisoned breaker lock means a panic mid-transition; falling
        // back to the inner value keeps the breaker functional.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HttpErrorParts, TimeoutKind};
    use http::{HeaderMap, StatusCode};

    fn http_error(status: u16) -> FetchError {
        FetchError::HttpResponse(HttpErrorParts {
            endpoint: "http://api.test/x".into(),
            method: Method::GET,
            status: StatusCode::from_u16(status).unwrap(),
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Default::default(),
        })
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            open_after_failed_attempts: threshold,
            half_open_after: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn opens_after_consecutive_matching_failures() {
        let breaker = breaker(3);
        for _ in 0..2 {
            breaker.admit().unwrap();
            breaker.on_failure(&http_error(503), &Method::GET);
        }
        breaker.admit().unwrap();
        breaker.on_failure(&http_error(503), &Method::GET);

        assert!(matches!(
            breaker.admit(),
            Err(FetchError::BrokenCircuit)
        ));
    }

    #[tokio::test]
    async fn success_resets_the_count() {
        let breaker = breaker(2);
        breaker.on_failure(&http_error(500), &Method::GET);
        breaker.on_success();
        breaker.on_failure(&http_error(500), &Method::GET);
        assert!(breaker.admit().is_ok());
    }

    #[tokio::test]
    async fn non_matching_failures_are_not_counted() {
        let breaker = breaker(1);
        breaker.on_failure(&http_error(404), &Method::GET);
        assert!(breaker.admit().is_ok());

        let no_timeouts = CircuitBreaker::new(CircuitBreakerConfig {
            open_after_failed_attempts: 1,
            trigger_on_timeout: false,
            ..Default::default()
        });
        no_timeouts.on_failure(&FetchError::Timeout(TimeoutKind::Attempt), &Method::GET);
        assert!(no_timeouts.admit().is_ok());
    }

    #[tokio::test]
    async fn method_restriction_applies_to_http_failures_only() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            open_after_failed_attempts: 1,
            methods: Some(vec!["POST".into()]),
            ..Default::default()
        });
        breaker.on_failure(&http_error(503), &Method::GET);
        assert!(breaker.admit().is_ok());
        breaker.on_failure(&http_error(503), &Method::POST);
        assert!(matches!(breaker.admit(), Err(FetchError::BrokenCircuit)));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_recovers_or_reopens() {
        let breaker = breaker(1);
        breaker.on_failure(&http_error(503), &Method::GET);
        assert!(matches!(breaker.admit(), Err(FetchError::BrokenCircuit)));

        tokio::time::advance(Duration::from_millis(60)).await;

        // First caller becomes the probe; a second one still fails fast.
        assert!(breaker.admit().is_ok());
        assert!(matches!(breaker.admit(), Err(FetchError::BrokenCircuit)));

        breaker.on_success();
        assert!(breaker.admit().is_ok());

        // Failing probe re-opens for another cool-down.
        breaker.on_failure(&http_error(503), &Method::GET);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.admit().is_ok());
        breaker.on_failure(&http_error(503), &Method::GET);
        assert!(matches!(breaker.admit(), Err(FetchError::BrokenCircuit)));
    }
}
