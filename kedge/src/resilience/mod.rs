//! The resilience pipeline.
//!
//! Policies nest in a fixed order around the transport:
//!
//! ```text
//! deadline ▷ retry ▷ bulkhead ▷ circuit breaker ▷ attempt timeout ▷ transport
//! ```
//!
//! Each layer is optional; absent layers elide to identity. The overall
//! deadline covers everything a call does — queue waits, attempts, backoff
//! and `Retry-After` sleeps — and once it fires no further retry is
//! initiated.

pub mod breaker;
pub mod bulkhead;
pub mod retry;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FetchError, HttpErrorParts, TimeoutKind};
use crate::signal::{aborted_any, AbortHandle};
use crate::transport::{Transport, TransportRequest, TransportResponse};

pub use breaker::CircuitBreakerConfig;
pub use bulkhead::BulkheadConfig;
pub use retry::RetryPolicy;

use breaker::CircuitBreaker;
use bulkhead::Bulkhead;

/// Safety margin kept between a clamped `Retry-After` sleep and the
/// overall deadline, so the subsequent attempt still has a chance to run.
const RETRY_AFTER_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

/// Resilience pipeline configuration. Every layer is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-attempt timeout, measured from the start of each transport
    /// attempt.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout_request: Option<Duration>,
    /// Overall wall-clock deadline, measured from pipeline entry.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout_total: Option<Duration>,
    /// Retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Bulkhead capacities.
    #[serde(default)]
    pub bulkhead: Option<BulkheadConfig>,
    /// Circuit breaker.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

pub(crate) struct ResiliencePipeline {
    timeout_request: Option<Duration>,
    timeout_total: Option<Duration>,
    retry: Option<RetryPolicy>,
    bulkhead: Option<Bulkhead>,
    breaker: Option<CircuitBreaker>,
}

impl ResiliencePipeline {
    pub fn new(config: ResilienceConfig) -> Self {
        ResiliencePipeline {
            timeout_request: config.timeout_request,
            timeout_total: config.timeout_total,
            retry: config.retry,
            bulkhead: config.bulkhead.as_ref().map(Bulkhead::new),
            breaker: config.circuit_breaker.map(CircuitBreaker::new),
        }
    }

    /// Run one client call through every configured layer.
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        request: TransportRequest,
        own: &AbortHandle,
        external: Option<&AbortHandle>,
        skip_fail_on_error_code: bool,
    ) -> Result<TransportResponse, FetchError> {
        let deadline = self.timeout_total.map(|total| Instant::now() + total);
        let max_attempts = self
            .retry
            .as_ref()
            .map(|policy| policy.max_retries + 1)
            .unwrap_or(1);
        let method = request.method.clone();
        let mut retry_after_clamped = false;
        let mut attempt: u32 = 0;

        loop {
            let _permit = match &self.bulkhead {
                Some(bulkhead) => tokio::select! {
                    permit = bulkhead.acquire() => Some(permit?),
                    _ = maybe_sleep_until(deadline) => {
                        return Err(FetchError::Timeout(TimeoutKind::Deadline));
                    }
                    reason = aborted_any(own, external) => {
                        return Err(FetchError::Aborted(reason));
                    }
                },
                None => None,
            };

            if let Some(breaker) = &self.breaker {
                breaker.admit()?;
            }

            let outcome = self
                .attempt(transport, request.clone(), deadline, own, external, skip_fail_on_error_code)
                .await;

            if let Some(breaker) = &self.breaker {
                match &outcome {
                    Ok(_) => breaker.on_success(),
                    Err(FetchError::Aborted(_)) => {}
                    Err(error) => breaker.on_failure(error, &method),
                }
            }

            // The slot only covers the attempt itself, not the backoff
            // sleep; retry sits outside the bulkhead.
            drop(_permit);

            let error = match outcome {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if matches!(
                error,
                FetchError::Timeout(TimeoutKind::Deadline) | FetchError::Aborted(_)
            ) {
                return Err(error);
            }

            let Some(policy) = &self.retry else {
                return Err(error);
            };
            if attempt + 1 >= max_attempts || !policy.is_retriable(&error, &method) {
                return Err(error);
            }

            let mut delay = policy.backoff_delay(attempt);
            if let FetchError::HttpResponse(parts) = &error {
                if matches!(parts.status.as_u16(), 429 | 503) {
                    if let Some(hint) = retry::retry_after_hint(&parts.headers, Utc::now()) {
                        delay = hint;
                        if let Some(deadline) = deadline {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if !retry_after_clamped
                                && delay + RETRY_AFTER_DEADLINE_MARGIN > remaining
                            {
                                delay = remaining.saturating_sub(RETRY_AFTER_DEADLINE_MARGIN);
                                retry_after_clamped = true;
                                debug!(?delay, "clamped Retry-After delay to fit the deadline");
                            }
                        }
                    }
                }
            }

            // The deadline dominates: never start a sleep that is certain
            // to overrun it.
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    return Err(error);
                }
            }

            debug!(attempt, ?delay, %error, "retrying failed attempt");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = maybe_sleep_until(deadline) => {
                    return Err(FetchError::Timeout(TimeoutKind::Deadline));
                }
                reason = aborted_any(own, external) => {
                    return Err(FetchError::Aborted(reason));
                }
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        transport: &dyn Transport,
        request: TransportRequest,
        deadline: Option<Instant>,
        own: &AbortHandle,
        external: Option<&AbortHandle>,
        skip_fail_on_error_code: bool,
    ) -> Result<TransportResponse, FetchError> {
        let method = request.method.clone();
        let endpoint = request.url.clone();

        let response = tokio::select! {
            result = transport.send(request) => result.map_err(FetchError::Network)?,
            _ = maybe_sleep(self.timeout_request) => {
                return Err(FetchError::Timeout(TimeoutKind::Attempt));
            }
            _ = maybe_sleep_until(deadline) => {
                return Err(FetchError::Timeout(TimeoutKind::Deadline));
            }
            reason = aborted_any(own, external) => {
                return Err(FetchError::Aborted(reason));
            }
        };

        if !response.ok() && !skip_fail_on_error_code {
            let status_text = response.status_text();
            return Err(FetchError::HttpResponse(HttpErrorParts {
                endpoint,
                method,
                status: response.status,
                status_text,
                headers: response.headers,
                body: response.body,
            }));
        }
        Ok(response)
    }
}

async fn maybe_sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => futures::future::pending().await,
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
