//! Error types surfaced to callers.

use http::{HeaderMap, Method, StatusCode};
use kedge_core::Raw;
use thiserror::Error;

use crate::transport::TransportError;

/// Structured details of an HTTP failure response.
#[derive(Debug)]
pub struct HttpErrorParts {
    /// Full request URL.
    pub endpoint: String,
    /// Request method.
    pub method: Method,
    /// Response status.
    pub status: StatusCode,
    /// Canonical reason phrase for the status.
    pub status_text: String,
    /// Response headers (consulted for `Retry-After` hints).
    pub headers: HeaderMap,
    /// Response body, unparsed.
    pub body: Raw,
}

/// Which timer produced a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The per-request timeout for a single transport attempt.
    Attempt,
    /// The overall wall-clock deadline for the whole call.
    Deadline,
}

/// Non-fatal outcome carried on the `update` channel of a cached request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoUpdateReason {
    /// The cache was fresh; no fetch was needed.
    FreshCache,
    /// Caching was disabled or missed; the main result came from upstream.
    CacheDisabled,
    /// Revalidation answered `304 Not Modified`.
    Unchanged,
    /// The racing fetch produced a value equal to the cached one.
    Equal,
    /// The race found no cached entry; the main result is the fetch.
    NoCached,
}

/// Error surface of the client.
///
/// `Timeout(Attempt)`, retriable `HttpResponse` and `Network` failures are
/// recovered by the retry policy when configured. `BulkheadRejected` and
/// `BrokenCircuit` surface immediately. `ContentType` is fatal. `NoUpdate`
/// is never returned from a main result, only over an update channel.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The transport returned `status >= 400` and `skip_fail_on_error_code`
    /// was off.
    #[error("HTTP {status} {status_text} for {method} {endpoint}",
        status = .0.status.as_u16(),
        status_text = .0.status_text,
        method = .0.method,
        endpoint = .0.endpoint)]
    HttpResponse(HttpErrorParts),

    /// A JSON request received a non-JSON `Content-Type`.
    #[error("unexpected content-type {content_type:?} for {endpoint}")]
    ContentType {
        /// Full request URL.
        endpoint: String,
        /// The offending `Content-Type` value.
        content_type: String,
    },

    /// A timer fired before the transport answered.
    #[error("request timed out ({0:?})")]
    Timeout(TimeoutKind),

    /// Bulkhead queue capacity was exceeded.
    #[error("bulkhead queue is full")]
    BulkheadRejected,

    /// The circuit breaker is open.
    #[error("circuit breaker is open")]
    BrokenCircuit,

    /// The request was aborted externally, with the caller's reason.
    #[error("request aborted{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted(Option<String>),

    /// Transport-level network failure.
    #[error("network error: {0}")]
    Network(#[source] TransportError),

    /// Non-fatal signal on the update channel.
    #[error("no update available: {0:?}")]
    NoUpdate(NoUpdateReason),

    /// The request was issued after `close()`.
    #[error("client is closed")]
    ClientClosed,

    /// A 2xx JSON body failed to decode.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

impl FetchError {
    /// The HTTP status, for `HttpResponse` failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::HttpResponse(parts) => Some(parts.status),
            _ => None,
        }
    }

    /// True for transport-level network failures that are worth retrying.
    pub(crate) fn is_retriable_network(&self) -> bool {
        matches!(self, FetchError::Network(source) if source.is_retriable())
    }

    /// True when serving a stale entry under `stale-if-error` is allowed:
    /// the revalidation failed with an upstream 5xx or a network error.
    pub(crate) fn allows_stale_if_error(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::HttpResponse(parts) => parts.status.is_server_error(),
            _ => false,
        }
    }
}
