//! The transport seam.
//!
//! A [`Transport`] performs exactly one HTTP exchange. Request bodies are
//! materialized to [`Raw`] bytes *before* the retry-capable layers, so
//! every retry attempt clones the request cheaply instead of re-reading a
//! body stream. Response bodies are buffered the same way.

mod reqwest;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use http::header::CONTENT_TYPE;
use kedge_core::Raw;
use thiserror::Error;

pub use self::reqwest::ReqwestTransport;

/// One buffered HTTP request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Request method.
    pub method: Method,
    /// Full request URL.
    pub url: String,
    /// Effective headers (already merged with client defaults).
    pub headers: HeaderMap,
    /// Buffered body, if any.
    pub body: Option<Raw>,
}

impl TransportRequest {
    /// Request with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        TransportRequest {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// One buffered HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers; lookups are case-insensitive.
    pub headers: HeaderMap,
    /// Buffered body.
    pub body: Raw,
}

impl TransportResponse {
    /// True iff `status < 400`.
    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    /// Canonical reason phrase for the status.
    pub fn status_text(&self) -> String {
        self.status
            .canonical_reason()
            .unwrap_or_default()
            .to_owned()
    }

    /// The `Content-Type` header value, when readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Body as text (lossy UTF-8).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Transport-level failures; all classified as network errors by the
/// resilience policies except invalid URLs, which no retry can fix.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request URL could not be parsed.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// Connection, I/O or protocol failure.
    #[error(transparent)]
    Connect(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub(crate) fn is_retriable(&self) -> bool {
        !matches!(self, TransportError::InvalidUrl(_))
    }
}

/// Issues one HTTP exchange.
///
/// Cancellation is dropping the returned future; implementations must not
/// leave work running after a drop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the exchange.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
