//! Shared test transport with a scripted response sequence.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use kedge::{Transport, TransportError, TransportRequest, TransportResponse};

/// One scripted transport exchange.
pub enum Step {
    /// Answer with a JSON response.
    Json {
        status: u16,
        body: &'static str,
        headers: Vec<(&'static str, &'static str)>,
        delay: Option<Duration>,
    },
    /// Fail with a network error.
    Network,
    /// Never answer (until the attempt is cancelled).
    Hang,
}

impl Step {
    pub fn ok(body: &'static str) -> Self {
        Step::Json {
            status: 200,
            body,
            headers: vec![],
            delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Step::Json {
            status,
            body: "{}",
            headers: vec![],
            delay: None,
        }
    }

    pub fn status_with(status: u16, headers: Vec<(&'static str, &'static str)>) -> Self {
        Step::Json {
            status,
            body: "{}",
            headers,
            delay: None,
        }
    }

    pub fn delayed(body: &'static str, delay: Duration) -> Self {
        Step::Json {
            status: 200,
            body,
            headers: vec![],
            delay: Some(delay),
        }
    }
}

#[derive(Default)]
struct Inner {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

/// Transport that replays a scripted sequence of outcomes and records
/// call counts plus the peak number of concurrent exchanges. Once the
/// script is exhausted it answers `200 {"ok":true}`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Inner>,
}

struct ConcurrencyGuard(Arc<Inner>);

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.0.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Self {
        ScriptedTransport {
            inner: Arc::new(Inner {
                script: Mutex::new(script.into()),
                ..Default::default()
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.inner.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_concurrent.fetch_max(current, Ordering::SeqCst);
        let _guard = ConcurrencyGuard(self.inner.clone());

        let step = self
            .inner
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front();
        match step {
            None => Ok(json_response(200, r#"{"ok":true}"#, &[])),
            Some(Step::Json {
                status,
                body,
                headers,
                delay,
            }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(json_response(status, body, &headers))
            }
            Some(Step::Network) => Err(TransportError::Connect("connection reset".into())),
            Some(Step::Hang) => futures::future::pending().await,
        }
    }
}

fn json_response(
    status: u16,
    body: &'static str,
    extra_headers: &[(&'static str, &'static str)],
) -> TransportResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    for (name, value) in extra_headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_static(value),
        );
    }
    TransportResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers,
        body: kedge::Raw::from_static(body.as_bytes()),
    }
}
