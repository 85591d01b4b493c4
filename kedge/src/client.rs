//! The HTTP client: request context, defaults, lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use http::header::{HeaderName, IntoHeaderName, ACCEPT};
use http::{HeaderMap, HeaderValue, Method};
use kedge_backend::{CacheProvider, ProviderRegistry, RegistryError};
use kedge_core::Raw;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::{CacheCoordinator, CacheOptions, JsonFetch, OffloadManager, PipelineFetcher, UpdateChannel};
use crate::error::FetchError;
use crate::resilience::{ResilienceConfig, ResiliencePipeline};
use crate::signal::AbortHandle;
use crate::transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};

/// Options for a plain (non-JSON) request.
///
/// Note that this path performs no caching: there is deliberately no
/// `use_cache` field here, only [`JsonOptions`] carries one.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Request method (GET by default).
    pub method: Method,
    /// Caller headers, merged over the client defaults.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Raw>,
    /// External abort handle.
    pub signal: Option<AbortHandle>,
    /// Treat non-2xx responses as normal responses instead of errors.
    pub skip_fail_on_error_code: bool,
}

impl FetchOptions {
    /// Default options: GET, no headers, no body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a caller header.
    pub fn header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Raw>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach an external abort handle.
    pub fn signal(mut self, signal: AbortHandle) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Treat non-2xx responses as normal responses.
    pub fn skip_fail_on_error_code(mut self, skip: bool) -> Self {
        self.skip_fail_on_error_code = skip;
        self
    }
}

/// Options for a JSON request.
#[derive(Debug, Clone, Default)]
pub struct JsonOptions {
    /// The underlying request options.
    pub fetch: FetchOptions,
    /// Do not inject `Accept: application/json`.
    pub skip_accept_header: bool,
    /// Do not validate the response `Content-Type`.
    pub skip_content_type_header_validation: bool,
    /// Engage the caching coordinator.
    pub use_cache: Option<CacheOptions>,
}

impl JsonOptions {
    /// Default options: GET, `Accept` injection and content-type
    /// validation on, no caching.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.fetch.method = method;
        self
    }

    /// Add a caller header.
    pub fn header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.fetch.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Raw>) -> Self {
        self.fetch.body = Some(body.into());
        self
    }

    /// Attach an external abort handle.
    pub fn signal(mut self, signal: AbortHandle) -> Self {
        self.fetch.signal = Some(signal);
        self
    }

    /// Treat non-2xx responses as normal responses.
    pub fn skip_fail_on_error_code(mut self, skip: bool) -> Self {
        self.fetch.skip_fail_on_error_code = skip;
        self
    }

    /// Do not inject `Accept: application/json`.
    pub fn skip_accept_header(mut self, skip: bool) -> Self {
        self.skip_accept_header = skip;
        self
    }

    /// Do not validate the response `Content-Type`.
    pub fn skip_content_type_header_validation(mut self, skip: bool) -> Self {
        self.skip_content_type_header_validation = skip;
        self
    }

    /// Engage the caching coordinator with the given options.
    pub fn use_cache(mut self, options: CacheOptions) -> Self {
        self.use_cache = Some(options);
        self
    }
}

struct ClientInner {
    base_url: Option<String>,
    default_headers: HeaderMap,
    default_headers_by_method: HashMap<Method, HeaderMap>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<ResiliencePipeline>,
    registry: Arc<ProviderRegistry>,
    coordinator: CacheCoordinator,
    offload: OffloadManager,
    active: DashMap<u64, AbortHandle>,
    next_request_id: AtomicU64,
    in_flight: AtomicUsize,
    closed: AtomicBool,
}

/// Resilient, cache-aware HTTP client.
///
/// Cheap to clone; clones share the transport, the resilience state
/// (bulkhead, circuit breaker) and the cache registry.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    base_url: Option<String>,
    default_headers: HeaderMap,
    default_headers_by_method: HashMap<Method, HeaderMap>,
    resilience: ResilienceConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: ProviderRegistry,
}

impl HttpClientBuilder {
    /// New builder with no defaults set.
    pub fn new() -> Self {
        HttpClientBuilder {
            base_url: None,
            default_headers: HeaderMap::new(),
            default_headers_by_method: HashMap::new(),
            resilience: ResilienceConfig::default(),
            transport: None,
            registry: ProviderRegistry::new(),
        }
    }

    /// Base URL prepended to relative request paths.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Header applied to every request (unless the caller deletes it with
    /// an empty value).
    pub fn default_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.default_headers.append(name, value);
        self
    }

    /// Header applied to requests with a specific method.
    pub fn default_header_for<K: IntoHeaderName>(
        mut self,
        method: Method,
        name: K,
        value: HeaderValue,
    ) -> Self {
        self.default_headers_by_method
            .entry(method)
            .or_default()
            .append(name, value);
        self
    }

    /// Resilience pipeline configuration.
    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.resilience = config;
        self
    }

    /// Custom transport (defaults to [`ReqwestTransport`]).
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Register a cache provider.
    pub fn provider(
        mut self,
        provider: impl CacheProvider + 'static,
    ) -> Result<Self, RegistryError> {
        self.registry.register(Arc::new(provider))?;
        Ok(self)
    }

    /// Build the client.
    pub fn build(self) -> HttpClient {
        let registry = Arc::new(self.registry);
        let offload = OffloadManager::new();
        HttpClient {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                default_headers: self.default_headers,
                default_headers_by_method: self.default_headers_by_method,
                transport: self
                    .transport
                    .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
                pipeline: Arc::new(ResiliencePipeline::new(self.resilience)),
                registry: registry.clone(),
                coordinator: CacheCoordinator::new(registry, offload.clone()),
                offload,
                active: DashMap::new(),
                next_request_id: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one request for the lifetime of its future.
struct RequestGuard {
    inner: Arc<ClientInner>,
    id: u64,
    handle: AbortHandle,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inner.active.remove(&self.id);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpClient {
    /// New builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Perform a request through the resilience pipeline and return the
    /// raw response.
    ///
    /// Known limitation: this path is never cached; only
    /// [`fetch_json`](Self::fetch_json) consults the caching coordinator.
    pub async fn fetch(
        &self,
        path: &str,
        options: FetchOptions,
    ) -> Result<TransportResponse, FetchError> {
        let guard = self.begin_request()?;
        let request = self.build_request(path, &options.method, &options.headers, options.body.clone());
        self.inner
            .pipeline
            .execute(
                &*self.inner.transport,
                request,
                &guard.handle,
                options.signal.as_ref(),
                options.skip_fail_on_error_code,
            )
            .await
    }

    /// Perform a JSON request, decoding the body into `T`.
    ///
    /// Injects `Accept: application/json` when absent, validates the
    /// response `Content-Type`, and consults the caching coordinator when
    /// `use_cache` is set.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: JsonOptions,
    ) -> Result<JsonFetch<T>, FetchError> {
        let guard = self.begin_request()?;
        let mut request = self.build_request(
            path,
            &options.fetch.method,
            &options.fetch.headers,
            options.fetch.body.clone(),
        );
        if !options.skip_accept_header && !request.headers.contains_key(ACCEPT) {
            request
                .headers
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        let fetcher = PipelineFetcher {
            pipeline: self.inner.pipeline.clone(),
            transport: self.inner.transport.clone(),
            signal: guard.handle.clone(),
            external: options.fetch.signal.clone(),
            skip_fail_on_error_code: options.fetch.skip_fail_on_error_code,
            validate_content_type: !options.skip_content_type_header_validation,
        };

        let (response, update) = match options.use_cache {
            Some(cache) if !cache.bypasses_cache() && !self.inner.registry.is_empty() => {
                self.inner.coordinator.execute(fetcher, request, cache).await?
            }
            _ => (fetcher.fetch_raw(request).await?, None),
        };

        Ok(JsonFetch {
            value: serde_json::from_slice(&response.body)?,
            status: response.status,
            headers: response.headers,
            update: update.map(UpdateChannel::new),
        })
    }

    /// Trigger every currently owned abort handle.
    pub fn abort_all(&self, reason: Option<String>) {
        debug!(
            active = self.inner.active.len(),
            "aborting all active requests"
        );
        for entry in self.inner.active.iter() {
            entry.value().abort(reason.clone());
        }
    }

    /// Close the client.
    ///
    /// New requests fail with [`FetchError::ClientClosed`] immediately.
    /// Outstanding work is then drained: with `None` the call waits
    /// indefinitely, with `Some(t)` it waits up to `t` before aborting
    /// what remains, and with `Some(0)` it aborts right away. Background
    /// cache tasks are part of the drain.
    pub async fn close(&self, timeout: Option<Duration>) {
        self.inner.closed.store(true, Ordering::SeqCst);
        match timeout {
            Some(limit) if limit.is_zero() => {
                self.abort_all(None);
                self.inner.offload.cancel_all();
            }
            Some(limit) => {
                if !self.drained(Some(limit)).await {
                    self.abort_all(None);
                    self.inner.offload.cancel_all();
                }
            }
            None => {
                self.drained(None).await;
            }
        }
        // Aborted work still needs to unwind before the backends go away.
        self.drained(None).await;
        self.inner.registry.close_all().await;
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    async fn drained(&self, timeout: Option<Duration>) -> bool {
        let wait = async {
            loop {
                if self.inner.in_flight.load(Ordering::SeqCst) == 0
                    && self.inner.offload.active_len() == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    fn begin_request(&self) -> Result<RequestGuard, FetchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FetchError::ClientClosed);
        }
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let handle = AbortHandle::new();
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.active.insert(id, handle.clone());
        Ok(RequestGuard {
            inner: self.inner.clone(),
            id,
            handle,
        })
    }

    fn build_request(
        &self,
        path: &str,
        method: &Method,
        caller_headers: &HeaderMap,
        body: Option<Raw>,
    ) -> TransportRequest {
        let url = join_url(self.inner.base_url.as_deref(), path);
        let headers = merge_headers(
            &self.inner.default_headers,
            self.inner.default_headers_by_method.get(method),
            caller_headers,
        );
        TransportRequest {
            method: method.clone(),
            url,
            headers,
            body,
        }
    }
}

/// Join a base URL and a path with exactly one separating slash; absolute
/// paths pass through untouched.
fn join_url(base: Option<&str>, path: &str) -> String {
    let Some(base) = base else {
        return path.to_owned();
    };
    if path.is_empty() {
        return base.to_owned();
    }
    if path.contains("://") {
        return path.to_owned();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Overlay defaults, per-method defaults and caller headers, in that
/// order of increasing precedence.
///
/// An empty value deletes the header; values already present in the
/// accumulated comma-list are not appended again. The merge happens once,
/// before the pipeline — retries reuse the merged set.
fn merge_headers(
    defaults: &HeaderMap,
    by_method: Option<&HeaderMap>,
    caller: &HeaderMap,
) -> HeaderMap {
    let mut merged = HeaderMap::new();
    let empty = HeaderMap::new();
    for layer in [defaults, by_method.unwrap_or(&empty), caller] {
        for (name, value) in layer.iter() {
            overlay_header(&mut merged, name, value);
        }
    }
    merged
}

fn overlay_header(map: &mut HeaderMap, name: &HeaderName, value: &HeaderValue) {
    let Ok(text) = value.to_str() else {
        map.insert(name.clone(), value.clone());
        return;
    };
    if text.trim().is_empty() {
        map.remove(name);
        return;
    }
    let existing = map
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match existing {
        None => {
            map.insert(name.clone(), value.clone());
        }
        Some(existing) => {
            let mut tokens: Vec<&str> = existing
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();
            let incoming: Vec<&str> = text
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty() && !tokens.contains(t))
                .collect();
            tokens.extend(incoming);
            if let Ok(combined) = HeaderValue::from_str(&tokens.join(",")) {
                map.insert(name.clone(), combined);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn url_join_rules() {
        assert_eq!(join_url(None, "http://a.test/x"), "http://a.test/x");
        assert_eq!(join_url(Some("http://a.test"), "x"), "http://a.test/x");
        assert_eq!(join_url(Some("http://a.test/"), "/x"), "http://a.test/x");
        assert_eq!(join_url(Some("http://a.test/v1"), ""), "http://a.test/v1");
        assert_eq!(
            join_url(Some("http://a.test"), "http://b.test/y"),
            "http://b.test/y"
        );
    }

    #[test]
    fn caller_headers_overlay_defaults() {
        let merged = merge_headers(
            &headers(&[("x-app", "kedge"), ("accept", "application/json")]),
            None,
            &headers(&[("x-trace", "abc")]),
        );
        assert_eq!(merged.get("x-app").unwrap(), "kedge");
        assert_eq!(merged.get("x-trace").unwrap(), "abc");
        assert_eq!(merged.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn empty_value_deletes_a_default() {
        let merged = merge_headers(
            &headers(&[("x-app", "kedge")]),
            None,
            &headers(&[("x-app", "")]),
        );
        assert!(!merged.contains_key("x-app"));
    }

    #[test]
    fn per_method_defaults_sit_between_global_and_caller() {
        let mut by_method = HashMap::new();
        by_method.insert(Method::POST, headers(&[("content-type", "application/json")]));
        let merged = merge_headers(
            &headers(&[("x-app", "kedge")]),
            by_method.get(&Method::POST),
            &HeaderMap::new(),
        );
        assert_eq!(merged.get("content-type").unwrap(), "application/json");
        assert_eq!(merged.get("x-app").unwrap(), "kedge");
    }

    #[test]
    fn comma_lists_are_deduplicated() {
        let merged = merge_headers(
            &headers(&[("accept-encoding", "gzip,br")]),
            None,
            &headers(&[("accept-encoding", "br, zstd")]),
        );
        assert_eq!(merged.get("accept-encoding").unwrap(), "gzip,br,zstd");
    }
}
