//! The caching coordinator.
//!
//! Engaged for JSON requests that carry [`CacheOptions`]. The coordinator
//! resolves a backend through the provider registry, evaluates the cached
//! entry's freshness under the request's effective directives, and then
//! multiplexes between cache and transport under one of three strategies:
//!
//! - [`CacheMode::CacheControl`] (default) — honor directives: serve fresh
//!   hits, revalidate stale ones conditionally, serve stale under
//!   `stale-while-revalidate` / `stale-if-error`
//! - [`CacheMode::FetchFirst`] — transport first, cache as fallback
//! - [`CacheMode::Race`] — cache and transport race for first result
//!
//! Write-through is fire-and-forget: it never fails a request, and a
//! lookup immediately after a fetch is not guaranteed to see the write.

mod offload;
mod update;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderValue, StatusCode};
use kedge_backend::{CacheBackend, ProviderRegistry};
use kedge_core::{CacheControl, CacheKey, CacheState, CachedEntry, Directive, DEFAULT_TABLE};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{FetchError, NoUpdateReason};
use crate::resilience::ResiliencePipeline;
use crate::signal::AbortHandle;
use crate::transport::{Transport, TransportRequest, TransportResponse};

pub(crate) use offload::OffloadManager;
pub(crate) use update::UpdateReceiver;
pub use update::{JsonBody, JsonFetch, UpdateChannel};
use update::{channel_if, resolve, resolved_channel};

/// Strategy for multiplexing between cache and transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Honor `Cache-Control` semantics (the default).
    #[default]
    CacheControl,
    /// Fetch first; fall back to the cache on failure.
    FetchFirst,
    /// Race the cache read against the fetch.
    Race,
}

/// Pluggable equality over decoded JSON values, used by the race strategy
/// to decide whether the fetched body is an update.
pub type EqualFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Caching request options.
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// Cache key; an empty key bypasses the coordinator.
    pub key: String,
    /// Table, defaulting to `"Cached"`.
    pub table: Option<String>,
    /// Multiplexing strategy.
    pub mode: CacheMode,
    /// Directives assumed when the response carries none.
    pub default_cache_control: Option<CacheControl>,
    /// Directives overriding whatever the response carries.
    pub forced_cache_control: Option<CacheControl>,
    /// Restriction to specific provider ids, tried in the given order.
    pub active_cache: Option<Vec<String>>,
    /// Request a second, eventually-resolved result (valid with
    /// `CacheControl` and `Race`).
    pub update: bool,
    /// Custom JSON equality for the race strategy.
    pub equal: Option<EqualFn>,
    /// Bound on the cache lookup itself.
    pub cache_timeout: Option<Duration>,
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("key", &self.key)
            .field("table", &self.table)
            .field("mode", &self.mode)
            .field("update", &self.update)
            .field("active_cache", &self.active_cache)
            .field("cache_timeout", &self.cache_timeout)
            .finish_non_exhaustive()
    }
}

impl CacheOptions {
    /// Options for `key` with every other field at its default.
    pub fn new(key: impl Into<String>) -> Self {
        CacheOptions {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Store under a specific table instead of `"Cached"`.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Select the multiplexing strategy.
    pub fn mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Directives assumed when the response carries none.
    pub fn default_cache_control(mut self, record: CacheControl) -> Self {
        self.default_cache_control = Some(record);
        self
    }

    /// Directives overriding whatever the response carries.
    pub fn forced_cache_control(mut self, record: CacheControl) -> Self {
        self.forced_cache_control = Some(record);
        self
    }

    /// Restrict lookups to specific providers.
    pub fn active_cache(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.active_cache = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Ask for the update channel.
    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    /// Custom JSON equality for the race strategy.
    pub fn equal(mut self, equal: EqualFn) -> Self {
        self.equal = Some(equal);
        self
    }

    /// Bound the cache lookup.
    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = Some(timeout);
        self
    }

    /// True when these options disable the coordinator entirely.
    pub(crate) fn bypasses_cache(&self) -> bool {
        if self.key.is_empty() {
            return true;
        }
        match &self.forced_cache_control {
            Some(forced) => {
                forced.no_store == Some(true) || forced.max_age == Some(Directive::Flag(false))
            }
            None => false,
        }
    }
}

/// The pipeline plus everything needed to run it from a background task.
#[derive(Clone)]
pub(crate) struct PipelineFetcher {
    pub pipeline: Arc<ResiliencePipeline>,
    pub transport: Arc<dyn Transport>,
    pub signal: AbortHandle,
    pub external: Option<AbortHandle>,
    pub skip_fail_on_error_code: bool,
    pub validate_content_type: bool,
}

impl PipelineFetcher {
    /// Run the resilience pipeline and validate the result as JSON.
    pub async fn fetch_raw(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, FetchError> {
        let endpoint = request.url.clone();
        let response = self
            .pipeline
            .execute(
                &*self.transport,
                request,
                &self.signal,
                self.external.as_ref(),
                self.skip_fail_on_error_code,
            )
            .await?;

        if self.validate_content_type
            && response.status != StatusCode::NOT_MODIFIED
            && !response.body.is_empty()
        {
            let content_type = response.content_type().unwrap_or_default();
            if !is_json_content_type(content_type) {
                return Err(FetchError::ContentType {
                    endpoint,
                    content_type: content_type.to_owned(),
                });
            }
        }
        Ok(response)
    }

    /// Same fetcher driven by a dedicated abort handle (used for the race
    /// fetch, which may outlive or be cancelled independently of the
    /// request that started it).
    fn with_signal(&self, signal: AbortHandle) -> Self {
        PipelineFetcher {
            signal,
            external: None,
            ..self.clone()
        }
    }
}

fn is_json_content_type(value: &str) -> bool {
    let mime = value.split(';').next().unwrap_or_default().trim();
    mime.eq_ignore_ascii_case("application/json")
        || mime.to_ascii_lowercase().ends_with("+json")
}

/// Chooses a backend, evaluates freshness and runs one of the strategies.
pub(crate) struct CacheCoordinator {
    registry: Arc<ProviderRegistry>,
    offload: OffloadManager,
}

impl CacheCoordinator {
    pub fn new(registry: Arc<ProviderRegistry>, offload: OffloadManager) -> Self {
        CacheCoordinator { registry, offload }
    }

    /// Run a JSON request through the configured strategy.
    ///
    /// Returns the raw response plus the optional update receiver; the
    /// caller decodes.
    pub async fn execute(
        &self,
        fetcher: PipelineFetcher,
        request: TransportRequest,
        options: CacheOptions,
    ) -> Result<(TransportResponse, Option<UpdateReceiver>), FetchError> {
        let table = options
            .table
            .clone()
            .unwrap_or_else(|| DEFAULT_TABLE.to_owned());
        let Some(backend) = self
            .registry
            .backend_for(options.active_cache.as_deref(), &table)
            .await
        else {
            debug!("no available cache provider; bypassing cache");
            let response = fetcher.fetch_raw(request).await?;
            return Ok((response, None));
        };
        let key = CacheKey::new(table, options.key.clone());

        match options.mode {
            CacheMode::CacheControl => {
                self.cache_control(fetcher, request, options, backend, key)
                    .await
            }
            CacheMode::FetchFirst => {
                self.fetch_first(fetcher, request, options, backend, key)
                    .await
            }
            CacheMode::Race => self.race(fetcher, request, options, backend, key).await,
        }
    }

    async fn cache_control(
        &self,
        fetcher: PipelineFetcher,
        request: TransportRequest,
        options: CacheOptions,
        backend: Arc<dyn CacheBackend>,
        key: CacheKey,
    ) -> Result<(TransportResponse, Option<UpdateReceiver>), FetchError> {
        let (tx, rx) = channel_if(options.update);

        let Some(entry) = lookup(&backend, &key, options.cache_timeout).await else {
            let response = fetcher.fetch_raw(request).await?;
            self.write_through(&backend, &key, &response, &options);
            resolve(tx, Err(FetchError::NoUpdate(NoUpdateReason::CacheDisabled)));
            return Ok((response, rx));
        };

        let effective = effective_record(&options, &entry.cache_control);
        match effective.state(entry.updated, Utc::now()) {
            CacheState::Disabled => {
                let response = fetcher.fetch_raw(request).await?;
                self.write_through(&backend, &key, &response, &options);
                resolve(tx, Err(FetchError::NoUpdate(NoUpdateReason::CacheDisabled)));
                Ok((response, rx))
            }
            CacheState::Fresh => {
                debug!(%key, "cache hit (fresh)");
                resolve(tx, Err(FetchError::NoUpdate(NoUpdateReason::FreshCache)));
                Ok((cached_response(&entry), rx))
            }
            CacheState::Stale {
                stale_while_revalidate,
                stale_if_error,
                ..
            } => {
                // The evaluator has already folded must-revalidate into
                // these flags where it forbids serving stale.
                let conditional = conditional_request(&request, &entry);

                if stale_while_revalidate {
                    debug!(%key, "cache hit (stale); revalidating in background");
                    self.spawn_revalidation(
                        fetcher, conditional, backend, key, entry.clone(), &options, tx,
                    );
                    return Ok((cached_response(&entry), rx));
                }

                match fetcher.fetch_raw(conditional).await {
                    Ok(response) if response.status == StatusCode::NOT_MODIFIED => {
                        debug!(%key, "revalidation answered 304");
                        self.touch_entry(&backend, entry.clone(), &response);
                        resolve(tx, Err(FetchError::NoUpdate(NoUpdateReason::Unchanged)));
                        Ok((cached_response(&entry), rx))
                    }
                    Ok(response) => {
                        self.write_through(&backend, &key, &response, &options);
                        resolve(tx, Err(FetchError::NoUpdate(NoUpdateReason::FreshCache)));
                        Ok((response, rx))
                    }
                    Err(error) if stale_if_error && error.allows_stale_if_error() => {
                        debug!(%key, %error, "revalidation failed; serving stale");
                        resolve(tx, Err(error));
                        Ok((cached_response(&entry), rx))
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    async fn fetch_first(
        &self,
        fetcher: PipelineFetcher,
        request: TransportRequest,
        options: CacheOptions,
        backend: Arc<dyn CacheBackend>,
        key: CacheKey,
    ) -> Result<(TransportResponse, Option<UpdateReceiver>), FetchError> {
        match fetcher.fetch_raw(request).await {
            Ok(response) => {
                self.write_through(&backend, &key, &response, &options);
                Ok((response, None))
            }
            Err(error) => {
                let Some(entry) = lookup(&backend, &key, options.cache_timeout).await else {
                    return Err(error);
                };
                let effective = effective_record(&options, &entry.cache_control);
                match effective.state(entry.updated, Utc::now()) {
                    CacheState::Fresh => {
                        debug!(%key, "fetch failed; serving fresh cache");
                        Ok((cached_response(&entry), None))
                    }
                    CacheState::Stale {
                        stale_if_error: true,
                        ..
                    } => {
                        debug!(%key, %error, "fetch failed; serving stale-if-error cache");
                        Ok((cached_response(&entry), None))
                    }
                    _ => Err(error),
                }
            }
        }
    }

    async fn race(
        &self,
        fetcher: PipelineFetcher,
        request: TransportRequest,
        options: CacheOptions,
        backend: Arc<dyn CacheBackend>,
        key: CacheKey,
    ) -> Result<(TransportResponse, Option<UpdateReceiver>), FetchError> {
        // The fetch runs as its own task so that it can keep going (and
        // write through) after the cache has already answered the caller.
        let race_abort = AbortHandle::new();
        let (fetch_tx, mut fetch_rx) =
            oneshot::channel::<Result<TransportResponse, FetchError>>();
        {
            let fetcher = fetcher.with_signal(race_abort.clone());
            let backend = backend.clone();
            let key = key.clone();
            let default_cc = options.default_cache_control.clone();
            let forced_cc = options.forced_cache_control.clone();
            self.offload.spawn("race-fetch", async move {
                let result = fetcher.fetch_raw(request).await;
                if let Ok(response) = &result {
                    if let Some(entry) = storable_entry(&key, response, &default_cc, &forced_cc) {
                        if let Err(error) = backend.set(entry).await {
                            warn!(%key, %error, "cache write-through failed");
                        }
                    }
                }
                let _ = fetch_tx.send(result);
            });
        }

        let lookup_fut = lookup(&backend, &key, options.cache_timeout);
        tokio::pin!(lookup_fut);

        enum First {
            Cache(Option<CachedEntry>),
            Fetch(Result<Result<TransportResponse, FetchError>, oneshot::error::RecvError>),
        }

        let first = tokio::select! {
            cached = &mut lookup_fut => First::Cache(cached),
            fetched = &mut fetch_rx => First::Fetch(fetched),
        };

        match first {
            First::Cache(Some(entry)) => {
                let effective = effective_record(&options, &entry.cache_control);
                let state = effective.state(entry.updated, Utc::now());
                let (swr, sie) = match state {
                    CacheState::Stale {
                        stale_while_revalidate,
                        stale_if_error,
                        ..
                    } => (stale_while_revalidate, stale_if_error),
                    _ => (false, false),
                };

                if state.is_fresh() || swr || sie {
                    debug!(%key, "race: cache answered first and is serveable");
                    if !options.update {
                        // A completed fetch would add nothing; the one
                        // exception is stale-while-revalidate, whose whole
                        // point is the refresh.
                        if !swr {
                            race_abort.abort(None);
                        }
                        return Ok((cached_response(&entry), None));
                    }
                    let immediate = cached_response(&entry);
                    let (tx, rx) = oneshot::channel();
                    let equal = options.equal.clone();
                    self.offload.spawn("race-compare", async move {
                        let outcome = match fetch_rx.await {
                            Ok(Ok(response)) => {
                                if fetched_equals_cached(&entry, &response, equal.as_ref()) {
                                    Err(FetchError::NoUpdate(NoUpdateReason::Equal))
                                } else {
                                    Ok(response)
                                }
                            }
                            Ok(Err(error)) => Err(error),
                            Err(_) => Err(FetchError::Aborted(None)),
                        };
                        let _ = tx.send(outcome);
                    });
                    return Ok((immediate, Some(rx)));
                }

                // Stale without a relaxation (or disabled): take the fetch.
                match fetch_rx.await {
                    Ok(Ok(response)) => {
                        let rx = options
                            .update
                            .then(|| resolved_channel(Err(FetchError::NoUpdate(NoUpdateReason::NoCached))));
                        Ok((response, rx))
                    }
                    Ok(Err(error)) => {
                        if matches!(state, CacheState::Disabled) {
                            return Err(error);
                        }
                        // The stale entry is still better than nothing.
                        debug!(%key, %error, "race: fetch failed; serving stale cache");
                        let rx = options.update.then(|| resolved_channel(Err(error)));
                        Ok((cached_response(&entry), rx))
                    }
                    Err(_) => Err(FetchError::Aborted(None)),
                }
            }
            First::Cache(None) => match fetch_rx.await {
                Ok(Ok(response)) => {
                    let rx = options
                        .update
                        .then(|| resolved_channel(Err(FetchError::NoUpdate(NoUpdateReason::NoCached))));
                    Ok((response, rx))
                }
                Ok(Err(error)) => Err(error),
                Err(_) => Err(FetchError::Aborted(None)),
            },
            First::Fetch(Ok(Ok(response))) => {
                let rx = options
                    .update
                    .then(|| resolved_channel(Err(FetchError::NoUpdate(NoUpdateReason::NoCached))));
                Ok((response, rx))
            }
            First::Fetch(Ok(Err(error))) => {
                // Fetch failed first: the cache may still save the call.
                match lookup_fut.await {
                    Some(entry) => {
                        let effective = effective_record(&options, &entry.cache_control);
                        if matches!(
                            effective.state(entry.updated, Utc::now()),
                            CacheState::Disabled
                        ) {
                            return Err(error);
                        }
                        debug!(%key, %error, "race: fetch failed; serving cache");
                        let rx = options.update.then(|| resolved_channel(Err(error)));
                        Ok((cached_response(&entry), rx))
                    }
                    None => Err(error),
                }
            }
            First::Fetch(Err(_)) => Err(FetchError::Aborted(None)),
        }
    }

    /// Background revalidation for stale-while-revalidate.
    ///
    /// Deduplicated per cache key unless the caller asked for the update
    /// channel, which must always resolve from its own revalidation.
    #[allow(clippy::too_many_arguments)]
    fn spawn_revalidation(
        &self,
        fetcher: PipelineFetcher,
        conditional: TransportRequest,
        backend: Arc<dyn CacheBackend>,
        key: CacheKey,
        entry: CachedEntry,
        options: &CacheOptions,
        tx: Option<update::UpdateSender>,
    ) {
        let default_cc = options.default_cache_control.clone();
        let forced_cc = options.forced_cache_control.clone();
        let task_key = key.clone();
        let task = async move {
            let outcome = match fetcher.fetch_raw(conditional).await {
                Ok(response) if response.status == StatusCode::NOT_MODIFIED => {
                    touch(&backend, entry, &response).await;
                    Err(FetchError::NoUpdate(NoUpdateReason::Unchanged))
                }
                Ok(response) => {
                    if let Some(entry) =
                        storable_entry(&task_key, &response, &default_cc, &forced_cc)
                    {
                        if let Err(error) = backend.set(entry).await {
                            warn!(%task_key, %error, "cache write-through failed");
                        }
                    }
                    Ok(response)
                }
                Err(error) => Err(error),
            };
            resolve(tx, outcome);
        };

        if options.update {
            self.offload.spawn("revalidate", task);
        } else {
            self.offload.spawn_keyed(format!("revalidate:{key}"), task);
        }
    }

    /// Fire-and-forget write-through after a successful fetch.
    fn write_through(
        &self,
        backend: &Arc<dyn CacheBackend>,
        key: &CacheKey,
        response: &TransportResponse,
        options: &CacheOptions,
    ) {
        if !response.ok() || response.status == StatusCode::NOT_MODIFIED {
            return;
        }
        let Some(entry) = storable_entry(
            key,
            response,
            &options.default_cache_control,
            &options.forced_cache_control,
        ) else {
            debug!(%key, "response is not storable; skipping write-through");
            return;
        };
        let backend = backend.clone();
        let key = key.clone();
        self.offload.spawn("write-through", async move {
            if let Err(error) = backend.set(entry).await {
                warn!(%key, %error, "cache write-through failed");
            }
        });
    }

    /// Refresh a retained entry after a 304: bump `updated` and adopt any
    /// directives the 304 carried.
    fn touch_entry(
        &self,
        backend: &Arc<dyn CacheBackend>,
        entry: CachedEntry,
        response: &TransportResponse,
    ) {
        let backend = backend.clone();
        let response = response.clone();
        self.offload.spawn("touch", async move {
            touch(&backend, entry, &response).await;
        });
    }
}

async fn touch(
    backend: &Arc<dyn CacheBackend>,
    mut entry: CachedEntry,
    response: &TransportResponse,
) {
    entry.updated = Utc::now();
    let refreshed = CacheControl::from_headers(&response.headers, Utc::now());
    if !refreshed.is_empty() {
        entry.cache_control = refreshed;
    }
    let key = entry.key.clone();
    if let Err(error) = backend.set(entry).await {
        warn!(%key, %error, "failed to refresh cache entry after 304");
    }
}

/// Bounded, failure-tolerant cache lookup; anything that goes wrong is a
/// miss.
async fn lookup(
    backend: &Arc<dyn CacheBackend>,
    key: &CacheKey,
    timeout: Option<Duration>,
) -> Option<CachedEntry> {
    let get = backend.get(key);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, get).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%key, "cache lookup timed out");
                return None;
            }
        },
        None => get.await,
    };
    match result {
        Ok(entry) => entry,
        Err(error) => {
            warn!(%key, %error, "cache lookup failed; treating as miss");
            None
        }
    }
}

/// `defaults ← response-derived ← forced`, later wins.
fn effective_record(options: &CacheOptions, response_derived: &CacheControl) -> CacheControl {
    let mut record = options.default_cache_control.clone().unwrap_or_default();
    record = record.merge(response_derived);
    if let Some(forced) = &options.forced_cache_control {
        record = record.merge(forced);
    }
    record
}

/// A cached entry presented as a response.
fn cached_response(entry: &CachedEntry) -> TransportResponse {
    TransportResponse {
        status: StatusCode::OK,
        headers: entry.headers.clone(),
        body: entry.value.clone(),
    }
}

/// Inject `If-None-Match` / `If-Modified-Since` from the entry's
/// validators; without validators the request goes out unconditional.
fn conditional_request(request: &TransportRequest, entry: &CachedEntry) -> TransportRequest {
    let mut request = request.clone();
    if let Some(etag) = entry.etag() {
        if let Ok(value) = HeaderValue::from_str(etag) {
            request.headers.insert(IF_NONE_MATCH, value);
        }
    } else if let Some(last_modified) = entry.last_modified() {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            request.headers.insert(IF_MODIFIED_SINCE, value);
        }
    }
    request
}

/// Build the entry to store for a response, or `None` when the effective
/// directives forbid storing it.
fn storable_entry(
    key: &CacheKey,
    response: &TransportResponse,
    default_cc: &Option<CacheControl>,
    forced_cc: &Option<CacheControl>,
) -> Option<CachedEntry> {
    let response_record = CacheControl::from_headers(&response.headers, Utc::now());
    let mut effective = default_cc.clone().unwrap_or_default();
    effective = effective.merge(&response_record);
    if let Some(forced) = forced_cc {
        effective = effective.merge(forced);
    }

    if effective.no_store == Some(true) {
        return None;
    }
    if effective.max_age.is_some_and(|d| d.is_zero()) && !has_revalidation_hint(response, &effective)
    {
        return None;
    }
    Some(CachedEntry::new(
        key.clone(),
        response.body.clone(),
        response.headers.clone(),
        response_record,
    ))
}

fn has_revalidation_hint(response: &TransportResponse, effective: &CacheControl) -> bool {
    response.headers.contains_key(http::header::ETAG)
        || response.headers.contains_key(http::header::LAST_MODIFIED)
        || effective
            .stale_while_revalidate
            .is_some_and(|d| !d.is_zero())
        || effective.stale_if_error.is_some_and(|d| !d.is_zero())
}

/// Equality for the race strategy: `ETag`, else `Last-Modified`, else deep
/// structural equality over the decoded JSON values.
fn fetched_equals_cached(
    entry: &CachedEntry,
    response: &TransportResponse,
    equal: Option<&EqualFn>,
) -> bool {
    let response_etag = response
        .headers
        .get(http::header::ETAG)
        .and_then(|v| v.to_str().ok());
    if let (Some(cached), Some(fetched)) = (entry.etag(), response_etag) {
        return cached == fetched;
    }

    let response_last_modified = response
        .headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok());
    if let (Some(cached), Some(fetched)) = (entry.last_modified(), response_last_modified) {
        return cached == fetched;
    }

    let (Ok(cached), Ok(fetched)) = (
        serde_json::from_slice::<Value>(&entry.value),
        serde_json::from_slice::<Value>(&response.body),
    ) else {
        return false;
    };
    match equal {
        Some(equal) => equal(&cached, &fetched),
        None => cached == fetched,
    }
}
