//! Integration tests for the caching coordinator against a wiremock
//! server, through the real reqwest transport.

use std::time::{Duration, Instant};

use kedge::{
    CacheMode, CacheOptions, FetchError, HttpClient, JsonOptions, NoUpdateReason,
};
use kedge_backend::MemoryProvider;
use kedge_moka::MokaProvider;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cached_client(server: &MockServer) -> HttpClient {
    HttpClient::builder()
        .base_url(server.uri())
        .provider(MemoryProvider::default())
        .unwrap()
        .build()
}

fn json_body(value: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(value.to_string(), "application/json")
}

/// Write-through is fire-and-forget; give it a moment to land.
async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn fresh_hit_skips_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"message": "hello"})).insert_header("cache-control", "max-age=60"))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("data"));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(first.value["message"], "hello");
    quiesce().await;

    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(second.value["message"], "hello");
}

#[tokio::test]
async fn fresh_hit_with_update_signals_fresh_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"v": 1})).insert_header("cache-control", "max-age=60"))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);

    let first = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new().use_cache(CacheOptions::new("data").update(true)),
        )
        .await
        .unwrap();
    // A miss resolves the channel with CacheDisabled.
    let update = first.update.unwrap().recv().await.unwrap_err();
    assert!(matches!(
        update,
        FetchError::NoUpdate(NoUpdateReason::CacheDisabled)
    ));
    quiesce().await;

    let second = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new().use_cache(CacheOptions::new("data").update(true)),
        )
        .await
        .unwrap();
    let update = second.update.unwrap().recv().await.unwrap_err();
    assert!(matches!(
        update,
        FetchError::NoUpdate(NoUpdateReason::FreshCache)
    ));
}

#[tokio::test]
async fn no_store_responses_are_never_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"version": 1})).insert_header("cache-control", "no-store"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"version": 2})).insert_header("cache-control", "no-store"))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("data"));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    quiesce().await;
    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();

    // Two consecutive fetches see two different server bodies.
    assert_eq!(first.value["version"], 1);
    assert_eq!(second.value["version"], 2);
}

#[tokio::test]
async fn stale_entries_revalidate_with_conditional_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            json_body(json!({"doc": "original"}))
                .insert_header("cache-control", "max-age=0")
                .insert_header("etag", "\"v1\""),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);

    let first = client
        .fetch_json::<Value>("/data", JsonOptions::new().use_cache(CacheOptions::new("data")))
        .await
        .unwrap();
    assert_eq!(first.value["doc"], "original");
    quiesce().await;

    // max-age=0 makes the entry stale; the 304 retains the cached value.
    let second = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new().use_cache(CacheOptions::new("data").update(true)),
        )
        .await
        .unwrap();
    assert_eq!(second.value["doc"], "original");
    let update = second.update.unwrap().recv().await.unwrap_err();
    assert!(matches!(
        update,
        FetchError::NoUpdate(NoUpdateReason::Unchanged)
    ));
}

#[tokio::test]
async fn stale_while_revalidate_serves_stale_and_refreshes_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            json_body(json!({"items": ["old"]}))
                .insert_header("cache-control", "max-age=0, stale-while-revalidate=60"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(json_body(json!({"items": ["new"]})).insert_header("cache-control", "max-age=60"))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("feed"));

    let first = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(first.value["items"][0], "old");
    quiesce().await;

    // Stale is served immediately; the revalidation runs behind it.
    let second = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(second.value["items"][0], "old");
    quiesce().await;

    // The background refresh has been written through by now.
    let third = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(third.value["items"][0], "new");
}

#[tokio::test]
async fn must_revalidate_does_not_suppress_stale_while_revalidate() {
    let server = MockServer::start().await;
    // must-revalidate together with a stale-while-revalidate window: once
    // the 1s max-age has elapsed the entry is stale but still inside the
    // window, and must be served immediately. (max-age=0 would instead be
    // folded into no-cache by the evaluator, which has no relaxations.)
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            json_body(json!({"rev": "old"}))
                .insert_header("cache-control", "max-age=1, must-revalidate, stale-while-revalidate=60"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            json_body(json!({"rev": "new"}))
                .insert_header("cache-control", "max-age=60")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("feed"));

    let first = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(first.value["rev"], "old");

    // Let the entry age past max-age into the stale window.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let started = Instant::now();
    let second = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(second.value["rev"], "old");
    // Served without waiting on the 200ms revalidation.
    assert!(started.elapsed() < Duration::from_millis(150));

    // The background refresh lands afterwards.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = client.fetch_json::<Value>("/feed", options()).await.unwrap();
    assert_eq!(third.value["rev"], "new");
}

#[tokio::test]
async fn must_revalidate_does_not_suppress_stale_if_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            json_body(json!({"cached": true}))
                .insert_header("cache-control", "max-age=1, must-revalidate, stale-if-error=60"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("data"));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(first.value["cached"], true);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The synchronous revalidation fails with a 503; stale-if-error still
    // applies despite must-revalidate.
    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(second.value["cached"], true);
}

#[tokio::test]
async fn stale_if_error_serves_stale_on_upstream_5xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            json_body(json!({"cached": true}))
                .insert_header("cache-control", "max-age=0, stale-if-error=60"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || JsonOptions::new().use_cache(CacheOptions::new("data"));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(first.value["cached"], true);
    quiesce().await;

    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(second.value["cached"], true);
}

#[tokio::test]
async fn fetch_first_falls_back_to_the_cache_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"from": "server"})).insert_header("cache-control", "max-age=60"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options =
        || JsonOptions::new().use_cache(CacheOptions::new("data").mode(CacheMode::FetchFirst));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(first.value["from"], "server");
    quiesce().await;

    // The second fetch fails with 500; the fresh cached entry answers.
    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(second.value["from"], "server");
}

#[tokio::test]
async fn race_returns_stale_cache_before_the_slow_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"result": "stale"})).insert_header("cache-control", "max-age=60"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            json_body(json!({"result": "fresh"}))
                .insert_header("cache-control", "max-age=60")
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let client = cached_client(&server);

    // Seed the cache.
    let seeded = client
        .fetch_json::<Value>("/data", JsonOptions::new().use_cache(CacheOptions::new("data")))
        .await
        .unwrap();
    assert_eq!(seeded.value["result"], "stale");
    quiesce().await;

    let started = Instant::now();
    let raced = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new().use_cache(CacheOptions::new("data").mode(CacheMode::Race)),
        )
        .await
        .unwrap();
    assert_eq!(raced.value["result"], "stale");
    assert!(started.elapsed() < Duration::from_millis(100));

    // A subsequent non-cached fetch observes the fresh value.
    let direct = client
        .fetch_json::<Value>("/data", JsonOptions::new())
        .await
        .unwrap();
    assert_eq!(direct.value["result"], "fresh");
}

#[tokio::test]
async fn race_with_update_delivers_the_fresh_value_later() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"result": "stale"})).insert_header("cache-control", "max-age=60"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            json_body(json!({"result": "fresh"}))
                .insert_header("cache-control", "max-age=60")
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let client = cached_client(&server);
    client
        .fetch_json::<Value>("/data", JsonOptions::new().use_cache(CacheOptions::new("data")))
        .await
        .unwrap();
    quiesce().await;

    let raced = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new()
                .use_cache(CacheOptions::new("data").mode(CacheMode::Race).update(true)),
        )
        .await
        .unwrap();
    assert_eq!(raced.value["result"], "stale");

    let update = raced.update.unwrap().recv().await.unwrap();
    assert_eq!(update.value["result"], "fresh");
}

#[tokio::test]
async fn race_with_equal_bodies_signals_no_update_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"stable": 42})).insert_header("cache-control", "max-age=60"))
        .mount(&server)
        .await;

    let client = cached_client(&server);
    client
        .fetch_json::<Value>("/data", JsonOptions::new().use_cache(CacheOptions::new("data")))
        .await
        .unwrap();
    quiesce().await;

    let raced = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new()
                .use_cache(CacheOptions::new("data").mode(CacheMode::Race).update(true)),
        )
        .await
        .unwrap();
    assert_eq!(raced.value["stable"], 42);

    let update = raced.update.unwrap().recv().await.unwrap_err();
    assert!(matches!(update, FetchError::NoUpdate(NoUpdateReason::Equal)));
}

#[tokio::test]
async fn race_miss_takes_the_fetch_and_signals_no_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"first": true})).insert_header("cache-control", "max-age=60"))
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let raced = client
        .fetch_json::<Value>(
            "/data",
            JsonOptions::new()
                .use_cache(CacheOptions::new("data").mode(CacheMode::Race).update(true)),
        )
        .await
        .unwrap();
    assert_eq!(raced.value["first"], true);

    let update = raced.update.unwrap().recv().await.unwrap_err();
    assert!(matches!(
        update,
        FetchError::NoUpdate(NoUpdateReason::NoCached)
    ));
}

#[tokio::test]
async fn unknown_active_cache_bypasses_caching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"n": 1})).insert_header("cache-control", "max-age=60"))
        .expect(2)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let options = || {
        JsonOptions::new()
            .use_cache(CacheOptions::new("data").active_cache(["no-such-provider"]))
    };

    client.fetch_json::<Value>("/data", options()).await.unwrap();
    quiesce().await;
    // Without an available provider every fetch goes upstream.
    client.fetch_json::<Value>("/data", options()).await.unwrap();
}

#[tokio::test]
async fn moka_provider_serves_fresh_hits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(json_body(json!({"tier": "lru"})).insert_header("cache-control", "max-age=60"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpClient::builder()
        .base_url(server.uri())
        .provider(MokaProvider::new("lru", 128))
        .unwrap()
        .build();
    let options =
        || JsonOptions::new().use_cache(CacheOptions::new("data").active_cache(["lru"]));

    let first = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(first.value["tier"], "lru");
    quiesce().await;
    let second = client.fetch_json::<Value>("/data", options()).await.unwrap();
    assert_eq!(second.value["tier"], "lru");
}

#[tokio::test]
async fn non_json_content_type_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let error = client
        .fetch_json::<Value>("/page", JsonOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error, FetchError::ContentType { .. }));
}

#[tokio::test]
async fn accept_header_is_injected_for_json_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("accept", "application/json"))
        .respond_with(json_body(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = cached_client(&server);
    let response = client
        .fetch_json::<Value>("/data", JsonOptions::new())
        .await
        .unwrap();
    assert_eq!(response.value["ok"], true);
}
