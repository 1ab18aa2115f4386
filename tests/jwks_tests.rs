//! JWKS discovery, caching, and fetch-guard behaviour against a local
//! key-directory origin.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use botauth_gateway::config::DEFAULT_DISCOVERY_PATHS;
use botauth_gateway::jwks::cache::JwksCache;
use botauth_gateway::jwks::fetch::{FetchConfig, FetchError, JwksFetcher};

use common::jwks_json;

struct Directory {
    base: String,
    well_known_hits: Arc<AtomicUsize>,
    direct_hits: Arc<AtomicUsize>,
}

/// Spawn a key directory serving:
/// - `/.well-known/jwks.json` — valid JWKS (second discovery probe)
/// - `/jwks/agent.json` — valid JWKS with `ETag: "v1"` and `max-age=0`
/// - `/huge.json` — an oversized body
async fn spawn_directory() -> Directory {
    let well_known_hits = Arc::new(AtomicUsize::new(0));
    let direct_hits = Arc::new(AtomicUsize::new(0));

    let wk = Arc::clone(&well_known_hits);
    let direct = Arc::clone(&direct_hits);

    let app = Router::new()
        .route(
            "/.well-known/jwks.json",
            get(move || {
                let wk = Arc::clone(&wk);
                async move {
                    wk.fetch_add(1, Ordering::SeqCst);
                    Response::builder()
                        .header("content-type", "application/json")
                        .body(Body::from(jwks_json()))
                        .unwrap()
                }
            }),
        )
        .route(
            "/jwks/agent.json",
            get(move |headers: HeaderMap| {
                let direct = Arc::clone(&direct);
                async move {
                    direct.fetch_add(1, Ordering::SeqCst);
                    let revalidated = headers
                        .get("if-none-match")
                        .is_some_and(|v| v.as_bytes() == b"\"v1\"");
                    if revalidated {
                        Response::builder()
                            .status(StatusCode::NOT_MODIFIED)
                            .header("etag", "\"v1\"")
                            .body(Body::empty())
                            .unwrap()
                    } else {
                        Response::builder()
                            .header("content-type", "application/json")
                            .header("etag", "\"v1\"")
                            .header("cache-control", "max-age=0")
                            .body(Body::from(jwks_json()))
                            .unwrap()
                    }
                }
            }),
        )
        .route(
            "/huge.json",
            get(|| async {
                Response::builder()
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b'x'; 64 * 1024]))
                    .unwrap()
            }),
        )
        .fallback(|| async { StatusCode::NOT_FOUND });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Directory {
        base,
        well_known_hits,
        direct_hits,
    }
}

fn insecure_config(max_bytes: usize) -> FetchConfig {
    FetchConfig {
        timeout: Duration::from_secs(3),
        max_bytes,
        allow_insecure: true,
        trusted_directories: Vec::new(),
        discovery_paths: DEFAULT_DISCOVERY_PATHS
            .iter()
            .map(ToString::to_string)
            .collect(),
    }
}

fn insecure_cache(max_bytes: usize) -> JwksCache {
    JwksCache::new(JwksFetcher::new(insecure_config(max_bytes)), Duration::from_secs(3600))
}

// ── E3: identity URL discovery ─────────────────────────────────────────

#[tokio::test]
async fn identity_url_discovers_the_second_well_known_path() {
    // GIVEN: a directory origin where the first probe path 404s
    let directory = spawn_directory().await;
    let cache = insecure_cache(1_048_576);
    let cancel = CancellationToken::new();

    // WHEN: an identity URL (no JWKS-looking path) is resolved
    let url = cache.resolve(&directory.base, &cancel).await.unwrap();

    // THEN: the /.well-known/jwks.json probe won and its document is cached
    assert_eq!(url.as_str(), format!("{}/.well-known/jwks.json", directory.base));
    assert_eq!(directory.well_known_hits.load(Ordering::SeqCst), 1);

    let document = cache.get(&url, &cancel).await.unwrap();
    assert!(document.find_key("K1").is_some());
    // The discovery fetch populated the cache; get() was a hit
    assert_eq!(directory.well_known_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolving_twice_reuses_the_discovered_document() {
    let directory = spawn_directory().await;
    let cache = insecure_cache(1_048_576);
    let cancel = CancellationToken::new();

    let first = cache.resolve(&directory.base, &cancel).await.unwrap();
    let second = cache.resolve(&directory.base, &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(directory.well_known_hits.load(Ordering::SeqCst), 1);
}

// ── Cache idempotency (two verifications, one fetch) ───────────────────

#[tokio::test]
async fn consecutive_gets_within_ttl_fetch_once() {
    let directory = spawn_directory().await;
    let cache = insecure_cache(1_048_576);
    let cancel = CancellationToken::new();
    let url = cache
        .resolve(&format!("{}/.well-known/jwks.json", directory.base), &cancel)
        .await
        .unwrap();

    cache.get(&url, &cancel).await.unwrap();
    cache.get(&url, &cancel).await.unwrap();

    assert_eq!(directory.well_known_hits.load(Ordering::SeqCst), 1);
}

// ── ETag refresh ───────────────────────────────────────────────────────

#[tokio::test]
async fn expired_entry_revalidates_with_if_none_match() {
    // GIVEN: a document served with max-age=0 and an ETag
    let directory = spawn_directory().await;
    let cache = insecure_cache(1_048_576);
    let cancel = CancellationToken::new();
    let url = cache
        .resolve(&format!("{}/jwks/agent.json", directory.base), &cancel)
        .await
        .unwrap();

    // First get: unconditional 200
    cache.get(&url, &cancel).await.unwrap();
    assert_eq!(directory.direct_hits.load(Ordering::SeqCst), 1);

    // The zero max-age expired the entry immediately; the next get sends
    // If-None-Match and the 304 extends the entry by the default TTL
    cache.get(&url, &cancel).await.unwrap();
    assert_eq!(directory.direct_hits.load(Ordering::SeqCst), 2);

    // Extended entry: no further fetch
    cache.get(&url, &cancel).await.unwrap();
    assert_eq!(directory.direct_hits.load(Ordering::SeqCst), 2);
}

// ── Body cap and document validation ───────────────────────────────────

#[tokio::test]
async fn oversized_body_is_rejected() {
    let directory = spawn_directory().await;
    let cache = insecure_cache(1024);
    let cancel = CancellationToken::new();
    let url = cache
        .resolve(&format!("{}/huge.json", directory.base), &cancel)
        .await
        .unwrap();

    let err = cache.get(&url, &cancel).await.unwrap_err();
    assert!(matches!(err, FetchError::TooLarge(1024)), "got {err:?}");
}

#[tokio::test]
async fn discovery_fails_cleanly_when_no_probe_matches() {
    // An origin serving nothing JWKS-shaped
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let app = Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        axum::serve(listener, app).await.unwrap();
    });

    let cache = insecure_cache(1_048_576);
    let err = cache
        .resolve(&base, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Discovery(_)), "got {err:?}");
}

// ── SSRF guard ─────────────────────────────────────────────────────────

#[tokio::test]
async fn loopback_literal_is_refused_before_any_connection() {
    let fetcher = JwksFetcher::new(FetchConfig {
        allow_insecure: false,
        ..insecure_config(1_048_576)
    });
    let cancel = CancellationToken::new();

    let url = url::Url::parse("https://127.0.0.1/jwks.json").unwrap();
    let err = fetcher.fetch(&url, None, &cancel).await.unwrap_err();
    assert!(matches!(err, FetchError::Fetch(_)), "got {err:?}");
}

#[tokio::test]
async fn hostname_resolving_to_loopback_is_screened_at_dns_time() {
    let fetcher = JwksFetcher::new(FetchConfig {
        allow_insecure: false,
        ..insecure_config(1_048_576)
    });
    let cancel = CancellationToken::new();

    // localhost resolves to 127.0.0.1/::1; the resolved-address screen
    // must refuse it even though the name itself is not a literal
    let url = url::Url::parse("https://localhost/jwks.json").unwrap();
    let err = fetcher.fetch(&url, None, &cancel).await.unwrap_err();
    let FetchError::Fetch(message) = err else {
        panic!("expected fetch refusal");
    };
    assert!(
        message.contains("private or reserved"),
        "unexpected message: {message}"
    );
}

#[tokio::test]
async fn cancellation_aborts_the_fetch() {
    let directory = spawn_directory().await;
    let cache = insecure_cache(1_048_576);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let url = cache
        .resolve(&format!("{}/jwks/agent.json", directory.base), &cancel)
        .await
        .unwrap();
    let err = cache.get(&url, &cancel).await.unwrap_err();
    assert!(matches!(err, FetchError::Cancelled), "got {err:?}");
}
