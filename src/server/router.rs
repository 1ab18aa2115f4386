//! HTTP router and handlers.
//!
//! Surfaces:
//! - `POST /verify` — the verifier RPC
//! - `POST /authorize` — reverse-proxy sub-request protocol
//!   (`X-Original-Method` / `X-Original-Host` / `X-Original-Uri`)
//! - `POST /cache/jwks/clear`, `POST /cache/jwks/invalidate`,
//!   `POST /cache/nonces/clear` — administration, optionally token-gated
//! - `GET /health`, `GET /stats`
//! - everything else — the sidecar proxy path

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};
use url::Url;

use crate::config::{Config, Mode};
use crate::jwks::cache::JwksCache;
use crate::nonce::NonceStore;
use crate::sidecar::classify::{Classification, classify, extract_forwarded};
use crate::sidecar::proxy::{apply_verdict_headers, effective_target, forward};
use crate::sidecar::path_is_protected;
use crate::telemetry::{AttemptRecord, Telemetry};
use crate::verifier::{FailureReason, Verdict, VerifierEngine, VerifyRequest};

/// Shared application state
pub struct AppState {
    /// The verification engine
    pub engine: Arc<VerifierEngine>,
    /// JWKS cache (admin surface)
    pub jwks: Arc<JwksCache>,
    /// Nonce store (admin surface)
    pub nonces: Arc<dyn NonceStore>,
    /// Telemetry pipeline
    pub telemetry: Arc<Telemetry>,
    /// Loaded configuration
    pub config: Config,
    /// Parsed upstream origin, when proxying is enabled
    pub upstream: Option<Url>,
    /// Client used for upstream forwarding
    pub http: reqwest::Client,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/verify", post(verify_handler))
        .route("/authorize", post(authorize_handler))
        .route("/cache/jwks/clear", post(jwks_clear_handler))
        .route("/cache/jwks/invalidate", post(jwks_invalidate_handler))
        .route("/cache/nonces/clear", post(nonces_clear_handler))
        .fallback(sidecar_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

// ── Verification surfaces ────────────────────────────────────────────────────

/// Verifier RPC request body.
#[derive(Debug, Deserialize)]
struct VerifyRpc {
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    jwks_url: Option<String>,
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(rpc): Json<VerifyRpc>,
) -> Response {
    let Ok(target) = Url::parse(&rpc.url) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid url: {}", rpc.url)})),
        )
            .into_response();
    };

    let headers: Vec<(String, String)> = rpc
        .headers
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();

    let request = VerifyRequest {
        method: rpc.method,
        target,
        headers,
        body: rpc.body.map(String::into_bytes),
        jwks_url: rpc.jwks_url,
    };

    let verdict = run_verify(&state, &request).await;
    verdict_response(&verdict, false)
}

/// Reverse-proxy sub-request protocol: the fronting proxy passes the
/// original request line in `X-Original-*` headers and copies our response
/// headers onto its own response.
async fn authorize_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };

    let method = header("x-original-method").unwrap_or_else(|| "GET".to_string());
    let Some(host) = header("x-original-host").or_else(|| header("host")) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "X-Original-Host is required"})),
        )
            .into_response();
    };
    let uri = header("x-original-uri").unwrap_or_else(|| "/".to_string());
    let scheme = if state.config.trust_forwarded_headers {
        header("x-forwarded-proto").unwrap_or_else(|| "https".to_string())
    } else {
        "https".to_string()
    };

    let Ok(target) = Url::parse(&format!("{scheme}://{host}{uri}")) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid original URI"})),
        )
            .into_response();
    };

    let verdict = match classify(&headers) {
        Classification::Unsigned => Verdict::fail(
            FailureReason::MissingSignatureHeaders,
            "Request carries no signature headers",
        ),
        Classification::Partial(verdict) => {
            record_sidecar_rejection(&state, &verdict, Some(host.clone()));
            verdict
        }
        Classification::Signed => {
            match extract_forwarded(&headers, state.config.label_hint.as_deref()) {
                Err(verdict) => {
                    record_sidecar_rejection(&state, &verdict, Some(host.clone()));
                    verdict
                }
                Ok(forwarded) => {
                    let request = VerifyRequest {
                        method,
                        target,
                        headers: forwarded,
                        body: None,
                        jwks_url: None,
                    };
                    run_verify(&state, &request).await
                }
            }
        }
    };

    verdict_response(&verdict, true)
}

/// Record a signed attempt the sidecar rejected before it reached the
/// engine (partial header sets, sensitive-header shield). The engine
/// records everything that gets further.
fn record_sidecar_rejection(state: &AppState, verdict: &Verdict, origin: Option<String>) {
    state.telemetry.record(AttemptRecord {
        verified: false,
        reason: verdict.reason(),
        jwks_url: None,
        kid: None,
        origin,
        weak_freshness: false,
    });
}

/// Run the engine under the configured overall deadline.
async fn run_verify(state: &AppState, request: &VerifyRequest) -> Verdict {
    let cancel = CancellationToken::new();
    let deadline = state.config.verify_timeout();
    tokio::select! {
        verdict = state.engine.verify(request, &cancel) => verdict,
        () = tokio::time::sleep(deadline) => {
            cancel.cancel();
            warn!(timeout_ms = deadline.as_millis() as u64, "Verification deadline exceeded");
            Verdict::fail(
                FailureReason::InternalError,
                format!("Verification timed out after {}ms", deadline.as_millis()),
            )
        }
    }
}

/// 200/401 with the RPC verdict body; optionally mirror the verdict ABI
/// onto the response headers for a fronting proxy to copy.
fn verdict_response(verdict: &Verdict, mirror_headers: bool) -> Response {
    let status = if verdict.is_verified() {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    let mut response = (status, Json(verdict.wire_json())).into_response();
    if mirror_headers {
        apply_verdict_headers(response.headers_mut(), verdict);
    }
    response
}

// ── Sidecar proxy path ───────────────────────────────────────────────────────

async fn sidecar_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let verdict = match classify(&headers) {
        Classification::Unsigned => None,
        Classification::Partial(verdict) => {
            record_sidecar_rejection(&state, &verdict, origin);
            Some(verdict)
        }
        Classification::Signed => {
            match extract_forwarded(&headers, state.config.label_hint.as_deref()) {
                Err(verdict) => {
                    record_sidecar_rejection(&state, &verdict, origin);
                    Some(verdict)
                }
                Ok(forwarded) => {
                    let Some(target) = effective_target(
                        &headers,
                        &uri,
                        state.config.trust_forwarded_headers,
                    ) else {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "request has no Host"})),
                        )
                            .into_response();
                    };
                    let request = VerifyRequest {
                        method: method.as_str().to_string(),
                        target,
                        headers: forwarded,
                        body: (!body.is_empty()).then(|| body.to_vec()),
                        jwks_url: None,
                    };
                    Some(run_verify(&state, &request).await)
                }
            }
        }
    };

    // Require-verified gating on protected paths
    let gated = state.config.mode == Mode::RequireVerified
        && path_is_protected(uri.path(), &state.config.protected_paths);
    if gated && !verdict.as_ref().is_some_and(Verdict::is_verified) {
        let verdict = verdict.unwrap_or_else(|| {
            Verdict::fail(
                FailureReason::MissingSignatureHeaders,
                "Request carries no signature headers",
            )
        });
        debug!(path = uri.path(), reason = ?verdict.reason(), "Rejecting unverified request");
        return verdict_response(&verdict, true);
    }

    // Observe (or unprotected path): proxy with advisory annotations
    let annotation = verdict.unwrap_or_else(|| {
        Verdict::fail(
            FailureReason::MissingSignatureHeaders,
            "Request carries no signature headers",
        )
    });
    match &state.upstream {
        Some(upstream) => {
            forward(
                &state.http,
                upstream,
                &method,
                &uri,
                headers,
                body,
                Some(&annotation),
            )
            .await
        }
        None => {
            let mut response = (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "no upstream configured"})),
            )
                .into_response();
            apply_verdict_headers(response.headers_mut(), &annotation);
            response
        }
    }
}

// ── Administration ───────────────────────────────────────────────────────────

/// Constant-time admin-token gate. Absent configuration leaves the admin
/// surface open (development posture).
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .unwrap_or_default();

    let matches = presented.len() == expected.len()
        && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()));
    if matches {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "admin token required"})),
        )
            .into_response())
    }
}

async fn jwks_clear_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let cleared = state.jwks.clear();
    Json(json!({"cleared": cleared})).into_response()
}

#[derive(Debug, Deserialize)]
struct InvalidateRpc {
    jwks_url: String,
}

async fn jwks_invalidate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(rpc): Json<InvalidateRpc>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let removed = state.jwks.invalidate(&rpc.jwks_url);
    Json(json!({"invalidated": removed})).into_response()
}

async fn nonces_clear_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let cleared = state.nonces.clear().await;
    warn!(cleared, "Nonce store cleared; replay protection reset");
    Json(json!({"cleared": cleared})).into_response()
}

// ── Introspection ────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.config.mode.to_string(),
    }))
    .into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state
        .telemetry
        .stats()
        .snapshot(state.config.karma_rejection_threshold);
    Json(json!({
        "stats": snapshot,
        "queue": {
            "depth": state.telemetry.queue_len(),
            "dropped": state.telemetry.dropped(),
        },
        "jwks_cache_entries": state.jwks.len(),
    }))
    .into_response()
}
