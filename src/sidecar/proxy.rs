//! Origin forwarding: hop-by-hop filtering, target reconstruction, and the
//! `X-OBAuth-*` response ABI.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri};
use tracing::warn;
use url::Url;

use crate::security::sanitize_header_value;
use crate::verifier::Verdict;

/// Hop-by-hop headers stripped in both directions when proxying.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The advisory/verdict response headers (the external ABI).
pub mod abi {
    /// `true` | `false`
    pub const VERIFIED: &str = "x-obauth-verified";
    /// Sanitized `client_name`, only when verified
    pub const AGENT: &str = "x-obauth-agent";
    /// Resolved JWKS URL, only when verified
    pub const JWKS_URL: &str = "x-obauth-jwks-url";
    /// Verified kid, only when verified
    pub const KID: &str = "x-obauth-kid";
    /// Sanitized reason code, only when not verified
    pub const ERROR: &str = "x-obauth-error";
}

/// Remove every hop-by-hop header from `headers`, including any named by a
/// `Connection` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection can nominate additional hop-by-hop headers
    let nominated: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_lowercase())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in nominated {
        headers.remove(name.as_str());
    }
}

/// The `X-OBAuth-*` headers for a verdict, values sanitized of CR/LF and
/// control characters.
#[must_use]
pub fn verdict_headers(verdict: &Verdict) -> Vec<(&'static str, String)> {
    match verdict {
        Verdict::Verified { agent, .. } => {
            let mut out = vec![
                (abi::VERIFIED, "true".to_string()),
                (abi::JWKS_URL, sanitize_header_value(&agent.jwks_url)),
                (abi::KID, sanitize_header_value(&agent.kid)),
            ];
            if let Some(name) = &agent.client_name {
                out.push((abi::AGENT, sanitize_header_value(name)));
            }
            out
        }
        Verdict::Failed { reason, .. } => vec![
            (abi::VERIFIED, "false".to_string()),
            (abi::ERROR, sanitize_header_value(reason.as_str())),
        ],
    }
}

/// Apply verdict headers onto a header map.
pub fn apply_verdict_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    for (name, value) in verdict_headers(verdict) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Reconstruct the effective target URI the agent signed.
///
/// `X-Forwarded-Proto`/`X-Forwarded-Host` are honoured only when
/// `trust_forwarded` is set; otherwise the request's own `Host` header and
/// the sidecar's plain-HTTP scheme are used.
#[must_use]
pub fn effective_target(headers: &HeaderMap, uri: &Uri, trust_forwarded: bool) -> Option<Url> {
    let forwarded = |name: &str| {
        trust_forwarded
            .then(|| headers.get(name))
            .flatten()
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
    };

    let scheme = forwarded("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = forwarded("x-forwarded-host").or_else(|| {
        headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    })?;

    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    Url::parse(&format!("{scheme}://{host}{path_and_query}")).ok()
}

/// Forward a request to the origin and translate the response back,
/// hop-by-hop headers stripped both ways and the verdict ABI attached.
///
/// # Errors
///
/// Returns a 502 response when the origin is unreachable.
pub async fn forward(
    client: &reqwest::Client,
    upstream: &Url,
    method: &Method,
    uri: &Uri,
    mut request_headers: HeaderMap,
    body: axum::body::Bytes,
    verdict: Option<&Verdict>,
) -> Response<Body> {
    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let Ok(target) = upstream.join(&path_and_query) else {
        return error_response(StatusCode::BAD_GATEWAY, "unroutable path");
    };

    strip_hop_by_hop(&mut request_headers);
    // The origin sees its own Host; reqwest derives it from the target
    request_headers.remove("host");
    request_headers.remove("content-length");
    if let Some(verdict) = verdict {
        apply_verdict_headers(&mut request_headers, verdict);
    }

    let Ok(method) = reqwest::Method::from_bytes(method.as_str().as_bytes()) else {
        return error_response(StatusCode::BAD_GATEWAY, "unsupported method");
    };

    let mut outbound = client.request(method, target);
    for (name, value) in &request_headers {
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    let upstream_response = match outbound.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Upstream request failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.append(name, value);
        }
    }
    strip_hop_by_hop(&mut response_headers);
    if let Some(verdict) = verdict {
        apply_verdict_headers(&mut response_headers, verdict);
    }

    let body = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Upstream body read failed: {e}");
            return error_response(StatusCode::BAD_GATEWAY, "upstream body read failed");
        }
    };

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        *headers = response_headers;
    }
    response
        .body(Body::from(body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "response build failed"))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(format!("{{\"error\":\"{message}\"}}")))
        .unwrap_or_default()
}
