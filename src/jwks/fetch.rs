//! SSRF-guarded JWKS fetching and well-known discovery.
//!
//! # Fetch discipline
//!
//! Every outbound fetch goes through the same gauntlet:
//!
//! 1. Scheme check — `https` only, unless `allow_insecure_transport` is set
//!    (development).
//! 2. Trusted-directory gate — a host outside the allow-list is refused
//!    before any network activity.
//! 3. DNS screening — the host is resolved once; every resolved address is
//!    checked against the private/reserved block list and the survivors are
//!    pinned for the connection, so a rebinding DNS answer cannot swap in a
//!    private address between check and connect.
//! 4. One redirect per probe, re-screened from step 1.
//! 5. Deadline and body cap — the fetch aborts past the configured timeout
//!    or once the body exceeds `jwks_max_bytes`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{StatusCode, redirect::Policy};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::security::ssrf::{host_is_blocked_literal, is_blocked_addr};

use super::{JwksDocument, JwksError};

/// JWKS acquisition failure, carrying enough shape for the verdict taxonomy.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The JWKS host is outside the trusted-directory allow-list.
    /// Surfaces as `untrusted_directory`.
    #[error("JWKS host '{0}' is not a trusted directory")]
    Untrusted(String),

    /// No discovery path under the identity URL yielded a valid JWKS.
    /// Surfaces as `jwks_discovery_failed`.
    #[error("JWKS discovery failed for {0}")]
    Discovery(String),

    /// Transport-level failure: bad URL, blocked address, DNS, connect,
    /// TLS, timeout, or HTTP error status. Surfaces as `jwks_fetch_failed`.
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),

    /// The body exceeded the configured size cap. Surfaces as `invalid_jwks`.
    #[error("JWKS response exceeds {0} bytes")]
    TooLarge(usize),

    /// The body was not a valid JWKS. Surfaces as `invalid_jwks`.
    #[error(transparent)]
    Invalid(#[from] JwksError),

    /// The request-scoped deadline or client disconnect fired.
    #[error("JWKS fetch cancelled")]
    Cancelled,
}

/// Result of one conditional fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304 — the cached entry is still current.
    NotModified,
    /// 2xx with a validated document.
    Fresh {
        /// Parsed document
        document: Arc<JwksDocument>,
        /// `ETag` response header, for the next conditional GET
        etag: Option<String>,
        /// `Cache-Control: max-age` directive, overriding the default TTL
        max_age: Option<Duration>,
    },
}

/// Fetch-side configuration, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Fetch deadline
    pub timeout: Duration,
    /// Body size cap
    pub max_bytes: usize,
    /// Permit http and private addresses (development)
    pub allow_insecure: bool,
    /// JWKS host allow-list; empty disables the gate
    pub trusted_directories: Vec<String>,
    /// Well-known probe order for identity URLs
    pub discovery_paths: Vec<String>,
}

impl FetchConfig {
    /// Extract the fetch-relevant keys from the main configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.jwks_timeout(),
            max_bytes: config.jwks_max_bytes,
            allow_insecure: config.allow_insecure_transport,
            trusted_directories: config.trusted_directories.clone(),
            discovery_paths: config.discovery_paths.clone(),
        }
    }
}

/// SSRF-guarded JWKS fetcher.
#[derive(Debug)]
pub struct JwksFetcher {
    config: FetchConfig,
}

impl JwksFetcher {
    /// Create a fetcher.
    #[must_use]
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// The configured well-known probe order.
    #[must_use]
    pub fn discovery_paths(&self) -> &[String] {
        &self.config.discovery_paths
    }

    /// Parse a directory URI, defaulting the scheme to https.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Fetch`] for unparseable URIs.
    pub fn prepare_url(raw: &str) -> Result<Url, FetchError> {
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("https://{raw}"))
                    .map_err(|e| FetchError::Fetch(format!("invalid directory URI '{raw}': {e}")))
            }
            Err(e) => Err(FetchError::Fetch(format!(
                "invalid directory URI '{raw}': {e}"
            ))),
        }
    }

    /// Whether `url` points directly at a JWKS document rather than an
    /// identity origin requiring discovery.
    #[must_use]
    pub fn looks_like_jwks_url(url: &Url) -> bool {
        let path = url.path();
        path.ends_with(".json")
            || path.contains("/jwks")
            || path.contains("/http-message-signatures-directory")
    }

    /// Validate scheme, trust, and literal-address rules without touching
    /// the network.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Untrusted`] or [`FetchError::Fetch`].
    pub fn validate_url(&self, url: &Url) -> Result<(), FetchError> {
        match url.scheme() {
            "https" => {}
            "http" if self.config.allow_insecure => {}
            other => {
                return Err(FetchError::Fetch(format!(
                    "scheme '{other}' is not allowed for JWKS fetches"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Fetch("directory URI has no host".to_string()))?;

        if !self.config.trusted_directories.is_empty() {
            let host_lower = host.to_lowercase();
            if !self
                .config
                .trusted_directories
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&host_lower))
            {
                return Err(FetchError::Untrusted(host_lower));
            }
        }

        if !self.config.allow_insecure && host_is_blocked_literal(host) {
            return Err(FetchError::Fetch(format!(
                "host '{host}' is a private or reserved address"
            )));
        }

        Ok(())
    }

    /// Fetch `url` once, conditionally when `etag` is given.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] per the fetch discipline above.
    pub async fn fetch(
        &self,
        url: &Url,
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::select! {
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.config.timeout, self.fetch_inner(url, etag)) => {
                result.map_err(|_| FetchError::Fetch("deadline exceeded".to_string()))?
            }
        }
    }

    async fn fetch_inner(&self, url: &Url, etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let mut current = url.clone();
        let mut redirects = 0u8;

        loop {
            self.validate_url(&current)?;
            let response = self.request(&current, etag).await?;

            if response.status().is_redirection() {
                if redirects >= 1 {
                    return Err(FetchError::Fetch("too many redirects".to_string()));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::Fetch("redirect without Location".to_string()))?;
                current = current
                    .join(location)
                    .map_err(|e| FetchError::Fetch(format!("invalid redirect target: {e}")))?;
                redirects += 1;
                debug!(target = %current, "Following JWKS redirect");
                continue;
            }

            if response.status() == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }

            if !response.status().is_success() {
                return Err(FetchError::Fetch(format!(
                    "HTTP {} from {current}",
                    response.status()
                )));
            }

            let new_etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let max_age = response
                .headers()
                .get(reqwest::header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_max_age);

            let body = self.read_capped(response).await?;
            let document = JwksDocument::parse(&body)?;

            return Ok(FetchOutcome::Fresh {
                document: Arc::new(document),
                etag: new_etag,
                max_age,
            });
        }
    }

    /// Resolve, screen, and pin the target's addresses, then issue the GET.
    async fn request(
        &self,
        url: &Url,
        etag: Option<&str>,
    ) -> Result<reqwest::Response, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Fetch("directory URI has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::Fetch("directory URI has no port".to_string()))?;

        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(self.config.timeout)
            .user_agent(concat!("botauth-gateway/", env!("CARGO_PKG_VERSION")));

        if !self.config.allow_insecure {
            builder = builder.https_only(true);

            // Resolve once, screen every address, pin the survivors.
            if host.parse::<std::net::IpAddr>().is_err() {
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|e| FetchError::Fetch(format!("DNS resolution failed: {e}")))?
                    .collect();
                if addrs.is_empty() {
                    return Err(FetchError::Fetch(format!("'{host}' resolved to nothing")));
                }
                if let Some(blocked) = addrs.iter().find(|a| is_blocked_addr(a.ip())) {
                    warn!(host = %host, addr = %blocked.ip(), "JWKS host resolves to a blocked address");
                    return Err(FetchError::Fetch(format!(
                        "'{host}' resolves to a private or reserved address"
                    )));
                }
                builder = builder.resolve_to_addrs(&host, &addrs);
            }
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Fetch(format!("client build failed: {e}")))?;

        let mut request = client.get(url.clone()).header(
            reqwest::header::ACCEPT,
            "application/http-message-signatures-directory+json, application/json",
        );
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        request
            .send()
            .await
            .map_err(|e| FetchError::Fetch(format!("request to {url} failed: {e}")))
    }

    /// Stream the body, refusing anything past the configured cap.
    async fn read_capped(&self, response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        if let Some(len) = response.content_length() {
            if len > self.config.max_bytes as u64 {
                return Err(FetchError::TooLarge(self.config.max_bytes));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Fetch(format!("body read failed: {e}")))?;
            if body.len() + chunk.len() > self.config.max_bytes {
                return Err(FetchError::TooLarge(self.config.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Probe the well-known paths under an identity origin and return the
    /// first URL serving a valid JWKS, together with its document.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Untrusted`] immediately when the origin host is
    /// outside the allow-list, [`FetchError::Cancelled`] on cancellation,
    /// and [`FetchError::Discovery`] when every probe fails.
    pub async fn discover(
        &self,
        origin: &Url,
        cancel: &CancellationToken,
    ) -> Result<(Url, FetchOutcome), FetchError> {
        // Surface trust refusals as such rather than a generic probe failure
        self.validate_url(origin)?;

        for path in &self.config.discovery_paths {
            let candidate = match origin.join(path) {
                Ok(u) => u,
                Err(e) => {
                    debug!(path = %path, "Skipping unjoinable discovery path: {e}");
                    continue;
                }
            };
            match self.fetch(&candidate, None, cancel).await {
                Ok(outcome @ FetchOutcome::Fresh { .. }) => {
                    debug!(url = %candidate, "JWKS discovered");
                    return Ok((candidate, outcome));
                }
                Ok(FetchOutcome::NotModified) => {
                    // Unconditional probe cannot yield 304; treat as a miss
                    debug!(url = %candidate, "Unexpected 304 from discovery probe");
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(FetchError::Untrusted(host)) => return Err(FetchError::Untrusted(host)),
                Err(e) => {
                    debug!(url = %candidate, "Discovery probe failed: {e}");
                }
            }
        }

        Err(FetchError::Discovery(origin.to_string()))
    }
}

/// Extract the `max-age` directive from a `Cache-Control` value.
fn parse_max_age(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|secs| secs.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fetcher(trusted: &[&str], allow_insecure: bool) -> JwksFetcher {
        JwksFetcher::new(FetchConfig {
            timeout: Duration::from_secs(3),
            max_bytes: 1_048_576,
            allow_insecure,
            trusted_directories: trusted.iter().map(ToString::to_string).collect(),
            discovery_paths: crate::config::DEFAULT_DISCOVERY_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    // ── URL preparation and classification ─────────────────────────────

    #[test]
    fn prepare_url_defaults_scheme_to_https() {
        let url = JwksFetcher::prepare_url("idp.example/jwks.json").unwrap();
        assert_eq!(url.as_str(), "https://idp.example/jwks.json");
    }

    #[test]
    fn direct_jwks_urls_are_recognised() {
        for direct in [
            "https://idp.example/jwks/alice.json",
            "https://idp.example/.well-known/jwks.json",
            "https://idp.example/.well-known/http-message-signatures-directory",
            "https://idp.example/jwks",
        ] {
            assert!(
                JwksFetcher::looks_like_jwks_url(&Url::parse(direct).unwrap()),
                "{direct} should be direct"
            );
        }
    }

    #[test]
    fn identity_urls_require_discovery() {
        for identity in ["https://bot-vendor.example", "https://bot-vendor.example/about"] {
            assert!(!JwksFetcher::looks_like_jwks_url(&Url::parse(identity).unwrap()));
        }
    }

    // ── Static validation ──────────────────────────────────────────────

    #[test]
    fn untrusted_host_is_refused_before_any_fetch() {
        let f = fetcher(&["idp.example"], false);
        let err = f
            .validate_url(&Url::parse("https://evil.example/jwks.json").unwrap())
            .unwrap_err();
        assert!(matches!(err, FetchError::Untrusted(h) if h == "evil.example"));
    }

    #[test]
    fn trusted_host_match_is_case_insensitive() {
        let f = fetcher(&["IDP.example"], false);
        assert!(
            f.validate_url(&Url::parse("https://idp.example/jwks.json").unwrap())
                .is_ok()
        );
    }

    #[test]
    fn empty_allow_list_disables_the_gate() {
        let f = fetcher(&[], false);
        assert!(
            f.validate_url(&Url::parse("https://anywhere.example/jwks.json").unwrap())
                .is_ok()
        );
    }

    #[test]
    fn http_scheme_requires_insecure_flag() {
        let url = Url::parse("http://idp.example/jwks.json").unwrap();
        assert!(fetcher(&[], false).validate_url(&url).is_err());
        assert!(fetcher(&[], true).validate_url(&url).is_ok());
    }

    #[test]
    fn literal_private_hosts_are_refused() {
        let f = fetcher(&[], false);
        for blocked in [
            "https://127.0.0.1/jwks.json",
            "https://10.0.0.8/jwks.json",
            "https://[::1]/jwks.json",
            "https://[::ffff:192.168.0.1]/jwks.json",
        ] {
            assert!(
                matches!(
                    f.validate_url(&Url::parse(blocked).unwrap()),
                    Err(FetchError::Fetch(_))
                ),
                "{blocked} should be refused"
            );
        }
    }

    // ── Cache-Control parsing ──────────────────────────────────────────

    #[test]
    fn max_age_is_extracted_from_cache_control() {
        assert_eq!(parse_max_age("max-age=600"), Some(Duration::from_secs(600)));
        assert_eq!(
            parse_max_age("public, max-age=120, immutable"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
    }
}
