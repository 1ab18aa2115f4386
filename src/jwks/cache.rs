//! JWKS cache with ETag refresh and per-key singleflight.
//!
//! Entries are keyed by the normalised JWKS URL (lowercase host, default
//! port stripped — the [`Url`] display form). A hit inside the TTL returns
//! the shared document without touching the network; an expired entry is
//! refreshed with a conditional GET (`If-None-Match`), where a 304 extends
//! the entry and a 200 replaces it. At most one fetch per key is in flight
//! at a time; concurrent callers for the same key await its completion and
//! re-read the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::JwksDocument;
use super::fetch::{FetchError, FetchOutcome, JwksFetcher};

/// One cached JWKS entry. The document is shared read-only.
struct CachedEntry {
    document: Arc<JwksDocument>,
    etag: Option<String>,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Concurrent JWKS cache in front of the SSRF-guarded fetcher.
pub struct JwksCache {
    entries: DashMap<String, CachedEntry>,
    /// Per-key fetch coordination: one underlying fetch per key, all
    /// concurrent callers awaiting its result.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    fetcher: JwksFetcher,
    default_ttl: Duration,
}

impl JwksCache {
    /// Create a cache over `fetcher` with the configured default TTL.
    #[must_use]
    pub fn new(fetcher: JwksFetcher, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            fetcher,
            default_ttl,
        }
    }

    /// Resolve a `Signature-Agent` directory URI to the final JWKS URL.
    ///
    /// Direct JWKS URLs validate without network activity. Identity URLs go
    /// through well-known discovery; each probed document is cached under
    /// its own URL so the later [`Self::get`] is a cache hit.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] per the fetch discipline.
    pub async fn resolve(
        &self,
        directory_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Url, FetchError> {
        let url = JwksFetcher::prepare_url(directory_uri)?;

        if JwksFetcher::looks_like_jwks_url(&url) {
            self.fetcher.validate_url(&url)?;
            return Ok(url);
        }

        // Identity URL: a previously discovered document for this origin
        // may already be cached under one of the probe paths.
        for path in self.fetcher.discovery_paths() {
            if let Ok(candidate) = url.join(path) {
                if let Some(entry) = self.entries.get(candidate.as_str()) {
                    if entry.is_fresh() {
                        return Ok(candidate);
                    }
                }
            }
        }

        let (discovered, outcome) = self.fetcher.discover(&url, cancel).await?;
        if let FetchOutcome::Fresh {
            document,
            etag,
            max_age,
        } = outcome
        {
            self.store(discovered.as_str(), document, etag, max_age);
        }
        Ok(discovered)
    }

    /// Return the document for `url`, fetching or refreshing as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the document cannot be obtained.
    pub async fn get(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Arc<JwksDocument>, FetchError> {
        let key = url.as_str().to_string();

        if let Some(entry) = self.entries.get(&key) {
            if entry.is_fresh() {
                return Ok(Arc::clone(&entry.document));
            }
        }

        // Singleflight: first caller fetches, the rest await and re-read.
        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        let result = self.refresh_locked(&key, url, cancel).await;
        drop(_guard);
        self.inflight.remove(&key);
        result
    }

    /// Fetch or conditionally refresh `key` while holding its gate.
    async fn refresh_locked(
        &self,
        key: &str,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Arc<JwksDocument>, FetchError> {
        // A concurrent caller may have refreshed while we waited on the gate
        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh() {
                return Ok(Arc::clone(&entry.document));
            }
        }

        let etag = self
            .entries
            .get(key)
            .and_then(|e| e.etag.clone());

        match self.fetcher.fetch(url, etag.as_deref(), cancel).await? {
            FetchOutcome::NotModified => {
                // Extend the stale entry by the default TTL
                if let Some(mut entry) = self.entries.get_mut(key) {
                    entry.expires_at = Instant::now() + self.default_ttl;
                    debug!(url = %url, "JWKS unchanged (304), entry extended");
                    return Ok(Arc::clone(&entry.document));
                }
                // Entry vanished (administrative invalidation mid-flight)
                Err(FetchError::Fetch(
                    "cache entry invalidated during refresh".to_string(),
                ))
            }
            FetchOutcome::Fresh {
                document,
                etag,
                max_age,
            } => {
                self.store(key, Arc::clone(&document), etag, max_age);
                Ok(document)
            }
        }
    }

    fn store(
        &self,
        key: &str,
        document: Arc<JwksDocument>,
        etag: Option<String>,
        max_age: Option<Duration>,
    ) {
        let ttl = max_age.unwrap_or(self.default_ttl);
        self.entries.insert(
            key.to_string(),
            CachedEntry {
                document,
                etag,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Seed an entry under the default TTL without fetching. Used for
    /// operator cache warming and by tests running without a key directory.
    pub fn prime(&self, jwks_url: &str, document: JwksDocument) {
        let key = JwksFetcher::prepare_url(jwks_url)
            .map_or_else(|_| jwks_url.to_string(), |u| u.as_str().to_string());
        self.store(&key, Arc::new(document), None, None);
    }

    /// Administrative invalidation of one key.
    pub fn invalidate(&self, jwks_url: &str) -> bool {
        let key = JwksFetcher::prepare_url(jwks_url)
            .map_or_else(|_| jwks_url.to_string(), |u| u.as_str().to_string());
        let removed = self.entries.remove(&key).is_some();
        debug!(url = %key, removed, "JWKS cache invalidation");
        removed
    }

    /// Administrative clear of every entry.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "JWKS cache cleared");
        count
    }

    /// Current number of cached documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::super::fetch::FetchConfig;
    use super::*;

    fn cache() -> JwksCache {
        let fetcher = JwksFetcher::new(FetchConfig {
            timeout: Duration::from_secs(3),
            max_bytes: 1_048_576,
            allow_insecure: false,
            trusted_directories: vec!["idp.example".to_string()],
            discovery_paths: crate::config::DEFAULT_DISCOVERY_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
        JwksCache::new(fetcher, Duration::from_secs(3600))
    }

    fn sample_document() -> Arc<JwksDocument> {
        use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
        let x = URL_SAFE_NO_PAD.encode([1u8; 32]);
        let body = format!(r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"K1","x":"{x}"}}]}}"#);
        Arc::new(JwksDocument::parse(body.as_bytes()).unwrap())
    }

    #[tokio::test]
    async fn direct_url_resolves_without_network() {
        // GIVEN: a trusted direct JWKS URL
        let c = cache();
        let cancel = CancellationToken::new();

        // WHEN: resolved
        let url = c
            .resolve("https://idp.example/jwks/alice.json", &cancel)
            .await
            .unwrap();

        // THEN: the URL comes back as-is, nothing cached yet
        assert_eq!(url.as_str(), "https://idp.example/jwks/alice.json");
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn untrusted_direct_url_is_refused() {
        let c = cache();
        let cancel = CancellationToken::new();
        let err = c
            .resolve("https://evil.example/jwks.json", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Untrusted(_)));
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_fetching() {
        // GIVEN: a cache primed with a fresh entry
        let c = cache();
        c.store(
            "https://idp.example/jwks/alice.json",
            sample_document(),
            None,
            None,
        );

        // WHEN: the same URL is requested
        let cancel = CancellationToken::new();
        let url = Url::parse("https://idp.example/jwks/alice.json").unwrap();
        let doc = c.get(&url, &cancel).await.unwrap();

        // THEN: the cached document is returned (a real fetch against
        // idp.example would fail in the test environment)
        assert!(doc.find_key("K1").is_some());
    }

    #[tokio::test]
    async fn invalidate_drops_one_key() {
        let c = cache();
        c.store("https://idp.example/jwks/a.json", sample_document(), None, None);
        c.store("https://idp.example/jwks/b.json", sample_document(), None, None);

        assert!(c.invalidate("https://idp.example/jwks/a.json"));
        assert_eq!(c.len(), 1);
        assert!(!c.invalidate("https://idp.example/jwks/a.json"));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let c = cache();
        c.store("https://idp.example/jwks/a.json", sample_document(), None, None);
        c.store("https://idp.example/jwks/b.json", sample_document(), None, None);

        assert_eq!(c.clear(), 2);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn max_age_overrides_default_ttl() {
        let c = cache();
        c.store(
            "https://idp.example/jwks/a.json",
            sample_document(),
            None,
            Some(Duration::ZERO),
        );

        // A zero max-age entry is immediately stale
        let entry = c.entries.get("https://idp.example/jwks/a.json").unwrap();
        assert!(!entry.is_fresh());
    }
}
