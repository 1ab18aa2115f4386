//! Verifier engine: the end-to-end signature verification pipeline.
//!
//! # Pipeline
//!
//! 1. Locate and parse `Signature-Input`, `Signature`, `Signature-Agent`;
//!    select the active label.
//! 2. Extract the label's parameters; only `ed25519` (or absent) `alg`.
//! 3. Freshness: `created`/`expires` against the skew window.
//! 4. Resolve the JWKS URL (discovery included).
//! 5. Fetch the JWKS (cached).
//! 6. Admit the nonce atomically — after every transient step so neither a
//!    probe failure nor a cancelled fetch burns a nonce — then locate the
//!    key by exact `kid`.
//! 7. Reconstruct the signature base.
//! 8. Verify the Ed25519 signature (constant-time).
//! 9. Emit the verdict; every attempt is recorded to telemetry unless the
//!    request was cancelled.
//!
//! The engine holds no per-request state and performs no I/O except through
//! its collaborators, so a fixed `(request, JWKS, now)` triple always yields
//! the same verdict.

pub mod freshness;
pub mod verdict;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::Signature;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::jwks::cache::JwksCache;
use crate::jwks::fetch::FetchError;
use crate::nonce::{Admission, NonceStore};
use crate::sfv::Dictionary;
use crate::signature::base::{self, BaseError, RequestContext};
use crate::signature::{CoveredComponent, SignatureInput, agent, parse_signatures};
use crate::telemetry::{AttemptRecord, Telemetry};

pub use verdict::{AgentIdentity, FailureReason, Verdict};

/// One request to verify, as assembled by a sidecar surface.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// HTTP method
    pub method: String,
    /// Effective target URI
    pub target: Url,
    /// Lowercased header name/value pairs, repeated names preserved
    pub headers: Vec<(String, String)>,
    /// Request body, when the signature covers `content-digest`
    pub body: Option<Vec<u8>>,
    /// Test-only override replacing `Signature-Agent` resolution
    pub jwks_url: Option<String>,
}

impl VerifyRequest {
    /// All values for `name` joined with `", "`, or `None` when absent.
    fn header_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.trim())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// `host[:port]` of the target, for telemetry origin tracking.
    fn origin(&self) -> Option<String> {
        let host = self.target.host_str()?;
        Some(match self.target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

/// Material gathered along the pipeline for the telemetry record.
#[derive(Debug, Default)]
struct AttemptProbe {
    kid: Option<String>,
    jwks_url: Option<String>,
    weak_freshness: bool,
}

/// The verification engine. Stateless per request; all shared state lives
/// in the collaborators.
pub struct VerifierEngine {
    jwks: Arc<JwksCache>,
    nonces: Arc<dyn NonceStore>,
    telemetry: Arc<Telemetry>,
    max_skew: i64,
    nonce_ttl: Duration,
    label_hint: Option<String>,
}

impl VerifierEngine {
    /// Compose an engine over its collaborators.
    #[must_use]
    pub fn new(
        jwks: Arc<JwksCache>,
        nonces: Arc<dyn NonceStore>,
        telemetry: Arc<Telemetry>,
        max_skew: i64,
        nonce_ttl: Duration,
        label_hint: Option<String>,
    ) -> Self {
        Self {
            jwks,
            nonces,
            telemetry,
            max_skew,
            nonce_ttl,
            label_hint,
        }
    }

    /// Verify against the current clock.
    pub async fn verify(&self, request: &VerifyRequest, cancel: &CancellationToken) -> Verdict {
        self.verify_at(request, Utc::now().timestamp(), cancel).await
    }

    /// Verify with an explicit `now` (unix seconds). Deterministic for a
    /// fixed `(request, JWKS snapshot, now)`.
    pub async fn verify_at(
        &self,
        request: &VerifyRequest,
        now: i64,
        cancel: &CancellationToken,
    ) -> Verdict {
        let mut probe = AttemptProbe::default();
        let verdict = match self.pipeline(request, now, cancel, &mut probe).await {
            Ok(verdict) | Err(verdict) => verdict,
        };

        // A cancelled verification writes no telemetry
        if !cancel.is_cancelled() {
            self.telemetry.record(AttemptRecord {
                verified: verdict.is_verified(),
                reason: verdict.reason(),
                jwks_url: probe.jwks_url,
                kid: probe.kid,
                origin: request.origin(),
                weak_freshness: probe.weak_freshness,
            });
        }

        verdict
    }

    #[allow(clippy::too_many_lines)]
    async fn pipeline(
        &self,
        request: &VerifyRequest,
        now: i64,
        cancel: &CancellationToken,
        probe: &mut AttemptProbe,
    ) -> Result<Verdict, Verdict> {
        // 1. Locate the signature headers
        let input_raw = request.header_joined("signature-input");
        let signature_raw = request.header_joined("signature");
        let agent_raw = request.header_joined("signature-agent");

        if input_raw.is_none() && signature_raw.is_none() && agent_raw.is_none() {
            return Err(Verdict::fail(
                FailureReason::MissingSignatureHeaders,
                "Request carries no signature headers",
            ));
        }
        let input_raw = input_raw.ok_or_else(|| {
            Verdict::fail(
                FailureReason::MissingSignatureInput,
                "Signature-Input header is missing",
            )
        })?;
        let signature_raw = signature_raw.ok_or_else(|| {
            Verdict::fail(
                FailureReason::MissingSignature,
                "Signature header is missing",
            )
        })?;
        if agent_raw.is_none() && request.jwks_url.is_none() {
            return Err(Verdict::fail(
                FailureReason::MissingSignatureAgent,
                "Signature-Agent header is missing",
            ));
        }

        // Parse the dictionaries and select the active label
        let input = SignatureInput::parse(&input_raw).map_err(|e| {
            Verdict::fail(
                FailureReason::InvalidStructuredField,
                format!("Signature-Input: {e}"),
            )
        })?;
        let label = match &self.label_hint {
            Some(hint) => {
                if input.get(hint).is_none() {
                    return Err(Verdict::fail(
                        FailureReason::InvalidStructuredField,
                        format!("Signature-Input has no entry for configured label '{hint}'"),
                    ));
                }
                hint.clone()
            }
            None => input
                .first_label()
                .expect("parse guarantees at least one label")
                .to_string(),
        };
        let entry = input.get(&label).expect("label selected from entries");

        let signatures = parse_signatures(&signature_raw).map_err(|e| {
            Verdict::fail(
                FailureReason::InvalidStructuredField,
                format!("Signature: {e}"),
            )
        })?;
        let signature_bytes = signatures
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| {
                Verdict::fail(
                    FailureReason::MissingSignature,
                    format!("Signature has no entry for label '{label}'"),
                )
            })?;

        // 2. Parameters
        if let Some(alg) = entry.alg.as_deref() {
            if alg != "ed25519" {
                return Err(Verdict::fail(
                    FailureReason::UnsupportedAlgorithm,
                    format!("Algorithm '{alg}' is not supported (ed25519 only)"),
                ));
            }
        }
        let keyid = entry.keyid.clone().ok_or_else(|| {
            Verdict::fail(
                FailureReason::UnknownKid,
                "Signature has no keyid parameter",
            )
        })?;
        probe.kid = Some(keyid.clone());

        // 3. Freshness, before nonce admission
        freshness::check(entry.created, entry.expires, now, self.max_skew)?;

        // 4. Resolve the JWKS URL
        let directory = match &request.jwks_url {
            Some(override_url) => override_url.clone(),
            None => {
                let agent_raw = agent_raw.as_deref().unwrap_or_default();
                agent::directory_for_label(agent_raw, &label).map_err(|e| {
                    Verdict::fail(FailureReason::InvalidSignatureAgent, e.to_string())
                })?
            }
        };
        let jwks_url = self
            .jwks
            .resolve(&directory, cancel)
            .await
            .map_err(map_fetch_error)?;
        probe.jwks_url = Some(jwks_url.as_str().to_string());

        // 5-6. Fetch the JWKS, then admit the nonce. Admission sits after
        // every transient step (probe, fetch, cancellation) so none of them
        // can burn a nonce the agent will legitimately retry with.
        let document = self
            .jwks
            .get(&jwks_url, cancel)
            .await
            .map_err(map_fetch_error)?;

        match &entry.nonce {
            Some(nonce) => {
                if self.nonces.admit(&keyid, nonce, self.nonce_ttl).await == Admission::Replay {
                    return Err(Verdict::fail(
                        FailureReason::NonceReplay,
                        "Nonce was already admitted within the replay window",
                    ));
                }
            }
            None => {
                // Legal, but only created/expires bound the request
                probe.weak_freshness = true;
            }
        }

        // Locate the key
        let jwk = document.find_key(&keyid).ok_or_else(|| {
            Verdict::fail(
                FailureReason::UnknownKid,
                format!("JWKS has no key with kid '{keyid}'"),
            )
        })?;
        let verifying_key = jwk.verifying_key().ok_or_else(|| {
            Verdict::fail(
                FailureReason::InvalidJwks,
                format!("Key '{keyid}' is not a usable Ed25519 key"),
            )
        })?;

        // 7. Reconstruct the signature base
        let ctx = RequestContext {
            method: &request.method,
            target: &request.target,
            headers: &request.headers,
        };
        let base = base::build(&ctx, &entry.components, &entry.raw).map_err(map_base_error)?;

        // Covered content-digest must match the body actually received
        if let Some(body) = &request.body {
            check_content_digest(request, &entry.components, body)?;
        }

        // 8. Verify (verify_strict is constant-time)
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| {
            Verdict::fail(
                FailureReason::SignatureMismatch,
                "Signature is not a well-formed Ed25519 signature",
            )
        })?;
        verifying_key
            .verify_strict(base.as_bytes(), &signature)
            .map_err(|_| {
                Verdict::fail(
                    FailureReason::SignatureMismatch,
                    "Signature does not verify over the reconstructed base",
                )
            })?;

        debug!(label = %label, kid = %keyid, jwks_url = %jwks_url, "Signature verified");

        // 9. Verdict
        Ok(Verdict::Verified {
            agent: AgentIdentity {
                jwks_url: jwks_url.as_str().to_string(),
                kid: keyid,
                client_name: document.client_name.clone(),
            },
            created: entry.created,
            expires: entry.expires,
        })
    }
}

/// Verify a covered `content-digest` header against the received body.
fn check_content_digest(
    request: &VerifyRequest,
    components: &[CoveredComponent],
    body: &[u8],
) -> Result<(), Verdict> {
    if !components.iter().any(|c| c.name == "content-digest") {
        return Ok(());
    }
    let Some(header) = request.header_joined("content-digest") else {
        // Base construction already failed if the header was covered but
        // absent; nothing further to check here
        return Ok(());
    };
    let dict = Dictionary::parse(&header).map_err(|e| {
        Verdict::fail(
            FailureReason::InvalidStructuredField,
            format!("Content-Digest: {e}"),
        )
    })?;
    let Some(expected) = dict.get("sha-256").and_then(|m| match &m.value {
        crate::sfv::MemberValue::Item(item) => item.as_bytes(),
        crate::sfv::MemberValue::InnerList(_) => None,
    }) else {
        return Ok(());
    };

    let actual = Sha256::digest(body);
    let matches = expected.len() == actual.len() && bool::from(expected.ct_eq(actual.as_slice()));
    if matches {
        Ok(())
    } else {
        Err(Verdict::fail(
            FailureReason::SignatureMismatch,
            "Content-Digest does not match the request body",
        ))
    }
}

fn map_fetch_error(error: FetchError) -> Verdict {
    let message = error.to_string();
    let reason = match error {
        FetchError::Untrusted(_) => FailureReason::UntrustedDirectory,
        FetchError::Discovery(_) => FailureReason::JwksDiscoveryFailed,
        FetchError::Fetch(_) | FetchError::Cancelled => FailureReason::JwksFetchFailed,
        FetchError::TooLarge(_) | FetchError::Invalid(_) => FailureReason::InvalidJwks,
    };
    Verdict::fail(reason, message)
}

fn map_base_error(error: BaseError) -> Verdict {
    let message = error.to_string();
    let reason = match error {
        BaseError::MissingComponent(_) => FailureReason::MissingCoveredHeader,
        BaseError::SensitiveHeader(_) => FailureReason::SensitiveHeaderInSignature,
        BaseError::UnparseableDictionary(_) => FailureReason::InvalidStructuredField,
    };
    Verdict::fail(reason, message)
}
