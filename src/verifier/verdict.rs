//! Verdicts and the failure taxonomy.
//!
//! The verdict is a closed sum: a request either verified, carrying the
//! agent's identity, or failed, carrying exactly one reason from the closed
//! taxonomy plus a human-readable error naming the failing step. No untagged
//! JSON travels between components; each HTTP surface maps the tag to its
//! wire shape.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Closed failure taxonomy. Every failed verdict maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// None of the three signature headers is present
    MissingSignatureHeaders,
    /// `Signature-Input` absent while a companion header is present
    MissingSignatureInput,
    /// `Signature` absent while a companion header is present
    MissingSignature,
    /// `Signature-Agent` absent while a companion header is present
    MissingSignatureAgent,
    /// A signature field is not parseable RFC 8941
    InvalidStructuredField,
    /// `Signature-Agent` carries no usable directory for the label
    InvalidSignatureAgent,
    /// `alg` parameter present and not `ed25519`
    UnsupportedAlgorithm,
    /// No `created` parameter
    MissingCreated,
    /// `created` outside the permitted skew window
    ClockSkew,
    /// `expires` in the past
    Expired,
    /// `(keyid, nonce)` already admitted within the replay window
    NonceReplay,
    /// JWKS host outside the trusted-directory allow-list
    UntrustedDirectory,
    /// No well-known probe yielded a valid JWKS
    JwksDiscoveryFailed,
    /// Transport failure fetching the JWKS
    JwksFetchFailed,
    /// The JWKS document violated the validity invariants
    InvalidJwks,
    /// No key in the JWKS matches the `keyid` parameter exactly
    UnknownKid,
    /// A covered header is absent from the request
    MissingCoveredHeader,
    /// The covered list names a never-forwarded sensitive header
    SensitiveHeaderInSignature,
    /// The Ed25519 check failed over the reconstructed base
    SignatureMismatch,
    /// Unexpected fault; never produced by malformed input
    InternalError,
}

impl FailureReason {
    /// Wire code for this reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingSignatureHeaders => "missing_signature_headers",
            Self::MissingSignatureInput => "missing_signature_input",
            Self::MissingSignature => "missing_signature",
            Self::MissingSignatureAgent => "missing_signature_agent",
            Self::InvalidStructuredField => "invalid_structured_field",
            Self::InvalidSignatureAgent => "invalid_signature_agent",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::MissingCreated => "missing_created",
            Self::ClockSkew => "clock_skew",
            Self::Expired => "expired",
            Self::NonceReplay => "nonce_replay",
            Self::UntrustedDirectory => "untrusted_directory",
            Self::JwksDiscoveryFailed => "jwks_discovery_failed",
            Self::JwksFetchFailed => "jwks_fetch_failed",
            Self::InvalidJwks => "invalid_jwks",
            Self::UnknownKid => "unknown_kid",
            Self::MissingCoveredHeader => "missing_covered_header",
            Self::SensitiveHeaderInSignature => "sensitive_header_in_signature",
            Self::SignatureMismatch => "signature_mismatch",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a verified agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Resolved JWKS URL the key came from
    pub jwks_url: String,
    /// Verified key identifier
    pub kid: String,
    /// Display name from the JWKS document, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// Outcome of one verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The signature verified against a trusted directory key.
    Verified {
        /// Who signed
        agent: AgentIdentity,
        /// `created` parameter
        created: Option<i64>,
        /// `expires` parameter
        expires: Option<i64>,
    },
    /// Verification failed.
    Failed {
        /// Taxonomy code
        reason: FailureReason,
        /// Human-readable description naming the failing step
        error: String,
    },
}

impl Verdict {
    /// Failed-verdict constructor.
    #[must_use]
    pub fn fail(reason: FailureReason, error: impl Into<String>) -> Self {
        Self::Failed {
            reason,
            error: error.into(),
        }
    }

    /// Whether this verdict verified.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// The failure reason, when failed.
    #[must_use]
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::Failed { reason, .. } => Some(*reason),
            Self::Verified { .. } => None,
        }
    }

    /// The agent identity, when verified.
    #[must_use]
    pub fn agent(&self) -> Option<&AgentIdentity> {
        match self {
            Self::Verified { agent, .. } => Some(agent),
            Self::Failed { .. } => None,
        }
    }

    /// The verifier-RPC body for this verdict.
    #[must_use]
    pub fn wire_json(&self) -> Value {
        match self {
            Self::Verified {
                agent,
                created,
                expires,
            } => {
                let mut body = json!({
                    "verified": true,
                    "agent": agent,
                });
                if let Some(created) = created {
                    body["created"] = json!(created);
                }
                if let Some(expires) = expires {
                    body["expires"] = json!(expires);
                }
                body
            }
            Self::Failed { reason, error } => json!({
                "verified": false,
                "error": error,
                "reason": reason.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reason_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(FailureReason::NonceReplay).unwrap(),
            serde_json::json!("nonce_replay")
        );
        assert_eq!(
            serde_json::to_value(FailureReason::SensitiveHeaderInSignature).unwrap(),
            serde_json::json!("sensitive_header_in_signature")
        );
        assert_eq!(FailureReason::ClockSkew.as_str(), "clock_skew");
    }

    #[test]
    fn verified_wire_shape_matches_rpc_contract() {
        let verdict = Verdict::Verified {
            agent: AgentIdentity {
                jwks_url: "https://idp.example/jwks/alice.json".to_string(),
                kid: "K1".to_string(),
                client_name: Some("Alice".to_string()),
            },
            created: Some(1_700_000_000),
            expires: None,
        };

        let wire = verdict.wire_json();
        assert_eq!(wire["verified"], true);
        assert_eq!(wire["agent"]["jwks_url"], "https://idp.example/jwks/alice.json");
        assert_eq!(wire["agent"]["kid"], "K1");
        assert_eq!(wire["created"], 1_700_000_000i64);
        assert!(wire.get("expires").is_none());
        assert!(wire.get("reason").is_none());
    }

    #[test]
    fn failed_wire_shape_matches_rpc_contract() {
        let verdict = Verdict::fail(
            FailureReason::MissingCoveredHeader,
            "Missing covered header: content-type",
        );

        let wire = verdict.wire_json();
        assert_eq!(wire["verified"], false);
        assert_eq!(wire["reason"], "missing_covered_header");
        assert_eq!(wire["error"], "Missing covered header: content-type");
        assert!(wire.get("agent").is_none());
    }
}
