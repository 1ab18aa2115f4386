//! JWKS document model and validation.
//!
//! A key directory serves an RFC 7517 key set: a `keys` array of JWKs, here
//! restricted to Ed25519 (`kty=OKP`, `crv=Ed25519`). An optional top-level
//! `client_name` carries the display name surfaced in verdicts.

pub mod cache;
pub mod fetch;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A JWKS document rejected by the validity invariants. Surfaces as
/// `invalid_jwks`.
#[derive(Debug, Error)]
pub enum JwksError {
    /// The body is not valid JSON.
    #[error("JWKS is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The `keys` array is missing or empty.
    #[error("JWKS has no keys")]
    NoKeys,

    /// No key element carries both `kid` and `x`.
    #[error("JWKS has no usable key (kid and x required)")]
    NoUsableKey,
}

/// One JSON Web Key. Unknown members are ignored; the verifier only needs
/// the Ed25519 subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; must be `OKP` for Ed25519
    pub kty: String,
    /// Curve name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// Key identifier (RFC 7638 thumbprint by convention)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Base64url public key bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// Advertised algorithm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Advertised use (`sig`)
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// Certificate chain (metadata only; never consumed in the hot path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5c: Option<Vec<String>>,
    /// Certificate URI (metadata only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5u: Option<String>,
}

impl Jwk {
    /// Whether this key has the fields verification needs.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.kid.is_some() && self.x.is_some()
    }

    /// Decode this JWK into an Ed25519 verifying key.
    ///
    /// Returns `None` when the key is not an Ed25519 OKP key or the
    /// public-key bytes are malformed.
    #[must_use]
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        if self.kty != "OKP" {
            return None;
        }
        if self.crv.as_deref() != Some("Ed25519") {
            return None;
        }
        let x = self.x.as_deref()?;
        let bytes = URL_SAFE_NO_PAD.decode(x).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    /// RFC 7638 thumbprint of this key (base64url SHA-256 over the
    /// canonical `{"crv","kty","x"}` form).
    #[must_use]
    pub fn thumbprint(&self) -> Option<String> {
        let crv = self.crv.as_deref()?;
        let x = self.x.as_deref()?;
        let canonical = format!(r#"{{"crv":"{crv}","kty":"{}","x":"{x}"}}"#, self.kty);
        let digest = Sha256::digest(canonical.as_bytes());
        Some(URL_SAFE_NO_PAD.encode(digest))
    }
}

/// A parsed, validated JWKS document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    /// The key set
    pub keys: Vec<Jwk>,
    /// Display name surfaced in verdicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl JwksDocument {
    /// Parse and validate a JWKS body.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError`] when the body is not JSON, `keys` is missing or
    /// empty, or no element carries both `kid` and `x`. (The 1 MiB size cap
    /// is enforced by the fetcher while streaming.)
    pub fn parse(body: &[u8]) -> Result<Self, JwksError> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            keys: Option<Vec<Jwk>>,
            #[serde(default)]
            client_name: Option<String>,
        }

        let wire: Wire = serde_json::from_slice(body)?;
        let keys = wire.keys.ok_or(JwksError::NoKeys)?;
        if keys.is_empty() {
            return Err(JwksError::NoKeys);
        }
        if !keys.iter().any(Jwk::is_usable) {
            return Err(JwksError::NoUsableKey);
        }

        Ok(Self {
            keys,
            client_name: wire.client_name,
        })
    }

    /// Locate a key by exact `kid` match. Truncated identifiers never match.
    #[must_use]
    pub fn find_key(&self, kid: &str) -> Option<&Jwk> {
        self.keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid))
    }
}
