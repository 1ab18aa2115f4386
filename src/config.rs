//! Configuration management

use std::{fmt, path::Path, str::FromStr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default well-known paths probed when a `Signature-Agent` value is an
/// identity URL rather than a direct JWKS document.
pub const DEFAULT_DISCOVERY_PATHS: [&str; 4] = [
    "/.well-known/http-message-signatures-directory",
    "/.well-known/jwks.json",
    "/.well-known/openbotauth/jwks.json",
    "/jwks.json",
];

/// Sidecar operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every request is proxied; the verification result is attached as
    /// advisory headers.
    #[default]
    Observe,
    /// Requests without a valid signature are rejected with 401 on
    /// protected paths.
    RequireVerified,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observe => write!(f, "observe"),
            Self::RequireVerified => write!(f, "require_verified"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "observe" => Ok(Self::Observe),
            "require_verified" => Ok(Self::RequireVerified),
            other => Err(Error::Config(format!(
                "Unknown mode '{other}': use 'observe' or 'require_verified'"
            ))),
        }
    }
}

/// Main configuration
///
/// Flat key-value shape loaded from YAML and `BOTAUTH_`-prefixed environment
/// variables. Unknown keys are rejected at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Host to bind to
    pub listen_host: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Origin base URL for sidecar proxying (unset disables the proxy path)
    pub upstream: Option<String>,
    /// Sidecar behaviour
    pub mode: Mode,
    /// Path prefixes subject to verification in `require_verified` mode
    pub protected_paths: Vec<String>,

    /// Freshness window for `created` (seconds)
    pub max_skew_sec: i64,
    /// Replay window and nonce TTL (seconds)
    pub nonce_ttl_sec: u64,
    /// Default JWKS cache TTL when upstream gives no `max-age` (seconds)
    pub jwks_ttl_sec: u64,
    /// Max JWKS body size (bytes)
    pub jwks_max_bytes: usize,
    /// JWKS fetch deadline (milliseconds)
    pub jwks_timeout_ms: u64,
    /// Sidecar-to-verifier overall deadline (milliseconds)
    pub verify_timeout_ms: u64,

    /// Allow-list of JWKS hosts. Empty disables the gate (development).
    pub trusted_directories: Vec<String>,
    /// Well-known paths probed for identity URLs, in order
    pub discovery_paths: Vec<String>,
    /// Explicit signature label selection (default: first label)
    pub label_hint: Option<String>,

    /// Honour `X-Forwarded-Proto`/`X-Forwarded-Host` when reconstructing
    /// the effective target URI
    pub trust_forwarded_headers: bool,
    /// Permit `http` JWKS URLs and private addresses (development only)
    pub allow_insecure_transport: bool,
    /// Bearer token for cache-admin endpoints (unset leaves them open)
    pub admin_token: Option<String>,

    /// Toggles the telemetry logger
    pub telemetry_enabled: bool,
    /// Durable attempt-log location (JSON lines)
    pub telemetry_log_path: String,
    /// Bounded telemetry queue size (drop-oldest under pressure)
    pub telemetry_queue_capacity: usize,
    /// Rejection-rate threshold above which karma is zeroed
    pub karma_rejection_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8402,
            upstream: None,
            mode: Mode::Observe,
            protected_paths: Vec::new(),
            max_skew_sec: 300,
            nonce_ttl_sec: 600,
            jwks_ttl_sec: 3600,
            jwks_max_bytes: 1_048_576,
            jwks_timeout_ms: 3000,
            verify_timeout_ms: 5000,
            trusted_directories: Vec::new(),
            discovery_paths: DEFAULT_DISCOVERY_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
            label_hint: None,
            trust_forwarded_headers: false,
            allow_insecure_transport: false,
            admin_token: None,
            telemetry_enabled: true,
            telemetry_log_path: "telemetry.log".to_string(),
            telemetry_queue_capacity: 1024,
            karma_rejection_threshold: 0.5,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or contains unrecognised keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BOTAUTH_ prefix)
        figment = figment.merge(Env::prefixed("BOTAUTH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation run after extraction.
    fn validate(&self) -> Result<()> {
        if let Some(ref upstream) = self.upstream {
            url::Url::parse(upstream)
                .map_err(|e| Error::Config(format!("Invalid upstream URL '{upstream}': {e}")))?;
        }
        if self.mode == Mode::RequireVerified && self.protected_paths.is_empty() {
            tracing::warn!(
                "require_verified mode with no protected_paths: nothing will be gated"
            );
        }
        if self.telemetry_queue_capacity == 0 {
            return Err(Error::Config(
                "telemetry_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Freshness window for `created`
    #[must_use]
    pub fn max_skew(&self) -> Duration {
        Duration::from_secs(self.max_skew_sec.unsigned_abs())
    }

    /// Nonce replay window
    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_sec)
    }

    /// Default JWKS cache TTL
    #[must_use]
    pub fn jwks_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_ttl_sec)
    }

    /// JWKS fetch deadline
    #[must_use]
    pub fn jwks_timeout(&self) -> Duration {
        Duration::from_millis(self.jwks_timeout_ms)
    }

    /// Overall verification deadline
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}
