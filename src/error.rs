//! Error types for BotAuth Gateway

use std::io;

use thiserror::Error;

/// Result type alias for BotAuth Gateway
pub type Result<T> = std::result::Result<T, Error>;

/// BotAuth Gateway errors
///
/// These are operational faults (configuration, IO, server lifecycle).
/// Verification outcomes never travel through this type; the verifier
/// pipeline returns a [`crate::verifier::Verdict`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream origin unreachable or misbehaving
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
