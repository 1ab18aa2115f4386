//! BotAuth Gateway Library
//!
//! Sidecar verification core for HTTP-signature-based bot authentication.
//!
//! # Features
//!
//! - **RFC 9421 verification**: signature-base reconstruction and Ed25519
//!   signature checks for requests signed by autonomous agents
//! - **Key discovery**: `Signature-Agent` resolution to JWKS documents with
//!   well-known-path probing, SSRF-guarded fetching, and an ETag-aware cache
//! - **Replay prevention**: atomic nonce admission within a sliding window
//! - **Sidecar modes**: observe (advisory headers) and require-verified
//!   (401 on protected paths) with hop-by-hop filtering
//! - **Ecosystem telemetry**: non-blocking counters and a durable attempt log

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod jwks;
pub mod nonce;
pub mod security;
pub mod server;
pub mod sfv;
pub mod sidecar;
pub mod signature;
pub mod telemetry;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
