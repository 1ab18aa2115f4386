//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// BotAuth Gateway - RFC 9421 bot-authentication sidecar
#[derive(Parser, Debug)]
#[command(name = "botauth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BOTAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "BOTAUTH_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "BOTAUTH_HOST")]
    pub host: Option<String>,

    /// Sidecar mode (observe, require_verified)
    #[arg(long, env = "BOTAUTH_MODE")]
    pub mode: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BOTAUTH_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BOTAUTH_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Disable telemetry recording
    #[arg(long)]
    pub no_telemetry: bool,
}
