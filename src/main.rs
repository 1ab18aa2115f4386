//! BotAuth Gateway - RFC 9421 bot-authentication sidecar
//!
//! Verifies HTTP message signatures from autonomous agents and translates
//! verdicts into policy-bearing response headers.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use botauth_gateway::{cli::Cli, config::Config, server::Server, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.listen_port = port;
            }
            if let Some(ref host) = cli.host {
                config.listen_host = host.clone();
            }
            if let Some(ref mode) = cli.mode {
                match mode.parse() {
                    Ok(m) => config.mode = m,
                    Err(e) => {
                        error!("Invalid --mode: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            if cli.no_telemetry {
                config.telemetry_enabled = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.listen_port,
        mode = %config.mode,
        trusted_directories = config.trusted_directories.len(),
        "Starting BotAuth Gateway"
    );

    // Create and run server
    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
