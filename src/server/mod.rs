//! Server lifecycle: component wiring, bind, and graceful shutdown.

pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::jwks::cache::JwksCache;
use crate::jwks::fetch::{FetchConfig, JwksFetcher};
use crate::nonce::MemoryNonceStore;
use crate::telemetry::Telemetry;
use crate::verifier::VerifierEngine;
use crate::{Error, Result};

use router::{AppState, create_router};

/// How often the nonce sweeper runs.
const NONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The gateway server.
pub struct Server {
    config: Config,
    state: Arc<AppState>,
    nonce_store: Arc<MemoryNonceStore>,
}

impl Server {
    /// Wire up the component graph from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the upstream URL or HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = JwksFetcher::new(FetchConfig::from_config(&config));
        let jwks = Arc::new(JwksCache::new(fetcher, config.jwks_ttl()));

        let nonces = Arc::new(MemoryNonceStore::new());

        let telemetry = Arc::new(Telemetry::new(
            config.telemetry_enabled,
            config.telemetry_queue_capacity,
            config.telemetry_log_path.clone(),
        ));

        let engine = Arc::new(VerifierEngine::new(
            Arc::clone(&jwks),
            Arc::clone(&nonces) as Arc<dyn crate::nonce::NonceStore>,
            Arc::clone(&telemetry),
            config.max_skew_sec,
            config.nonce_ttl(),
            config.label_hint.clone(),
        ));

        let upstream = config
            .upstream
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(|e| Error::Config(format!("Invalid upstream URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.verify_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {e}")))?;

        let state = Arc::new(AppState {
            engine,
            jwks,
            nonces: Arc::clone(&nonces) as Arc<dyn crate::nonce::NonceStore>,
            telemetry,
            config: config.clone(),
            upstream,
            http,
        });

        Ok(Self {
            config,
            state,
            nonce_store: nonces,
        })
    }

    /// Shared state, for embedding the router in tests.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Run until SIGINT/SIGTERM, then drain and stop.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .listen_host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.listen_port,
        );

        let shutdown = CancellationToken::new();

        // Background lanes: telemetry consumer and nonce sweeper
        let consumer = tokio::spawn(
            Arc::clone(&self.state.telemetry).run_consumer(shutdown.clone()),
        );
        let sweeper =
            MemoryNonceStore::spawn_sweeper(Arc::clone(&self.nonce_store), NONCE_SWEEP_INTERVAL);

        let router = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, mode = %self.config.mode, "Gateway listening");

        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()));
        serve.await?;

        // Stop the background lanes and flush telemetry
        shutdown.cancel();
        sweeper.abort();
        if let Err(e) = consumer.await {
            debug!("Telemetry consumer join: {e}");
        }

        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM, cancelling `token` for background lanes.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    token.cancel();
}
