//! Stream Manager Binary
//!
//! Runs the shared stream manager behind its HTTP adapter.
//!
//! # Usage
//!
//! ```bash
//! STREAM_MANAGER_STREAMS=btcusdt@trade,ethusdt@kline_1m cargo run --bin stream-manager
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_MANAGER_BASE_URL`: per-stream upstream base (default: Binance `/ws`)
//! - `STREAM_MANAGER_LEGACY_URL`: combined-stream endpoint (default: Binance `/stream`)
//! - `STREAM_MANAGER_BACKEND`: manager | legacy (default: manager)
//! - `STREAM_MANAGER_STREAMS`: comma-separated streams subscribed at startup
//! - `STREAM_MANAGER_MAX_RETRIES`: retry ceiling or "unbounded" (default: unbounded)
//! - `STREAM_MANAGER_BASE_DELAY_MS`, `STREAM_MANAGER_MAX_DELAY_MS`,
//!   `STREAM_MANAGER_BACKOFF_FACTOR`, `STREAM_MANAGER_JITTER_RATIO`,
//!   `STREAM_MANAGER_CIRCUIT_COOLDOWN_MS`: reconnection policy
//! - `STREAM_MANAGER_CLEANUP_GRACE_MS`: teardown delay for unused streams (default: 0)
//! - `STREAM_MANAGER_CONNECT_TIMEOUT_MS`: handshake timeout (default: 10000)
//! - `STREAM_MANAGER_IDLE_TIMEOUT_SECS`: reconnect silent sockets, 0 disables (default: 180)
//! - `STREAM_MANAGER_HTTP_PORT`: health/metrics port, 0 disables (default: 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: tracing export
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use stream_manager::infrastructure::health::{BackendControl, HealthServer, HealthServerState};
use stream_manager::infrastructure::telemetry;
use stream_manager::{
    CompatibilityRouter, ServiceConfig, StreamManager, Subscription, handler, init_metrics,
    shutdown,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting stream manager");

    let _metrics_handle = init_metrics();

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let router = Arc::new(CompatibilityRouter::with_websocket(
        &config.manager,
        config.backend,
    )?);
    let subscriptions = subscribe_startup_streams(router.as_ref(), &config.streams);

    let shutdown_token = CancellationToken::new();
    if config.server.http_port != 0 {
        let manager: Arc<dyn StreamManager> = router.clone();
        let control: Arc<dyn BackendControl> = router.clone();
        let health_state =
            HealthServerState::new(env!("CARGO_PKG_VERSION").to_string(), manager)
                .with_backend_control(control);
        let health_server = HealthServer::new(
            config.server.http_port,
            Arc::new(health_state),
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tracing::info!(streams = subscriptions.len(), "Stream manager ready");

    await_shutdown(shutdown_token).await;

    drop(subscriptions);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown(router.as_ref()))
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Connections did not close in time"
        );
    }

    tracing::info!("Stream manager stopped");
    Ok(())
}

/// Subscribe each configured stream with a handler that logs every message.
fn subscribe_startup_streams(manager: &dyn StreamManager, streams: &[String]) -> Vec<Subscription> {
    streams
        .iter()
        .filter_map(|stream| {
            let logger = handler(|message| {
                tracing::debug!(
                    stream = %message.stream,
                    epoch = message.epoch,
                    payload = %message.payload,
                    "Message received"
                );
                Ok(())
            });
            match manager.subscribe(stream, logger) {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    tracing::error!(stream = %stream, error = %e, "Startup subscription failed");
                    None
                }
            }
        })
        .collect()
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    let backoff = &config.manager.backoff;
    tracing::info!(
        backend = config.backend.as_str(),
        base_url = %config.manager.base_url,
        legacy_url = %config.manager.legacy_url,
        http_port = config.server.http_port,
        streams = config.streams.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        base_delay_ms = u64::try_from(backoff.base_delay.as_millis()).unwrap_or(u64::MAX),
        max_delay_ms = u64::try_from(backoff.max_delay.as_millis()).unwrap_or(u64::MAX),
        factor = backoff.factor,
        jitter_ratio = backoff.jitter_ratio,
        max_retries = ?backoff.max_retries,
        cleanup_grace_ms = u64::try_from(config.manager.cleanup_grace.as_millis()).unwrap_or(u64::MAX),
        "Reconnection policy"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// A signal that cannot be installed is logged and never fires.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
