mod config;
mod delivery;
mod error;
mod event;
mod forwarder;
mod platform;
mod processor;
mod scheduler;
mod stats;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, CONFIG_PATH_ENV};
use crate::forwarder::Forwarder;
use crate::platform::telegram::TelegramApi;

#[tokio::main]
async fn main() -> Result<()> {
    // Config path: first CLI argument, then FEEDGRAM_CONFIG; env vars alone are enough
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded successfully");
    info!("  Stream: {}", config.stream.url);
    info!("  Chat: {}", config.telegram.chat_id);
    info!(
        "  Batching: up to {} message(s), {}ms max wait",
        config.effective_batch_size(),
        config.processor.batch_max_wait_ms
    );
    info!(
        "  Rate limit: one call per {}ms",
        config.delivery.rate_limit_interval_ms
    );

    let api = Arc::new(TelegramApi::new(&config.telegram));
    let forwarder = Forwarder::new(config, api);

    let bot_name = forwarder.verify().await?;
    info!("Telegram connection OK (@{})", bot_name);

    let handle = forwarder.start().await?;
    info!("Forwarder is running, press Ctrl+C to stop");

    shutdown_signal().await;

    let snapshot = handle.stop().await?;
    info!(
        "Forwarder stopped after {}s ({} delivered, {} errors)",
        snapshot.uptime.as_secs(),
        snapshot.processed,
        snapshot.errors
    );
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
