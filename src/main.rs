mod backoff;
mod config;
mod message;
mod metrics;
mod relay;
mod scheduler;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::metrics::RelayMetrics;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bridgehook=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Optional TOML file; the environment always takes precedence
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path.display());
    }
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Source: {}", config.source.url);
    info!("  Webhook: {}", config.webhook.url);
    info!("  Authenticated: {}", config.has_source_credentials());
    if !config.webhook.message_prefix.is_empty() {
        info!("  Message prefix: {:?}", config.webhook.message_prefix);
    }
    info!("  Telemetry: {}", config.telemetry.enabled);

    let metrics = Arc::new(RelayMetrics::new());
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut heartbeat = None;
    if config.telemetry.enabled {
        let mut s = Scheduler::new().await?;
        scheduler::tasks::register_heartbeat(&mut s, &config.telemetry.heartbeat_cron, metrics.clone())
            .await?;
        s.start().await?;
        heartbeat = Some(s);
    }

    let result = relay::run(&config, metrics, cancel).await;

    if let Some(s) = heartbeat {
        if let Err(e) = s.shutdown().await {
            warn!("{:#}", e);
        }
    }

    if result.is_ok() {
        info!("Shut down cleanly");
    }
    result
}

/// Cancel the relay on Ctrl-C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
