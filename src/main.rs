mod access_policy;
mod api;
mod asset_store;
mod config;
mod error;
mod object_storage;
mod stats_job;
mod visit_ledger;

use access_policy::PgAccessPolicy;
use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use asset_store::AssetStore;
use config::Config;
use object_storage::ObjectStorage;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use visit_ledger::VisitLedger;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Asset Delivery Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        AssetStore::new(&config.database)
            .await
            .context("Failed to initialize asset store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let storage = Arc::new(
        ObjectStorage::new(&config.storage)
            .await
            .context("Failed to initialize object storage")?,
    );

    let ledger = Arc::new(VisitLedger::new(store.pool().clone()));
    let access = Arc::new(PgAccessPolicy::new(store.pool().clone()));

    // Create API state
    let api_state = AppState {
        store: store.clone(),
        ledger: ledger.clone(),
        storage: storage.clone(),
        access,
        trust_forwarded_for: config.api.trust_forwarded_for,
    };

    // Spawn the periodic counter fold job
    let fold_handle = tokio::spawn(stats_job::run_fold_scheduler(
        ledger.clone(),
        config.fold_interval(),
    ));

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Asset delivery service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down asset delivery service");

    // Abort tasks
    fold_handle.abort();
    api_handle.abort();

    info!("Asset delivery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
