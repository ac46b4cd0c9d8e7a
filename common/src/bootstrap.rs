// Bootstrap utilities for binary initialization
// Shared wiring between the worker binary and the integration test harness.

use crate::config::Settings;
use crate::db::Store;
use anyhow::{Context, Result};
use tracing::info;

/// Connect to the store, verify it, and create the required indexes
#[tracing::instrument(skip(settings))]
pub async fn init_store(settings: &Settings) -> Result<Store> {
    info!("Initializing store");

    let store = Store::connect(&settings.store)
        .await
        .context("Failed to connect to store")?;

    store
        .ensure_indexes()
        .await
        .context("Failed to create store indexes")?;

    info!("Store initialized");
    Ok(store)
}

/// Start the Prometheus metrics exporter on the configured port
pub fn init_metrics_exporter(port: u16) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Initialize tracing for JSON logging
/// Used by: Worker (production)
///
/// This sets up structured JSON logging with thread IDs and log levels
pub fn init_json_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .json()
        .init();
}

/// Initialize tracing for human-readable logging
/// Used by: local development
///
/// This sets up human-readable logging with environment filter
pub fn init_human_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=info,common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
