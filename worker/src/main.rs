// Worker binary entry point
// Wires configuration, store, repositories, handler registry, and the
// worker manager; runs until SIGINT and drains in-flight jobs on shutdown.

mod pipelines;

use anyhow::Result;
use common::bootstrap;
use common::config::Settings;
use common::db::repositories::{BatchRepository, JobRepository};
use common::handlers::{PdfHandler, ResourceContext, SessionHandler};
use common::registry::HandlerRegistry;
use common::webhook::WebhookDispatcher;
use common::worker::{WorkerManager, WorkerManagerConfig};
use pipelines::CommandPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    bootstrap::init_json_tracing();

    info!("Starting generic worker");

    // Load configuration
    let settings = Settings::load()?;
    settings.validate().map_err(anyhow::Error::msg)?;
    info!("Configuration loaded successfully");

    bootstrap::init_metrics_exporter(settings.observability.metrics_port)?;

    // Connect to the store and ensure indexes
    let store = bootstrap::init_store(&settings).await?;

    // Initialize repositories
    let job_repo = Arc::new(JobRepository::new(
        store.clone(),
        settings.generic_worker.log_entries_cap,
    ));
    let batch_repo = Arc::new(BatchRepository::new(store));
    info!("Repositories initialized");

    // Webhook dispatcher shared by handlers and the manager
    let dispatcher = Arc::new(WebhookDispatcher::new(
        settings.generic_worker.webhook_timeout_seconds,
        settings.generic_worker.worker_identity.clone(),
    )?);

    // External processing pipelines, one command per job type
    let command_timeout = Duration::from_secs(settings.processors.command_timeout_seconds);
    let resources = Arc::new(ResourceContext {
        session_pipeline: Arc::new(CommandPipeline::new(
            settings.processors.session_command.clone(),
            command_timeout,
            settings.processors.workdir.clone(),
        )),
        pdf_pipeline: Arc::new(CommandPipeline::new(
            settings.processors.pdf_command.clone(),
            command_timeout,
            settings.processors.workdir.clone(),
        )),
        webhooks: Arc::clone(&dispatcher),
    });

    // Handler registry, populated once at startup
    let mut registry = HandlerRegistry::new();
    registry.register("session", Arc::new(SessionHandler));
    registry.register("pdf", Arc::new(PdfHandler));
    let registry = Arc::new(registry);
    info!(types = ?registry.registered_types(), "Handlers registered");

    // Worker manager
    let manager = Arc::new(WorkerManager::new(
        WorkerManagerConfig::from(&settings.generic_worker),
        job_repo,
        batch_repo,
        registry,
        resources,
        dispatcher,
    ));

    let manager_handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                error!(error = %e, "Worker manager error");
            }
        })
    };

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Stop claiming and let in-flight jobs finish
    manager.stop();
    let _ = manager_handle.await;

    info!("Worker shutdown complete");
    Ok(())
}
