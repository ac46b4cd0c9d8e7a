// Worker manager implementation
// One supervision loop, N concurrent workers. The loop is the single writer
// of the in-flight set; workers only touch durable state through the
// repositories. Backpressure lives in the store: the loop re-queries pending
// work every cycle instead of building an in-memory queue.

use crate::config::GenericWorkerConfig;
use crate::db::repositories::{BatchRepository, JobRepository, StatusUpdate};
use crate::errors::{codes, RepositoryError};
use crate::handlers::ResourceContext;
use crate::models::{Job, JobError, JobStatus, LogEntry};
use crate::registry::HandlerRegistry;
use crate::webhook::WebhookDispatcher;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the worker manager
#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    /// When false, `start` returns immediately.
    pub active: bool,
    /// Hard ceiling on in-flight jobs.
    pub max_concurrent: usize,
    /// Time between polls when idle or at the ceiling.
    pub poll_interval: Duration,
    /// Age beyond which a `processing` job counts as stalled.
    pub stall_timeout: Duration,
    /// Supervision iterations between stall sweeps.
    pub stall_check_every: u32,
}

impl From<&GenericWorkerConfig> for WorkerManagerConfig {
    fn from(config: &GenericWorkerConfig) -> Self {
        Self {
            active: config.active,
            max_concurrent: config.max_concurrent as usize,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            stall_timeout: Duration::from_secs(config.stall_timeout_seconds),
            stall_check_every: config.stall_check_every,
        }
    }
}

/// Polling scheduler that claims pending jobs and dispatches them to
/// registered handlers under a bounded concurrency ceiling.
pub struct WorkerManager {
    config: WorkerManagerConfig,
    job_repo: Arc<JobRepository>,
    batch_repo: Arc<BatchRepository>,
    registry: Arc<HandlerRegistry>,
    resources: Arc<ResourceContext>,
    dispatcher: Arc<WebhookDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerManager {
    pub fn new(
        config: WorkerManagerConfig,
        job_repo: Arc<JobRepository>,
        batch_repo: Arc<BatchRepository>,
        registry: Arc<HandlerRegistry>,
        resources: Arc<ResourceContext>,
        dispatcher: Arc<WebhookDispatcher>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            job_repo,
            batch_repo,
            registry,
            resources,
            dispatcher,
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request graceful shutdown: the loop stops claiming and drains the
    /// in-flight workers before returning.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the supervision loop until shutdown
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), RepositoryError> {
        if !self.config.active {
            info!("Worker manager disabled by configuration");
            return Ok(());
        }

        info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_seconds = self.config.poll_interval.as_secs(),
            "Starting worker manager"
        );

        let mut tick = interval(self.config.poll_interval);
        let mut shutdown_rx = self.shutdown_receiver();
        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut iterations: u32 = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    iterations = iterations.wrapping_add(1);

                    reap_finished(&mut in_flight).await;

                    let free = self.config.max_concurrent.saturating_sub(in_flight.len());
                    if free == 0 {
                        debug!("At concurrency ceiling, skipping claim");
                    } else if let Err(e) = self.claim_and_dispatch(free, &mut in_flight).await {
                        error!(error = %e, "Claim cycle failed");
                    }

                    if iterations % self.config.stall_check_every == 0 {
                        self.run_stall_sweep().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping worker manager");
                    break;
                }
            }
        }

        info!(in_flight = in_flight.len(), "Draining in-flight workers");
        for (job_id, handle) in in_flight {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "Worker task failed during drain");
            }
        }

        info!("Worker manager stopped");
        Ok(())
    }

    /// Fetch claimable candidates, claim each atomically, and spawn workers.
    /// Candidates already in flight are skipped; a lost claim race is not an
    /// error, another worker owns the job.
    async fn claim_and_dispatch(
        &self,
        free: usize,
        in_flight: &mut HashMap<String, JoinHandle<()>>,
    ) -> Result<(), RepositoryError> {
        let excluded = self.batch_repo.inactive_ids().await?;
        let candidates = self
            .job_repo
            .find_claimable(free as i64, &excluded)
            .await?;

        for candidate in candidates {
            if in_flight.contains_key(&candidate.job_id) {
                debug!(job_id = %candidate.job_id, "Candidate already in flight, skipping");
                continue;
            }

            match self.job_repo.claim(&candidate.job_id).await? {
                Some(job) => {
                    metrics::counter!("jobs_claimed_total").increment(1);
                    debug!(job_id = %job.job_id, job_type = %job.job_type, "Job claimed");

                    let job_id = job.job_id.clone();
                    let handle = tokio::spawn(run_job(
                        job,
                        Arc::clone(&self.job_repo),
                        Arc::clone(&self.batch_repo),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.resources),
                        Arc::clone(&self.dispatcher),
                    ));
                    in_flight.insert(job_id, handle);
                }
                None => {
                    debug!(job_id = %candidate.job_id, "Lost claim race, skipping");
                }
            }
        }

        Ok(())
    }

    /// Force over-aged processing jobs to failed and deliver their error
    /// webhooks. Runs every `stall_check_every` iterations.
    async fn run_stall_sweep(&self) {
        let reset = match self.job_repo.reset_stalled(self.config.stall_timeout).await {
            Ok(reset) => reset,
            Err(e) => {
                error!(error = %e, "Stall sweep failed");
                return;
            }
        };

        if reset.is_empty() {
            return;
        }
        metrics::counter!("stalled_jobs_reset_total").increment(reset.len() as u64);

        for job in reset {
            if job.webhook.is_some() {
                self.dispatcher
                    .notify_job_terminal(&self.job_repo, &job)
                    .await;
            } else {
                let entry =
                    LogEntry::info("Stall reset: no webhook configured, notification skipped");
                if let Err(e) = self.job_repo.append_log(&job.job_id, entry).await {
                    warn!(job_id = %job.job_id, error = %e, "Failed to record webhook skip");
                }
            }

            if let Some(batch_id) = job.batch_id.clone() {
                finalize_batch(&self.batch_repo, &self.dispatcher, &batch_id).await;
            }
        }
    }
}

/// Remove finished workers from the in-flight set, surfacing panics
async fn reap_finished(in_flight: &mut HashMap<String, JoinHandle<()>>) {
    let done: Vec<String> = in_flight
        .iter()
        .filter(|(_, handle)| handle.is_finished())
        .map(|(job_id, _)| job_id.clone())
        .collect();

    for job_id in done {
        if let Some(handle) = in_flight.remove(&job_id) {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "Worker task panicked");
            }
        }
    }
}

/// Lifecycle of one claimed job: resolve the handler, run it with a panic
/// guard, enforce the terminal-transition contract, and settle batch
/// accounting.
#[instrument(skip_all, fields(job_id = %job.job_id, job_type = %job.job_type))]
async fn run_job(
    job: Job,
    job_repo: Arc<JobRepository>,
    batch_repo: Arc<BatchRepository>,
    registry: Arc<HandlerRegistry>,
    resources: Arc<ResourceContext>,
    dispatcher: Arc<WebhookDispatcher>,
) {
    let started = Instant::now();
    let job_type = job.job_type.clone();
    let batch_id = job.batch_id.clone();

    let final_job = match registry.lookup(&job.job_type) {
        Some(handler) => {
            let outcome = AssertUnwindSafe(handler.run(
                job.clone(),
                Arc::clone(&job_repo),
                Arc::clone(&resources),
            ))
            .catch_unwind()
            .await;

            settle_outcome(&job, outcome, &job_repo, &dispatcher).await
        }
        None => {
            warn!("No handler registered for job type");
            fail_job(
                &job_repo,
                &dispatcher,
                &job.job_id,
                codes::UNKNOWN_JOB_TYPE,
                format!("No handler registered for job type '{}'", job.job_type),
            )
            .await
        }
    };

    if let Some(final_job) = &final_job {
        match final_job.status {
            JobStatus::Completed => {
                metrics::counter!("jobs_completed_total", "job_type" => job_type.clone())
                    .increment(1);
            }
            JobStatus::Failed => {
                let code = final_job
                    .error
                    .as_ref()
                    .map(|e| e.code.clone())
                    .unwrap_or_default();
                metrics::counter!("jobs_failed_total", "job_type" => job_type.clone(), "code" => code)
                    .increment(1);
            }
            _ => {}
        }
    }
    metrics::histogram!("job_duration_seconds", "job_type" => job_type)
        .record(started.elapsed().as_secs_f64());

    if let Some(batch_id) = batch_id {
        finalize_batch(&batch_repo, &dispatcher, &batch_id).await;
    }
}

/// Enforce the handler contract against the persisted job state after the
/// handler returned (or panicked). Returns the final job document when it
/// could be determined.
async fn settle_outcome(
    job: &Job,
    outcome: Result<Result<(), crate::errors::HandlerError>, Box<dyn std::any::Any + Send>>,
    job_repo: &Arc<JobRepository>,
    dispatcher: &Arc<WebhookDispatcher>,
) -> Option<Job> {
    let current = match job_repo.find_by_id(&job.job_id).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            warn!(job_id = %job.job_id, "Job disappeared while processing");
            return None;
        }
        Err(e) => {
            // Transient store failure: nothing to do here, the stall sweep
            // recovers the job later.
            error!(job_id = %job.job_id, error = %e, "Failed to read job after handler run");
            return None;
        }
    };

    match outcome {
        Ok(Ok(())) => {
            if current.is_terminal() {
                return Some(current);
            }
            error!(job_id = %job.job_id, "Handler returned without a terminal transition");
            fail_job(
                job_repo,
                dispatcher,
                &job.job_id,
                codes::HANDLER_CONTRACT,
                "Handler returned without reaching a terminal state".to_string(),
            )
            .await
        }
        Ok(Err(e)) => {
            if current.is_terminal() {
                // The handler transitioned the job and then failed; the
                // persisted state wins.
                warn!(job_id = %job.job_id, error = %e, "Handler errored after terminal transition");
                return Some(current);
            }
            fail_job(
                job_repo,
                dispatcher,
                &job.job_id,
                codes::HANDLER_EXCEPTION,
                e.to_string(),
            )
            .await
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(job_id = %job.job_id, message = %message, "Handler panicked");
            if current.is_terminal() {
                return Some(current);
            }
            fail_job(
                job_repo,
                dispatcher,
                &job.job_id,
                codes::HANDLER_EXCEPTION,
                format!("Handler panicked: {}", message),
            )
            .await
        }
    }
}

/// Transition a job to failed with the given code and send the error
/// webhook. Used for the failure modes the worker itself produces.
async fn fail_job(
    job_repo: &Arc<JobRepository>,
    dispatcher: &Arc<WebhookDispatcher>,
    job_id: &str,
    code: &str,
    message: String,
) -> Option<Job> {
    let entry = LogEntry::error(message.clone());
    if let Err(e) = job_repo.append_log(job_id, entry).await {
        warn!(job_id, error = %e, "Failed to append failure log entry");
    }

    let update = StatusUpdate::with_error(JobError::new(code, message));
    match job_repo
        .update_status(job_id, JobStatus::Failed, update)
        .await
    {
        Ok(job) => {
            dispatcher.notify_job_terminal(job_repo, &job).await;
            Some(job)
        }
        Err(RepositoryError::InvalidTransition { job_id, from, to }) => {
            // A concurrent finalizer (stall reset, admin action) won the race.
            error!(job_id = %job_id, from = %from, to = %to, "Disallowed transition while failing job");
            None
        }
        Err(e) => {
            error!(job_id, error = %e, "Failed to persist job failure");
            None
        }
    }
}

/// Refresh the derived counters of a batch after a terminal job change and
/// fire the batch webhook exactly once when the batch just became terminal.
async fn finalize_batch(
    batch_repo: &Arc<BatchRepository>,
    dispatcher: &Arc<WebhookDispatcher>,
    batch_id: &str,
) {
    let batch = match batch_repo.refresh(batch_id).await {
        Ok(batch) => batch,
        Err(e) => {
            warn!(batch_id, error = %e, "Failed to refresh batch accounting");
            return;
        }
    };

    if !batch.status.is_terminal() || batch.webhook.is_none() {
        return;
    }

    match batch_repo.try_mark_notified(batch_id).await {
        Ok(true) => dispatcher.notify_batch_terminal(&batch).await,
        Ok(false) => debug!(batch_id, "Batch webhook already sent"),
        Err(e) => warn!(batch_id, error = %e, "Failed to claim batch notification"),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
