// Enqueue operations: the contract by which external code creates work.
// HTTP framing (multipart, routing, auth) lives outside the core; callers
// observe outcome via webhook or by polling the job record.

use crate::db::repositories::{BatchRepository, JobRepository};
use crate::errors::{EnqueueError, ValidationError};
use crate::models::{BatchSpec, Job, JobSpec};
use std::sync::Arc;
use tracing::{info, instrument};

/// Receipt returned by `enqueue_batch`
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub job_ids: Vec<String>,
}

/// Service owning the enqueue contract
pub struct EnqueueService {
    job_repo: Arc<JobRepository>,
    batch_repo: Arc<BatchRepository>,
}

impl EnqueueService {
    pub fn new(job_repo: Arc<JobRepository>, batch_repo: Arc<BatchRepository>) -> Self {
        Self {
            job_repo,
            batch_repo,
        }
    }

    /// Create a single pending job. Responds immediately; no processing has
    /// happened yet. Unknown job types are accepted here — the handler
    /// lookup error surfaces at dispatch, so operators can register new
    /// handlers without racing in-flight enqueues.
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type))]
    pub async fn enqueue_job(&self, spec: JobSpec) -> Result<String, EnqueueError> {
        validate_job_spec(&spec)?;

        let job = Job::from_spec(spec);
        self.job_repo.create(&job).await?;

        metrics::counter!("jobs_enqueued_total", "job_type" => job.job_type.clone()).increment(1);
        info!(job_id = %job.job_id, "Job enqueued");
        Ok(job.job_id)
    }

    /// Create a batch and its jobs as one logical unit
    #[instrument(skip(self, spec, jobs), fields(job_count = jobs.len()))]
    pub async fn enqueue_batch(
        &self,
        spec: BatchSpec,
        jobs: Vec<JobSpec>,
    ) -> Result<BatchReceipt, EnqueueError> {
        if jobs.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        if let Some(webhook) = &spec.webhook {
            validate_webhook_url(&webhook.url)?;
        }
        for job in &jobs {
            validate_job_spec(job)?;
        }

        let (batch, job_ids) = self.batch_repo.create_with_jobs(spec, jobs).await?;

        metrics::counter!("batches_enqueued_total").increment(1);
        info!(batch_id = %batch.batch_id, jobs = job_ids.len(), "Batch enqueued");
        Ok(BatchReceipt {
            batch_id: batch.batch_id,
            job_ids,
        })
    }
}

/// Validate the enqueue envelope. `job_type` must be non-empty and a webhook,
/// if present, must point at an HTTPS endpoint.
pub fn validate_job_spec(spec: &JobSpec) -> Result<(), ValidationError> {
    if spec.job_type.trim().is_empty() {
        return Err(ValidationError::MissingField("job_type".to_string()));
    }
    if let Some(webhook) = &spec.webhook {
        validate_webhook_url(&webhook.url)?;
    }
    Ok(())
}

fn validate_webhook_url(url: &str) -> Result<(), ValidationError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ValidationError::InvalidFieldValue {
        field: "webhook.url".to_string(),
        reason: e.to_string(),
    })?;

    if parsed.scheme() != "https" {
        return Err(ValidationError::InsecureWebhookUrl(url.to_string()));
    }
    Ok(())
}
