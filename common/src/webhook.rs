// Webhook dispatcher
// Builds the canonical success/error payloads and POSTs them with
// bearer-token auth and a bounded timeout. Delivery is at-most-once: the
// terminal state is persisted before the attempt, and failures only produce
// a job log entry.

use crate::db::repositories::JobRepository;
use crate::errors::{codes, WebhookError};
use crate::models::{Batch, BatchStatus, Job, JobStatus, LogEntry, WebhookSpec};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const CALLBACK_TOKEN_HEADER: &str = "X-Callback-Token";
const BODY_EXCERPT_LEN: usize = 200;

/// Canonical webhook payload shared by success and error notifications.
/// `data`, `error`, and `token` serialize as explicit nulls when absent.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub status: String,
    pub worker: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub process: ProcessInfo,
    pub data: Option<Value>,
    pub error: Option<PayloadError>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub main_processor: String,
    pub started: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayloadError {
    pub code: String,
    pub message: String,
}

/// Posts canonical payloads to caller-provided HTTPS endpoints
pub struct WebhookDispatcher {
    client: Client,
    worker_identity: String,
}

impl WebhookDispatcher {
    /// Create a dispatcher with the given HTTP timeout
    pub fn new(timeout_seconds: u64, worker_identity: impl Into<String>) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| WebhookError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            worker_identity: worker_identity.into(),
        })
    }

    /// Build the success payload for a completed job
    pub fn success_payload(&self, job: &Job) -> WebhookPayload {
        let (echo, token) = echo_and_token(job.webhook.as_ref(), &job.job_id);

        WebhookPayload {
            status: "completed".to_string(),
            worker: self.worker_identity.clone(),
            job_id: echo,
            process: ProcessInfo {
                id: job.job_id.clone(),
                main_processor: job.job_type.clone(),
                started: job.started_at.unwrap_or(job.created_at).to_rfc3339(),
                completed: Some(job.completed_at.unwrap_or(job.updated_at).to_rfc3339()),
            },
            data: job
                .results
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok()),
            error: None,
            token,
        }
    }

    /// Build the error payload for a failed job
    pub fn error_payload(&self, job: &Job) -> WebhookPayload {
        let (echo, token) = echo_and_token(job.webhook.as_ref(), &job.job_id);

        let error = job
            .error
            .as_ref()
            .map(|e| PayloadError {
                code: e.code.clone(),
                message: e.message.clone(),
            })
            .unwrap_or_else(|| PayloadError {
                code: codes::INTERNAL.to_string(),
                message: "Job failed without a recorded error".to_string(),
            });

        WebhookPayload {
            status: "error".to_string(),
            worker: self.worker_identity.clone(),
            job_id: echo,
            process: ProcessInfo {
                id: job.job_id.clone(),
                main_processor: job.job_type.clone(),
                started: job.started_at.unwrap_or(job.created_at).to_rfc3339(),
                completed: None,
            },
            data: None,
            error: Some(error),
            token,
        }
    }

    /// Build the batch-level payload fired once on terminal batch state
    pub fn batch_payload(&self, batch: &Batch) -> WebhookPayload {
        let (echo, token) = echo_and_token(batch.webhook.as_ref(), &batch.batch_id);

        let (status, data, error) = match batch.status {
            BatchStatus::Failed => (
                "error".to_string(),
                None,
                Some(PayloadError {
                    code: codes::BATCH_FAILED.to_string(),
                    message: format!("All {} job(s) in the batch failed", batch.total_jobs),
                }),
            ),
            status => (
                status.to_string(),
                Some(json!({
                    "total_jobs": batch.total_jobs,
                    "completed_jobs": batch.completed_jobs,
                    "failed_jobs": batch.failed_jobs,
                })),
                None,
            ),
        };

        WebhookPayload {
            status,
            worker: self.worker_identity.clone(),
            job_id: echo,
            process: ProcessInfo {
                id: batch.batch_id.clone(),
                main_processor: "batch".to_string(),
                started: batch.created_at.to_rfc3339(),
                completed: Some(batch.updated_at.to_rfc3339()),
            },
            data,
            error,
            token,
        }
    }

    /// POST a payload to the webhook endpoint. Non-2xx responses and
    /// transport failures are errors for the caller to log; they never
    /// affect job state.
    #[instrument(skip(self, spec, payload), fields(url = %spec.url))]
    pub async fn post(
        &self,
        spec: &WebhookSpec,
        payload: &WebhookPayload,
    ) -> Result<u16, WebhookError> {
        let mut request = self.client.post(&spec.url).json(payload);
        if let Some(token) = &spec.token {
            request = request
                .bearer_auth(token)
                .header(CALLBACK_TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Webhook delivered");
            return Ok(status.as_u16());
        }

        let excerpt: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(BODY_EXCERPT_LEN)
            .collect();

        Err(WebhookError::Rejected {
            status: status.as_u16(),
            excerpt,
        })
    }

    /// Send the terminal notification for a job, recording the delivery
    /// outcome as a job log entry. A job without a webhook is a quiet no-op.
    #[instrument(skip(self, repo, job), fields(job_id = %job.job_id, status = %job.status))]
    pub async fn notify_job_terminal(&self, repo: &JobRepository, job: &Job) {
        let Some(spec) = job.webhook.clone() else {
            debug!("No webhook configured, skipping notification");
            return;
        };

        let payload = match job.status {
            JobStatus::Completed => self.success_payload(job),
            JobStatus::Failed => self.error_payload(job),
            status => {
                warn!(%status, "Refusing to notify for non-terminal job");
                return;
            }
        };

        let entry = match self.post(&spec, &payload).await {
            Ok(status) => LogEntry::info("Webhook delivered")
                .with_context(json!({"url": spec.url, "status": status})),
            Err(e) => {
                warn!(error = %e, "Webhook delivery failed");
                LogEntry::warning(format!("Webhook delivery failed: {}", e))
                    .with_context(json!({"url": spec.url}))
            }
        };

        if let Err(e) = repo.append_log(&job.job_id, entry).await {
            warn!(error = %e, "Failed to record webhook outcome");
        }
    }

    /// Send the batch-level notification. Outcome is logged; batches carry
    /// no log list of their own.
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id, status = %batch.status))]
    pub async fn notify_batch_terminal(&self, batch: &Batch) {
        let Some(spec) = batch.webhook.clone() else {
            return;
        };

        let payload = self.batch_payload(batch);
        match self.post(&spec, &payload).await {
            Ok(status) => debug!(status, "Batch webhook delivered"),
            Err(e) => warn!(error = %e, "Batch webhook delivery failed"),
        }
    }
}

fn echo_and_token(spec: Option<&WebhookSpec>, fallback_id: &str) -> (String, Option<String>) {
    match spec {
        Some(spec) => (
            spec.job_id_echo
                .clone()
                .unwrap_or_else(|| fallback_id.to_string()),
            spec.token.clone(),
        ),
        None => (fallback_id.to_string(), None),
    }
}
