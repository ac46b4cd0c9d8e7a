// Error handling framework

use thiserror::Error;

/// Terminal error codes persisted into `Job.error.code` and mirrored in
/// webhook payloads.
pub mod codes {
    /// Required parameters missing or ill-typed.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    /// No handler registered for the job type.
    pub const UNKNOWN_JOB_TYPE: &str = "UNKNOWN_JOB_TYPE";
    /// Handler raised an error or panicked mid-run.
    pub const HANDLER_EXCEPTION: &str = "HANDLER_EXCEPTION";
    /// Handler returned without reaching a terminal state.
    pub const HANDLER_CONTRACT: &str = "HANDLER_CONTRACT";
    /// Job sat in `processing` beyond the stall timeout.
    pub const STALLED: &str = "STALLED";
    /// Disallowed state change or other repository-level bug.
    pub const INTERNAL: &str = "INTERNAL";
    /// Pending job failed by the emergency stop.
    pub const ADMIN_FAILED: &str = "ADMIN_FAILED";
    /// Batch-level webhook code for fully failed batches.
    pub const BATCH_FAILED: &str = "BATCH_FAILED";
}

/// Validation errors raised at the enqueue boundary
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Webhook URL must use https: {0}")]
    InsecureWebhookUrl(String),

    #[error("Batch must contain at least one job")]
    EmptyBatch,
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

/// Repository errors covering the jobs and batches collections
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Document serialization failed: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Job {0} is not in a terminal state")]
    NotTerminal(String),
}

impl From<mongodb::error::Error> for RepositoryError {
    fn from(err: mongodb::error::Error) -> Self {
        RepositoryError::QueryFailed(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for RepositoryError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<mongodb::bson::de::Error> for RepositoryError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

/// Partial failure while creating a batch with its jobs. Carries the ids
/// created before the failure so the caller can clean up.
#[derive(Error, Debug)]
#[error("Batch creation failed after creating {} job(s): {source}", created_job_ids.len())]
pub struct BatchCreateError {
    pub batch_id: String,
    pub created_job_ids: Vec<String>,
    #[source]
    pub source: RepositoryError,
}

/// Errors surfaced to callers of the enqueue operations
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    BatchCreate(#[from] BatchCreateError),
}

/// Webhook delivery errors. Delivery failures never affect job state.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Failed to build webhook client: {0}")]
    ClientBuild(String),

    #[error("Webhook payload serialization failed: {0}")]
    Serialization(String),

    #[error("Webhook POST failed: {0}")]
    Transport(String),

    #[error("Webhook endpoint returned status {status}: {excerpt}")]
    Rejected { status: u16, excerpt: String },
}

/// Errors surfaced by job handlers to the worker
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Parameter validation failed: {0}")]
    Validation(String),

    #[error("Processing pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Repository operation failed: {0}")]
    Repository(#[from] RepositoryError),
}

/// Errors from the external processing pipelines
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Processor unavailable: {0}")]
    Unavailable(String),

    #[error("Processor failed: {0}")]
    Failed(String),

    #[error("Processor timed out after {0} seconds")]
    Timeout(u64),

    #[error("Processor I/O error: {0}")]
    Io(String),

    #[error("Processor produced invalid output: {0}")]
    InvalidOutput(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}
