use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Helper module for optional timestamps stored as BSON datetimes. The
// required-timestamp case is covered by the driver's serde helpers; the
// optional case needs a hand-rolled wrapper.
pub(crate) mod opt_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<bson::DateTime>::deserialize(deserializer)?;
        Ok(value.map(|dt| dt.to_chrono()))
    }
}

use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;

// ============================================================================
// Job Models
// ============================================================================

/// Job represents a single unit of asynchronous work with durable state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "opt_bson_datetime")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_bson_datetime")]
    pub completed_at: Option<DateTime<Utc>>,
    pub parameters: JobParameters,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<JobResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
}

impl Job {
    /// Create a new pending job from an enqueue spec
    pub fn from_spec(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            job_type: spec.job_type,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            parameters: spec.parameters,
            progress: JobProgress::default(),
            results: None,
            error: None,
            logs: Vec::new(),
            batch_id: spec.batch_id,
            user_id: spec.user_id,
            job_name: spec.job_name,
            webhook: spec.webhook,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for creating a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    #[serde(default)]
    pub parameters: JobParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// JobStatus is the durable state machine of a job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed transitions: pending -> processing (claim), pending -> failed
    /// (administrative fail), processing -> completed | failed. Terminal
    /// states admit no successor.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Non-terminal statuses from which `next` is reachable, used to build
    /// compare-and-set filters.
    pub fn allowed_predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Processing => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Processing],
            JobStatus::Failed => &[JobStatus::Pending, JobStatus::Processing],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Coarse progress reported by handlers while a job is processing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

impl JobProgress {
    pub fn at(percent: u8, step: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            current_step: Some(step.into()),
            step_index: None,
            total_steps: None,
        }
    }
}

/// Terminal error recorded on a failed job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Append-only log entry attached to a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Parameter / Result Envelopes
// ============================================================================

/// Handler input envelope: typed common fields plus an open `extra` map for
/// type-specific keys. Serialization round-trips unknown keys without loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_archive: Option<bool>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl JobParameters {
    /// Fetch a required string from `extra`
    pub fn require_str(&self, key: &str) -> Result<&str, String> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("missing or empty required parameter '{}'", key))
    }

    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn optional_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }
}

/// Handler output envelope, same typed-common + open shape as parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<AssetRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Reference to a produced artifact; blob lifecycle is external
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRef {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

// ============================================================================
// Webhook Models
// ============================================================================

/// Per-job (or per-batch) webhook destination embedded at enqueue time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Caller-chosen correlation id echoed back as `jobId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id_echo: Option<String>,
}

// ============================================================================
// Batch Models
// ============================================================================

/// Batch is a named set of jobs submitted together; counters and status are
/// derived from its jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "_id")]
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_name: Option<String>,
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub processing_jobs: i64,
    pub pending_jobs: i64,
    pub status: BatchStatus,
    pub is_active: bool,
    pub archived: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
    /// Set exactly once when the batch-level webhook is delivered.
    #[serde(default, with = "opt_bson_datetime")]
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Batch {
    pub fn new(spec: BatchSpec, total_jobs: i64) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4().to_string(),
            batch_name: spec.batch_name,
            total_jobs,
            completed_jobs: 0,
            failed_jobs: 0,
            processing_jobs: 0,
            pending_jobs: total_jobs,
            status: BatchStatus::Pending,
            is_active: true,
            archived: false,
            created_at: now,
            updated_at: now,
            webhook: spec.webhook,
            notified_at: None,
            user_id: spec.user_id,
        }
    }

    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            pending: self.pending_jobs,
            processing: self.processing_jobs,
            completed: self.completed_jobs,
            failed: self.failed_jobs,
        }
    }
}

/// Input for creating a batch
#[derive(Debug, Clone, Default)]
pub struct BatchSpec {
    pub batch_name: Option<String>,
    pub webhook: Option<WebhookSpec>,
    pub user_id: Option<String>,
}

/// BatchStatus is derived from job counters, never set directly by handlers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Partial
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Partial => write!(f, "partial"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "partial" => Ok(BatchStatus::Partial),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// Snapshot of per-status job counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl BatchCounts {
    pub fn sum(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Derive the batch status from the counters:
    /// all terminal and all succeeded -> completed; all terminal and all
    /// failed -> failed; all terminal mixed -> partial; nothing progressed
    /// yet -> pending; otherwise -> processing.
    pub fn derive_status(&self) -> BatchStatus {
        let terminal = self.completed + self.failed;
        if self.pending == 0 && self.processing == 0 && terminal > 0 {
            if self.failed == 0 {
                BatchStatus::Completed
            } else if self.completed == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Partial
            }
        } else if self.processing == 0 && terminal == 0 {
            BatchStatus::Pending
        } else {
            BatchStatus::Processing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_allowed() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_status_transitions_rejected() {
        // Terminal states admit no successor.
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        // No going back and no skipping processing.
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_status_display_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_parameters_round_trip_preserves_extra() {
        let mut extra = Map::new();
        extra.insert(
            "file_source".to_string(),
            json!({"type": "upload", "path": "cache/uploads/abc.pdf"}),
        );
        extra.insert("include_images".to_string(), json!(true));

        let params = JobParameters {
            template: Some("Report".to_string()),
            use_cache: Some(true),
            extra,
            ..Default::default()
        };

        let value = serde_json::to_value(&params).unwrap();
        let back: JobParameters = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_results_round_trip() {
        let mut extra = Map::new();
        extra.insert("page_count".to_string(), json!(12));

        let results = JobResults {
            markdown_content: Some("# Title".to_string()),
            assets: Some(vec![AssetRef {
                name: "page-1.png".to_string(),
                path: "artifacts/page-1.png".to_string(),
                kind: Some("image".to_string()),
            }]),
            extra,
            ..Default::default()
        };

        let value = serde_json::to_value(&results).unwrap();
        let back: JobResults = serde_json::from_value(value).unwrap();
        assert_eq!(back, results);
    }

    #[test]
    fn test_batch_derive_all_completed() {
        let counts = BatchCounts {
            pending: 0,
            processing: 0,
            completed: 4,
            failed: 0,
        };
        assert_eq!(counts.derive_status(), BatchStatus::Completed);
    }

    #[test]
    fn test_batch_derive_all_failed() {
        let counts = BatchCounts {
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 3,
        };
        assert_eq!(counts.derive_status(), BatchStatus::Failed);
    }

    #[test]
    fn test_batch_derive_partial() {
        let counts = BatchCounts {
            pending: 0,
            processing: 0,
            completed: 3,
            failed: 1,
        };
        assert_eq!(counts.derive_status(), BatchStatus::Partial);
    }

    #[test]
    fn test_batch_derive_pending_until_progress() {
        let counts = BatchCounts {
            pending: 5,
            processing: 0,
            completed: 0,
            failed: 0,
        };
        assert_eq!(counts.derive_status(), BatchStatus::Pending);
    }

    #[test]
    fn test_batch_derive_processing_with_remaining_pending() {
        let counts = BatchCounts {
            pending: 2,
            processing: 0,
            completed: 1,
            failed: 1,
        };
        assert_eq!(counts.derive_status(), BatchStatus::Processing);
    }

    #[test]
    fn test_job_from_spec_starts_pending() {
        let job = Job::from_spec(JobSpec {
            job_type: "pdf".to_string(),
            parameters: JobParameters::default(),
            webhook: None,
            user_id: Some("u1".to_string()),
            job_name: None,
            batch_id: None,
        });
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress.percent, 0);
        assert!(job.logs.is_empty());
        assert!(job.results.is_none());
    }

    #[test]
    fn test_progress_at_clamps_percent() {
        let progress = JobProgress::at(250, "late");
        assert_eq!(progress.percent, 100);
    }
}
