// Job handlers and the seams to the external media processors
// The processing algorithms (transcription, OCR, LLM extraction) live
// outside this crate; handlers drive them through the pipeline traits below.

pub mod pdf;
pub mod session;

pub use pdf::PdfHandler;
pub use session::SessionHandler;

use crate::db::repositories::{JobRepository, StatusUpdate};
use crate::errors::{codes, HandlerError, PipelineError};
use crate::models::{AssetRef, Job, JobError, JobProgress, JobResults, JobStatus, LogEntry};
use crate::webhook::WebhookDispatcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Shared subsystem context handed to every handler alongside the repository
pub struct ResourceContext {
    pub session_pipeline: Arc<dyn SessionPipeline>,
    pub pdf_pipeline: Arc<dyn PdfPipeline>,
    pub webhooks: Arc<WebhookDispatcher>,
}

/// Best-effort progress write; progress must never block terminal completion
pub(crate) async fn push_progress(repo: &JobRepository, job_id: &str, progress: JobProgress) {
    if let Err(e) = repo.update_progress(job_id, progress).await {
        warn!(job_id, error = %e, "Progress update failed");
    }
}

/// Terminate a job as failed input: VALIDATION_ERROR, error webhook, done.
/// Returning `Ok` afterwards is correct — the handler honored its protocol,
/// the job just carried bad parameters.
pub(crate) async fn fail_validation(
    repo: &Arc<JobRepository>,
    resources: &ResourceContext,
    job: &Job,
    message: String,
) -> Result<(), HandlerError> {
    let _ = repo
        .append_log(&job.job_id, LogEntry::error(message.clone()))
        .await;

    let failed = repo
        .update_status(
            &job.job_id,
            JobStatus::Failed,
            StatusUpdate::with_error(JobError::new(codes::VALIDATION_ERROR, message)),
        )
        .await?;

    resources.webhooks.notify_job_terminal(repo, &failed).await;
    Ok(())
}

/// Persist results, transition to completed, and send the success webhook
pub(crate) async fn complete(
    repo: &Arc<JobRepository>,
    resources: &ResourceContext,
    job: &Job,
    results: JobResults,
) -> Result<(), HandlerError> {
    let update = StatusUpdate {
        results: Some(results),
        progress: Some(JobProgress::at(100, "completed")),
        error: None,
    };
    let completed = repo
        .update_status(&job.job_id, JobStatus::Completed, update)
        .await?;

    resources.webhooks.notify_job_terminal(repo, &completed).await;
    Ok(())
}

/// External processor for `session` jobs: transcription, chapter detection,
/// markdown rendering, optional archive creation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionPipeline: Send + Sync {
    async fn process(&self, request: SessionRequest) -> Result<SessionOutput, PipelineError>;
}

/// External processor for `pdf` jobs: native text extraction, OCR, and LLM
/// vision extraction depending on the requested method.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PdfPipeline: Send + Sync {
    async fn extract(&self, request: PdfRequest) -> Result<PdfOutput, PipelineError>;
}

/// Input to the session pipeline, narrowed from the job parameter envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRequest {
    pub event: String,
    pub session: String,
    pub url: String,
    pub filename: String,
    pub track: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starttime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speakers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    pub use_cache: bool,
    pub create_archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionOutput {
    pub markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Value>,
    #[serde(default)]
    pub assets: Vec<AssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

/// Input to the pdf pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfRequest {
    pub source: PdfSource,
    pub method: ExtractionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    pub use_cache: bool,
    pub include_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PdfOutput {
    pub markdown: String,
    #[serde(default)]
    pub page_assets: Vec<AssetRef>,
}

/// Where the pdf input comes from: a previously uploaded file or a URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PdfSource {
    Upload { path: String },
    Url { value: String },
}

/// The extraction strategies understood by the pdf pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Native,
    Ocr,
    Llm,
    LlmAndNative,
    LlmAndOcr,
    Preview,
    PreviewAndNative,
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(ExtractionMethod::Native),
            "ocr" => Ok(ExtractionMethod::Ocr),
            "llm" => Ok(ExtractionMethod::Llm),
            "llm_and_native" => Ok(ExtractionMethod::LlmAndNative),
            "llm_and_ocr" => Ok(ExtractionMethod::LlmAndOcr),
            "preview" => Ok(ExtractionMethod::Preview),
            "preview_and_native" => Ok(ExtractionMethod::PreviewAndNative),
            _ => Err(format!("Invalid extraction method: {}", s)),
        }
    }
}
