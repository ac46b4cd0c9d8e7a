// Pdf job handler
// Narrows the parameter envelope into a pdf extraction request, drives the
// pdf pipeline, and cleans up upload-sourced input files after success.

use super::{
    complete, fail_validation, push_progress, ExtractionMethod, PdfPipeline, PdfRequest, PdfSource,
    ResourceContext,
};
use crate::db::repositories::JobRepository;
use crate::errors::HandlerError;
use crate::models::{Job, JobParameters, JobProgress, JobResults, LogEntry};
use crate::registry::JobHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct PdfHandler;

#[async_trait]
impl JobHandler for PdfHandler {
    #[instrument(skip_all, fields(job_id = %job.job_id))]
    async fn run(
        &self,
        job: Job,
        repo: Arc<JobRepository>,
        resources: Arc<ResourceContext>,
    ) -> Result<(), HandlerError> {
        push_progress(&repo, &job.job_id, JobProgress::at(0, "started")).await;

        let request = match parse_request(&job.parameters) {
            Ok(request) => request,
            Err(message) => return fail_validation(&repo, &resources, &job, message).await,
        };

        push_progress(&repo, &job.job_id, JobProgress::at(40, "extracting")).await;

        let output = resources.pdf_pipeline.extract(request.clone()).await?;

        push_progress(&repo, &job.job_id, JobProgress::at(90, "persisting results")).await;

        let mut results = JobResults {
            markdown_content: Some(output.markdown),
            ..Default::default()
        };
        if !output.page_assets.is_empty() {
            results.assets = Some(output.page_assets);
        }
        if let Ok(method) = serde_json::to_value(request.method) {
            results.extra.insert("extraction_method".to_string(), method);
        }

        complete(&repo, &resources, &job, results).await?;

        // Uploaded inputs are consumed by the job; remove them once the
        // results are durable.
        if let PdfSource::Upload { path } = &request.source {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    let _ = repo
                        .append_log(
                            &job.job_id,
                            LogEntry::info(format!("Deleted uploaded source file {}", path)),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete uploaded source file");
                    let _ = repo
                        .append_log(
                            &job.job_id,
                            LogEntry::warning(format!(
                                "Failed to delete uploaded source file {}: {}",
                                path, e
                            )),
                        )
                        .await;
                }
            }
        }

        info!("Pdf job completed");
        Ok(())
    }
}

/// Narrow the parameter envelope into a pdf pipeline request
fn parse_request(params: &JobParameters) -> Result<PdfRequest, String> {
    let source_value = params
        .extra
        .get("file_source")
        .ok_or_else(|| "missing required parameter 'file_source'".to_string())?;
    let source: PdfSource = serde_json::from_value(source_value.clone())
        .map_err(|e| format!("invalid 'file_source': {}", e))?;

    let method = params
        .require_str("extraction_method")?
        .parse::<ExtractionMethod>()?;

    Ok(PdfRequest {
        source,
        method,
        template: params.template.clone(),
        context: params.context.clone(),
        use_cache: params.use_cache.unwrap_or(true),
        include_images: params.optional_bool("include_images").unwrap_or(false),
    })
}
