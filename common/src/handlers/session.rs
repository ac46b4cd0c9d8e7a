// Session job handler
// Consumes a conference/meeting session reference, drives the session
// pipeline (download, transcription, chapters, rendering), and persists the
// markdown transcript plus produced assets.

use super::{
    complete, fail_validation, push_progress, ResourceContext, SessionPipeline, SessionRequest,
};
use crate::db::repositories::JobRepository;
use crate::errors::HandlerError;
use crate::models::{Job, JobParameters, JobProgress, JobResults, LogEntry};
use crate::registry::JobHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct SessionHandler;

#[async_trait]
impl JobHandler for SessionHandler {
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

        let _ = repo
            .append_log(
                &job.job_id,
                LogEntry::info(format!(
                    "Processing session '{}' of event '{}'",
                    request.session, request.event
                )),
            )
            .await;
        push_progress(&repo, &job.job_id, JobProgress::at(25, "processing session")).await;

        let output = resources.session_pipeline.process(request.clone()).await?;

        push_progress(&repo, &job.job_id, JobProgress::at(90, "persisting results")).await;

        let mut results = JobResults {
            markdown_content: Some(output.markdown),
            transcript: output.transcript,
            chapters: output.chapters,
            archive_path: output.archive_path,
            ..Default::default()
        };
        if !output.assets.is_empty() {
            results.assets = Some(output.assets);
        }
        results
            .extra
            .insert("event".to_string(), Value::String(request.event));
        results
            .extra
            .insert("session".to_string(), Value::String(request.session));

        complete(&repo, &resources, &job, results).await?;

        info!("Session job completed");
        Ok(())
    }
}

/// Narrow the parameter envelope into a session pipeline request
fn parse_request(params: &JobParameters) -> Result<SessionRequest, String> {
    Ok(SessionRequest {
        event: params.require_str("event")?.to_string(),
        session: params.require_str("session")?.to_string(),
        url: params.require_str("url")?.to_string(),
        filename: params.require_str("filename")?.to_string(),
        track: params.require_str("track")?.to_string(),
        day: params.optional_str("day").map(str::to_string),
        starttime: params.optional_str("starttime").map(str::to_string),
        endtime: params.optional_str("endtime").map(str::to_string),
        speakers: params.extra.get("speakers").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        video_url: params.optional_str("video_url").map(str::to_string),
        attachments_url: params.optional_str("attachments_url").map(str::to_string),
        source_language: params.source_language.clone(),
        target_language: params.target_language.clone(),
        use_cache: params.use_cache.unwrap_or(true),
        create_archive: params.create_archive.unwrap_or(false),
    })
}
