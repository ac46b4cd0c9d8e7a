// Command-driven pipeline implementations
// The media algorithms (transcription, OCR, LLM extraction) live in the
// platform's processing executables. Each pipeline invocation writes the
// request as JSON to the command's stdin and parses the result JSON from
// its stdout, under a bounded timeout.

use async_trait::async_trait;
use common::errors::PipelineError;
use common::handlers::{
    PdfOutput, PdfPipeline, PdfRequest, SessionOutput, SessionPipeline, SessionRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Pipeline backed by an external processing executable
pub struct CommandPipeline {
    command: String,
    timeout: Duration,
    workdir: PathBuf,
}

impl CommandPipeline {
    pub fn new(
        command: impl Into<String>,
        timeout: Duration,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            timeout,
            workdir: workdir.into(),
        }
    }

    /// Run the command once: request JSON on stdin, result JSON on stdout
    #[instrument(skip(self, request), fields(command = %self.command))]
    async fn invoke<O: DeserializeOwned>(
        &self,
        request: &impl Serialize,
    ) -> Result<O, PipelineError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| PipelineError::Failed(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Unavailable(format!("{}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Failed(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        debug!(bytes = output.stdout.len(), "Pipeline command produced output");
        serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::InvalidOutput(e.to_string()))
    }
}

#[async_trait]
impl SessionPipeline for CommandPipeline {
    async fn process(&self, request: SessionRequest) -> Result<SessionOutput, PipelineError> {
        self.invoke(&request).await
    }
}

#[async_trait]
impl PdfPipeline for CommandPipeline {
    async fn extract(&self, request: PdfRequest) -> Result<PdfOutput, PipelineError> {
        self.invoke(&request).await
    }
}
