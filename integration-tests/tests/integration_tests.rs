// End-to-end scenarios for the job processing core against a live MongoDB.
// Run with a local instance:
//   MONGODB_URI=mongodb://localhost:27017 cargo test --test integration_tests -- --ignored
// Each test uses its own database so the scenarios are isolated.

use async_trait::async_trait;
use common::config::StoreConfig;
use common::db::repositories::{
    BatchFilter, BatchRepository, JobFilter, JobRepository, StatusUpdate,
};
use common::db::Store;
use common::enqueue::EnqueueService;
use common::errors::{codes, PipelineError, RepositoryError};
use common::handlers::{
    PdfHandler, PdfOutput, PdfPipeline, PdfRequest, ResourceContext, SessionHandler,
    SessionOutput, SessionPipeline, SessionRequest,
};
use common::models::{
    BatchSpec, BatchStatus, Job, JobError, JobProgress, JobSpec, JobStatus, LogEntry, WebhookSpec,
};
use common::registry::HandlerRegistry;
use common::webhook::WebhookDispatcher;
use common::worker::{WorkerManager, WorkerManagerConfig};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOG_CAP: u32 = 10;

// ---------------------------------------------------------------------------
// Test pipelines
// ---------------------------------------------------------------------------

/// Pdf pipeline returning fixed markdown immediately
struct StaticPdfPipeline;

#[async_trait]
impl PdfPipeline for StaticPdfPipeline {
    async fn extract(&self, _request: PdfRequest) -> Result<PdfOutput, PipelineError> {
        Ok(PdfOutput {
            markdown: "# Extracted document".to_string(),
            page_assets: Vec::new(),
        })
    }
}

/// Session pipeline that always fails, standing in for an unreachable host
struct FailingSessionPipeline;

#[async_trait]
impl SessionPipeline for FailingSessionPipeline {
    async fn process(&self, _request: SessionRequest) -> Result<SessionOutput, PipelineError> {
        Err(PipelineError::Failed(
            "connection refused by media host".to_string(),
        ))
    }
}

/// Pdf pipeline that records the peak number of concurrent invocations
struct GaugedPdfPipeline {
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl GaugedPdfPipeline {
    fn new(delay: Duration) -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl PdfPipeline for GaugedPdfPipeline {
    async fn extract(&self, _request: PdfRequest) -> Result<PdfOutput, PipelineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(PdfOutput {
            markdown: "# Extracted document".to_string(),
            page_assets: Vec::new(),
        })
    }
}

/// Pdf pipeline that sleeps far beyond any stall timeout without progress
struct SleepyPdfPipeline {
    delay: Duration,
}

#[async_trait]
impl PdfPipeline for SleepyPdfPipeline {
    async fn extract(&self, _request: PdfRequest) -> Result<PdfOutput, PipelineError> {
        sleep(self.delay).await;
        Ok(PdfOutput {
            markdown: "# Too late".to_string(),
            page_assets: Vec::new(),
        })
    }
}

/// Session pipeline that never runs; placeholder for pdf-only scenarios
struct UnusedSessionPipeline;

#[async_trait]
impl SessionPipeline for UnusedSessionPipeline {
    async fn process(&self, _request: SessionRequest) -> Result<SessionOutput, PipelineError> {
        Err(PipelineError::Unavailable("not under test".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestRig {
    job_repo: Arc<JobRepository>,
    batch_repo: Arc<BatchRepository>,
    enqueue: EnqueueService,
    manager: Arc<WorkerManager>,
    manager_task: tokio::task::JoinHandle<()>,
}

impl TestRig {
    async fn shutdown(self) {
        self.manager.stop();
        let _ = self.manager_task.await;
    }
}

async fn setup_store() -> Store {
    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let config = StoreConfig {
        uri,
        database: format!("mediaworks_test_{}", Uuid::new_v4().simple()),
        connect_timeout_seconds: 5,
    };

    let store = Store::connect(&config)
        .await
        .expect("Failed to connect to test store");
    store
        .ensure_indexes()
        .await
        .expect("Failed to create indexes");
    store
}

struct RigOptions {
    max_concurrent: usize,
    poll_interval: Duration,
    stall_timeout: Duration,
    stall_check_every: u32,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(600),
            stall_check_every: 1000,
        }
    }
}

async fn start_rig(
    store: &Store,
    session_pipeline: Arc<dyn SessionPipeline>,
    pdf_pipeline: Arc<dyn PdfPipeline>,
    options: RigOptions,
) -> TestRig {
    let job_repo = Arc::new(JobRepository::new(store.clone(), LOG_CAP));
    let batch_repo = Arc::new(BatchRepository::new(store.clone()));
    let dispatcher = Arc::new(WebhookDispatcher::new(5, "itest-worker").unwrap());

    let resources = Arc::new(ResourceContext {
        session_pipeline,
        pdf_pipeline,
        webhooks: Arc::clone(&dispatcher),
    });

    let mut registry = HandlerRegistry::new();
    registry.register("session", Arc::new(SessionHandler));
    registry.register("pdf", Arc::new(PdfHandler));

    let manager = Arc::new(WorkerManager::new(
        WorkerManagerConfig {
            active: true,
            max_concurrent: options.max_concurrent,
            poll_interval: options.poll_interval,
            stall_timeout: options.stall_timeout,
            stall_check_every: options.stall_check_every,
        },
        Arc::clone(&job_repo),
        Arc::clone(&batch_repo),
        Arc::new(registry),
        resources,
        dispatcher,
    ));

    let manager_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let _ = manager.start().await;
        })
    };

    TestRig {
        enqueue: EnqueueService::new(Arc::clone(&job_repo), Arc::clone(&batch_repo)),
        job_repo,
        batch_repo,
        manager,
        manager_task,
    }
}

fn pdf_spec(webhook: Option<WebhookSpec>) -> JobSpec {
    let mut spec = JobSpec {
        job_type: "pdf".to_string(),
        parameters: Default::default(),
        webhook,
        user_id: None,
        job_name: None,
        batch_id: None,
    };
    spec.parameters.extra.insert(
        "file_source".to_string(),
        json!({"type": "url", "value": "https://host/sample.pdf"}),
    );
    spec.parameters
        .extra
        .insert("extraction_method".to_string(), json!("native"));
    spec
}

fn session_spec(webhook: Option<WebhookSpec>) -> JobSpec {
    let mut spec = JobSpec {
        job_type: "session".to_string(),
        parameters: Default::default(),
        webhook,
        user_id: None,
        job_name: None,
        batch_id: None,
    };
    for (key, value) in [
        ("event", "rustconf"),
        ("session", "opening-keynote"),
        ("url", "https://unreachable.invalid/keynote.mp4"),
        ("filename", "keynote.mp4"),
        ("track", "main"),
    ] {
        spec.parameters.extra.insert(key.to_string(), json!(value));
    }
    spec
}

/// Create a job directly through the repository (webhook URLs from the local
/// mock server are plain http, which the enqueue boundary would refuse).
async fn create_job(repo: &JobRepository, spec: JobSpec) -> String {
    let job = Job::from_spec(spec);
    repo.create(&job).await.expect("Failed to create job");
    job.job_id
}

async fn wait_terminal(repo: &JobRepository, job_id: &str, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = repo
            .find_by_id(job_id)
            .await
            .expect("Failed to fetch job")
            .expect("Job disappeared");
        if job.is_terminal() {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timeout waiting for job {} (status {})", job_id, job.status);
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn mock_webhook(url: &str) -> WebhookSpec {
    WebhookSpec {
        url: url.to_string(),
        token: Some("t1".to_string()),
        job_id_echo: None,
    }
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

/// Single pdf job success: pending -> processing -> completed, results
/// persisted, webhook delivered with auth headers and the canonical body.
#[tokio::test]
#[ignore]
async fn scenario_pdf_job_success_with_webhook() {
    let store = setup_store().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer t1"))
        .and(header("X-Callback-Token", "t1"))
        .and(body_partial_json(json!({"status": "completed"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    let job_id = create_job(&rig.job_repo, pdf_spec(Some(mock_webhook(&server.uri())))).await;
    let job = wait_terminal(&rig.job_repo, &job_id, Duration::from_secs(10)).await;

    assert_eq!(job.status, JobStatus::Completed);
    let results = job.results.expect("completed job must carry results");
    assert!(!results.markdown_content.unwrap().is_empty());
    assert_eq!(job.progress.percent, 100);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    // Delivery outcome is recorded in the job log (written just after the
    // terminal transition we waited on).
    sleep(Duration::from_millis(500)).await;
    let job = rig.job_repo.get(&job_id).await.unwrap();
    assert!(job
        .logs
        .iter()
        .any(|entry| entry.message.contains("Webhook delivered")));

    rig.shutdown().await;
}

/// Session handler whose pipeline fails: terminal failed with
/// HANDLER_EXCEPTION and the canonical error webhook.
#[tokio::test]
#[ignore]
async fn scenario_session_handler_exception() {
    let store = setup_store().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "status": "error",
            "data": null,
            "error": {"code": codes::HANDLER_EXCEPTION},
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rig = start_rig(
        &store,
        Arc::new(FailingSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    let job_id = create_job(
        &rig.job_repo,
        session_spec(Some(mock_webhook(&server.uri()))),
    )
    .await;
    let job = wait_terminal(&rig.job_repo, &job_id, Duration::from_secs(10)).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("failed job must carry an error");
    assert_eq!(error.code, codes::HANDLER_EXCEPTION);
    assert!(error.message.contains("connection refused"));
    assert!(job.results.is_none());

    rig.shutdown().await;
}

/// Unknown job type: terminal failed with UNKNOWN_JOB_TYPE, webhook sent.
#[tokio::test]
#[ignore]
async fn scenario_unknown_job_type() {
    let store = setup_store().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "status": "error",
            "error": {"code": codes::UNKNOWN_JOB_TYPE},
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    let mut spec = pdf_spec(Some(mock_webhook(&server.uri())));
    spec.job_type = "zzz-unknown".to_string();
    let job_id = create_job(&rig.job_repo, spec).await;
    let job = wait_terminal(&rig.job_repo, &job_id, Duration::from_secs(10)).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, codes::UNKNOWN_JOB_TYPE);

    rig.shutdown().await;
}

/// Concurrency ceiling: with max_concurrent=3 and 10 queued jobs, no more
/// than 3 run at once and all reach a terminal state.
#[tokio::test]
#[ignore]
async fn scenario_concurrency_ceiling() {
    let store = setup_store().await;
    let pipeline = Arc::new(GaugedPdfPipeline::new(Duration::from_millis(400)));
    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::clone(&pipeline) as Arc<dyn PdfPipeline>,
        RigOptions {
            max_concurrent: 3,
            ..Default::default()
        },
    )
    .await;

    let mut job_ids = Vec::new();
    for _ in 0..10 {
        job_ids.push(create_job(&rig.job_repo, pdf_spec(None)).await);
    }

    for job_id in &job_ids {
        let job = wait_terminal(&rig.job_repo, job_id, Duration::from_secs(30)).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    let peak = pipeline.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "observed {} concurrent workers", peak);
    assert!(peak > 0);

    rig.shutdown().await;
}

/// Stall recovery: a handler sleeping far beyond the stall timeout is reset
/// to failed with STALLED within the timeout plus one sweep cycle.
#[tokio::test]
#[ignore]
async fn scenario_stall_recovery() {
    let store = setup_store().await;
    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(SleepyPdfPipeline {
            delay: Duration::from_secs(8),
        }),
        RigOptions {
            poll_interval: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(2),
            stall_check_every: 2,
            ..Default::default()
        },
    )
    .await;

    let job_id = create_job(&rig.job_repo, pdf_spec(None)).await;
    let job = wait_terminal(&rig.job_repo, &job_id, Duration::from_secs(15)).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, codes::STALLED);
    assert!(job
        .logs
        .iter()
        .any(|entry| entry.message.contains("notification skipped")));

    rig.shutdown().await;
}

/// Batch with a partial failure: 3 valid pdf jobs and one unknown type end
/// as a `partial` batch with correct counters.
#[tokio::test]
#[ignore]
async fn scenario_batch_partial_failure() {
    let store = setup_store().await;
    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    let mut jobs = vec![pdf_spec(None), pdf_spec(None), pdf_spec(None)];
    let mut unknown = pdf_spec(None);
    unknown.job_type = "zzz-unknown".to_string();
    jobs.push(unknown);

    let receipt = rig
        .enqueue
        .enqueue_batch(BatchSpec::default(), jobs)
        .await
        .expect("Failed to enqueue batch");
    assert_eq!(receipt.job_ids.len(), 4);

    for job_id in &receipt.job_ids {
        wait_terminal(&rig.job_repo, job_id, Duration::from_secs(15)).await;
    }

    // Derived accounting settles with the last finalizer.
    sleep(Duration::from_millis(500)).await;
    let batch = rig.batch_repo.get(&receipt.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Partial);
    assert_eq!(batch.total_jobs, 4);
    assert_eq!(batch.completed_jobs, 3);
    assert_eq!(batch.failed_jobs, 1);
    assert_eq!(batch.counts().sum(), batch.total_jobs);

    rig.shutdown().await;
}

/// The batch webhook fires exactly once even though several workers
/// finalize jobs of the same batch.
#[tokio::test]
#[ignore]
async fn scenario_batch_webhook_fires_once() {
    let store = setup_store().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "status": "completed",
            "process": {"main_processor": "batch"},
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    let spec = BatchSpec {
        batch_name: Some("webhook-once".to_string()),
        webhook: Some(mock_webhook(&server.uri())),
        user_id: None,
    };
    let (batch, job_ids) = {
        let receipt = rig
            .enqueue
            .enqueue_batch(spec, vec![pdf_spec(None), pdf_spec(None), pdf_spec(None)])
            .await
            .unwrap();
        (receipt.batch_id, receipt.job_ids)
    };

    for job_id in &job_ids {
        wait_terminal(&rig.job_repo, job_id, Duration::from_secs(15)).await;
    }
    sleep(Duration::from_millis(500)).await;

    let batch = rig.batch_repo.get(&batch).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert!(batch.notified_at.is_some());

    rig.shutdown().await;
}

// ---------------------------------------------------------------------------
// Repository behaviors
// ---------------------------------------------------------------------------

/// A pending job can be claimed exactly once.
#[tokio::test]
#[ignore]
async fn test_no_double_claim() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let job_id = create_job(&repo, pdf_spec(None)).await;

    let first = repo.claim(&job_id).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first.unwrap().status, JobStatus::Processing);

    let second = repo.claim(&job_id).await.unwrap();
    assert!(second.is_none());
}

/// Terminal jobs admit no further status, results, or error mutations.
#[tokio::test]
#[ignore]
async fn test_terminal_jobs_are_immutable() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let job_id = create_job(&repo, pdf_spec(None)).await;
    repo.claim(&job_id).await.unwrap().unwrap();
    repo.update_status(&job_id, JobStatus::Completed, StatusUpdate::default())
        .await
        .unwrap();

    for next in [
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        let err = repo
            .update_status(&job_id, next, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));
    }

    // Progress writes on a terminal job are silent no-ops.
    repo.update_progress(&job_id, JobProgress::at(10, "late"))
        .await
        .unwrap();
    let job = repo.get(&job_id).await.unwrap();
    assert_eq!(job.progress.percent, 100);
}

/// Processing jobs cannot be moved back to pending, and pending jobs cannot
/// skip straight to completed.
#[tokio::test]
#[ignore]
async fn test_rejected_transitions() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let job_id = create_job(&repo, pdf_spec(None)).await;
    let err = repo
        .update_status(&job_id, JobStatus::Completed, StatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidTransition { .. }));

    let missing = repo
        .update_status("no-such-job", JobStatus::Failed, StatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, RepositoryError::NotFound(_)));
}

/// Progress percent is monotone non-decreasing while processing.
#[tokio::test]
#[ignore]
async fn test_progress_is_monotonic() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let job_id = create_job(&repo, pdf_spec(None)).await;
    repo.claim(&job_id).await.unwrap().unwrap();

    repo.update_progress(&job_id, JobProgress::at(60, "mid"))
        .await
        .unwrap();
    repo.update_progress(&job_id, JobProgress::at(30, "regress"))
        .await
        .unwrap();

    let job = repo.get(&job_id).await.unwrap();
    assert_eq!(job.progress.percent, 60);
    assert_eq!(job.progress.current_step.as_deref(), Some("mid"));
}

/// Concurrent log appends both land; exceeding the cap drops the oldest half.
#[tokio::test]
#[ignore]
async fn test_log_append_and_compaction() {
    let store = setup_store().await;
    let repo = Arc::new(JobRepository::new(store.clone(), LOG_CAP));

    let job_id = create_job(&repo, pdf_spec(None)).await;

    let first = {
        let repo = Arc::clone(&repo);
        let job_id = job_id.clone();
        tokio::spawn(async move { repo.append_log(&job_id, LogEntry::info("left")).await })
    };
    let second = {
        let repo = Arc::clone(&repo);
        let job_id = job_id.clone();
        tokio::spawn(async move { repo.append_log(&job_id, LogEntry::info("right")).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let job = repo.get(&job_id).await.unwrap();
    assert_eq!(job.logs.len(), 2);

    // Push past the cap. The 11th append exceeds it and compacts down to
    // the newest 5 entries; the 12th lands on top of those.
    for index in 0..(LOG_CAP as usize) {
        repo.append_log(&job_id, LogEntry::info(format!("entry-{}", index)))
            .await
            .unwrap();
    }
    let job = repo.get(&job_id).await.unwrap();
    assert_eq!(job.logs.len(), (LOG_CAP / 2 + 1) as usize);
    // The oldest entries are gone, the newest survives.
    assert!(job.logs.iter().all(|entry| entry.message != "left"));
    assert!(job
        .logs
        .last()
        .unwrap()
        .message
        .contains(&format!("entry-{}", LOG_CAP - 1)));
}

/// Jobs of an inactive batch are not dispatched; reactivating releases them.
#[tokio::test]
#[ignore]
async fn test_inactive_batch_gates_dispatch() {
    let store = setup_store().await;

    // Enqueue and deactivate before any worker is running so the job cannot
    // be claimed in the gap.
    let job_repo = Arc::new(JobRepository::new(store.clone(), LOG_CAP));
    let batch_repo = Arc::new(BatchRepository::new(store.clone()));
    let enqueue = EnqueueService::new(Arc::clone(&job_repo), Arc::clone(&batch_repo));
    let receipt = enqueue
        .enqueue_batch(BatchSpec::default(), vec![pdf_spec(None)])
        .await
        .unwrap();
    let batch = batch_repo.toggle_active(&receipt.batch_id).await.unwrap();
    assert!(!batch.is_active);

    let rig = start_rig(
        &store,
        Arc::new(UnusedSessionPipeline),
        Arc::new(StaticPdfPipeline),
        RigOptions::default(),
    )
    .await;

    // Give the manager a few poll cycles; the job must stay pending.
    sleep(Duration::from_secs(2)).await;
    let job = rig.job_repo.get(&receipt.job_ids[0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let batch = rig.batch_repo.toggle_active(&receipt.batch_id).await.unwrap();
    assert!(batch.is_active);
    let job = wait_terminal(&rig.job_repo, &receipt.job_ids[0], Duration::from_secs(10)).await;
    assert_eq!(job.status, JobStatus::Completed);

    rig.shutdown().await;
}

/// Archived batches disappear from default listings but keep their data.
#[tokio::test]
#[ignore]
async fn test_archive_hides_batch_from_default_listing() {
    let store = setup_store().await;
    let job_repo = Arc::new(JobRepository::new(store.clone(), LOG_CAP));
    let batch_repo = Arc::new(BatchRepository::new(store.clone()));
    let enqueue = EnqueueService::new(Arc::clone(&job_repo), Arc::clone(&batch_repo));

    let receipt = enqueue
        .enqueue_batch(BatchSpec::default(), vec![pdf_spec(None)])
        .await
        .unwrap();
    batch_repo.archive(&receipt.batch_id).await.unwrap();

    let visible = batch_repo
        .find_with_filter(BatchFilter::default())
        .await
        .unwrap();
    assert!(visible.iter().all(|b| b.batch_id != receipt.batch_id));

    let all = batch_repo
        .find_with_filter(BatchFilter {
            include_archived: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(all.iter().any(|b| b.batch_id == receipt.batch_id));

    // Data intact.
    let batch = batch_repo.get(&receipt.batch_id).await.unwrap();
    assert_eq!(batch.total_jobs, 1);
}

/// Emergency stop fails pending jobs of active batches and deactivates them.
#[tokio::test]
#[ignore]
async fn test_fail_all_active_batches() {
    let store = setup_store().await;
    let job_repo = Arc::new(JobRepository::new(store.clone(), LOG_CAP));
    let batch_repo = Arc::new(BatchRepository::new(store.clone()));
    let enqueue = EnqueueService::new(Arc::clone(&job_repo), Arc::clone(&batch_repo));

    let receipt = enqueue
        .enqueue_batch(BatchSpec::default(), vec![pdf_spec(None), pdf_spec(None)])
        .await
        .unwrap();

    let failed = batch_repo.fail_all_active(&job_repo).await.unwrap();
    assert_eq!(failed, 2);

    let batch = batch_repo.get(&receipt.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(!batch.is_active);

    for job_id in &receipt.job_ids {
        let job = job_repo.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().code, codes::ADMIN_FAILED);
    }
}

/// Only terminal jobs may be deleted.
#[tokio::test]
#[ignore]
async fn test_delete_terminal_job_only() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let job_id = create_job(&repo, pdf_spec(None)).await;
    let err = repo.delete(&job_id).await.unwrap_err();
    assert!(matches!(err, RepositoryError::NotTerminal(_)));

    repo.claim(&job_id).await.unwrap().unwrap();
    repo.update_status(
        &job_id,
        JobStatus::Failed,
        StatusUpdate::with_error(JobError::new(codes::INTERNAL, "operator fail")),
    )
    .await
    .unwrap();

    repo.delete(&job_id).await.unwrap();
    assert!(repo.find_by_id(&job_id).await.unwrap().is_none());
}

/// Job listings honor status filters, pagination, and FIFO ordering.
#[tokio::test]
#[ignore]
async fn test_list_jobs_filtering_and_order() {
    let store = setup_store().await;
    let repo = JobRepository::new(store.clone(), LOG_CAP);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(create_job(&repo, pdf_spec(None)).await);
        sleep(Duration::from_millis(20)).await;
    }
    repo.claim(&ids[0]).await.unwrap().unwrap();

    let pending = repo
        .find_with_filter(JobFilter {
            status: Some(JobStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    // Oldest first by default.
    assert_eq!(pending[0].job_id, ids[1]);

    let newest = repo
        .find_with_filter(JobFilter {
            newest_first: true,
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].job_id, ids[2]);
}
