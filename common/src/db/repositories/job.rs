// Job repository implementation
// Owns all durable job state: creation, atomic status transitions, progress
// and log writes, stall recovery, and the claim used by the worker manager.

use crate::db::Store;
use crate::errors::{codes, RepositoryError};
use crate::models::{Job, JobError, JobProgress, JobResults, JobStatus, LogEntry};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Repository for job-related store operations
pub struct JobRepository {
    store: Store,
    log_cap: u32,
}

/// Fields applied together with a status transition in one atomic update
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error: Option<JobError>,
    pub results: Option<JobResults>,
    pub progress: Option<JobProgress>,
}

impl StatusUpdate {
    pub fn with_error(error: JobError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_results(results: JobResults) -> Self {
        Self {
            results: Some(results),
            ..Default::default()
        }
    }
}

/// Filter for querying jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub batch_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    /// Default ordering is `created_at` ascending; administrative views can
    /// flip it.
    pub newest_first: bool,
}

impl JobRepository {
    /// Create a new JobRepository
    ///
    /// `log_cap` bounds the per-job `logs` array; exceeding it drops the
    /// oldest half in a single compaction.
    pub fn new(store: Store, log_cap: u32) -> Self {
        Self { store, log_cap }
    }

    /// Insert a new pending job
    #[instrument(skip(self, job), fields(job_id = %job.job_id, job_type = %job.job_type))]
    pub async fn create(&self, job: &Job) -> Result<(), RepositoryError> {
        self.store.jobs().insert_one(job, None).await?;

        info!("Job created");
        Ok(())
    }

    /// Find a job by id
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        let job = self
            .store
            .jobs()
            .find_one(doc! {"_id": job_id}, None)
            .await?;

        Ok(job)
    }

    /// Find a job by id, failing if it does not exist
    pub async fn get(&self, job_id: &str) -> Result<Job, RepositoryError> {
        self.find_by_id(job_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("Job not found: {}", job_id)))
    }

    /// Find jobs with filtering and pagination
    #[instrument(skip(self))]
    pub async fn find_with_filter(&self, filter: JobFilter) -> Result<Vec<Job>, RepositoryError> {
        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", status.to_string());
        }
        if let Some(batch_id) = filter.batch_id {
            query.insert("batch_id", batch_id);
        }
        if let Some(user_id) = filter.user_id {
            query.insert("user_id", user_id);
        }

        let order = if filter.newest_first { -1 } else { 1 };
        let options = FindOptions::builder()
            .sort(doc! {"created_at": order})
            .limit(filter.limit)
            .skip(filter.skip)
            .build();

        let jobs = self
            .store
            .jobs()
            .find(query, options)
            .await?
            .try_collect()
            .await?;

        Ok(jobs)
    }

    /// Fetch the oldest pending jobs eligible for dispatch, excluding jobs
    /// owned by the given (inactive) batches.
    #[instrument(skip(self, excluded_batch_ids))]
    pub async fn find_claimable(
        &self,
        limit: i64,
        excluded_batch_ids: &[String],
    ) -> Result<Vec<Job>, RepositoryError> {
        let mut query = doc! {"status": JobStatus::Pending.to_string()};
        if !excluded_batch_ids.is_empty() {
            query.insert("batch_id", doc! {"$nin": excluded_batch_ids});
        }

        let options = FindOptions::builder()
            .sort(doc! {"created_at": 1})
            .limit(limit)
            .build();

        let jobs = self
            .store
            .jobs()
            .find(query, options)
            .await?
            .try_collect()
            .await?;

        Ok(jobs)
    }

    /// Atomically claim a pending job for processing. Returns `None` when the
    /// job was already claimed (or no longer exists) — the caller skips it.
    #[instrument(skip(self))]
    pub async fn claim(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        let now = bson::DateTime::from_chrono(Utc::now());

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .store
            .jobs()
            .find_one_and_update(
                doc! {"_id": job_id, "status": JobStatus::Pending.to_string()},
                doc! {"$set": {
                    "status": JobStatus::Processing.to_string(),
                    "started_at": now,
                    "updated_at": now,
                }},
                options,
            )
            .await?;

        Ok(claimed)
    }

    /// Apply a status transition as a single atomic conditional update.
    /// Rejects disallowed transitions with `InvalidTransition`.
    #[instrument(skip(self, update), fields(next = %next))]
    pub async fn update_status(
        &self,
        job_id: &str,
        next: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, RepositoryError> {
        let now = Utc::now();
        let now_bson = bson::DateTime::from_chrono(now);

        let mut set = doc! {
            "status": next.to_string(),
            "updated_at": now_bson,
        };
        if next == JobStatus::Processing {
            set.insert("started_at", now_bson);
        }
        if next.is_terminal() {
            set.insert("completed_at", now_bson);
        }
        if let Some(error) = &update.error {
            set.insert("error", bson::to_bson(error)?);
        }
        if let Some(results) = &update.results {
            set.insert("results", bson::to_bson(results)?);
        }
        if let Some(progress) = &update.progress {
            set.insert("progress", bson::to_bson(progress)?);
        }

        let allowed: Vec<String> = JobStatus::allowed_predecessors(next)
            .iter()
            .map(|s| s.to_string())
            .collect();

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .store
            .jobs()
            .find_one_and_update(
                doc! {"_id": job_id, "status": {"$in": &allowed}},
                doc! {"$set": set},
                options,
            )
            .await?;

        match updated {
            Some(job) => {
                info!(job_id, status = %next, "Job status updated");
                Ok(job)
            }
            // Disambiguate: gone vs in a state that does not admit `next`.
            None => match self.find_by_id(job_id).await? {
                Some(job) => Err(RepositoryError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status.to_string(),
                    to: next.to_string(),
                }),
                None => Err(RepositoryError::NotFound(format!(
                    "Job not found: {}",
                    job_id
                ))),
            },
        }
    }

    /// Partial progress update while the job is processing. A no-op on
    /// terminal jobs and on writes that would move `percent` backwards.
    #[instrument(skip(self, progress), fields(percent = progress.percent))]
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: JobProgress,
    ) -> Result<(), RepositoryError> {
        let result = self
            .store
            .jobs()
            .update_one(
                doc! {
                    "_id": job_id,
                    "status": JobStatus::Processing.to_string(),
                    "progress.percent": {"$lte": progress.percent as i32},
                },
                doc! {"$set": {
                    "progress": bson::to_bson(&progress)?,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;

        if result.matched_count == 0 {
            if self.find_by_id(job_id).await?.is_none() {
                return Err(RepositoryError::NotFound(format!(
                    "Job not found: {}",
                    job_id
                )));
            }
            tracing::debug!(job_id, "Progress update skipped (terminal or regressing)");
        }

        Ok(())
    }

    /// Append a log entry. When the list exceeds the cap, a second atomic
    /// update drops the oldest half.
    #[instrument(skip(self, entry))]
    pub async fn append_log(&self, job_id: &str, entry: LogEntry) -> Result<(), RepositoryError> {
        let result = self
            .store
            .jobs()
            .update_one(
                doc! {"_id": job_id},
                doc! {"$push": {"logs": bson::to_bson(&entry)?}},
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(RepositoryError::NotFound(format!(
                "Job not found: {}",
                job_id
            )));
        }

        // Compaction: only fires when logs[log_cap] exists, i.e. the cap was
        // exceeded. $slice keeps the newest half.
        let keep = (self.log_cap / 2) as i64;
        let probe = format!("logs.{}", self.log_cap);
        let compacted = self
            .store
            .jobs()
            .update_one(
                doc! {"_id": job_id, &probe: {"$exists": true}},
                doc! {"$push": {"logs": {"$each": [], "$slice": -keep}}},
                None,
            )
            .await?;

        if compacted.modified_count > 0 {
            info!(job_id, kept = keep, "Job logs compacted");
        }

        Ok(())
    }

    /// Delete a terminal job. Non-terminal jobs are refused.
    #[instrument(skip(self))]
    pub async fn delete(&self, job_id: &str) -> Result<(), RepositoryError> {
        let terminal = [
            JobStatus::Completed.to_string(),
            JobStatus::Failed.to_string(),
        ];
        let result = self
            .store
            .jobs()
            .delete_one(doc! {"_id": job_id, "status": {"$in": &terminal[..]}}, None)
            .await?;

        if result.deleted_count == 0 {
            return match self.find_by_id(job_id).await? {
                Some(_) => Err(RepositoryError::NotTerminal(job_id.to_string())),
                None => Err(RepositoryError::NotFound(format!(
                    "Job not found: {}",
                    job_id
                ))),
            };
        }

        info!(job_id, "Job deleted");
        Ok(())
    }

    /// Transition jobs stuck in `processing` beyond `max_processing_age` to
    /// `failed` with a STALLED error. Returns the reset jobs so the caller
    /// can deliver their error webhooks; the reset count is the length.
    #[instrument(skip(self))]
    pub async fn reset_stalled(
        &self,
        max_processing_age: Duration,
    ) -> Result<Vec<Job>, RepositoryError> {
        let age = chrono::Duration::from_std(max_processing_age)
            .map_err(|e| RepositoryError::QueryFailed(e.to_string()))?;
        let cutoff = bson::DateTime::from_chrono(Utc::now() - age);

        let stalled: Vec<Job> = self
            .store
            .jobs()
            .find(
                doc! {
                    "status": JobStatus::Processing.to_string(),
                    "started_at": {"$lt": cutoff},
                },
                None,
            )
            .await?
            .try_collect()
            .await?;

        let mut reset = Vec::with_capacity(stalled.len());
        for job in stalled {
            let now = bson::DateTime::from_chrono(Utc::now());
            let error = JobError::new(
                codes::STALLED,
                "Job exceeded the processing stall timeout and was reset",
            );
            let log = LogEntry::error("Stall reset: job forced to failed");

            let options = FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build();

            // Conditional on still being processing: a worker finishing in
            // the meantime wins.
            let updated = self
                .store
                .jobs()
                .find_one_and_update(
                    doc! {"_id": &job.job_id, "status": JobStatus::Processing.to_string()},
                    doc! {
                        "$set": {
                            "status": JobStatus::Failed.to_string(),
                            "error": bson::to_bson(&error)?,
                            "completed_at": now,
                            "updated_at": now,
                        },
                        "$push": {"logs": bson::to_bson(&log)?},
                    },
                    options,
                )
                .await?;

            if let Some(job) = updated {
                warn!(job_id = %job.job_id, "Stalled job reset to failed");
                reset.push(job);
            }
        }

        if !reset.is_empty() {
            info!(count = reset.len(), "Stall reset completed");
        }
        Ok(reset)
    }

    /// Administratively fail the pending jobs of the given batches. Used by
    /// the emergency stop; in-flight jobs are untouched.
    #[instrument(skip(self, batch_ids))]
    pub async fn fail_pending_in_batches(
        &self,
        batch_ids: &[String],
        error: &JobError,
    ) -> Result<u64, RepositoryError> {
        if batch_ids.is_empty() {
            return Ok(0);
        }

        let now = bson::DateTime::from_chrono(Utc::now());
        let result = self
            .store
            .jobs()
            .update_many(
                doc! {
                    "status": JobStatus::Pending.to_string(),
                    "batch_id": {"$in": batch_ids},
                },
                doc! {"$set": {
                    "status": JobStatus::Failed.to_string(),
                    "error": bson::to_bson(error)?,
                    "completed_at": now,
                    "updated_at": now,
                }},
                None,
            )
            .await?;

        Ok(result.modified_count)
    }
}

/// Read an integer out of an aggregation result that may be Int32 or Int64
pub(crate) fn bson_int(value: Option<&Bson>) -> i64 {
    match value {
        Some(Bson::Int32(v)) => *v as i64,
        Some(Bson::Int64(v)) => *v,
        _ => 0,
    }
}
