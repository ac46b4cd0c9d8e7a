// Batch repository implementation
// Batches own their jobs; counters and status are derived from job state and
// never written directly by handlers.

use super::job::{bson_int, JobRepository};
use crate::db::Store;
use crate::errors::{codes, BatchCreateError, RepositoryError};
use crate::models::{
    Batch, BatchCounts, BatchSpec, BatchStatus, Job, JobError, JobSpec, JobStatus,
};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use tracing::{info, instrument, warn};

/// Repository for batch-related store operations
pub struct BatchRepository {
    store: Store,
}

/// Filter for querying batches. Archived batches are excluded unless asked
/// for explicitly.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub is_active: Option<bool>,
    pub include_archived: bool,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

impl BatchRepository {
    /// Create a new BatchRepository
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a batch together with its jobs as one logical unit. On partial
    /// failure the already-created documents are removed best-effort and the
    /// error reports the ids so the caller can verify cleanup.
    #[instrument(skip(self, spec, job_specs), fields(job_count = job_specs.len()))]
    pub async fn create_with_jobs(
        &self,
        spec: BatchSpec,
        job_specs: Vec<JobSpec>,
    ) -> Result<(Batch, Vec<String>), BatchCreateError> {
        let batch = Batch::new(spec, job_specs.len() as i64);

        self.store
            .batches()
            .insert_one(&batch, None)
            .await
            .map_err(|e| BatchCreateError {
                batch_id: batch.batch_id.clone(),
                created_job_ids: Vec::new(),
                source: e.into(),
            })?;

        let mut created = Vec::with_capacity(job_specs.len());
        for mut job_spec in job_specs {
            job_spec.batch_id = Some(batch.batch_id.clone());
            let job = Job::from_spec(job_spec);

            if let Err(e) = self.store.jobs().insert_one(&job, None).await {
                self.compensate_partial_create(&batch.batch_id, &created)
                    .await;
                return Err(BatchCreateError {
                    batch_id: batch.batch_id.clone(),
                    created_job_ids: created,
                    source: e.into(),
                });
            }
            created.push(job.job_id);
        }

        info!(batch_id = %batch.batch_id, jobs = created.len(), "Batch created");
        Ok((batch, created))
    }

    /// Best-effort removal of the documents created before a batch insert
    /// failed midway.
    async fn compensate_partial_create(&self, batch_id: &str, job_ids: &[String]) {
        if !job_ids.is_empty() {
            if let Err(e) = self
                .store
                .jobs()
                .delete_many(doc! {"_id": {"$in": job_ids}}, None)
                .await
            {
                warn!(batch_id, error = %e, "Failed to clean up jobs of aborted batch");
            }
        }
        if let Err(e) = self
            .store
            .batches()
            .delete_one(doc! {"_id": batch_id}, None)
            .await
        {
            warn!(batch_id, error = %e, "Failed to clean up aborted batch");
        }
    }

    /// Find a batch by id with counters and status recomputed from the
    /// current job states.
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, batch_id: &str) -> Result<Option<Batch>, RepositoryError> {
        let batch = self
            .store
            .batches()
            .find_one(doc! {"_id": batch_id}, None)
            .await?;

        match batch {
            Some(mut batch) => {
                let counts = self.job_counts(batch_id).await?;
                apply_counts(&mut batch, counts);
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    pub async fn get(&self, batch_id: &str) -> Result<Batch, RepositoryError> {
        self.find_by_id(batch_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("Batch not found: {}", batch_id)))
    }

    /// Recompute the derived counters from job state and persist them.
    /// Invoked after every terminal job change of a batched job, so cached
    /// counters and the read-time recomputation always agree.
    #[instrument(skip(self))]
    pub async fn refresh(&self, batch_id: &str) -> Result<Batch, RepositoryError> {
        let counts = self.job_counts(batch_id).await?;
        let status = counts.derive_status();

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .store
            .batches()
            .find_one_and_update(
                doc! {"_id": batch_id},
                doc! {"$set": {
                    "pending_jobs": counts.pending,
                    "processing_jobs": counts.processing,
                    "completed_jobs": counts.completed,
                    "failed_jobs": counts.failed,
                    "status": status.to_string(),
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
                options,
            )
            .await?;

        updated.ok_or_else(|| RepositoryError::NotFound(format!("Batch not found: {}", batch_id)))
    }

    /// Find batches with filtering and pagination
    #[instrument(skip(self))]
    pub async fn find_with_filter(
        &self,
        filter: BatchFilter,
    ) -> Result<Vec<Batch>, RepositoryError> {
        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", status.to_string());
        }
        if let Some(is_active) = filter.is_active {
            query.insert("is_active", is_active);
        }
        if !filter.include_archived {
            query.insert("archived", false);
        }

        let options = FindOptions::builder()
            .sort(doc! {"created_at": -1})
            .limit(filter.limit)
            .skip(filter.skip)
            .build();

        let batches = self
            .store
            .batches()
            .find(query, options)
            .await?
            .try_collect()
            .await?;

        Ok(batches)
    }

    /// Hide a batch from default listings; data is retained
    #[instrument(skip(self))]
    pub async fn archive(&self, batch_id: &str) -> Result<(), RepositoryError> {
        let result = self
            .store
            .batches()
            .update_one(
                doc! {"_id": batch_id},
                doc! {"$set": {
                    "archived": true,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(RepositoryError::NotFound(format!(
                "Batch not found: {}",
                batch_id
            )));
        }

        info!(batch_id, "Batch archived");
        Ok(())
    }

    /// Flip `is_active`. Inactive batches gate dispatch of their pending jobs.
    #[instrument(skip(self))]
    pub async fn toggle_active(&self, batch_id: &str) -> Result<Batch, RepositoryError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .store
            .batches()
            .find_one_and_update(
                doc! {"_id": batch_id},
                vec![doc! {"$set": {
                    "is_active": {"$not": "$is_active"},
                    "updated_at": "$$NOW",
                }}],
                options,
            )
            .await?;

        match updated {
            Some(batch) => {
                info!(batch_id, is_active = batch.is_active, "Batch active flag toggled");
                Ok(batch)
            }
            None => Err(RepositoryError::NotFound(format!(
                "Batch not found: {}",
                batch_id
            ))),
        }
    }

    /// Ids of inactive batches, used to filter dispatch candidates
    pub async fn inactive_ids(&self) -> Result<Vec<String>, RepositoryError> {
        let ids = self
            .store
            .batches()
            .distinct("_id", doc! {"is_active": false}, None)
            .await?;

        Ok(ids
            .into_iter()
            .filter_map(|b| b.as_str().map(str::to_string))
            .collect())
    }

    /// Emergency stop: fail the pending jobs of every active batch, then
    /// deactivate the batches and refresh their derived state. In-flight
    /// jobs are not cancelled. Returns the number of jobs failed.
    #[instrument(skip(self, job_repo))]
    pub async fn fail_all_active(
        &self,
        job_repo: &JobRepository,
    ) -> Result<u64, RepositoryError> {
        let active_ids: Vec<String> = self
            .store
            .batches()
            .distinct("_id", doc! {"is_active": true}, None)
            .await?
            .into_iter()
            .filter_map(|b| b.as_str().map(str::to_string))
            .collect();

        if active_ids.is_empty() {
            return Ok(0);
        }

        let error = JobError::new(codes::ADMIN_FAILED, "Batch failed by emergency stop");
        let failed = job_repo
            .fail_pending_in_batches(&active_ids, &error)
            .await?;

        self.store
            .batches()
            .update_many(
                doc! {"_id": {"$in": &active_ids}},
                doc! {"$set": {
                    "is_active": false,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;

        for batch_id in &active_ids {
            if let Err(e) = self.refresh(batch_id).await {
                warn!(batch_id, error = %e, "Failed to refresh batch after emergency stop");
            }
        }

        warn!(batches = active_ids.len(), jobs_failed = failed, "Emergency stop executed");
        Ok(failed)
    }

    /// Claim the right to send the batch-level webhook. The conditional
    /// update on `notified_at` makes the send exactly-once even when several
    /// workers finalize jobs of the same batch concurrently.
    #[instrument(skip(self))]
    pub async fn try_mark_notified(&self, batch_id: &str) -> Result<bool, RepositoryError> {
        let terminal = [
            BatchStatus::Completed.to_string(),
            BatchStatus::Failed.to_string(),
            BatchStatus::Partial.to_string(),
        ];

        let result = self
            .store
            .batches()
            .update_one(
                doc! {
                    "_id": batch_id,
                    "notified_at": bson::Bson::Null,
                    "status": {"$in": &terminal[..]},
                },
                doc! {"$set": {
                    "notified_at": bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;

        Ok(result.modified_count > 0)
    }

    /// Delete a terminal batch and the jobs it owns
    #[instrument(skip(self))]
    pub async fn delete(&self, batch_id: &str) -> Result<(), RepositoryError> {
        let batch = self.get(batch_id).await?;
        if !batch.status.is_terminal() {
            return Err(RepositoryError::NotTerminal(batch_id.to_string()));
        }

        self.store
            .jobs()
            .delete_many(doc! {"batch_id": batch_id}, None)
            .await?;
        self.store
            .batches()
            .delete_one(doc! {"_id": batch_id}, None)
            .await?;

        info!(batch_id, "Batch and owned jobs deleted");
        Ok(())
    }

    /// Aggregate per-status job counts for one batch
    async fn job_counts(&self, batch_id: &str) -> Result<BatchCounts, RepositoryError> {
        let pipeline = vec![
            doc! {"$match": {"batch_id": batch_id}},
            doc! {"$group": {"_id": "$status", "count": {"$sum": 1}}},
        ];

        let mut cursor = self.store.jobs().aggregate(pipeline, None).await?;
        let mut counts = BatchCounts::default();

        while let Some(group) = cursor.try_next().await? {
            let count = bson_int(group.get("count"));
            match group.get_str("_id").unwrap_or_default().parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = count,
                Ok(JobStatus::Processing) => counts.processing = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Err(e) => warn!(batch_id, error = %e, "Unknown job status in batch accounting"),
            }
        }

        Ok(counts)
    }
}

fn apply_counts(batch: &mut Batch, counts: BatchCounts) {
    batch.pending_jobs = counts.pending;
    batch.processing_jobs = counts.processing;
    batch.completed_jobs = counts.completed;
    batch.failed_jobs = counts.failed;
    batch.status = counts.derive_status();
}
