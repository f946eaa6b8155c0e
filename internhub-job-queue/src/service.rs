//! Submission front door: couples the durable job record store with the
//! transient work queue.
//!
//! A submission is recorded before it is enqueued, under a locally generated
//! placeholder reference, then reconciled to the queue-assigned identifier.
//! If the process dies between those two steps the record survives with its
//! placeholder, and [`QueueService::recover_orphans`] fails it on the next
//! maintenance pass instead of leaving it queued forever.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use internhub_job_store::{
    Job, JobFilter, JobPage, JobStats, JobStatus, JobStore, JobType, NewJob, Scope,
    PLACEHOLDER_PREFIX,
};

use crate::error::QueueError;
use crate::queue::{ItemState, JobPayload, JobQueue};

/// A parsed batch ready for submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub rows: Vec<Value>,
    pub file_name: String,
    pub original_name: String,
    pub file_size: i64,
    pub institution_id: String,
    pub created_by_id: String,
}

/// What a caller gets back from a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub queue_ref: String,
    pub status: JobStatus,
}

/// Coordinates job records and queue items so neither is left dangling.
pub struct QueueService {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Submit a batch: create the durable record first, enqueue second,
    /// then swap the record's placeholder reference for the queue-assigned
    /// identifier. An enqueue failure leaves a `Failed` record behind, so
    /// the submission is never silently lost.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, QueueError> {
        let placeholder = new_placeholder_ref();
        let record = self
            .store
            .create(NewJob {
                queue_ref: placeholder.clone(),
                job_type: request.job_type,
                file_name: request.file_name,
                original_name: request.original_name,
                file_size: request.file_size,
                total_rows: request.rows.len() as u32,
                institution_id: request.institution_id.clone(),
                created_by_id: request.created_by_id.clone(),
            })
            .await?;

        let payload = JobPayload {
            rows: request.rows,
            institution_id: request.institution_id,
            created_by_id: request.created_by_id,
        };
        let item_id = match self.queue.enqueue(request.job_type, payload).await {
            Ok(id) => id,
            Err(err) => {
                warn!(job_id = %record.id, error = %err, "enqueue failed; failing job record");
                self.store
                    .mark_failed(&placeholder, &format!("enqueue failed: {err}"))
                    .await?;
                return Err(err);
            }
        };

        let job = self.store.reconcile_ref(&placeholder, &item_id).await?;
        info!(job_id = %job.id, queue_ref = %job.queue_ref, job_type = %job.job_type, "job submitted");
        Ok(SubmitReceipt {
            job_id: job.id,
            queue_ref: job.queue_ref,
            status: job.status,
        })
    }

    /// Cancel a queued job. The record transition is authoritative; the
    /// queue item is then dropped best-effort (a worker may already hold
    /// it, in which case the record transition would have been rejected).
    pub async fn cancel(&self, queue_ref: &str) -> Result<Job, QueueError> {
        let job = self.store.cancel(queue_ref).await?;
        if let Err(err) = self.queue.remove(queue_ref).await {
            warn!(queue_ref, error = %err, "cancelled job had no queue item");
        }
        info!(job_id = %job.id, queue_ref, "job cancelled");
        Ok(job)
    }

    /// Administrative retry of a failed job. The queue item must still
    /// exist; once trimmed, the batch payload is gone and the job can only
    /// be resubmitted.
    pub async fn retry(&self, queue_ref: &str) -> Result<Job, QueueError> {
        let job = self.store.get_by_ref(queue_ref).await?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(format!(
                "job {} is {}, only failed jobs can be retried",
                job.id, job.status
            )));
        }
        self.queue.retry(queue_ref).await?;
        let job = self.store.requeue(queue_ref).await?;
        info!(job_id = %job.id, queue_ref, retry_count = job.retry_count, "job requeued");
        Ok(job)
    }

    /// Drop a queue item without touching the job record. Callers that
    /// want the record closed out pair this with [`QueueService::cancel`].
    pub async fn remove(&self, queue_ref: &str) -> Result<(), QueueError> {
        self.queue.remove(queue_ref).await?;
        info!(queue_ref, "queue item removed");
        Ok(())
    }

    pub async fn pause(&self) {
        self.queue.pause().await;
    }

    pub async fn resume(&self) {
        self.queue.resume().await;
    }

    pub async fn get(&self, queue_ref: &str) -> Result<Job, QueueError> {
        Ok(self.store.get_by_ref(queue_ref).await?)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Job, QueueError> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn list(
        &self,
        filter: JobFilter,
        page: u64,
        per_page: u64,
    ) -> Result<JobPage, QueueError> {
        Ok(self.store.list(filter, page, per_page).await?)
    }

    pub async fn list_active(&self, scope: Scope) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_active(scope).await?)
    }

    pub async fn stats(&self, scope: Scope) -> Result<JobStats, QueueError> {
        Ok(self.store.stats(scope).await?)
    }

    /// Fail queued records the queue can no longer deliver, once they are
    /// older than `older_than`: records stuck on a placeholder reference
    /// (the process died between create and enqueue), and reconciled
    /// records whose queue item is gone or parked (lost across a restart,
    /// or trimmed). Returns the number failed.
    pub async fn recover_orphans(&self, older_than: chrono::Duration) -> Result<u64, QueueError> {
        let mut failed = self.store.fail_orphaned(older_than).await?;

        let cutoff = Utc::now() - older_than;
        for job in self.store.list_active(Scope::All).await? {
            if job.status != JobStatus::Queued
                || job.has_placeholder_ref()
                || job.queued_at > cutoff
            {
                continue;
            }
            let deliverable = matches!(
                self.queue.get(&job.queue_ref).await.map(|i| i.state),
                Some(ItemState::Pending | ItemState::Active)
            );
            if !deliverable {
                self.store
                    .mark_failed(&job.queue_ref, "queue item lost before dispatch")
                    .await?;
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(count = failed, "failed orphaned job records");
        }
        Ok(failed)
    }

    /// Delete terminal records older than `max_age`.
    pub async fn retention_sweep(&self, max_age: chrono::Duration) -> Result<u64, QueueError> {
        let removed = self.store.retention_sweep(max_age).await?;
        if removed > 0 {
            info!(count = removed, "retention sweep removed old job records");
        }
        Ok(removed)
    }
}

/// Build a fresh placeholder queue reference: unique, and recognisable by
/// prefix so orphan recovery can find abandoned records.
pub fn new_placeholder_ref() -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!(
        "{PLACEHOLDER_PREFIX}{}-{}",
        Utc::now().timestamp_millis(),
        &unique[..8]
    )
}
