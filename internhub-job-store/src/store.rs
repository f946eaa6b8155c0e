//! The `JobStore` trait: durable lifecycle operations on job records.

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{BatchOutcome, Job, JobFilter, JobPage, JobStats, NewJob, Scope};

/// Durable store of job records.
///
/// The store is scope-agnostic: `Scope` is applied as an equality filter on
/// `institution_id`, nothing more. Updates are keyed by the unique
/// `queue_ref`, so no cross-job locking is needed; the status-transition
/// methods are atomic conditional updates so that an administrative cancel
/// cannot race a worker that just started the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new record with status `Queued`, `queued_at` now and all
    /// counters zero. Fails with [`StoreError::Validation`] when required
    /// fields are missing.
    async fn create(&self, spec: NewJob) -> Result<Job, StoreError>;

    /// Replace a placeholder reference with the queue-assigned identifier.
    /// Second phase of submission; the reference never changes afterwards.
    async fn reconcile_ref(&self, placeholder: &str, real: &str) -> Result<Job, StoreError>;

    /// Transition to `Processing` and set `started_at`.
    ///
    /// Valid from `Queued` and, for queue-level redeliveries, from
    /// `Failed`. Any other source state is an [`StoreError::InvalidState`].
    async fn mark_started(&self, queue_ref: &str) -> Result<Job, StoreError>;

    /// Transition to `Completed`: progress 100, `processed_rows =
    /// success + failed`, reports and processing time attached.
    async fn mark_completed(
        &self,
        queue_ref: &str,
        outcome: &BatchOutcome,
    ) -> Result<Job, StoreError>;

    /// Transition to `Failed` with an error message; increments
    /// `retry_count`. Valid from `Queued` (enqueue failure) and
    /// `Processing` (handler failure or stall).
    async fn mark_failed(&self, queue_ref: &str, message: &str) -> Result<Job, StoreError>;

    /// Recompute `progress` from processed/total. Progress never decreases;
    /// only meaningful while `Processing`.
    async fn update_progress(
        &self,
        queue_ref: &str,
        processed_rows: u32,
        total_rows: u32,
    ) -> Result<Job, StoreError>;

    /// Transition to `Cancelled`. Only queued jobs can be cancelled.
    async fn cancel(&self, queue_ref: &str) -> Result<Job, StoreError>;

    /// Administrative retry: `Failed` back to `Queued`, `retry_count`
    /// preserved.
    async fn requeue(&self, queue_ref: &str) -> Result<Job, StoreError>;

    async fn get_by_ref(&self, queue_ref: &str) -> Result<Job, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Paginated listing, most recently queued first. `page` is 1-based.
    async fn list(&self, filter: JobFilter, page: u64, per_page: u64)
        -> Result<JobPage, StoreError>;

    /// All `Queued` and `Processing` jobs within the scope.
    async fn list_active(&self, scope: Scope) -> Result<Vec<Job>, StoreError>;

    async fn stats(&self, scope: Scope) -> Result<JobStats, StoreError>;

    /// Delete terminal jobs whose `completed_at` is older than `max_age`.
    /// Returns the number removed. Active jobs are never touched.
    async fn retention_sweep(&self, max_age: Duration) -> Result<u64, StoreError>;

    /// Fail queued jobs still carrying a `pending-` placeholder reference
    /// older than `older_than`, the residue of a crash between record
    /// creation and enqueue reconciliation. Returns the number failed.
    async fn fail_orphaned(&self, older_than: Duration) -> Result<u64, StoreError>;
}

pub(crate) fn validate_new_job(spec: &NewJob) -> Result<(), StoreError> {
    if spec.queue_ref.is_empty() {
        return Err(StoreError::Validation("queue_ref is required".into()));
    }
    if spec.file_name.is_empty() {
        return Err(StoreError::Validation("file_name is required".into()));
    }
    if spec.total_rows == 0 {
        return Err(StoreError::Validation(
            "total_rows must be greater than zero".into(),
        ));
    }
    if spec.institution_id.is_empty() {
        return Err(StoreError::Validation("institution_id is required".into()));
    }
    if spec.created_by_id.is_empty() {
        return Err(StoreError::Validation("created_by_id is required".into()));
    }
    Ok(())
}
