//! In-memory job store implementation.
//!
//! Backs tests and embedded deployments. State is an ordered map guarded by
//! a single `RwLock`; all transition methods perform their status check and
//! mutation under the same write guard, which makes them atomic conditional
//! updates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{validate_new_job, JobStore};
use crate::types::{
    BatchOutcome, Job, JobFilter, JobPage, JobStats, JobStatus, NewJob, Scope, progress_percent,
    RECENT_JOBS,
};

/// Internal storage optimized for both insertion-order iteration and lookup
/// by id or queue reference.
#[derive(Debug, Default)]
struct StoreState {
    /// Job ids in insertion order (oldest first).
    order: VecDeque<Uuid>,
    jobs: HashMap<Uuid, Job>,
    by_ref: HashMap<String, Uuid>,
}

impl StoreState {
    fn get_by_ref_mut(&mut self, queue_ref: &str) -> Result<&mut Job, StoreError> {
        let id = self
            .by_ref
            .get(queue_ref)
            .copied()
            .ok_or_else(|| StoreError::not_found(queue_ref))?;
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(queue_ref))
    }

    /// Iterate most recently queued first.
    fn iter_recent(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().rev().filter_map(|id| self.jobs.get(id))
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(job) = self.jobs.remove(&id) {
            self.by_ref.remove(&job.queue_ref);
        }
        self.order.retain(|other| *other != id);
    }
}

/// In-memory [`JobStore`].
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJobStore").finish_non_exhaustive()
    }
}

fn fail_in_place(job: &mut Job, message: &str) {
    let now = Utc::now();
    job.status = JobStatus::Failed;
    job.completed_at = Some(now);
    job.error_message = Some(message.to_string());
    job.retry_count += 1;
    if let Some(started) = job.started_at {
        job.processing_time_ms = Some((now - started).num_milliseconds());
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, spec: NewJob) -> Result<Job, StoreError> {
        validate_new_job(&spec)?;

        let mut state = self.state.write().await;
        if state.by_ref.contains_key(&spec.queue_ref) {
            return Err(StoreError::Validation(format!(
                "queue_ref already in use: {}",
                spec.queue_ref
            )));
        }

        let job = Job {
            id: Uuid::new_v4(),
            queue_ref: spec.queue_ref,
            job_type: spec.job_type,
            status: JobStatus::Queued,
            file_name: spec.file_name,
            original_name: spec.original_name,
            file_size: spec.file_size,
            total_rows: spec.total_rows,
            processed_rows: 0,
            success_count: 0,
            failed_count: 0,
            progress: 0,
            success_report: None,
            error_report: None,
            warnings: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            error_message: None,
            retry_count: 0,
            institution_id: spec.institution_id,
            created_by_id: spec.created_by_id,
        };

        state.by_ref.insert(job.queue_ref.clone(), job.id);
        state.order.push_back(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn reconcile_ref(&self, placeholder: &str, real: &str) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        if state.by_ref.contains_key(real) {
            return Err(StoreError::Validation(format!(
                "queue_ref already in use: {real}"
            )));
        }
        let id = state
            .by_ref
            .remove(placeholder)
            .ok_or_else(|| StoreError::not_found(placeholder))?;
        state.by_ref.insert(real.to_string(), id);
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(placeholder))?;
        job.queue_ref = real.to_string();
        Ok(job.clone())
    }

    async fn mark_started(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if !matches!(job.status, JobStatus::Queued | JobStatus::Failed) {
            return Err(StoreError::invalid_state(format!(
                "cannot start a {} job",
                job.status
            )));
        }
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn mark_completed(
        &self,
        queue_ref: &str,
        outcome: &BatchOutcome,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if job.status != JobStatus::Processing {
            return Err(StoreError::invalid_state(format!(
                "cannot complete a {} job",
                job.status
            )));
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.success_count = outcome.success;
        job.failed_count = outcome.failed;
        job.processed_rows = outcome.success + outcome.failed;
        job.progress = 100;
        job.success_report = Some(outcome.success_records.clone());
        job.error_report = Some(outcome.failed_records.clone());
        job.warnings = Some(outcome.warnings.clone());
        job.completed_at = Some(now);
        if let Some(started) = job.started_at {
            job.processing_time_ms = Some((now - started).num_milliseconds());
        }
        Ok(job.clone())
    }

    async fn mark_failed(&self, queue_ref: &str, message: &str) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if !matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
            return Err(StoreError::invalid_state(format!(
                "cannot fail a {} job",
                job.status
            )));
        }
        fail_in_place(job, message);
        Ok(job.clone())
    }

    async fn update_progress(
        &self,
        queue_ref: &str,
        processed_rows: u32,
        total_rows: u32,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if job.status != JobStatus::Processing {
            debug!(queue_ref, status = %job.status, "ignoring progress update on non-processing job");
            return Ok(job.clone());
        }
        let pct = progress_percent(processed_rows, total_rows);
        job.progress = job.progress.max(pct);
        job.processed_rows = job.processed_rows.max(processed_rows);
        Ok(job.clone())
    }

    async fn cancel(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::invalid_state(
                "only queued jobs can be cancelled",
            ));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn requeue(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let mut state = self.state.write().await;
        let job = state.get_by_ref_mut(queue_ref)?;
        if job.status != JobStatus::Failed {
            return Err(StoreError::invalid_state(
                "only failed jobs can be retried",
            ));
        }
        // retry_count is preserved; the run-specific fields are reset so the
        // re-execution starts from a clean slate.
        job.status = JobStatus::Queued;
        job.started_at = None;
        job.completed_at = None;
        job.processing_time_ms = None;
        job.error_message = None;
        job.progress = 0;
        job.processed_rows = 0;
        job.success_count = 0;
        job.failed_count = 0;
        job.success_report = None;
        job.error_report = None;
        job.warnings = None;
        Ok(job.clone())
    }

    async fn get_by_ref(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let state = self.state.read().await;
        let id = state
            .by_ref
            .get(queue_ref)
            .ok_or_else(|| StoreError::not_found(queue_ref))?;
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(queue_ref))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        let state = self.state.read().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id.to_string()))
    }

    async fn list(
        &self,
        filter: JobFilter,
        page: u64,
        per_page: u64,
    ) -> Result<JobPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let state = self.state.read().await;

        let matching: Vec<&Job> = state.iter_recent().filter(|j| filter.matches(j)).collect();
        let total = matching.len() as u64;
        let total_pages = total.div_ceil(per_page);
        let jobs = matching
            .into_iter()
            .skip(((page - 1) * per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            jobs,
            total,
            page,
            per_page,
            total_pages,
        })
    }

    async fn list_active(&self, scope: Scope) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .iter_recent()
            .filter(|j| {
                matches!(j.status, JobStatus::Queued | JobStatus::Processing)
                    && scope.matches(j)
            })
            .cloned()
            .collect())
    }

    async fn stats(&self, scope: Scope) -> Result<JobStats, StoreError> {
        let state = self.state.read().await;
        let mut stats = JobStats {
            total: 0,
            by_status: HashMap::new(),
            by_type: HashMap::new(),
            recent_jobs: Vec::new(),
        };
        for job in state.iter_recent().filter(|j| scope.matches(j)) {
            stats.total += 1;
            *stats.by_status.entry(job.status).or_insert(0) += 1;
            *stats.by_type.entry(job.job_type).or_insert(0) += 1;
            if stats.recent_jobs.len() < RECENT_JOBS {
                stats.recent_jobs.push(job.clone());
            }
        }
        Ok(stats)
    }

    async fn retention_sweep(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.write().await;
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.status.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff)
            })
            .map(|j| j.id)
            .collect();
        for id in &expired {
            state.remove(*id);
        }
        Ok(expired.len() as u64)
    }

    async fn fail_orphaned(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - older_than;
        let mut state = self.state.write().await;
        let mut failed = 0;
        let orphaned: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Queued && j.has_placeholder_ref() && j.queued_at < cutoff
            })
            .map(|j| j.id)
            .collect();
        for id in orphaned {
            if let Some(job) = state.jobs.get_mut(&id) {
                fail_in_place(job, "orphaned placeholder reference: enqueue never completed");
                failed += 1;
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobType;
    use serde_json::json;

    fn spec(queue_ref: &str) -> NewJob {
        NewJob {
            queue_ref: queue_ref.to_string(),
            job_type: JobType::Users,
            file_name: "upload-1.csv".to_string(),
            original_name: "users.csv".to_string(),
            file_size: 2048,
            total_rows: 10,
            institution_id: "inst-1".to_string(),
            created_by_id: "admin-1".to_string(),
        }
    }

    fn outcome(success: u32, failed: u32) -> BatchOutcome {
        BatchOutcome {
            success,
            failed,
            success_records: json!([]),
            failed_records: json!([{"row": 2, "errors": ["missing email"]}]),
            warnings: json!([]),
        }
    }

    #[tokio::test]
    async fn create_starts_queued_with_zero_counters() {
        let store = MemoryJobStore::new();
        let job = store.create(spec("pending-1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.processed_rows, 0);
        assert_eq!(job.progress, 0);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn create_rejects_missing_fields() {
        let store = MemoryJobStore::new();
        let mut bad = spec("pending-1");
        bad.file_name = String::new();
        assert!(matches!(
            store.create(bad).await,
            Err(StoreError::Validation(_))
        ));

        let mut bad = spec("pending-2");
        bad.total_rows = 0;
        assert!(matches!(
            store.create(bad).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_swaps_reference_once() {
        let store = MemoryJobStore::new();
        store.create(spec("pending-1")).await.unwrap();

        let job = store.reconcile_ref("pending-1", "q-1").await.unwrap();
        assert_eq!(job.queue_ref, "q-1");
        assert!(!job.has_placeholder_ref());

        assert!(store.get_by_ref("pending-1").await.is_err());
        assert!(store.get_by_ref("q-1").await.is_ok());
        assert!(matches!(
            store.reconcile_ref("pending-1", "q-2").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn completed_job_satisfies_count_invariant() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        store.mark_started("q-1").await.unwrap();
        let job = store.mark_completed("q-1", &outcome(7, 3)).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_rows, job.success_count + job.failed_count);
        assert_eq!(job.failed_count, 3);
        assert_eq!(job.progress, 100);
        assert!(job.error_report.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.processing_time_ms.is_some());
    }

    #[tokio::test]
    async fn mark_failed_increments_retry_count() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        store.mark_started("q-1").await.unwrap();
        let job = store.mark_failed("q-1", "database unreachable").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("database unreachable"));

        // A redelivery runs the lifecycle again.
        store.mark_started("q-1").await.unwrap();
        let job = store.mark_failed("q-1", "still unreachable").await.unwrap();
        assert_eq!(job.retry_count, 2);
    }

    #[tokio::test]
    async fn mark_started_rejects_processing_and_terminal_sources() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        store.mark_started("q-1").await.unwrap();
        assert!(matches!(
            store.mark_started("q-1").await,
            Err(StoreError::InvalidState(_))
        ));

        store.mark_completed("q-1", &outcome(10, 0)).await.unwrap();
        assert!(matches!(
            store.mark_started("q-1").await,
            Err(StoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn progress_is_monotone_and_ignored_outside_processing() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();

        // Queued: update is a no-op.
        let job = store.update_progress("q-1", 5, 10).await.unwrap();
        assert_eq!(job.progress, 0);

        store.mark_started("q-1").await.unwrap();
        let job = store.update_progress("q-1", 5, 10).await.unwrap();
        assert_eq!(job.progress, 50);

        // A stale, smaller update cannot move progress backwards.
        let job = store.update_progress("q-1", 3, 10).await.unwrap();
        assert_eq!(job.progress, 50);
        assert_eq!(job.processed_rows, 5);
    }

    #[tokio::test]
    async fn cancel_only_from_queued_and_state_unchanged_on_rejection() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        store.mark_started("q-1").await.unwrap();

        let err = store.cancel("q-1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        let job = store.get_by_ref("q-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        store.create(spec("q-2")).await.unwrap();
        let job = store.cancel("q-2").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn requeue_preserves_retry_count() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        store.mark_started("q-1").await.unwrap();
        store.mark_failed("q-1", "boom").await.unwrap();

        let job = store.requeue("q-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.progress, 0);
        assert!(job.error_message.is_none());

        // Only failed jobs can be retried.
        assert!(matches!(
            store.requeue("q-1").await,
            Err(StoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_and_paginates_recent_first() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            let mut s = spec(&format!("q-{i}"));
            if i % 2 == 0 {
                s.job_type = JobType::Students;
            }
            store.create(s).await.unwrap();
        }

        let page = store
            .list(JobFilter::default(), 1, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.jobs.len(), 2);
        assert_eq!(page.jobs[0].queue_ref, "q-4");

        let filtered = store
            .list(
                JobFilter {
                    job_type: Some(JobType::Students),
                    ..Default::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.total, 3);
    }

    #[tokio::test]
    async fn stats_and_active_respect_scope() {
        let store = MemoryJobStore::new();
        store.create(spec("q-1")).await.unwrap();
        let mut other = spec("q-2");
        other.institution_id = "inst-2".to_string();
        store.create(other).await.unwrap();
        store.mark_started("q-2").await.unwrap();

        let stats = store.stats(Scope::All).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&JobStatus::Queued], 1);
        assert_eq!(stats.by_status[&JobStatus::Processing], 1);

        let scoped = store
            .stats(Scope::Institution("inst-2".to_string()))
            .await
            .unwrap();
        assert_eq!(scoped.total, 1);

        let active = store
            .list_active(Scope::Institution("inst-1".to_string()))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].queue_ref, "q-1");
    }

    #[tokio::test]
    async fn retention_sweep_only_removes_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        store.create(spec("q-old")).await.unwrap();
        store.mark_started("q-old").await.unwrap();
        store.mark_completed("q-old", &outcome(10, 0)).await.unwrap();

        store.create(spec("q-live")).await.unwrap();

        // Backdate the completed job past the cutoff.
        {
            let mut state = store.state.write().await;
            let id = state.by_ref["q-old"];
            let job = state.jobs.get_mut(&id).unwrap();
            job.completed_at = Some(Utc::now() - Duration::days(40));
        }

        let removed = store.retention_sweep(Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_by_ref("q-old").await.is_err());
        assert!(store.get_by_ref("q-live").await.is_ok());
    }

    #[tokio::test]
    async fn fail_orphaned_targets_stale_placeholders_only() {
        let store = MemoryJobStore::new();
        store.create(spec("pending-stale")).await.unwrap();
        store.create(spec("pending-fresh")).await.unwrap();
        store.create(spec("q-reconciled")).await.unwrap();

        {
            let mut state = store.state.write().await;
            let id = state.by_ref["pending-stale"];
            let job = state.jobs.get_mut(&id).unwrap();
            job.queued_at = Utc::now() - Duration::minutes(30);
        }

        let failed = store.fail_orphaned(Duration::minutes(15)).await.unwrap();
        assert_eq!(failed, 1);

        let stale = store.get_by_ref("pending-stale").await.unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert_eq!(stale.retry_count, 1);

        let fresh = store.get_by_ref("pending-fresh").await.unwrap();
        assert_eq!(fresh.status, JobStatus::Queued);
        let reconciled = store.get_by_ref("q-reconciled").await.unwrap();
        assert_eq!(reconciled.status, JobStatus::Queued);
    }
}
