//! Bounded worker pool that drains the queue and drives job records
//! through their lifecycle.
//!
//! Each worker loops on `dequeue`, resolves the registered handler for the
//! item's job type, and records the outcome on the durable store. A single
//! maintenance task redelivers stalled items and trims finished ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use internhub_job_store::{BatchOutcome, Job, JobStore, JobType, StoreError};

use crate::handler::{BatchContext, HandlerRegistry};
use crate::queue::{JobQueue, QueueItem};

/// Pool sizing and outcome policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// When set, a job whose row failure ratio exceeds this fraction is
    /// marked failed instead of completed. `None` treats any mix of row
    /// successes and failures as a completed job with per-row reports.
    pub failure_threshold: Option<f64>,
    /// Interval between stall-recovery and trim passes.
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            failure_threshold: None,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl From<&internhub_config::Config> for PoolConfig {
    fn from(cfg: &internhub_config::Config) -> Self {
        Self {
            concurrency: cfg.workers.concurrency,
            failure_threshold: cfg.workers.failure_threshold,
            maintenance_interval: Duration::from_secs(cfg.workers.maintenance_interval_secs),
        }
    }
}

/// Progress notification broadcast while a job is processing. Mirrors the
/// durable counters on the record; subscribers that lag simply miss events
/// and re-read the record.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub queue_ref: String,
    pub job_type: JobType,
    pub progress: u8,
    pub processed_rows: u32,
    pub total_rows: u32,
}

struct PoolInner {
    queue: Arc<JobQueue>,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: PoolConfig,
    progress: broadcast::Sender<ProgressEvent>,
    shutdown: watch::Sender<bool>,
}

/// A running pool of workers plus its maintenance task.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers and the maintenance loop. The returned pool owns
    /// the task handles; call [`WorkerPool::shutdown`] to drain them.
    pub fn start(
        queue: Arc<JobQueue>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: PoolConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (progress, _) = broadcast::channel(256);
        let inner = Arc::new(PoolInner {
            queue,
            store,
            registry,
            config,
            progress,
            shutdown,
        });

        let mut handles = Vec::with_capacity(inner.config.concurrency + 1);
        for worker_id in 0..inner.config.concurrency {
            let inner = inner.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, inner).await;
            }));
        }
        {
            let inner = inner.clone();
            handles.push(tokio::spawn(async move {
                run_maintenance(inner).await;
            }));
        }
        info!(concurrency = inner.config.concurrency, "worker pool started");
        Self { inner, handles }
    }

    /// Subscribe to progress events. Late subscribers only see events
    /// published after this call.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    /// Close the queue, signal every task and wait for them to finish.
    /// Workers complete their current item before exiting.
    pub async fn shutdown(self) {
        info!("worker pool shutting down");
        let _ = self.inner.shutdown.send(true);
        self.inner.queue.close().await;
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, inner: Arc<PoolInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!(worker_id, "worker started");
    loop {
        let item = tokio::select! {
            item = inner.queue.dequeue() => item,
            _ = shutdown.changed() => {
                // Queue is closing; drain whatever is still dispatchable.
                inner.queue.try_dequeue().await
            }
        };
        let Some(item) = item else {
            break;
        };
        process_item(worker_id, &inner, item).await;
        if *shutdown.borrow() {
            break;
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn process_item(worker_id: usize, inner: &PoolInner, item: QueueItem) {
    let queue_ref = item.id.clone();

    let job = match inner.store.mark_started(&queue_ref).await {
        Ok(job) => job,
        Err(StoreError::InvalidState(reason)) => {
            // Cancelled or already finished; drop the item without running
            // the handler.
            debug!(worker_id, queue_ref, reason, "skipping item for terminal record");
            let _ = inner.queue.complete(&queue_ref).await;
            return;
        }
        Err(StoreError::NotFound(_)) => {
            // The submitting task has enqueued the item but not yet
            // reconciled the record to its id. Re-pend with backoff so the
            // next delivery finds the record instead of dropping the
            // payload.
            warn!(worker_id, queue_ref, "no job record for item yet; backing off");
            let _ = inner
                .queue
                .fail(&queue_ref, "job record not reconciled yet")
                .await;
            return;
        }
        Err(err) => {
            error!(worker_id, queue_ref, error = %err, "store error starting job");
            let _ = inner.queue.fail(&queue_ref, &err.to_string()).await;
            return;
        }
    };

    info!(
        worker_id,
        job_id = %job.id,
        queue_ref,
        job_type = %job.job_type,
        total_rows = job.total_rows,
        "processing job"
    );
    report_progress(inner, &job, 10).await;

    let Some(handler) = inner.registry.get(job.job_type) else {
        let message = format!("no handler registered for job type {}", job.job_type);
        fail_job(inner, &job, &message).await;
        return;
    };

    let ctx = BatchContext {
        institution_id: item.payload.institution_id.clone(),
        created_by_id: item.payload.created_by_id.clone(),
    };
    match handler.handle(&item.payload.rows, &ctx).await {
        Ok(outcome) => finish_job(inner, &job, outcome).await,
        Err(err) => fail_job(inner, &job, &err.to_string()).await,
    }
}

async fn finish_job(inner: &PoolInner, job: &Job, outcome: BatchOutcome) {
    if let Some(threshold) = inner.config.failure_threshold {
        let total = job.total_rows.max(1) as f64;
        let ratio = outcome.failed as f64 / total;
        if ratio > threshold {
            let message = format!(
                "row failure ratio {:.2} exceeds threshold {:.2} ({} of {} rows failed)",
                ratio, threshold, outcome.failed, job.total_rows
            );
            fail_job(inner, job, &message).await;
            return;
        }
    }

    match inner.store.mark_completed(&job.queue_ref, &outcome).await {
        Ok(done) => {
            info!(
                job_id = %done.id,
                queue_ref = %done.queue_ref,
                success = outcome.success,
                failed = outcome.failed,
                "job completed"
            );
            broadcast_progress(inner, &done);
            if let Err(err) = inner.queue.complete(&done.queue_ref).await {
                warn!(queue_ref = %done.queue_ref, error = %err, "queue complete failed");
            }
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "failed to record completion");
            let _ = inner.queue.fail(&job.queue_ref, &err.to_string()).await;
        }
    }
}

async fn fail_job(inner: &PoolInner, job: &Job, message: &str) {
    warn!(job_id = %job.id, queue_ref = %job.queue_ref, message, "job failed");
    if let Err(err) = inner.store.mark_failed(&job.queue_ref, message).await {
        error!(job_id = %job.id, error = %err, "failed to record failure");
    }
    if let Err(err) = inner.queue.fail(&job.queue_ref, message).await {
        warn!(queue_ref = %job.queue_ref, error = %err, "queue fail failed");
    }
}

/// Record intermediate progress on the store, broadcast it, and extend the
/// heartbeat deadline so long-running handlers are not treated as stalled.
async fn report_progress(inner: &PoolInner, job: &Job, percent: u8) {
    let processed = (job.total_rows as u64 * percent as u64 / 100) as u32;
    match inner
        .store
        .update_progress(&job.queue_ref, processed, job.total_rows)
        .await
    {
        Ok(updated) => broadcast_progress(inner, &updated),
        Err(err) => debug!(job_id = %job.id, error = %err, "progress update skipped"),
    }
    let _ = inner.queue.heartbeat(&job.queue_ref).await;
}

fn broadcast_progress(inner: &PoolInner, job: &Job) {
    // No receivers is fine; events are advisory.
    let _ = inner.progress.send(ProgressEvent {
        job_id: job.id,
        queue_ref: job.queue_ref.clone(),
        job_type: job.job_type,
        progress: job.progress,
        processed_rows: job.processed_rows,
        total_rows: job.total_rows,
    });
}

async fn run_maintenance(inner: Arc<PoolInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        for item in inner.queue.recover_stalled().await {
            // Put the record back in a redeliverable state; a fresh
            // dispatch re-enters it via mark_started.
            match inner
                .store
                .mark_failed(&item.id, "processing stalled: heartbeat deadline exceeded")
                .await
            {
                Ok(_) => warn!(queue_ref = %item.id, "stalled job marked failed for redelivery"),
                Err(StoreError::InvalidState(_)) | Err(StoreError::NotFound(_)) => {
                    debug!(queue_ref = %item.id, "stalled item had no running record")
                }
                Err(err) => error!(queue_ref = %item.id, error = %err, "stall recovery failed"),
            }
        }
        inner.queue.trim().await;
    }
    debug!("maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use internhub_job_store::progress_percent;

    #[test]
    fn default_pool_runs_two_workers_and_no_threshold() {
        let config = PoolConfig::default();
        assert_eq!(config.concurrency, 2);
        assert!(config.failure_threshold.is_none());
    }

    #[test]
    fn progress_math_matches_record_semantics() {
        assert_eq!(progress_percent(5, 50), 10);
        let processed = (50u64 * 10 / 100) as u32;
        assert_eq!(processed, 5);
    }
}
