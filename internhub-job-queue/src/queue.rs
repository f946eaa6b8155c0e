//! In-process work queue with retry, backoff, trimming and stall detection.
//!
//! The queue holds transient dispatch state only; the job record store is
//! the durable state machine. Items are dispatched FIFO by arrival, retried
//! with exponential backoff after a failed dispatch, and finished items are
//! trimmed so the queue cannot grow without bound.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use internhub_job_store::JobType;

use crate::error::QueueError;

/// Dispatch policy for the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redeliveries after a failed dispatch before the item is parked as
    /// failed. The default of 3 yields backoffs of 5s, 10s and 20s.
    pub max_retries: u32,
    /// First backoff delay; doubles on each subsequent redelivery.
    pub backoff_base: Duration,
    /// An active item that misses this heartbeat window is considered
    /// stalled and becomes eligible for redelivery.
    pub heartbeat_timeout: Duration,
    pub completed_keep: usize,
    pub completed_max_age: Duration,
    pub failed_keep: usize,
    /// Upper bound on pending items; `None` means unbounded.
    pub max_pending: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            completed_keep: 100,
            completed_max_age: Duration::from_secs(24 * 60 * 60),
            failed_keep: 50,
            max_pending: None,
        }
    }
}

impl From<&internhub_config::Config> for QueueConfig {
    fn from(cfg: &internhub_config::Config) -> Self {
        Self {
            max_retries: cfg.queue.max_retries,
            backoff_base: Duration::from_secs(cfg.queue.backoff_base_secs),
            heartbeat_timeout: Duration::from_secs(cfg.queue.heartbeat_secs),
            completed_keep: cfg.queue.completed_keep,
            completed_max_age: Duration::from_secs(cfg.queue.completed_max_age_hours * 60 * 60),
            failed_keep: cfg.queue.failed_keep,
            max_pending: cfg.queue.max_pending,
        }
    }
}

/// Row payload plus the scope metadata a handler needs.
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub rows: Vec<Value>,
    pub institution_id: String,
    pub created_by_id: String,
}

/// Dispatch state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting for a worker (possibly delayed by backoff).
    Pending,
    /// Held by a worker, subject to the heartbeat deadline.
    Active,
    Completed,
    Failed,
}

/// One unit of work as seen by the dispatch mechanism.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub state: ItemState,
    /// Failed dispatches so far.
    pub failures: u32,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Item ids in arrival order (oldest first).
    order: VecDeque<String>,
    items: HashMap<String, QueueItem>,
    paused: bool,
    closed: bool,
}

impl QueueState {
    fn pending_count(&self) -> usize {
        self.items
            .values()
            .filter(|i| i.state == ItemState::Pending)
            .count()
    }

    fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let item = self.items.remove(id);
        if item.is_some() {
            self.order.retain(|other| other != id);
        }
        item
    }
}

/// The work queue.
pub struct JobQueue {
    config: QueueConfig,
    state: RwLock<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: RwLock::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Accept a payload and return the assigned item identifier.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JobPayload,
    ) -> Result<String, QueueError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(max) = self.config.max_pending {
            if state.pending_count() >= max {
                return Err(QueueError::Full);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let item = QueueItem {
            id: id.clone(),
            job_type,
            payload,
            state: ItemState::Pending,
            failures: 0,
            enqueued_at: now,
            available_at: now,
            deadline: None,
            finished_at: None,
            last_error: None,
        };
        state.order.push_back(id.clone());
        state.items.insert(id.clone(), item);
        drop(state);

        info!(item_id = %id, job_type = %job_type, "enqueued item");
        self.notify.notify_one();
        Ok(id)
    }

    /// Stop accepting new items and wake every waiting worker.
    pub async fn close(&self) {
        self.state.write().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Dequeue the oldest dispatchable item, or `None` when nothing is
    /// ready (paused, empty, or all pending items still backing off).
    pub async fn try_dequeue(&self) -> Option<QueueItem> {
        let mut state = self.state.write().await;
        if state.paused {
            return None;
        }
        let now = Utc::now();
        let id = state.order.iter().find(|id| {
            state
                .items
                .get(*id)
                .is_some_and(|i| i.state == ItemState::Pending && i.available_at <= now)
        })?;
        let id = id.clone();
        let deadline = now + to_chrono(self.config.heartbeat_timeout);
        let item = state.items.get_mut(&id)?;
        item.state = ItemState::Active;
        item.deadline = Some(deadline);
        Some(item.clone())
    }

    /// Dequeue, suspending until an item becomes dispatchable. Returns
    /// `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueueItem> {
        loop {
            if let Some(item) = self.try_dequeue().await {
                return Some(item);
            }

            let (closed, next_available) = {
                let state = self.state.read().await;
                // While paused there is nothing to time out on; resume()
                // wakes every waiter.
                let next = if state.paused {
                    None
                } else {
                    state
                        .items
                        .values()
                        .filter(|i| i.state == ItemState::Pending)
                        .map(|i| i.available_at)
                        .min()
                };
                (state.closed, next)
            };
            if closed {
                return None;
            }

            // Wake on a new item / resume, or when the earliest backoff
            // delay elapses.
            let sleep_for = next_available
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Mark an active item finished.
    pub async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        if item.state != ItemState::Active {
            return Err(QueueError::invalid_state(format!(
                "item {id} is not active"
            )));
        }
        item.state = ItemState::Completed;
        item.deadline = None;
        item.finished_at = Some(Utc::now());
        debug!(item_id = %id, "item completed");
        Self::trim_locked(&mut state, &self.config);
        Ok(())
    }

    /// Record a failed dispatch. The item is re-pended with backoff until
    /// `max_retries` is exhausted, then parked as failed.
    pub async fn fail(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        self.fail_locked(&mut state, id, error)
    }

    fn fail_locked(
        &self,
        state: &mut QueueState,
        id: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        let max_retries = self.config.max_retries;
        let backoff_base = self.config.backoff_base;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        if item.state != ItemState::Active {
            return Err(QueueError::invalid_state(format!(
                "item {id} is not active"
            )));
        }
        item.failures += 1;
        item.deadline = None;
        item.last_error = Some(error.to_string());

        if item.failures > max_retries {
            item.state = ItemState::Failed;
            item.finished_at = Some(Utc::now());
            warn!(item_id = %id, failures = item.failures, error, "item failed permanently");
            Self::trim_locked(state, &self.config);
        } else {
            let delay = backoff_base.saturating_mul(1u32 << (item.failures - 1).min(16));
            item.state = ItemState::Pending;
            item.available_at = Utc::now() + to_chrono(delay);
            info!(
                item_id = %id,
                failures = item.failures,
                delay_ms = delay.as_millis() as u64,
                error,
                "item failed; scheduled for redelivery"
            );
        }
        Ok(())
    }

    /// Extend the heartbeat deadline of an active item.
    pub async fn heartbeat(&self, id: &str) -> Result<(), QueueError> {
        let deadline = Utc::now() + to_chrono(self.config.heartbeat_timeout);
        let mut state = self.state.write().await;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        if item.state == ItemState::Active {
            item.deadline = Some(deadline);
        }
        Ok(())
    }

    /// Return active items whose heartbeat deadline has passed to the
    /// pending set (or park them, if out of retries), treating the miss as
    /// a crashed worker. Returns the affected items post-update.
    pub async fn recover_stalled(&self) -> Vec<QueueItem> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let stalled: Vec<String> = state
            .items
            .values()
            .filter(|i| i.state == ItemState::Active && i.deadline.is_some_and(|d| d < now))
            .map(|i| i.id.clone())
            .collect();

        let mut recovered = Vec::with_capacity(stalled.len());
        for id in stalled {
            warn!(item_id = %id, "item stalled: heartbeat deadline exceeded");
            if self
                .fail_locked(&mut state, &id, "stalled: heartbeat deadline exceeded")
                .is_ok()
            {
                if let Some(item) = state.items.get(&id) {
                    recovered.push(item.clone());
                }
            }
        }
        if !recovered.is_empty() {
            self.notify.notify_waiters();
        }
        recovered
    }

    /// Administrative redelivery: reset the item for a fresh round of
    /// attempts. Fails with [`QueueError::ItemNotFound`] once the item has
    /// been trimmed.
    pub async fn retry(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        item.state = ItemState::Pending;
        item.failures = 0;
        item.available_at = Utc::now();
        item.deadline = None;
        item.finished_at = None;
        item.last_error = None;
        drop(state);

        info!(item_id = %id, "item rescheduled by administrative retry");
        self.notify.notify_one();
        Ok(())
    }

    /// Remove an item from the queue without touching the job record.
    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))
    }

    /// Stop dispatching without losing queued items.
    pub async fn pause(&self) {
        self.state.write().await.paused = true;
        info!("queue paused");
    }

    pub async fn resume(&self) {
        self.state.write().await.paused = false;
        info!("queue resumed");
        self.notify.notify_waiters();
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        self.state.read().await.items.get(id).cloned()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.read().await.pending_count()
    }

    /// Drop old finished items: completed beyond the keep count or age,
    /// failed beyond the keep count.
    pub async fn trim(&self) {
        let mut state = self.state.write().await;
        Self::trim_locked(&mut state, &self.config);
    }

    fn trim_locked(state: &mut QueueState, config: &QueueConfig) {
        let age_cutoff = Utc::now() - to_chrono(config.completed_max_age);

        let mut finished: Vec<(String, ItemState, DateTime<Utc>)> = state
            .items
            .values()
            .filter_map(|i| match i.state {
                ItemState::Completed | ItemState::Failed => {
                    Some((i.id.clone(), i.state, i.finished_at.unwrap_or(i.enqueued_at)))
                }
                _ => None,
            })
            .collect();
        // Oldest first, so truncation keeps the most recent.
        finished.sort_by_key(|(_, _, at)| *at);

        let completed: Vec<&(String, ItemState, DateTime<Utc>)> = finished
            .iter()
            .filter(|(_, s, _)| *s == ItemState::Completed)
            .collect();
        let failed: Vec<&(String, ItemState, DateTime<Utc>)> = finished
            .iter()
            .filter(|(_, s, _)| *s == ItemState::Failed)
            .collect();

        let mut doomed: Vec<String> = Vec::new();
        let completed_excess = completed.len().saturating_sub(config.completed_keep);
        for (id, _, at) in completed.iter().map(|t| &**t) {
            if doomed.len() < completed_excess || *at < age_cutoff {
                doomed.push(id.clone());
            }
        }
        let failed_excess = failed.len().saturating_sub(config.failed_keep);
        for (id, _, _) in failed.iter().take(failed_excess).map(|t| &**t) {
            doomed.push(id.clone());
        }

        for id in doomed {
            debug!(item_id = %id, "trimming finished item");
            state.remove(&id);
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JobPayload {
        JobPayload {
            rows: vec![json!({"email": "a@example.com"})],
            institution_id: "inst-1".into(),
            created_by_id: "admin-1".into(),
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_retries: 2,
            backoff_base: Duration::from_millis(40),
            heartbeat_timeout: Duration::from_millis(50),
            completed_keep: 2,
            completed_max_age: Duration::from_secs(3600),
            failed_keep: 1,
            max_pending: None,
        }
    }

    #[tokio::test]
    async fn dispatches_in_arrival_order() {
        let queue = JobQueue::new(QueueConfig::default());
        let first = queue.enqueue(JobType::Users, payload()).await.unwrap();
        let second = queue.enqueue(JobType::Students, payload()).await.unwrap();

        assert_eq!(queue.try_dequeue().await.unwrap().id, first);
        assert_eq!(queue.try_dequeue().await.unwrap().id, second);
        assert!(queue.try_dequeue().await.is_none());
    }

    #[tokio::test]
    async fn pause_stops_dispatch_without_losing_items() {
        let queue = JobQueue::new(QueueConfig::default());
        queue.enqueue(JobType::Users, payload()).await.unwrap();

        queue.pause().await;
        assert!(queue.try_dequeue().await.is_none());
        assert_eq!(queue.pending_len().await, 1);

        queue.resume().await;
        assert!(queue.try_dequeue().await.is_some());
    }

    #[tokio::test]
    async fn failed_dispatch_backs_off_then_redelivers() {
        let queue = JobQueue::new(fast_config());
        let id = queue.enqueue(JobType::Users, payload()).await.unwrap();

        let item = queue.try_dequeue().await.unwrap();
        queue.fail(&item.id, "boom").await.unwrap();

        // Still backing off.
        assert!(queue.try_dequeue().await.is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let item = queue.try_dequeue().await.unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.failures, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_item_as_failed() {
        let queue = JobQueue::new(fast_config());
        let id = queue.enqueue(JobType::Users, payload()).await.unwrap();

        for _ in 0..3 {
            // 1 initial dispatch + 2 redeliveries
            tokio::time::sleep(Duration::from_millis(100)).await;
            let item = queue.try_dequeue().await.unwrap();
            queue.fail(&item.id, "boom").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.try_dequeue().await.is_none());
        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.failures, 3);
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue_and_unblocks_dequeue() {
        let queue = std::sync::Arc::new(JobQueue::new(QueueConfig::default()));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        assert!(waiter.await.unwrap().is_none());
        assert!(matches!(
            queue.enqueue(JobType::Users, payload()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn bounded_queue_reports_full() {
        let config = QueueConfig {
            max_pending: Some(1),
            ..QueueConfig::default()
        };
        let queue = JobQueue::new(config);
        queue.enqueue(JobType::Users, payload()).await.unwrap();
        assert!(matches!(
            queue.enqueue(JobType::Users, payload()).await,
            Err(QueueError::Full)
        ));
    }

    #[tokio::test]
    async fn stalled_item_is_recovered_for_redelivery() {
        let queue = JobQueue::new(fast_config());
        let id = queue.enqueue(JobType::Users, payload()).await.unwrap();
        queue.try_dequeue().await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let recovered = queue.recover_stalled().await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert_eq!(recovered[0].state, ItemState::Pending);
        assert_eq!(recovered[0].failures, 1);
    }

    #[tokio::test]
    async fn heartbeat_defers_stall_detection() {
        let queue = JobQueue::new(fast_config());
        let id = queue.enqueue(JobType::Users, payload()).await.unwrap();
        queue.try_dequeue().await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            queue.heartbeat(&id).await.unwrap();
        }
        assert!(queue.recover_stalled().await.is_empty());
    }

    #[tokio::test]
    async fn trim_drops_finished_items_beyond_keep_counts() {
        let queue = JobQueue::new(fast_config());

        // completed_keep = 2: three completions leave two.
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = queue.enqueue(JobType::Users, payload()).await.unwrap();
            queue.try_dequeue().await.unwrap();
            queue.complete(&id).await.unwrap();
            ids.push(id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(queue.get(&ids[0]).await.is_none(), "oldest trimmed");
        assert!(queue.get(&ids[1]).await.is_some());
        assert!(queue.get(&ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn trim_drops_completed_items_past_max_age() {
        // Keep count is generous; only the age cutoff applies.
        let queue = JobQueue::new(QueueConfig {
            completed_keep: 10,
            completed_max_age: Duration::from_millis(30),
            ..fast_config()
        });

        let old = queue.enqueue(JobType::Users, payload()).await.unwrap();
        queue.try_dequeue().await.unwrap();
        queue.complete(&old).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = queue.enqueue(JobType::Users, payload()).await.unwrap();
        queue.try_dequeue().await.unwrap();
        queue.complete(&fresh).await.unwrap();

        assert!(queue.get(&old).await.is_none(), "aged out");
        assert!(queue.get(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn retry_resets_a_parked_item_and_is_not_found_after_trim() {
        let queue = JobQueue::new(fast_config());
        let id = queue.enqueue(JobType::Users, payload()).await.unwrap();
        queue.try_dequeue().await.unwrap();
        queue.fail(&id, "boom").await.unwrap();

        queue.retry(&id).await.unwrap();
        let item = queue.try_dequeue().await.unwrap();
        assert_eq!(item.failures, 0);
        queue.complete(&id).await.unwrap();

        queue.remove(&id).await.unwrap();
        assert!(matches!(
            queue.retry(&id).await,
            Err(QueueError::ItemNotFound(_))
        ));
    }
}
