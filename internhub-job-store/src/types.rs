//! Core types for bulk import job records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of batch a job carries. One registered handler exists per type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Users,
    Students,
    Institutions,
    SelfInternships,
}

impl JobType {
    /// Stable string form used for persistence and logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Students => "students",
            Self::Institutions => "institutions",
            Self::SelfInternships => "self_internships",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "users" => Some(Self::Users),
            "students" => Some(Self::Students),
            "institutions" => Some(Self::Institutions),
            "self_internships" => Some(Self::SelfInternships),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job record.
///
/// Terminal states are `Completed`, `Failed` and `Cancelled`; no transition
/// is defined out of `Completed` or `Cancelled`. `Failed` may re-enter
/// `Queued` through an administrative retry, or `Processing` through a
/// queue-level redelivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one submitted batch operation and its outcome.
///
/// The record is the source of truth for job state, independent of the
/// transient queue item identified by `queue_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Queue item identifier. Starts as a locally generated `pending-`
    /// placeholder and is overwritten once the queue accepts the payload;
    /// after that reconciliation it never changes.
    pub queue_ref: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub file_name: String,
    pub original_name: String,
    pub file_size: i64,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub success_count: u32,
    pub failed_count: u32,
    /// 0–100; monotonically non-decreasing while processing, exactly 100
    /// when completed.
    pub progress: u8,
    pub success_report: Option<Value>,
    pub error_report: Option<Value>,
    pub warnings: Option<Value>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub error_message: Option<String>,
    /// Incremented on every transition into `Failed`; preserved across
    /// administrative retries.
    pub retry_count: u32,
    pub institution_id: String,
    pub created_by_id: String,
}

impl Job {
    /// True while the record still carries its pre-reconciliation
    /// placeholder reference.
    pub fn has_placeholder_ref(&self) -> bool {
        self.queue_ref.starts_with(PLACEHOLDER_PREFIX)
    }
}

/// Prefix of locally generated queue references, before reconciliation.
pub const PLACEHOLDER_PREFIX: &str = "pending-";

/// Submission-time specification of a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_ref: String,
    pub job_type: JobType,
    pub file_name: String,
    pub original_name: String,
    pub file_size: i64,
    pub total_rows: u32,
    pub institution_id: String,
    pub created_by_id: String,
}

/// Per-row breakdown returned by a batch handler.
///
/// Row-level failures are data, not subsystem failures: an outcome with
/// `failed > 0` still completes the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: u32,
    pub failed: u32,
    pub success_records: Value,
    pub failed_records: Value,
    pub warnings: Value,
}

impl BatchOutcome {
    pub fn empty() -> Self {
        Self {
            success: 0,
            failed: 0,
            success_records: Value::Array(Vec::new()),
            failed_records: Value::Array(Vec::new()),
            warnings: Value::Array(Vec::new()),
        }
    }
}

/// Ownership scope for read operations: one institution, or unrestricted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Institution(String),
}

impl Scope {
    pub(crate) fn matches(&self, job: &Job) -> bool {
        match self {
            Self::All => true,
            Self::Institution(id) => job.institution_id == *id,
        }
    }
}

/// Filter for paginated listings. All fields are conjunctive.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Inclusive lower bound on `queued_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `queued_at`.
    pub to: Option<DateTime<Utc>>,
    pub scope: Scope,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            job_type: None,
            status: None,
            from: None,
            to: None,
            scope: Scope::All,
        }
    }
}

impl JobFilter {
    pub(crate) fn matches(&self, job: &Job) -> bool {
        if let Some(t) = self.job_type {
            if job.job_type != t {
                return false;
            }
        }
        if let Some(s) = self.status {
            if job.status != s {
                return false;
            }
        }
        if let Some(from) = self.from {
            if job.queued_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if job.queued_at > to {
                return false;
            }
        }
        self.scope.matches(job)
    }
}

/// One page of a filtered listing, most recently queued first.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

/// Number of recent jobs included in [`JobStats`].
pub const RECENT_JOBS: usize = 10;

/// Aggregate view over job records within a scope.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: HashMap<JobStatus, u64>,
    pub by_type: HashMap<JobType, u64>,
    pub recent_jobs: Vec<Job>,
}

/// Compute a 0–100 progress percentage, rounded to the nearest integer.
pub fn progress_percent(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}
