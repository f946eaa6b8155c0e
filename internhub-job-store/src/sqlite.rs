//! SQLite-backed job store implementation.
//!
//! Timestamps are persisted as unix epoch milliseconds (INTEGER) so that
//! range comparisons in SQL are exact; report payloads are stored as JSON
//! text. Status transitions are single conditional UPDATE statements, which
//! keeps the cancel-vs-worker race safe without explicit locking.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{validate_new_job, JobStore};
use crate::types::{
    BatchOutcome, Job, JobFilter, JobPage, JobStats, JobStatus, JobType, NewJob, Scope,
    PLACEHOLDER_PREFIX, RECENT_JOBS,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                  TEXT PRIMARY KEY,
    queue_ref           TEXT NOT NULL UNIQUE,
    job_type            TEXT NOT NULL,
    status              TEXT NOT NULL,
    file_name           TEXT NOT NULL,
    original_name       TEXT NOT NULL,
    file_size           INTEGER NOT NULL,
    total_rows          INTEGER NOT NULL,
    processed_rows      INTEGER NOT NULL DEFAULT 0,
    success_count       INTEGER NOT NULL DEFAULT 0,
    failed_count        INTEGER NOT NULL DEFAULT 0,
    progress            INTEGER NOT NULL DEFAULT 0,
    success_report      TEXT,
    error_report        TEXT,
    warnings            TEXT,
    queued_at           INTEGER NOT NULL,
    started_at          INTEGER,
    completed_at        INTEGER,
    processing_time_ms  INTEGER,
    error_message       TEXT,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    institution_id      TEXT NOT NULL,
    created_by_id       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_institution ON jobs (institution_id);
CREATE INDEX IF NOT EXISTS idx_jobs_queued_at ON jobs (queued_at);
"#;

const JOB_COLUMNS: &str = "id, queue_ref, job_type, status, file_name, original_name, \
     file_size, total_rows, processed_rows, success_count, failed_count, progress, \
     success_report, error_report, warnings, queued_at, started_at, completed_at, \
     processing_time_ms, error_message, retry_count, institution_id, created_by_id";

/// SQLite [`JobStore`].
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Open (creating if necessary) a file-backed store.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Validation(format!("cannot create db dir: {e}")))?;
            }
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "opened sqlite job store");
        Ok(store)
    }

    /// Open an in-memory store. A single connection keeps every query on
    /// the same in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool, applying the schema migration.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_by_ref(&self, queue_ref: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue_ref = ?1"
        ))
        .bind(queue_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Re-read a record after a conditional update affected zero rows, to
    /// distinguish "unknown reference" from "wrong source state".
    async fn rejected(&self, queue_ref: &str, verb: &str) -> StoreError {
        match self.fetch_by_ref(queue_ref).await {
            Ok(Some(job)) => {
                StoreError::invalid_state(format!("cannot {verb} a {} job", job.status))
            }
            Ok(None) => StoreError::not_found(queue_ref),
            Err(e) => e,
        }
    }

    async fn require_by_ref(&self, queue_ref: &str) -> Result<Job, StoreError> {
        self.fetch_by_ref(queue_ref)
            .await?
            .ok_or_else(|| StoreError::not_found(queue_ref))
    }
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Validation(format!("corrupt timestamp: {ms}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;

    let parse_report = |col: &str| -> Result<Option<serde_json::Value>, StoreError> {
        let raw: Option<String> = row.try_get(col)?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    };

    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(Job {
        id: Uuid::parse_str(&id)
            .map_err(|e| StoreError::Validation(format!("corrupt job id {id}: {e}")))?,
        queue_ref: row.try_get("queue_ref")?,
        job_type: JobType::parse(&job_type)
            .ok_or_else(|| StoreError::Validation(format!("unknown job type: {job_type}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Validation(format!("unknown status: {status}")))?,
        file_name: row.try_get("file_name")?,
        original_name: row.try_get("original_name")?,
        file_size: row.try_get("file_size")?,
        total_rows: row.try_get::<i64, _>("total_rows")? as u32,
        processed_rows: row.try_get::<i64, _>("processed_rows")? as u32,
        success_count: row.try_get::<i64, _>("success_count")? as u32,
        failed_count: row.try_get::<i64, _>("failed_count")? as u32,
        progress: row.try_get::<i64, _>("progress")? as u8,
        success_report: parse_report("success_report")?,
        error_report: parse_report("error_report")?,
        warnings: parse_report("warnings")?,
        queued_at: from_millis(row.try_get("queued_at")?)?,
        started_at: started_at.map(from_millis).transpose()?,
        completed_at: completed_at.map(from_millis).transpose()?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        institution_id: row.try_get("institution_id")?,
        created_by_id: row.try_get("created_by_id")?,
    })
}

fn push_scope(qb: &mut QueryBuilder<'_, Sqlite>, scope: &Scope) {
    if let Scope::Institution(id) = scope {
        qb.push(" AND institution_id = ").push_bind(id.clone());
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, spec: NewJob) -> Result<Job, StoreError> {
        validate_new_job(&spec)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, queue_ref, job_type, status, file_name, original_name, \
             file_size, total_rows, queued_at, retry_count, institution_id, created_by_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
        )
        .bind(id.to_string())
        .bind(&spec.queue_ref)
        .bind(spec.job_type.as_str())
        .bind(JobStatus::Queued.as_str())
        .bind(&spec.file_name)
        .bind(&spec.original_name)
        .bind(spec.file_size)
        .bind(spec.total_rows as i64)
        .bind(millis(now))
        .bind(&spec.institution_id)
        .bind(&spec.created_by_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Validation(format!("queue_ref already in use: {}", spec.queue_ref))
            }
            other => StoreError::Database(other),
        })?;

        self.require_by_ref(&spec.queue_ref).await
    }

    async fn reconcile_ref(&self, placeholder: &str, real: &str) -> Result<Job, StoreError> {
        let result = sqlx::query("UPDATE jobs SET queue_ref = ?1 WHERE queue_ref = ?2")
            .bind(real)
            .bind(placeholder)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Validation(format!("queue_ref already in use: {real}"))
                }
                other => StoreError::Database(other),
            })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(placeholder));
        }
        self.require_by_ref(real).await
    }

    async fn mark_started(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'processing', started_at = ?1 \
             WHERE queue_ref = ?2 AND status IN ('queued', 'failed')",
        )
        .bind(millis(Utc::now()))
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejected(queue_ref, "start").await);
        }
        self.require_by_ref(queue_ref).await
    }

    async fn mark_completed(
        &self,
        queue_ref: &str,
        outcome: &BatchOutcome,
    ) -> Result<Job, StoreError> {
        let now = millis(Utc::now());
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', success_count = ?1, failed_count = ?2, \
             processed_rows = ?3, progress = 100, success_report = ?4, error_report = ?5, \
             warnings = ?6, completed_at = ?7, \
             processing_time_ms = CASE WHEN started_at IS NULL THEN NULL ELSE ?7 - started_at END \
             WHERE queue_ref = ?8 AND status = 'processing'",
        )
        .bind(outcome.success as i64)
        .bind(outcome.failed as i64)
        .bind((outcome.success + outcome.failed) as i64)
        .bind(serde_json::to_string(&outcome.success_records)?)
        .bind(serde_json::to_string(&outcome.failed_records)?)
        .bind(serde_json::to_string(&outcome.warnings)?)
        .bind(now)
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejected(queue_ref, "complete").await);
        }
        self.require_by_ref(queue_ref).await
    }

    async fn mark_failed(&self, queue_ref: &str, message: &str) -> Result<Job, StoreError> {
        let now = millis(Utc::now());
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?1, error_message = ?2, \
             retry_count = retry_count + 1, \
             processing_time_ms = CASE WHEN started_at IS NULL THEN NULL ELSE ?1 - started_at END \
             WHERE queue_ref = ?3 AND status IN ('queued', 'processing')",
        )
        .bind(now)
        .bind(message)
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejected(queue_ref, "fail").await);
        }
        self.require_by_ref(queue_ref).await
    }

    async fn update_progress(
        &self,
        queue_ref: &str,
        processed_rows: u32,
        total_rows: u32,
    ) -> Result<Job, StoreError> {
        let pct = crate::types::progress_percent(processed_rows, total_rows);
        let result = sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?1), \
             processed_rows = MAX(processed_rows, ?2) \
             WHERE queue_ref = ?3 AND status = 'processing'",
        )
        .bind(pct as i64)
        .bind(processed_rows as i64)
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            debug!(queue_ref, "ignoring progress update on non-processing job");
        }
        self.require_by_ref(queue_ref).await
    }

    async fn cancel(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?1 \
             WHERE queue_ref = ?2 AND status = 'queued'",
        )
        .bind(millis(Utc::now()))
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(match self.fetch_by_ref(queue_ref).await? {
                Some(_) => StoreError::invalid_state("only queued jobs can be cancelled"),
                None => StoreError::not_found(queue_ref),
            });
        }
        self.require_by_ref(queue_ref).await
    }

    async fn requeue(&self, queue_ref: &str) -> Result<Job, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', started_at = NULL, completed_at = NULL, \
             processing_time_ms = NULL, error_message = NULL, progress = 0, \
             processed_rows = 0, success_count = 0, failed_count = 0, \
             success_report = NULL, error_report = NULL, warnings = NULL \
             WHERE queue_ref = ?1 AND status = 'failed'",
        )
        .bind(queue_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(match self.fetch_by_ref(queue_ref).await? {
                Some(_) => StoreError::invalid_state("only failed jobs can be retried"),
                None => StoreError::not_found(queue_ref),
            });
        }
        self.require_by_ref(queue_ref).await
    }

    async fn get_by_ref(&self, queue_ref: &str) -> Result<Job, StoreError> {
        self.require_by_ref(queue_ref).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r))
            .transpose()?
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

        let apply_filter = |qb: &mut QueryBuilder<'_, Sqlite>| {
            if let Some(t) = filter.job_type {
                qb.push(" AND job_type = ").push_bind(t.as_str());
            }
            if let Some(s) = filter.status {
                qb.push(" AND status = ").push_bind(s.as_str());
            }
            if let Some(from) = filter.from {
                qb.push(" AND queued_at >= ").push_bind(millis(from));
            }
            if let Some(to) = filter.to {
                qb.push(" AND queued_at <= ").push_bind(millis(to));
            }
            push_scope(qb, &filter.scope);
        };

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs WHERE 1=1");
        apply_filter(&mut count_qb);
        let total: i64 = count_qb.build().fetch_one(&self.pool).await?.try_get(0)?;
        let total = total as u64;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"
        ));
        apply_filter(&mut qb);
        qb.push(" ORDER BY queued_at DESC, rowid DESC LIMIT ")
            .push_bind(per_page as i64)
            .push(" OFFSET ")
            .push_bind(((page - 1) * per_page) as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            jobs,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        })
    }

    async fn list_active(&self, scope: Scope) -> Result<Vec<Job>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('queued', 'processing')"
        ));
        push_scope(&mut qb, &scope);
        qb.push(" ORDER BY queued_at DESC, rowid DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn stats(&self, scope: Scope) -> Result<JobStats, StoreError> {
        let mut status_qb = QueryBuilder::<Sqlite>::new(
            "SELECT status, COUNT(*) FROM jobs WHERE 1=1",
        );
        push_scope(&mut status_qb, &scope);
        status_qb.push(" GROUP BY status");

        let mut by_status = HashMap::new();
        let mut total = 0u64;
        for row in status_qb.build().fetch_all(&self.pool).await? {
            let status: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            let status = JobStatus::parse(&status)
                .ok_or_else(|| StoreError::Validation(format!("unknown status: {status}")))?;
            by_status.insert(status, count as u64);
            total += count as u64;
        }

        let mut type_qb = QueryBuilder::<Sqlite>::new(
            "SELECT job_type, COUNT(*) FROM jobs WHERE 1=1",
        );
        push_scope(&mut type_qb, &scope);
        type_qb.push(" GROUP BY job_type");

        let mut by_type = HashMap::new();
        for row in type_qb.build().fetch_all(&self.pool).await? {
            let job_type: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            let job_type = JobType::parse(&job_type)
                .ok_or_else(|| StoreError::Validation(format!("unknown job type: {job_type}")))?;
            by_type.insert(job_type, count as u64);
        }

        let mut recent_qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"
        ));
        push_scope(&mut recent_qb, &scope);
        recent_qb
            .push(" ORDER BY queued_at DESC, rowid DESC LIMIT ")
            .push_bind(RECENT_JOBS as i64);

        let rows = recent_qb.build().fetch_all(&self.pool).await?;
        let recent_jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobStats {
            total,
            by_status,
            by_type,
            recent_jobs,
        })
    }

    async fn retention_sweep(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = millis(Utc::now() - max_age);
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
             AND completed_at IS NOT NULL AND completed_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_orphaned(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = millis(now - older_than);
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?1, \
             error_message = 'orphaned placeholder reference: enqueue never completed', \
             retry_count = retry_count + 1 \
             WHERE status = 'queued' AND queue_ref LIKE ?2 AND queued_at < ?3",
        )
        .bind(millis(now))
        .bind(format!("{PLACEHOLDER_PREFIX}%"))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
