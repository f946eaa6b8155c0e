//! Batch handler trait and registry.
//!
//! Handlers own the row-level import logic for one job type. The pipeline
//! treats them as opaque: it hands over the parsed rows and the ownership
//! scope, and gets back a per-row success/failure breakdown. A handler must
//! not fail for row-level problems; those belong in `failed_records` of
//! the returned outcome. Only handler-fatal conditions (a dependency being
//! unreachable, a bug) are errors, which the worker maps to a job-level
//! failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use internhub_job_store::{BatchOutcome, JobType};

/// Fatal conditions a handler may surface. Row-level failures are data,
/// not errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ownership scope forwarded to handlers with every batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub institution_id: String,
    pub created_by_id: String,
}

/// Trait for implementing batch handlers.
///
/// Each job type has exactly one handler, registered at startup.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Returns the job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Process a batch of rows and return the per-row breakdown.
    async fn handle(&self, rows: &[Value], ctx: &BatchContext)
        -> Result<BatchOutcome, HandlerError>;
}

/// Registry mapping a [`JobType`] to its handler.
///
/// Populated once at startup and shared read-only with the worker pool;
/// dispatch is a map lookup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn BatchHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its job type, replacing any previous one.
    pub fn register<H: BatchHandler + 'static>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn BatchHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn BatchHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A handler that accepts every row unchanged.
///
/// Useful for tests or as a placeholder while the real import logic for a
/// job type isn't wired up yet.
#[derive(Debug, Clone)]
pub struct NoOpHandler {
    job_type: JobType,
}

impl NoOpHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }
}

#[async_trait]
impl BatchHandler for NoOpHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn handle(
        &self,
        rows: &[Value],
        _ctx: &BatchContext,
    ) -> Result<BatchOutcome, HandlerError> {
        Ok(BatchOutcome {
            success: rows.len() as u32,
            failed: 0,
            success_records: Value::Array(rows.to_vec()),
            failed_records: Value::Array(Vec::new()),
            warnings: Value::Array(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registry_dispatches_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(NoOpHandler::new(JobType::Users));

        assert!(registry.get(JobType::Users).is_some());
        assert!(registry.get(JobType::Students).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn noop_handler_accepts_all_rows() {
        let handler = NoOpHandler::new(JobType::Institutions);
        let ctx = BatchContext {
            institution_id: "inst-1".into(),
            created_by_id: "admin-1".into(),
        };
        let rows = vec![json!({"name": "a"}), json!({"name": "b"})];

        let outcome = handler.handle(&rows, &ctx).await.unwrap();
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.failed, 0);
    }
}
