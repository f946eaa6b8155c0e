//! Error types for the queue, submission service and worker pool.

use internhub_job_store::StoreError;
use thiserror::Error;

/// Errors that may occur while interacting with the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}
