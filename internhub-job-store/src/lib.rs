//! Durable job records for the InternHub bulk import pipeline.
//!
//! A [`Job`] is the durable record of one submitted batch operation,
//! independent of the transient queue item that carries the payload to a
//! worker. This crate owns the job state machine:
//!
//! ```text
//! QUEUED --(worker dequeues)--> PROCESSING
//! QUEUED --(cancel)--> CANCELLED
//! QUEUED --(enqueue error)--> FAILED
//! PROCESSING --(handler succeeds)--> COMPLETED
//! PROCESSING --(handler throws)--> FAILED
//! FAILED --(administrative retry)--> QUEUED
//! ```
//!
//! # Architecture
//!
//! - [`JobStore`] - Trait over durable job-record operations
//! - [`MemoryJobStore`] - In-memory implementation for tests and embedded use
//! - [`SqliteJobStore`] - SQLite-backed implementation
//! - [`Job`], [`JobStatus`], [`JobType`] - The record and its enums
//! - [`BatchOutcome`] - Per-row breakdown attached on completion

mod error;
mod memory;
mod sqlite;
mod store;
mod types;

pub use error::StoreError;
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::JobStore;
pub use types::{
    progress_percent, BatchOutcome, Job, JobFilter, JobPage, JobStats, JobStatus, JobType, NewJob,
    Scope, PLACEHOLDER_PREFIX, RECENT_JOBS,
};

// Re-export async_trait for downstream JobStore implementations.
pub use async_trait::async_trait;
