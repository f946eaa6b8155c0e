//! Bulk operation job pipeline: an in-process work queue, a submission
//! service that keeps queue items and durable job records consistent, and a
//! bounded worker pool dispatching to per-type batch handlers.
//!
//! The moving parts, outermost first:
//!
//! - [`QueueService`]: the submission front door. Creates the job record
//!   under a placeholder reference, enqueues the payload, then reconciles
//!   the reference to the queue-assigned identifier.
//! - [`JobQueue`]: transient FIFO dispatch with exponential backoff on
//!   failed deliveries, heartbeat-based stall detection, pause/resume and
//!   trimming of finished items.
//! - [`WorkerPool`]: a fixed set of workers draining the queue, plus a
//!   maintenance task for stall recovery and trimming.
//! - [`BatchHandler`]: the per-job-type extension point; implementations
//!   are looked up through a [`HandlerRegistry`].
//!
//! Durable state lives behind the `JobStore` trait from
//! `internhub-job-store`; everything in this crate treats the record as the
//! source of truth and the queue item as disposable.

pub mod error;
pub mod handler;
pub mod queue;
pub mod service;
pub mod worker;

pub use error::QueueError;
pub use handler::{BatchContext, BatchHandler, HandlerError, HandlerRegistry, NoOpHandler};
pub use queue::{ItemState, JobPayload, JobQueue, QueueConfig, QueueItem};
pub use service::{new_placeholder_ref, QueueService, SubmitReceipt, SubmitRequest};
pub use worker::{PoolConfig, ProgressEvent, WorkerPool};

// Re-exported so handler implementations depend on a single attribute path.
pub use async_trait::async_trait;
