//! Concrete batch handlers for the InternHub bulk import pipeline.
//!
//! This crate provides implementations of the
//! [`BatchHandler`](internhub_job_queue::BatchHandler) trait for every
//! importable record kind:
//!
//! - `users` - platform user accounts
//! - `students` - student records with unique student numbers
//! - `institutions` - partner institutions
//! - `self_internships` - self-arranged internship registrations
//!
//! Handlers validate row shape and in-batch uniqueness, and report every
//! row as either a success or a failure with 1-based row numbers. Row
//! failures never abort the batch.
//!
//! # Usage
//!
//! ```rust,no_run
//! use internhub_job_queue::HandlerRegistry;
//! use internhub_jobs::register_all_handlers;
//!
//! let mut registry = HandlerRegistry::new();
//! register_all_handlers(&mut registry);
//! ```

mod institutions;
mod rows;
mod self_internships;
mod students;
mod users;

pub use institutions::InstitutionsHandler;
pub use rows::RowResults;
pub use self_internships::SelfInternshipsHandler;
pub use students::StudentsHandler;
pub use users::UsersHandler;

use internhub_job_queue::HandlerRegistry;

/// Register one handler per job type.
pub fn register_all_handlers(registry: &mut HandlerRegistry) {
    registry.register(UsersHandler::new());
    registry.register(StudentsHandler::new());
    registry.register(InstitutionsHandler::new());
    registry.register(SelfInternshipsHandler::new());
}
