//! Bulk user import handler.

use std::collections::HashSet;

use serde_json::Value;
use tracing::info;

use internhub_job_queue::{async_trait, BatchContext, BatchHandler, HandlerError};
use internhub_job_store::{BatchOutcome, JobType};

use crate::rows::{missing_fields, required_str, valid_email, RowResults};

/// Handler for bulk user imports.
///
/// Each row needs `email`, `first_name` and `last_name`; the email must
/// look like an address and may appear only once per batch.
#[derive(Debug, Default)]
pub struct UsersHandler;

impl UsersHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchHandler for UsersHandler {
    fn job_type(&self) -> JobType {
        JobType::Users
    }

    async fn handle(
        &self,
        rows: &[Value],
        ctx: &BatchContext,
    ) -> Result<BatchOutcome, HandlerError> {
        let mut results = RowResults::new();
        let mut seen_emails: HashSet<String> = HashSet::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let mut errors = missing_fields(row, &["email", "first_name", "last_name"]);

            if let Some(email) = required_str(row, "email") {
                if !valid_email(email) {
                    errors.push(format!("invalid email: {email}"));
                } else if !seen_emails.insert(email.to_ascii_lowercase()) {
                    errors.push(format!("duplicate email in batch: {email}"));
                }
            }

            if errors.is_empty() {
                if required_str(row, "role").is_none() {
                    results.warn(row_number, "role missing, defaulting to member");
                }
                results.accept(row);
            } else {
                results.reject(row_number, row, errors);
            }
        }

        let outcome = results.into_outcome();
        info!(
            institution_id = %ctx.institution_id,
            success = outcome.success,
            failed = outcome.failed,
            "user import batch processed"
        );
        Ok(outcome)
    }
}
