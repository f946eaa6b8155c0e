//! Bulk institution import handler.

use std::collections::HashSet;

use serde_json::Value;
use tracing::info;

use internhub_job_queue::{async_trait, BatchContext, BatchHandler, HandlerError};
use internhub_job_store::{BatchOutcome, JobType};

use crate::rows::{missing_fields, optional_str, required_str, valid_email, RowResults};

/// Handler for bulk institution imports. Rows need a unique `name` and a
/// well-formed `contact_email`.
#[derive(Debug, Default)]
pub struct InstitutionsHandler;

impl InstitutionsHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchHandler for InstitutionsHandler {
    fn job_type(&self) -> JobType {
        JobType::Institutions
    }

    async fn handle(
        &self,
        rows: &[Value],
        ctx: &BatchContext,
    ) -> Result<BatchOutcome, HandlerError> {
        let mut results = RowResults::new();
        let mut seen_names: HashSet<String> = HashSet::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let mut errors = missing_fields(row, &["name", "contact_email"]);

            if let Some(name) = required_str(row, "name") {
                if !seen_names.insert(name.to_lowercase()) {
                    errors.push(format!("duplicate institution name in batch: {name}"));
                }
            }
            if let Some(email) = required_str(row, "contact_email") {
                if !valid_email(email) {
                    errors.push(format!("invalid contact_email: {email}"));
                }
            }

            if errors.is_empty() {
                if optional_str(row, "website").is_none() {
                    results.warn(row_number, "website missing");
                }
                results.accept(row);
            } else {
                results.reject(row_number, row, errors);
            }
        }

        let outcome = results.into_outcome();
        info!(
            created_by_id = %ctx.created_by_id,
            success = outcome.success,
            failed = outcome.failed,
            "institution import batch processed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> BatchContext {
        BatchContext {
            institution_id: "platform".into(),
            created_by_id: "admin-1".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_case_insensitively() {
        let rows = vec![
            json!({"name": "Acme Corp", "contact_email": "hr@acme.com"}),
            json!({"name": "ACME CORP", "contact_email": "jobs@acme.com"}),
            json!({"name": "Globex", "contact_email": "not-an-email"}),
        ];

        let outcome = InstitutionsHandler::new()
            .handle(&rows, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.failed, 2);
    }
}
