//! Bulk student import handler.

use std::collections::HashSet;

use serde_json::Value;
use tracing::info;

use internhub_job_queue::{async_trait, BatchContext, BatchHandler, HandlerError};
use internhub_job_store::{BatchOutcome, JobType};

use crate::rows::{missing_fields, optional_str, required_str, valid_email, RowResults};

/// Handler for bulk student imports.
///
/// Rows need `email`, `first_name`, `last_name` and `student_number`; the
/// student number must be unique within the batch.
#[derive(Debug, Default)]
pub struct StudentsHandler;

impl StudentsHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchHandler for StudentsHandler {
    fn job_type(&self) -> JobType {
        JobType::Students
    }

    async fn handle(
        &self,
        rows: &[Value],
        ctx: &BatchContext,
    ) -> Result<BatchOutcome, HandlerError> {
        let mut results = RowResults::new();
        let mut seen_numbers: HashSet<String> = HashSet::new();
        let mut seen_emails: HashSet<String> = HashSet::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let mut errors =
                missing_fields(row, &["email", "first_name", "last_name", "student_number"]);

            if let Some(email) = required_str(row, "email") {
                if !valid_email(email) {
                    errors.push(format!("invalid email: {email}"));
                } else if !seen_emails.insert(email.to_ascii_lowercase()) {
                    errors.push(format!("duplicate email in batch: {email}"));
                }
            }
            if let Some(number) = required_str(row, "student_number") {
                if !seen_numbers.insert(number.to_string()) {
                    errors.push(format!("duplicate student_number in batch: {number}"));
                }
            }

            if errors.is_empty() {
                if optional_str(row, "cohort").is_none() {
                    results.warn(row_number, "cohort missing, student left unassigned");
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
            "student import batch processed"
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
            institution_id: "inst-1".into(),
            created_by_id: "admin-1".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_student_numbers_are_rejected() {
        let rows = vec![
            json!({"email": "s1@example.com", "first_name": "A", "last_name": "B", "student_number": "1001", "cohort": "2026"}),
            json!({"email": "s2@example.com", "first_name": "C", "last_name": "D", "student_number": "1001", "cohort": "2026"}),
        ];

        let outcome = StudentsHandler::new().handle(&rows, &ctx()).await.unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.failed_records.as_array().unwrap()[0]["errors"][0]
            .as_str()
            .unwrap()
            .contains("duplicate student_number"));
    }

    #[tokio::test]
    async fn missing_cohort_warns() {
        let rows = vec![json!({
            "email": "s1@example.com",
            "first_name": "A",
            "last_name": "B",
            "student_number": "1001",
        })];

        let outcome = StudentsHandler::new().handle(&rows, &ctx()).await.unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.warnings.as_array().unwrap().len(), 1);
    }
}
