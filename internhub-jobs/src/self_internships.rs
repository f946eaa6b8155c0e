//! Bulk self-arranged internship import handler.

use serde_json::Value;
use tracing::info;

use internhub_job_queue::{async_trait, BatchContext, BatchHandler, HandlerError};
use internhub_job_store::{BatchOutcome, JobType};

use crate::rows::{missing_fields, optional_str, required_str, valid_date, valid_email, RowResults};

/// Handler for bulk imports of self-arranged internships.
///
/// Rows need `student_email`, `company_name` and an ISO `start_date`. An
/// `end_date`, when present, must not precede the start.
#[derive(Debug, Default)]
pub struct SelfInternshipsHandler;

impl SelfInternshipsHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchHandler for SelfInternshipsHandler {
    fn job_type(&self) -> JobType {
        JobType::SelfInternships
    }

    async fn handle(
        &self,
        rows: &[Value],
        ctx: &BatchContext,
    ) -> Result<BatchOutcome, HandlerError> {
        let mut results = RowResults::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let mut errors =
                missing_fields(row, &["student_email", "company_name", "start_date"]);

            if let Some(email) = required_str(row, "student_email") {
                if !valid_email(email) {
                    errors.push(format!("invalid student_email: {email}"));
                }
            }
            let start = required_str(row, "start_date");
            if let Some(start) = start {
                if !valid_date(start) {
                    errors.push(format!("invalid start_date: {start} (expected YYYY-MM-DD)"));
                }
            }
            let end = optional_str(row, "end_date");
            match end {
                Some(end) if !valid_date(end) => {
                    errors.push(format!("invalid end_date: {end} (expected YYYY-MM-DD)"));
                }
                Some(end) => {
                    // ISO dates compare correctly as strings.
                    if start.is_some_and(|s| valid_date(s) && end < s) {
                        errors.push("end_date precedes start_date".to_string());
                    }
                }
                None => {}
            }

            if errors.is_empty() {
                if end.is_none() {
                    results.warn(row_number, "end_date missing, internship left open-ended");
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
            "self internship import batch processed"
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
    async fn date_ordering_and_format_are_enforced() {
        let rows = vec![
            json!({"student_email": "s@example.com", "company_name": "Acme", "start_date": "2026-03-01", "end_date": "2026-06-30"}),
            json!({"student_email": "s@example.com", "company_name": "Acme", "start_date": "2026-03-01", "end_date": "2026-01-01"}),
            json!({"student_email": "s@example.com", "company_name": "Acme", "start_date": "01-03-2026"}),
        ];

        let outcome = SelfInternshipsHandler::new()
            .handle(&rows, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.failed, 2);

        let failures = outcome.failed_records.as_array().unwrap();
        assert!(failures[0]["errors"][0]
            .as_str()
            .unwrap()
            .contains("precedes"));
        assert!(failures[1]["errors"][0]
            .as_str()
            .unwrap()
            .contains("invalid start_date"));
    }

    #[tokio::test]
    async fn open_ended_internship_warns_but_succeeds() {
        let rows = vec![json!({
            "student_email": "s@example.com",
            "company_name": "Acme",
            "start_date": "2026-03-01",
        })];

        let outcome = SelfInternshipsHandler::new()
            .handle(&rows, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.warnings.as_array().unwrap().len(), 1);
    }
}
