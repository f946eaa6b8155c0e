//! Shared row validation for batch handlers.
//!
//! Handlers accumulate per-row results into a [`RowResults`] and turn it
//! into the [`BatchOutcome`] the pipeline records. Row numbers are 1-based
//! to match the source file the operator uploaded.

use serde_json::{json, Value};

use internhub_job_store::BatchOutcome;

/// Accumulator for per-row validation results.
#[derive(Debug, Default)]
pub struct RowResults {
    success: Vec<Value>,
    failed: Vec<Value>,
    warnings: Vec<Value>,
}

impl RowResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, row: &Value) {
        self.success.push(row.clone());
    }

    pub fn reject(&mut self, row_number: usize, row: &Value, errors: Vec<String>) {
        self.failed.push(json!({
            "row": row_number,
            "data": row,
            "errors": errors,
        }));
    }

    pub fn warn(&mut self, row_number: usize, message: impl Into<String>) {
        self.warnings.push(json!({
            "row": row_number,
            "message": message.into(),
        }));
    }

    pub fn into_outcome(self) -> BatchOutcome {
        BatchOutcome {
            success: self.success.len() as u32,
            failed: self.failed.len() as u32,
            success_records: Value::Array(self.success),
            failed_records: Value::Array(self.failed),
            warnings: Value::Array(self.warnings),
        }
    }
}

/// Fetch a required string field, trimmed. `None` when absent or blank.
pub fn required_str<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Fetch an optional string field, trimmed. Blank counts as absent.
pub fn optional_str<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    required_str(row, field)
}

/// Collect "field is required" errors for every missing field.
pub fn missing_fields(row: &Value, fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .filter(|f| required_str(row, f).is_none())
        .map(|f| format!("{f} is required"))
        .collect()
}

/// Minimal shape check for an email address.
pub fn valid_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// Minimal shape check for an ISO `YYYY-MM-DD` date.
pub fn valid_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    s.char_indices()
        .all(|(i, c)| matches!(i, 4 | 7) || c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_split_into_outcome_counters() {
        let mut results = RowResults::new();
        let row = json!({"email": "a@example.com"});
        results.accept(&row);
        results.reject(2, &json!({}), vec!["email is required".into()]);
        results.warn(1, "missing optional field");

        let outcome = results.into_outcome();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.warnings.as_array().unwrap().len(), 1);
        let failure = &outcome.failed_records.as_array().unwrap()[0];
        assert_eq!(failure["row"], 2);
    }

    #[test]
    fn required_str_rejects_blank_and_non_string() {
        let row = json!({"a": "x", "b": "  ", "c": 5});
        assert_eq!(required_str(&row, "a"), Some("x"));
        assert_eq!(required_str(&row, "b"), None);
        assert_eq!(required_str(&row, "c"), None);
        assert_eq!(required_str(&row, "d"), None);
    }

    #[test]
    fn email_and_date_shape_checks() {
        assert!(valid_email("user@example.com"));
        assert!(!valid_email("user@localhost"));
        assert!(!valid_email("example.com"));
        assert!(!valid_email("@example.com"));

        assert!(valid_date("2026-08-27"));
        assert!(!valid_date("27-08-2026"));
        assert!(!valid_date("2026/08/27"));
        assert!(!valid_date("2026-8-27"));
    }
}
