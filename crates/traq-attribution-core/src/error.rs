//! Validation errors for user-supplied rule, project and date input.
//!
//! Every variant names the offending field so callers (CLI, UI bridges)
//! can point at the input that was rejected. Validation always runs
//! before any write, so a [`ValidationError`] guarantees storage was not
//! touched. Library functions return `anyhow::Result`; callers that need
//! the structured error use `err.downcast_ref::<ValidationError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error(
        "invalid pattern_type '{value}' (expected app_name, window_title, git_repo, domain or path)"
    )]
    InvalidPatternType { value: String },

    #[error("invalid match_type '{value}' (expected exact, contains, prefix, suffix or regex)")]
    InvalidMatchType { value: String },

    #[error("invalid regex in {field}: {message}")]
    InvalidRegex { field: &'static str, message: String },

    #[error("weight must be a positive number, got {value}")]
    InvalidWeight { value: f64 },

    #[error("min_confidence must be between 0 and 1, got {value}")]
    InvalidConfidence { value: f64 },

    #[error("{field} {id} not found")]
    NotFound { field: &'static str, id: i64 },

    #[error("invalid {field} '{value}': expected YYYY-MM-DD")]
    InvalidDate { field: &'static str, value: String },

    #[error("invalid event_type '{value}' (expected focus, git, browser or screenshot)")]
    InvalidEventType { value: String },
}

impl ValidationError {
    /// The input field this error refers to.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingField { field } => field,
            ValidationError::InvalidPatternType { .. } => "pattern_type",
            ValidationError::InvalidMatchType { .. } => "match_type",
            ValidationError::InvalidRegex { field, .. } => field,
            ValidationError::InvalidWeight { .. } => "weight",
            ValidationError::InvalidConfidence { .. } => "min_confidence",
            ValidationError::NotFound { field, .. } => field,
            ValidationError::InvalidDate { field, .. } => field,
            ValidationError::InvalidEventType { .. } => "event_type",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_field() {
        let err = ValidationError::MissingField {
            field: "project_id",
        };
        assert_eq!(err.to_string(), "project_id is required");
        assert_eq!(err.field(), "project_id");

        let err = ValidationError::InvalidRegex {
            field: "pattern_value",
            message: "unclosed group".to_string(),
        };
        assert!(err.to_string().contains("pattern_value"));
        assert_eq!(err.field(), "pattern_value");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ValidationError::NotFound {
            field: "id",
            id: 42,
        }
        .into();
        let validation = err.downcast_ref::<ValidationError>().unwrap();
        assert_eq!(validation.field(), "id");
        assert_eq!(err.to_string(), "id 42 not found");
    }
}
