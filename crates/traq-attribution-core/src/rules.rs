//! Rule input validation.
//!
//! User-authored rules arrive as loosely-typed [`RuleInput`] (strings from
//! the CLI or a UI bridge). [`validate_rule`] turns them into a
//! [`PatternSpec`] or a [`ValidationError`] naming the bad field, before
//! anything is written.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::{MatchType, Pattern, PatternSpec, PatternType};

pub const DEFAULT_RULE_WEIGHT: f64 = 1.0;

/// Samples returned by a rule preview.
pub const PREVIEW_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleInput {
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub pattern_type: Option<String>,
    #[serde(default)]
    pub pattern_value: Option<String>,
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl RuleInput {
    /// Fill every unset field from an existing rule.
    pub fn merged_with(&self, existing: &Pattern) -> RuleInput {
        RuleInput {
            project_id: self.project_id.or(Some(existing.project_id)),
            pattern_type: self
                .pattern_type
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| Some(existing.pattern_type.as_str().to_string())),
            pattern_value: self
                .pattern_value
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| Some(existing.pattern_value.clone())),
            match_type: self
                .match_type
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| Some(existing.match_type.as_str().to_string())),
            weight: self.weight.or(Some(existing.weight)),
        }
    }
}

/// What a candidate rule would match in history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RulePreview {
    pub match_count: usize,
    pub samples: Vec<String>,
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField { field })
}

/// Validate type, value, match type and weight. The project id is checked
/// separately because previews have none.
pub fn validate_pattern_fields(
    input: &RuleInput,
) -> Result<(PatternType, String, MatchType, f64), ValidationError> {
    let pattern_type: PatternType = required(&input.pattern_type, "pattern_type")?.parse()?;
    let pattern_value = required(&input.pattern_value, "pattern_value")?.to_string();

    let match_type = match input.match_type.as_deref().map(str::trim) {
        None | Some("") => MatchType::default(),
        Some(m) => m.parse()?,
    };

    let weight = input.weight.unwrap_or(DEFAULT_RULE_WEIGHT);
    if !(weight.is_finite() && weight > 0.0) {
        return Err(ValidationError::InvalidWeight { value: weight });
    }

    if match_type == MatchType::Regex {
        Regex::new(&pattern_value).map_err(|e| ValidationError::InvalidRegex {
            field: "pattern_value",
            message: e.to_string(),
        })?;
    }

    Ok((pattern_type, pattern_value, match_type, weight))
}

/// Check a caller-supplied confidence threshold.
pub fn validate_min_confidence(value: f64) -> Result<f64, ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::InvalidConfidence { value })
    }
}

/// Full validation for a rule that will be persisted.
pub fn validate_rule(input: &RuleInput) -> Result<PatternSpec, ValidationError> {
    let project_id = input
        .project_id
        .filter(|&id| id != 0)
        .ok_or(ValidationError::MissingField { field: "project_id" })?;
    let (pattern_type, pattern_value, match_type, weight) = validate_pattern_fields(input)?;
    Ok(PatternSpec {
        project_id,
        pattern_type,
        pattern_value,
        match_type,
        weight,
    })
}
