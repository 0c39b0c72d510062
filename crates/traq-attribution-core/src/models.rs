//! Core data models for project attribution.
//!
//! These types describe the projects, captured activity events, weighted
//! rules and suggestion results that flow between storage, the matcher,
//! the vector index and the assignment orchestrator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Color given to projects created without one.
pub const DEFAULT_PROJECT_COLOR: &str = "#6366f1";

/// A user-defined project that activity is attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub description: String,
    pub created_at: i64,
}

/// The kinds of captured activity the engine can attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Focus,
    Git,
    Browser,
    Screenshot,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Focus,
        EventType::Git,
        EventType::Browser,
        EventType::Screenshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Focus => "focus",
            EventType::Git => "git",
            EventType::Browser => "browser",
            EventType::Screenshot => "screenshot",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "focus" | "activity" => Ok(EventType::Focus),
            "git" => Ok(EventType::Git),
            "browser" => Ok(EventType::Browser),
            "screenshot" => Ok(EventType::Screenshot),
            other => Err(ValidationError::InvalidEventType {
                value: other.to_string(),
            }),
        }
    }
}

/// Which context field a rule tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    AppName,
    WindowTitle,
    GitRepo,
    Domain,
    Path,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::AppName => "app_name",
            PatternType::WindowTitle => "window_title",
            PatternType::GitRepo => "git_repo",
            PatternType::Domain => "domain",
            PatternType::Path => "path",
        }
    }

    /// Short label used in match reasons (`Matched app: code`).
    pub fn label(&self) -> &'static str {
        match self {
            PatternType::AppName => "app",
            PatternType::WindowTitle => "window",
            PatternType::GitRepo => "repo",
            PatternType::Domain => "url",
            PatternType::Path => "path",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app_name" => Ok(PatternType::AppName),
            "window_title" => Ok(PatternType::WindowTitle),
            "git_repo" => Ok(PatternType::GitRepo),
            "domain" => Ok(PatternType::Domain),
            "path" => Ok(PatternType::Path),
            other => Err(ValidationError::InvalidPatternType {
                value: other.to_string(),
            }),
        }
    }
}

/// How a rule value is compared against the context field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    #[default]
    Contains,
    Prefix,
    Suffix,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Prefix => "prefix",
            MatchType::Suffix => "suffix",
            MatchType::Regex => "regex",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchType::Exact),
            "contains" => Ok(MatchType::Contains),
            "prefix" => Ok(MatchType::Prefix),
            "suffix" => Ok(MatchType::Suffix),
            "regex" => Ok(MatchType::Regex),
            other => Err(ValidationError::InvalidMatchType {
                value: other.to_string(),
            }),
        }
    }
}

/// Where an assignment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Rule,
    Embedding,
    Detection,
    User,
    Unassigned,
}

impl AssignmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentSource::Rule => "rule",
            AssignmentSource::Embedding => "embedding",
            AssignmentSource::Detection => "detection",
            AssignmentSource::User => "user",
            AssignmentSource::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted weighted match rule owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub project_id: i64,
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub match_type: MatchType,
    pub weight: f64,
    pub hit_count: i64,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

impl Pattern {
    pub fn spec(&self) -> PatternSpec {
        PatternSpec {
            project_id: self.project_id,
            pattern_type: self.pattern_type,
            pattern_value: self.pattern_value.clone(),
            match_type: self.match_type,
            weight: self.weight,
        }
    }
}

/// The writable part of a [`Pattern`]: everything except storage bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSpec {
    pub project_id: i64,
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub match_type: MatchType,
    pub weight: f64,
}

/// A captured activity event as stored by the capture collaborator.
///
/// Only the fields relevant to attribution are modeled; the engine never
/// sees pixels or process handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub event_type: EventType,
    pub timestamp: i64,
    pub app_name: Option<String>,
    pub window_title: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub file_path: Option<String>,
    pub project_id: Option<i64>,
    pub project_confidence: Option<f64>,
    pub project_source: Option<String>,
}

impl ActivityEvent {
    pub fn new(event_type: EventType, timestamp: i64) -> Self {
        Self {
            id: 0,
            event_type,
            timestamp,
            app_name: None,
            window_title: None,
            url: None,
            domain: None,
            git_repo: None,
            git_branch: None,
            file_path: None,
            project_id: None,
            project_confidence: None,
            project_source: None,
        }
    }

    /// Whether the event already carries a real (non-zero) project.
    pub fn is_assigned(&self) -> bool {
        matches!(self.project_id, Some(id) if id != 0)
    }
}

/// A suggestion or decision: which project, how sure, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentResult {
    pub project_id: i64,
    pub project_name: String,
    pub color: String,
    pub confidence: f64,
    pub source: AssignmentSource,
    pub reason: String,
}

/// One neighbor returned by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityResult {
    pub event_type: EventType,
    pub event_id: i64,
    pub project_id: i64,
    pub project_name: String,
    pub similarity: f64,
    pub source_text: String,
}

/// A persisted embedding row together with the assignment of its event.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub event_type: EventType,
    pub event_id: i64,
    pub embedding: Vec<u8>,
    pub context_text: String,
    pub project_id: Option<i64>,
    pub project_name: Option<String>,
}

/// A manual assignment recorded for future reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentExample {
    pub id: i64,
    pub project_id: i64,
    pub event_type: EventType,
    pub event_id: i64,
    pub context_json: String,
    pub created_at: i64,
}

/// Aggregate counters for one backfill pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillResult {
    pub total_processed: usize,
    pub auto_assigned: usize,
    pub already_assigned: usize,
    pub no_match: usize,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_alias() {
        assert_eq!("activity".parse::<EventType>().unwrap(), EventType::Focus);
        assert_eq!("Focus".parse::<EventType>().unwrap(), EventType::Focus);
        assert!("keyboard".parse::<EventType>().is_err());
    }

    #[test]
    fn test_pattern_enums_roundtrip_strings() {
        for t in ["app_name", "window_title", "git_repo", "domain", "path"] {
            assert_eq!(t.parse::<PatternType>().unwrap().as_str(), t);
        }
        for m in ["exact", "contains", "prefix", "suffix", "regex"] {
            assert_eq!(m.parse::<MatchType>().unwrap().as_str(), m);
        }
        assert_eq!(MatchType::default(), MatchType::Contains);
    }

    #[test]
    fn test_invalid_pattern_type_names_field() {
        let err = "title".parse::<PatternType>().unwrap_err();
        assert_eq!(err.field(), "pattern_type");
    }

    #[test]
    fn test_is_assigned_treats_zero_as_unassigned() {
        let mut event = ActivityEvent::new(EventType::Focus, 0);
        assert!(!event.is_assigned());
        event.project_id = Some(0);
        assert!(!event.is_assigned());
        event.project_id = Some(3);
        assert!(event.is_assigned());
    }
}
