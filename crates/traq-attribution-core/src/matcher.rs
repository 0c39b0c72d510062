//! Weighted multi-field rule matching.
//!
//! Each pattern tests one context field. Hits add the pattern weight to
//! the owning project's score; the highest score wins and is normalized
//! against [`CONFIDENCE_SATURATION`].
//!
//! | Pattern type | Context field | Reason label |
//! |--------------|---------------|--------------|
//! | `app_name` | app name | `app` |
//! | `window_title` | window title | `window` |
//! | `git_repo` | git repository | `repo` |
//! | `domain` | domain, else URL | `url` |
//! | `path` | file path | `path` |

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};

use crate::context::AssignmentContext;
use crate::models::{MatchType, Pattern, PatternType};

/// Total weight at which a rule match is considered fully confident.
pub const CONFIDENCE_SATURATION: f64 = 3.0;

/// Compiled rules grouped by owning project id.
pub type GroupedPatterns = BTreeMap<i64, Vec<CompiledPattern>>;

/// The winning project of a rule evaluation, before name/color lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub project_id: i64,
    pub score: f64,
    pub confidence: f64,
    pub reason: String,
}

/// A rule value prepared for repeated matching.
///
/// Text values are lower-cased once. Regex values are compiled from the
/// value as written, with case-insensitive matching, so escape classes
/// like `\D` keep their meaning.
#[derive(Debug, Clone)]
pub enum FieldMatcher {
    Text { value: String, match_type: MatchType },
    Regex(Regex),
    Never,
}

impl FieldMatcher {
    pub fn new(pattern: &str, match_type: MatchType) -> Self {
        if pattern.is_empty() {
            return FieldMatcher::Never;
        }
        match match_type {
            MatchType::Regex => match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => FieldMatcher::Regex(re),
                Err(_) => FieldMatcher::Never,
            },
            _ => FieldMatcher::Text {
                value: pattern.to_lowercase(),
                match_type,
            },
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        match self {
            FieldMatcher::Never => false,
            FieldMatcher::Regex(re) => re.is_match(value),
            FieldMatcher::Text { value: pattern, match_type } => {
                let value = value.to_lowercase();
                match match_type {
                    MatchType::Exact => value == *pattern,
                    MatchType::Contains => value.contains(pattern.as_str()),
                    MatchType::Prefix => value.starts_with(pattern.as_str()),
                    MatchType::Suffix => value.ends_with(pattern.as_str()),
                    MatchType::Regex => false,
                }
            }
        }
    }
}

/// A persisted rule with its matcher built.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub pattern: Pattern,
    matcher: FieldMatcher,
}

impl CompiledPattern {
    pub fn new(pattern: Pattern) -> Self {
        let matcher = FieldMatcher::new(&pattern.pattern_value, pattern.match_type);
        Self { pattern, matcher }
    }

    /// Whether this rule hits the context, returning the matched value.
    pub fn hit<'a>(&self, ctx: &'a AssignmentContext) -> Option<&'a str> {
        field_hit(ctx, self.pattern.pattern_type, &self.matcher)
    }
}

/// Test the context field a rule type targets. Domain rules fall back to
/// the raw URL when the domain itself does not match.
pub fn field_hit<'a>(
    ctx: &'a AssignmentContext,
    pattern_type: PatternType,
    matcher: &FieldMatcher,
) -> Option<&'a str> {
    let test = |value: Option<&'a str>| value.filter(|v| matcher.is_match(v));
    match pattern_type {
        PatternType::Domain => test(ctx.domain.as_deref()).or_else(|| test(ctx.url.as_deref())),
        other => test(ctx.field(other)),
    }
}

pub fn group_by_project(patterns: Vec<Pattern>) -> GroupedPatterns {
    let mut grouped = GroupedPatterns::new();
    for p in patterns {
        grouped.entry(p.project_id).or_default().push(CompiledPattern::new(p));
    }
    grouped
}

/// Compare a field value against a rule value, case-insensitively.
///
/// Empty inputs never match. A regex that fails to compile here yields
/// `false`; invalid regexes are rejected when rules are written.
pub fn match_field(value: &str, pattern: &str, match_type: MatchType) -> bool {
    FieldMatcher::new(pattern, match_type).is_match(value)
}

/// Score every project's patterns and return the best one.
///
/// Ties go to the lowest project id. Returns `None` when no project scores
/// above zero. The reason quotes the context value of the last hit.
pub fn match_context(grouped: &GroupedPatterns, ctx: &AssignmentContext) -> Option<RuleMatch> {
    let mut best: Option<RuleMatch> = None;

    for (&project_id, patterns) in grouped {
        let mut score = 0.0;
        let mut reason = String::new();
        for compiled in patterns {
            if let Some(value) = compiled.hit(ctx) {
                score += compiled.pattern.weight;
                reason = format!("Matched {}: {}", compiled.pattern.pattern_type.label(), value);
            }
        }
        if score > 0.0 && best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(RuleMatch {
                project_id,
                score,
                confidence: (score / CONFIDENCE_SATURATION).min(1.0),
                reason,
            });
        }
    }

    best
}
