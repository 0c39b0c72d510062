//! Rule synthesis from manual assignments.
//!
//! When the user assigns an event to a project, [`learn_rules`] derives
//! weighted patterns from its context. Writing them (as upserts) and
//! refreshing the cache is the orchestrator's job; this module is pure.
//!
//! | Source field | Pattern | Match | Weight |
//! |--------------|---------|-------|--------|
//! | app name | `app_name` | exact | 0.5 |
//! | git repository | `git_repo` | contains | 1.0 |
//! | window title (≤ 3 keywords) | `window_title` | contains | 0.3 |
//! | domain | `domain` | contains | 0.7 |

use serde::Deserialize;

use crate::context::AssignmentContext;
use crate::models::{MatchType, PatternSpec, PatternType};

pub const APP_WEIGHT: f64 = 0.5;
pub const REPO_WEIGHT: f64 = 1.0;
pub const KEYWORD_WEIGHT: f64 = 0.3;
pub const DOMAIN_WEIGHT: f64 = 0.7;
pub const MAX_TITLE_KEYWORDS: usize = 3;

const KEYWORD_MIN_LEN: usize = 4;
const KEYWORD_TRIM: &[char] = &['[', ']', '(', ')', '-', ':', '.', ',', '|', '/', '\\', '"', '\''];
const URL_MARKERS: &[&str] = &[".com", ".org", "http", "www"];

const GENERIC_APPS: &[&str] = &["gnome-shell", "plasmashell", "explorer", "finder", "desktop"];

const GENERIC_DOMAINS: &[&str] = &[
    "google.com",
    "github.com",
    "stackoverflow.com",
    "youtube.com",
    "twitter.com",
    "facebook.com",
    "linkedin.com",
    "reddit.com",
    "amazon.com",
    "wikipedia.org",
];

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "new", "tab", "untitled", "file", "edit", "view",
    "help", "window", "document", "google", "chrome", "firefox", "safari",
];

/// Deny-lists consulted while learning. Defaults are built in; each list
/// can be replaced from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LearningTables {
    #[serde(default = "default_generic_apps")]
    pub generic_apps: Vec<String>,
    #[serde(default = "default_generic_domains")]
    pub generic_domains: Vec<String>,
    #[serde(default = "default_stop_words")]
    pub stop_words: Vec<String>,
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_generic_apps() -> Vec<String> {
    to_strings(GENERIC_APPS)
}

fn default_generic_domains() -> Vec<String> {
    to_strings(GENERIC_DOMAINS)
}

fn default_stop_words() -> Vec<String> {
    to_strings(STOP_WORDS)
}

impl Default for LearningTables {
    fn default() -> Self {
        Self {
            generic_apps: default_generic_apps(),
            generic_domains: default_generic_domains(),
            stop_words: default_stop_words(),
        }
    }
}

impl LearningTables {
    pub fn is_generic_app(&self, app: &str) -> bool {
        let lower = app.to_lowercase();
        self.generic_apps.iter().any(|g| lower.contains(g.as_str()))
    }

    pub fn is_generic_domain(&self, domain: &str) -> bool {
        let lower = domain.to_lowercase();
        self.generic_domains
            .iter()
            .any(|g| lower == *g || lower.ends_with(&format!(".{}", g)))
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.iter().any(|w| w == word)
    }
}

/// Short repository name: last path segment, `.git` and `user@host:`
/// stripped, lower-cased.
pub fn extract_repo_name(repo: &str) -> Option<String> {
    let trimmed = repo.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let last = last.rsplit(':').next().unwrap_or(last);
    let name = last.trim().to_lowercase();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Up to [`MAX_TITLE_KEYWORDS`] distinctive words from a window title.
pub fn extract_keywords(title: &str, tables: &LearningTables) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for raw in title.split_whitespace() {
        let word = raw.to_lowercase();
        let word = word.trim_matches(KEYWORD_TRIM);
        if word.chars().count() < KEYWORD_MIN_LEN
            || tables.is_stop_word(word)
            || URL_MARKERS.iter().any(|m| word.contains(m))
            || keywords.iter().any(|k| k == word)
        {
            continue;
        }
        keywords.push(word.to_string());
        if keywords.len() == MAX_TITLE_KEYWORDS {
            break;
        }
    }
    keywords
}

fn spec(project_id: i64, t: PatternType, value: String, m: MatchType, weight: f64) -> PatternSpec {
    PatternSpec {
        project_id,
        pattern_type: t,
        pattern_value: value,
        match_type: m,
        weight,
    }
}

/// Derive the rules a manual assignment teaches.
pub fn learn_rules(project_id: i64, ctx: &AssignmentContext, tables: &LearningTables) -> Vec<PatternSpec> {
    let mut rules = Vec::new();

    if let Some(app) = ctx.app_name.as_deref().filter(|a| !a.is_empty()) {
        if !tables.is_generic_app(app) {
            rules.push(spec(
                project_id,
                PatternType::AppName,
                app.to_lowercase(),
                MatchType::Exact,
                APP_WEIGHT,
            ));
        }
    }

    if let Some(name) = ctx.git_repo.as_deref().and_then(extract_repo_name) {
        rules.push(spec(project_id, PatternType::GitRepo, name, MatchType::Contains, REPO_WEIGHT));
    }

    if let Some(title) = ctx.window_title.as_deref() {
        for keyword in extract_keywords(title, tables) {
            rules.push(spec(
                project_id,
                PatternType::WindowTitle,
                keyword,
                MatchType::Contains,
                KEYWORD_WEIGHT,
            ));
        }
    }

    if let Some(domain) = ctx.domain.as_deref().filter(|d| !d.is_empty()) {
        if !tables.is_generic_domain(domain) {
            rules.push(spec(
                project_id,
                PatternType::Domain,
                domain.to_lowercase(),
                MatchType::Contains,
                DOMAIN_WEIGHT,
            ));
        }
    }

    rules
}
