//! Event-type-agnostic classifier input.
//!
//! An [`AssignmentContext`] is derived once per event and never mutated by
//! the engine. Browser windows rarely carry a URL field of their own, so
//! derivation lifts the first `http(s)://` URL out of the window title and
//! computes its domain.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{ActivityEvent, PatternType};

/// Apps whose window titles are scanned for an embedded URL.
pub const BROWSER_APPS: &[&str] = &[
    "chrome", "firefox", "safari", "brave", "edge", "chromium", "opera", "vivaldi",
];

static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("static URL regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl AssignmentContext {
    /// Derive the context for a captured event.
    pub fn from_event(event: &ActivityEvent) -> Self {
        let mut ctx = AssignmentContext {
            app_name: non_empty(event.app_name.as_deref()),
            window_title: non_empty(event.window_title.as_deref()),
            url: non_empty(event.url.as_deref()),
            domain: non_empty(event.domain.as_deref()),
            git_repo: non_empty(event.git_repo.as_deref()),
            git_branch: non_empty(event.git_branch.as_deref()),
            file_path: non_empty(event.file_path.as_deref()),
        };

        if ctx.url.is_none() && ctx.app_name.as_deref().is_some_and(is_browser) {
            if let Some(url) = ctx.window_title.as_deref().and_then(extract_url) {
                ctx.url = Some(url);
            }
        }
        if ctx.domain.is_none() {
            ctx.domain = ctx.url.as_deref().and_then(extract_domain);
        }
        ctx
    }

    /// The value a rule of the given type is tested against.
    ///
    /// Domain rules fall back to the URL when no domain was captured.
    pub fn field(&self, pattern_type: PatternType) -> Option<&str> {
        let value = match pattern_type {
            PatternType::AppName => self.app_name.as_deref(),
            PatternType::WindowTitle => self.window_title.as_deref(),
            PatternType::GitRepo => self.git_repo.as_deref(),
            PatternType::Domain => self.domain.as_deref().or(self.url.as_deref()),
            PatternType::Path => self.file_path.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.app_name.is_none()
            && self.window_title.is_none()
            && self.url.is_none()
            && self.domain.is_none()
            && self.git_repo.is_none()
            && self.git_branch.is_none()
            && self.file_path.is_none()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Whether an app name belongs to a known web browser.
pub fn is_browser(app_name: &str) -> bool {
    let lower = app_name.to_lowercase();
    BROWSER_APPS.iter().any(|b| lower.contains(b))
}

/// First `http(s)://` URL embedded in free text.
pub fn extract_url(text: &str) -> Option<String> {
    URL_IN_TEXT.find(text).map(|m| m.as_str().to_string())
}

/// Host part of a URL: protocol, path and port stripped, lower-cased.
pub fn extract_domain(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    let host = host.trim().to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://Docs.RS/tokio/latest"),
            Some("docs.rs".to_string())
        );
        assert_eq!(
            extract_domain("http://localhost:8080/x"),
            Some("localhost".to_string())
        );
        assert_eq!(extract_domain("example.com"), Some("example.com".to_string()));
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_browser_title_url_is_lifted() {
        let mut event = ActivityEvent::new(EventType::Focus, 100);
        event.app_name = Some("Firefox".into());
        event.window_title = Some("Issue 12 https://gitlab.example.org/traq/-/issues/12 - Mozilla Firefox".into());

        let ctx = AssignmentContext::from_event(&event);
        assert_eq!(
            ctx.url.as_deref(),
            Some("https://gitlab.example.org/traq/-/issues/12")
        );
        assert_eq!(ctx.domain.as_deref(), Some("gitlab.example.org"));
    }

    #[test]
    fn test_non_browser_title_url_is_ignored() {
        let mut event = ActivityEvent::new(EventType::Focus, 100);
        event.app_name = Some("Code".into());
        event.window_title = Some("notes https://example.com".into());

        let ctx = AssignmentContext::from_event(&event);
        assert!(ctx.url.is_none());
        assert!(ctx.domain.is_none());
    }

    #[test]
    fn test_domain_field_falls_back_to_url() {
        let ctx = AssignmentContext {
            url: Some("https://example.com/a".into()),
            ..Default::default()
        };
        assert_eq!(ctx.field(PatternType::Domain), Some("https://example.com/a"));
        assert_eq!(ctx.field(PatternType::AppName), None);
    }

    #[test]
    fn test_blank_fields_are_dropped() {
        let mut event = ActivityEvent::new(EventType::Git, 1);
        event.git_repo = Some("   ".into());
        let ctx = AssignmentContext::from_event(&event);
        assert!(ctx.is_empty());
    }
}
