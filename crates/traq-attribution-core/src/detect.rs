//! Keyword-based project detection.
//!
//! A fallback for events no rule matches: a keyword table maps
//! distinctive words (usually repository or product names) to project
//! names. Detection answers with a fixed confidence per signal.

use std::collections::BTreeMap;

use crate::context::AssignmentContext;
use crate::learner::extract_repo_name;
use crate::models::Project;

pub const TITLE_CONFIDENCE: f64 = 0.8;
pub const GIT_CONFIDENCE: f64 = 0.9;

/// Project names shorter than this are not used as implicit keywords.
const MIN_PROJECT_KEYWORD_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub project_name: String,
    pub confidence: f64,
    pub signal: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectDetector {
    // Lower-cased keyword -> project name, longest keyword first.
    keywords: Vec<(String, String)>,
}

impl ProjectDetector {
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        let mut detector = Self::default();
        for (keyword, project) in table {
            detector.add_keyword(keyword, project);
        }
        detector
    }

    /// Also treat each existing project's own name as a keyword.
    pub fn with_project_names(mut self, projects: &[Project]) -> Self {
        for p in projects {
            if p.name.chars().count() >= MIN_PROJECT_KEYWORD_LEN {
                self.add_keyword(&p.name, &p.name);
            }
        }
        self
    }

    fn add_keyword(&mut self, keyword: &str, project: &str) {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() || self.keywords.iter().any(|(k, _)| *k == keyword) {
            return;
        }
        self.keywords.push((keyword, project.to_string()));
        self.keywords
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    fn lookup(&self, haystack: &str) -> Option<&str> {
        let haystack = haystack.to_lowercase();
        self.keywords
            .iter()
            .find(|(k, _)| haystack.contains(k.as_str()))
            .map(|(_, project)| project.as_str())
    }

    /// Project whose keyword appears in the window title. The app name is
    /// only consulted when the title is empty.
    pub fn detect_from_window_title(&self, title: &str, app: &str) -> Option<&str> {
        if !title.trim().is_empty() {
            return self.lookup(title);
        }
        if app.trim().is_empty() {
            return None;
        }
        self.lookup(app)
    }

    /// Project whose keyword matches the repository short name.
    pub fn detect_from_git_repo(&self, repo: &str) -> Option<&str> {
        let name = extract_repo_name(repo)?;
        self.lookup(&name)
    }

    /// Run every signal against a context, strongest first.
    pub fn detect(&self, ctx: &AssignmentContext) -> Option<Detection> {
        if let Some(project) = ctx.git_repo.as_deref().and_then(|r| self.detect_from_git_repo(r)) {
            return Some(Detection {
                project_name: project.to_string(),
                confidence: GIT_CONFIDENCE,
                signal: "git",
            });
        }
        let title = ctx.window_title.as_deref().unwrap_or_default();
        let app = ctx.app_name.as_deref().unwrap_or_default();
        self.detect_from_window_title(title, app)
            .map(|project| Detection {
                project_name: project.to_string(),
                confidence: TITLE_CONFIDENCE,
                signal: "title",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ProjectDetector {
        let mut table = BTreeMap::new();
        table.insert("traq".to_string(), "Traq".to_string());
        table.insert("traq-web".to_string(), "Traq Website".to_string());
        table.insert("ledger".to_string(), "Accounting".to_string());
        ProjectDetector::new(&table)
    }

    #[test]
    fn test_title_detection_prefers_longest_keyword() {
        let d = detector();
        assert_eq!(d.detect_from_window_title("index.tsx - TRAQ-WEB", "Code"), Some("Traq Website"));
        assert_eq!(d.detect_from_window_title("main.go - traq", "Code"), Some("Traq"));
        assert_eq!(d.detect_from_window_title("YouTube", "Firefox"), None);
    }

    #[test]
    fn test_app_only_used_without_title() {
        let d = detector();
        assert_eq!(d.detect_from_window_title("", "Ledger Live"), Some("Accounting"));
        assert_eq!(d.detect_from_window_title("Inbox", "Ledger Live"), None);
    }

    #[test]
    fn test_git_detection_uses_short_name() {
        let d = detector();
        assert_eq!(d.detect_from_git_repo("git@host:me/traq.git"), Some("Traq"));
        assert_eq!(d.detect_from_git_repo("/home/u/ledger-tools"), Some("Accounting"));
        assert_eq!(d.detect_from_git_repo("/home/u/dotfiles"), None);
    }

    #[test]
    fn test_detect_confidence_by_signal() {
        let d = detector();
        let git = d
            .detect(&AssignmentContext {
                git_repo: Some("/src/traq".into()),
                window_title: Some("ledger".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(git.project_name, "Traq");
        assert_eq!(git.confidence, GIT_CONFIDENCE);

        let title = d
            .detect(&AssignmentContext {
                window_title: Some("ledger.xlsx".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(title.project_name, "Accounting");
        assert_eq!(title.confidence, TITLE_CONFIDENCE);
    }

    #[test]
    fn test_project_names_become_keywords() {
        let projects = vec![
            Project {
                id: 1,
                name: "Moonbase".into(),
                color: "#fff".into(),
                description: String::new(),
                created_at: 0,
            },
            Project {
                id: 2,
                name: "X".into(),
                color: "#fff".into(),
                description: String::new(),
                created_at: 0,
            },
        ];
        let d = ProjectDetector::default().with_project_names(&projects);
        assert_eq!(d.detect_from_window_title("moonbase roadmap", ""), Some("Moonbase"));
        assert_eq!(d.detect_from_window_title("x marks", ""), None);
    }
}
