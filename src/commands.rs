//! CLI handlers for project, rule, event, assignment and suggestion
//! commands.
//!
//! Each `run_*` function opens the service, performs one operation and
//! prints the result to stdout. Errors propagate to `main`.

use anyhow::{bail, Result};
use clap::Args;

use traq_attribution_core::context::AssignmentContext;
use traq_attribution_core::models::{ActivityEvent, EventType, Pattern};
use traq_attribution_core::rules::{validate_min_confidence, RuleInput};
use traq_attribution_core::store::Store;

use crate::assignment::AssignmentService;
use crate::backfill::parse_local_date;
use crate::config::Config;

/// Context fields shared by `event add` and `suggest`.
#[derive(Args, Debug, Clone, Default)]
pub struct EventFields {
    /// Application name (e.g. `Code`, `Firefox`).
    #[arg(long)]
    pub app: Option<String>,

    /// Window title.
    #[arg(long)]
    pub title: Option<String>,

    /// Page URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Domain; derived from the URL when omitted.
    #[arg(long)]
    pub domain: Option<String>,

    /// Git repository path or remote.
    #[arg(long)]
    pub repo: Option<String>,

    /// Git branch.
    #[arg(long)]
    pub branch: Option<String>,

    /// File path.
    #[arg(long)]
    pub file: Option<String>,
}

impl EventFields {
    fn to_event(&self, event_type: EventType, timestamp: i64) -> ActivityEvent {
        let mut event = ActivityEvent::new(event_type, timestamp);
        event.app_name = self.app.clone();
        event.window_title = self.title.clone();
        event.url = self.url.clone();
        event.domain = self.domain.clone();
        event.git_repo = self.repo.clone();
        event.git_branch = self.branch.clone();
        event.file_path = self.file.clone();
        event
    }
}

/// Rule fields shared by `rule add`, `rule update` and `rule preview`.
#[derive(Args, Debug, Clone, Default)]
pub struct RuleFields {
    /// Pattern type: app_name, window_title, git_repo, domain or path.
    #[arg(long = "type")]
    pub pattern_type: Option<String>,

    /// Value to match (case-insensitive).
    #[arg(long = "value")]
    pub pattern_value: Option<String>,

    /// Match type: exact, contains, prefix, suffix or regex.
    #[arg(long = "match")]
    pub match_type: Option<String>,

    /// Positive weight added to the project's score on a hit.
    #[arg(long)]
    pub weight: Option<f64>,
}

impl RuleFields {
    fn into_input(self, project_id: Option<i64>) -> RuleInput {
        RuleInput {
            project_id,
            pattern_type: self.pattern_type,
            pattern_value: self.pattern_value,
            match_type: self.match_type,
            weight: self.weight,
        }
    }
}

fn print_rule(rule: &Pattern) {
    println!(
        "  #{}  {} {} '{}'  weight {:.2}  hits {}",
        rule.id, rule.pattern_type, rule.match_type, rule.pattern_value, rule.weight, rule.hit_count
    );
}

// ============ Projects ============

pub async fn run_project_add(
    config: &Config,
    name: &str,
    color: Option<&str>,
    description: Option<&str>,
) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let project = service
        .create_project(name, color, description.unwrap_or_default())
        .await?;
    println!("project added");
    println!("  id: {}", project.id);
    println!("  name: {}", project.name);
    println!("  color: {}", project.color);
    Ok(())
}

pub async fn run_project_list(config: &Config) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let projects = service.list_projects().await?;
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    for p in &projects {
        if p.description.is_empty() {
            println!("{:>4}  {}  {}", p.id, p.color, p.name);
        } else {
            println!("{:>4}  {}  {} ({})", p.id, p.color, p.name, p.description);
        }
    }
    Ok(())
}

pub async fn run_project_update(
    config: &Config,
    id: i64,
    name: Option<&str>,
    color: Option<&str>,
    description: Option<&str>,
) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let project = service.update_project(id, name, color, description).await?;
    println!("project updated");
    println!("  id: {}", project.id);
    println!("  name: {}", project.name);
    println!("  color: {}", project.color);
    Ok(())
}

pub async fn run_project_delete(config: &Config, id: i64) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    service.delete_project(id).await?;
    println!("project {} deleted", id);
    Ok(())
}

pub async fn run_project_discover(config: &Config, since: Option<&str>) -> Result<()> {
    let since_ts = match since {
        Some(date) => parse_local_date("since", date)?,
        None => 0,
    };
    let service = AssignmentService::open(config).await?;
    let report = service.auto_discover_projects(since_ts).await?;

    println!("project discover");
    println!("  projects created: {}", report.created.len());
    for p in &report.created {
        println!("    {} ({})", p.name, p.color);
    }
    println!("  git rules seeded: {}", report.rules_added);
    Ok(())
}

// ============ Rules ============

pub async fn run_rule_add(config: &Config, project_id: i64, fields: RuleFields) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let rule = service.create_rule(&fields.into_input(Some(project_id))).await?;
    println!("rule added");
    print_rule(&rule);
    Ok(())
}

pub async fn run_rule_update(
    config: &Config,
    id: i64,
    project_id: Option<i64>,
    fields: RuleFields,
) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let rule = service.update_rule(id, &fields.into_input(project_id)).await?;
    println!("rule updated");
    print_rule(&rule);
    Ok(())
}

pub async fn run_rule_preview(config: &Config, fields: RuleFields) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let preview = service.preview_rule(&fields.into_input(None)).await?;
    println!("rule preview");
    println!("  matching events: {}", preview.match_count);
    for sample in &preview.samples {
        println!("    {}", sample);
    }
    Ok(())
}

pub async fn run_rule_list(config: &Config, project_id: i64) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let rules = service.list_rules(project_id).await?;
    if rules.is_empty() {
        println!("No rules for project {}.", project_id);
        return Ok(());
    }
    println!("rules for project {}", project_id);
    for rule in &rules {
        print_rule(rule);
    }
    Ok(())
}

pub async fn run_rule_delete(config: &Config, id: i64) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    service.delete_rule(id).await?;
    println!("rule {} deleted", id);
    Ok(())
}

pub async fn run_rule_apply(config: &Config, id: i64) -> Result<()> {
    let service = AssignmentService::open(config).await?;
    let applied = service.apply_rule_to_history(id).await?;
    println!("rule {} applied", id);
    println!("  events assigned: {}", applied);
    Ok(())
}

// ============ Events ============

pub async fn run_event_add(
    config: &Config,
    event_type: &str,
    timestamp: Option<i64>,
    fields: &EventFields,
) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());

    let service = AssignmentService::open(config).await?;
    let id = service
        .store()
        .insert_event(&fields.to_event(event_type, timestamp))
        .await?;
    println!("event added");
    println!("  type: {}", event_type);
    println!("  id: {}", id);
    Ok(())
}

pub async fn run_assign(config: &Config, event_type: &str, event_id: i64, project_id: i64) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    let service = AssignmentService::open(config).await?;
    service.manual_assign(event_type, event_id, project_id).await?;
    if project_id == 0 {
        println!("{} #{} unassigned", event_type, event_id);
    } else {
        println!("{} #{} assigned to project {}", event_type, event_id, project_id);
    }
    Ok(())
}

// ============ Suggestions ============

/// Which event `traq suggest` should classify.
pub enum SuggestTarget {
    Stored { event_type: String, event_id: i64 },
    Fields(EventFields),
}

pub async fn run_suggest(config: &Config, target: SuggestTarget, min_confidence: Option<f64>) -> Result<()> {
    let min_confidence = min_confidence.map(validate_min_confidence).transpose()?;
    let service = AssignmentService::open(config).await?;
    let min_confidence = min_confidence.unwrap_or_else(|| service.min_confidence());

    let event = match target {
        SuggestTarget::Stored { event_type, event_id } => {
            let event_type: EventType = event_type.parse()?;
            match service.store().get_event(event_type, event_id).await? {
                Some(event) => event,
                None => bail!("{} event {} not found", event_type, event_id),
            }
        }
        SuggestTarget::Fields(fields) => fields.to_event(EventType::Focus, 0),
    };
    let ctx = AssignmentContext::from_event(&event);

    match service.suggest(&ctx, min_confidence).await {
        Some(s) => {
            println!("suggestion");
            println!("  project: {} (id {})", s.project_name, s.project_id);
            println!("  color: {}", s.color);
            println!("  confidence: {:.2}", s.confidence);
            println!("  source: {}", s.source);
            println!("  reason: {}", s.reason);
        }
        None => println!("No suggestion."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_fields_build_event() {
        let fields = EventFields {
            app: Some("Code".into()),
            repo: Some("/src/traq".into()),
            ..Default::default()
        };
        let event = fields.to_event(EventType::Git, 42);
        assert_eq!(event.event_type, EventType::Git);
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.app_name.as_deref(), Some("Code"));
        assert_eq!(event.git_repo.as_deref(), Some("/src/traq"));
        assert!(event.window_title.is_none());
    }

    #[test]
    fn test_rule_fields_carry_project() {
        let input = RuleFields {
            pattern_type: Some("app_name".into()),
            pattern_value: Some("code".into()),
            ..Default::default()
        }
        .into_input(Some(3));
        assert_eq!(input.project_id, Some(3));
        assert_eq!(input.match_type, None);
    }
}
