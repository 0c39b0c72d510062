//! Assignment orchestrator.
//!
//! [`AssignmentService`] is the façade the CLI and the backfill runner
//! talk to. It owns the pattern cache, the vector index and the embedder,
//! and combines them with the store:
//!
//! | Area | Operations |
//! |------|------------|
//! | Manual assignment | [`manual_assign`](AssignmentService::manual_assign) (then learn + example) |
//! | Rules | create, update, preview, delete, list, apply to history |
//! | Projects | create, list, get, update, delete, auto-discover |
//! | Suggestions | rule matcher, vector index, and the combined [`suggest`](AssignmentService::suggest) |
//!
//! Validation failures surface as [`ValidationError`] inside the returned
//! `anyhow::Error`. Suggestion calls never fail; they answer `None`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use traq_attribution_core::context::AssignmentContext;
use traq_attribution_core::detect::ProjectDetector;
use traq_attribution_core::embedding::{build_context_text, context_hash, vec_to_blob, Embedder};
use traq_attribution_core::error::ValidationError;
use traq_attribution_core::index::VectorIndex;
use traq_attribution_core::learner::{extract_repo_name, learn_rules, LearningTables};
use traq_attribution_core::models::{
    AssignmentResult, AssignmentSource, EventType, MatchType, Pattern, PatternSpec, PatternType,
    Project, DEFAULT_PROJECT_COLOR,
};
use traq_attribution_core::rules::{
    validate_pattern_fields, validate_rule, RuleInput, RulePreview, PREVIEW_SAMPLE_LIMIT,
};
use traq_attribution_core::store::Store;

use crate::config::Config;
use crate::embedding::{build_embedder, embed_text};
use crate::pattern_cache::PatternCache;
use crate::sqlite_store::SqliteStore;

/// Colors handed out to auto-discovered projects, in order.
pub const DISCOVERY_PALETTE: [&str; 10] = [
    "#6366f1", "#8b5cf6", "#ec4899", "#f43f5e", "#f97316", "#eab308", "#22c55e", "#14b8a6",
    "#06b6d4", "#3b82f6",
];

/// Weight of the `git_repo` rule seeded for a discovered project.
const DISCOVERY_RULE_WEIGHT: f64 = 1.0;

pub struct AssignmentService {
    store: Arc<dyn Store>,
    cache: Arc<PatternCache>,
    index: VectorIndex,
    embedder: Embedder,
    tables: LearningTables,
    keywords: BTreeMap<String, String>,
    min_confidence: f64,
}

/// What [`AssignmentService::auto_discover_projects`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    pub created: Vec<Project>,
    pub rules_added: usize,
}

impl AssignmentService {
    /// Build the service and warm the rule cache and vector index.
    ///
    /// Warm-up failures (for example a database that has not been
    /// initialized yet) are logged, not returned.
    pub async fn new(store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        let embedder = build_embedder(&config.embedding).await?;
        let service = Self::with_embedder(store, config, embedder);

        service.cache.force_refresh().await;
        if let Err(e) = service.reload_vectors().await {
            debug!(error = %format!("{:#}", e), "vector index not loaded");
        }
        Ok(service)
    }

    /// Open the configured SQLite database and build the service on it.
    pub async fn open(config: &Config) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config).await?);
        Self::new(store, config).await
    }

    /// Build without warming anything, with an explicit embedder.
    pub fn with_embedder(store: Arc<dyn Store>, config: &Config, embedder: Embedder) -> Self {
        let ttl = Duration::from_secs(config.assignment.cache_ttl_secs);
        Self {
            cache: Arc::new(PatternCache::new(Arc::clone(&store), ttl)),
            store,
            index: VectorIndex::with_neighbors(config.assignment.neighbors),
            embedder,
            tables: config.learning.tables(),
            keywords: config.detection.keywords.clone(),
            min_confidence: config.assignment.min_confidence,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn cache(&self) -> &Arc<PatternCache> {
        &self.cache
    }

    /// Configured default threshold.
    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Keyword detector over the configured table plus current project names.
    pub async fn detector(&self) -> Result<ProjectDetector> {
        let projects = self.store.list_projects().await?;
        Ok(ProjectDetector::new(&self.keywords).with_project_names(&projects))
    }

    // ============ Manual assignment ============

    /// Assign an event by hand. Project `0` clears the assignment.
    ///
    /// Only the assignment write can fail the call. Learning, the
    /// assignment example and the event embedding are best-effort.
    pub async fn manual_assign(&self, event_type: EventType, event_id: i64, project_id: i64) -> Result<()> {
        if project_id != 0 && self.store.get_project(project_id).await?.is_none() {
            return Err(ValidationError::NotFound {
                field: "project_id",
                id: project_id,
            }
            .into());
        }

        self.store
            .set_event_project(event_type, event_id, project_id, 1.0, AssignmentSource::User)
            .await?;
        info!(%event_type, event_id, project_id, "manual assignment recorded");

        if project_id == 0 {
            return Ok(());
        }

        let event = match self.store.get_event(event_type, event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "could not reload assigned event");
                return Ok(());
            }
        };
        let ctx = AssignmentContext::from_event(&event);

        self.learn_from(project_id, &ctx).await;

        match serde_json::to_string(&ctx) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .add_assignment_example(project_id, event_type, event_id, &json)
                    .await
                {
                    warn!(error = %format!("{:#}", e), "failed to store assignment example");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize assignment context"),
        }

        let text = build_context_text(&ctx);
        if !text.is_empty() {
            let blob = vec_to_blob(&embed_text(&self.embedder, &text).await);
            if let Err(e) = self
                .store
                .save_embedding(event_type, event_id, &blob, &text, &context_hash(&text))
                .await
            {
                warn!(error = %format!("{:#}", e), "failed to store event embedding");
            }
        }

        Ok(())
    }

    /// Upsert the rules a manual assignment teaches, then refresh the cache.
    pub async fn learn_from(&self, project_id: i64, ctx: &AssignmentContext) {
        let rules = learn_rules(project_id, ctx, &self.tables);
        let mut learned = 0;
        for rule in &rules {
            match self.store.upsert_pattern(rule).await {
                Ok(()) => learned += 1,
                Err(e) => warn!(
                    error = %format!("{:#}", e),
                    pattern_type = %rule.pattern_type,
                    value = %rule.pattern_value,
                    "failed to learn rule"
                ),
            }
        }
        debug!(project_id, learned, "learned rules from manual assignment");
        self.cache.force_refresh().await;
    }

    // ============ Rules ============

    pub async fn create_rule(&self, input: &RuleInput) -> Result<Pattern> {
        let spec = validate_rule(input)?;
        self.require_project(spec.project_id).await?;
        let pattern = self.store.create_pattern(&spec).await?;
        self.cache.force_refresh().await;
        Ok(pattern)
    }

    pub async fn update_rule(&self, id: i64, input: &RuleInput) -> Result<Pattern> {
        let existing = self
            .store
            .get_pattern(id)
            .await?
            .ok_or(ValidationError::NotFound { field: "id", id })?;
        let spec = validate_rule(&input.merged_with(&existing))?;
        if spec.project_id != existing.project_id {
            self.require_project(spec.project_id).await?;
        }
        self.store.update_pattern(id, &spec).await?;
        self.cache.force_refresh().await;

        Ok(Pattern {
            project_id: spec.project_id,
            pattern_type: spec.pattern_type,
            pattern_value: spec.pattern_value,
            match_type: spec.match_type,
            weight: spec.weight,
            ..existing
        })
    }

    /// Count and sample historical matches without writing anything.
    pub async fn preview_rule(&self, input: &RuleInput) -> Result<RulePreview> {
        let (pattern_type, pattern_value, match_type, weight) = validate_pattern_fields(input)?;
        let spec = PatternSpec {
            project_id: input.project_id.unwrap_or(0),
            pattern_type,
            pattern_value,
            match_type,
            weight,
        };
        Ok(RulePreview {
            match_count: self.store.count_matching_events(&spec).await?,
            samples: self
                .store
                .sample_matching_events(&spec, PREVIEW_SAMPLE_LIMIT)
                .await?,
        })
    }

    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.store.delete_pattern(id).await?;
        self.cache.force_refresh().await;
        Ok(())
    }

    pub async fn list_rules(&self, project_id: i64) -> Result<Vec<Pattern>> {
        self.store.list_patterns(project_id).await
    }

    /// Assign every unassigned historical event the rule matches to the
    /// rule's project. Returns how many events were assigned.
    pub async fn apply_rule_to_history(&self, rule_id: i64) -> Result<usize> {
        let rule = self
            .store
            .get_pattern(rule_id)
            .await?
            .ok_or(ValidationError::NotFound {
                field: "id",
                id: rule_id,
            })?;

        let targets = self.store.unassigned_matching_events(&rule.spec()).await?;
        let mut applied = 0;
        for (event_type, event_id) in targets {
            self.store
                .set_event_project(event_type, event_id, rule.project_id, 1.0, AssignmentSource::Rule)
                .await?;
            applied += 1;
        }
        info!(rule_id, applied, "applied rule to history");
        Ok(applied)
    }

    // ============ Projects ============

    pub async fn create_project(&self, name: &str, color: Option<&str>, description: &str) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField { field: "name" }.into());
        }
        let color = color
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_PROJECT_COLOR);
        self.store.create_project(name, color, description).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.store.list_projects().await
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.store.get_project(id).await
    }

    /// Change any of name, color and description.
    pub async fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        color: Option<&str>,
        description: Option<&str>,
    ) -> Result<Project> {
        let mut project = self.require_project(id).await?;
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ValidationError::MissingField { field: "name" }.into());
            }
            project.name = name.to_string();
        }
        if let Some(color) = color {
            project.color = color.trim().to_string();
        }
        if let Some(description) = description {
            project.description = description.to_string();
        }
        self.store.update_project(&project).await?;
        Ok(project)
    }

    /// Delete a project, unassign its events and drop its rules.
    pub async fn delete_project(&self, id: i64) -> Result<()> {
        self.store.delete_project(id).await?;
        self.cache.force_refresh().await;
        if let Err(e) = self.reload_vectors().await {
            warn!(error = %format!("{:#}", e), "failed to reload vector index after project deletion");
        }
        Ok(())
    }

    async fn require_project(&self, id: i64) -> Result<Project> {
        Ok(self
            .store
            .get_project(id)
            .await?
            .ok_or(ValidationError::NotFound {
                field: "project_id",
                id,
            })?)
    }

    /// Create projects for keywords found in git history since `since`.
    ///
    /// Each detected project that does not exist yet (by case-insensitive
    /// name) is created with the next palette color, and every repository
    /// that triggered it gets a `git_repo` rule.
    pub async fn auto_discover_projects(&self, since: i64) -> Result<DiscoveryReport> {
        let detector = ProjectDetector::new(&self.keywords);
        let commits = self
            .store
            .events_in_range(EventType::Git, since, i64::MAX)
            .await?;

        let mut repos_by_project: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for commit in &commits {
            let Some(repo) = commit.git_repo.as_deref() else {
                continue;
            };
            let (Some(project), Some(short)) = (detector.detect_from_git_repo(repo), extract_repo_name(repo)) else {
                continue;
            };
            let repos = repos_by_project.entry(project.to_string()).or_default();
            if !repos.contains(&short) {
                repos.push(short);
            }
        }

        let existing = self.store.list_projects().await?;
        let mut by_name: HashMap<String, i64> = existing
            .iter()
            .map(|p| (p.name.to_lowercase(), p.id))
            .collect();
        let mut next_color = existing.len();

        let mut report = DiscoveryReport::default();
        for (name, repos) in repos_by_project {
            let project_id = match by_name.get(&name.to_lowercase()) {
                Some(&id) => id,
                None => {
                    let color = DISCOVERY_PALETTE[next_color % DISCOVERY_PALETTE.len()];
                    next_color += 1;
                    let project = self
                        .store
                        .create_project(&name, color, "Auto-discovered from git history")
                        .await?;
                    info!(project = %project.name, "discovered project");
                    by_name.insert(name.to_lowercase(), project.id);
                    let id = project.id;
                    report.created.push(project);
                    id
                }
            };

            for repo in repos {
                self.store
                    .upsert_pattern(&PatternSpec {
                        project_id,
                        pattern_type: PatternType::GitRepo,
                        pattern_value: repo,
                        match_type: MatchType::Contains,
                        weight: DISCOVERY_RULE_WEIGHT,
                    })
                    .await?;
                report.rules_added += 1;
            }
        }

        self.cache.force_refresh().await;
        Ok(report)
    }

    // ============ Suggestions ============

    /// Best rule match for a context, or `None`.
    pub async fn suggest_project(&self, ctx: &AssignmentContext) -> Option<AssignmentResult> {
        let m = self.cache.match_context(ctx)?;
        let project = match self.store.get_project(m.project_id).await {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %format!("{:#}", e), "project lookup failed during suggestion");
                return None;
            }
        };
        Some(AssignmentResult {
            project_id: project.id,
            project_name: project.name,
            color: project.color,
            confidence: m.confidence,
            source: AssignmentSource::Rule,
            reason: m.reason,
        })
    }

    /// Nearest-neighbor vote over labeled embeddings, or `None`.
    pub async fn suggest_from_embeddings(
        &self,
        ctx: &AssignmentContext,
        min_confidence: f64,
    ) -> Option<AssignmentResult> {
        if self.index.is_empty() {
            return None;
        }
        let query = embed_text(&self.embedder, &build_context_text(ctx)).await;
        let mut result = self.index.suggest_project(&query, min_confidence)?;
        match self.store.get_project(result.project_id).await {
            Ok(Some(project)) => {
                result.project_name = project.name;
                result.color = project.color;
                Some(result)
            }
            _ => None,
        }
    }

    /// Rules first; embeddings when no rule clears the threshold.
    pub async fn suggest(&self, ctx: &AssignmentContext, min_confidence: f64) -> Option<AssignmentResult> {
        if let Some(rule) = self.suggest_project(ctx).await {
            if rule.confidence >= min_confidence {
                return Some(rule);
            }
        }
        self.suggest_from_embeddings(ctx, min_confidence).await
    }

    /// Rebuild the vector index from storage.
    pub async fn reload_vectors(&self) -> Result<usize> {
        let count = self.index.load(self.store.as_ref()).await?;
        debug!(count, "vector index loaded");
        Ok(count)
    }
}
