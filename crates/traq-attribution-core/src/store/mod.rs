//! Storage abstraction for project attribution.
//!
//! The [`Store`] trait defines every storage operation the engine needs:
//! project and rule CRUD, event reads and assignment writes, embedding
//! persistence and the historical scans behind rule preview.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::AssignmentContext;
use crate::matcher::{field_hit, FieldMatcher};
use crate::models::{
    ActivityEvent, AssignmentExample, AssignmentSource, EventType, Pattern, PatternSpec, PatternType,
    Project, StoredEmbedding,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Area | Methods |
/// |------|---------|
/// | Projects | `create_project`, `get_project`, `list_projects`, `update_project`, `delete_project` |
/// | Patterns | `create_pattern`, `get_pattern`, `update_pattern`, `delete_pattern`, `list_patterns`, `list_all_patterns`, `upsert_pattern` |
/// | Events | `insert_event`, `get_event`, `events_in_range`, `set_event_project` |
/// | Examples | `add_assignment_example`, `list_assignment_examples` |
/// | Embeddings | `save_embedding`, `labeled_embeddings`, `events_without_embeddings` |
/// | Preview | `count_matching_events`, `sample_matching_events`, `unassigned_matching_events` |
///
/// `delete_project` must clear the project from every event (project id
/// `NULL`, source `unassigned`) and remove its patterns and examples.
#[async_trait]
pub trait Store: Send + Sync {
    // ============ Projects ============

    async fn create_project(&self, name: &str, color: &str, description: &str) -> Result<Project>;

    async fn get_project(&self, id: i64) -> Result<Option<Project>>;

    /// All projects ordered by name.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn update_project(&self, project: &Project) -> Result<()>;

    async fn delete_project(&self, id: i64) -> Result<()>;

    // ============ Patterns ============

    async fn create_pattern(&self, spec: &PatternSpec) -> Result<Pattern>;

    async fn get_pattern(&self, id: i64) -> Result<Option<Pattern>>;

    async fn update_pattern(&self, id: i64, spec: &PatternSpec) -> Result<()>;

    async fn delete_pattern(&self, id: i64) -> Result<()>;

    async fn list_patterns(&self, project_id: i64) -> Result<Vec<Pattern>>;

    async fn list_all_patterns(&self) -> Result<Vec<Pattern>>;

    /// Insert, or on (project, type, value, match) conflict bump the hit
    /// count, refresh last-used and grow the weight by 10% while below 2.0.
    async fn upsert_pattern(&self, spec: &PatternSpec) -> Result<()>;

    // ============ Events ============

    /// Record a captured event; returns its id.
    async fn insert_event(&self, event: &ActivityEvent) -> Result<i64>;

    async fn get_event(&self, event_type: EventType, id: i64) -> Result<Option<ActivityEvent>>;

    /// Events of one type with `start <= timestamp < end`, oldest first.
    async fn events_in_range(
        &self,
        event_type: EventType,
        start: i64,
        end: i64,
    ) -> Result<Vec<ActivityEvent>>;

    /// Project id `0` clears the assignment.
    async fn set_event_project(
        &self,
        event_type: EventType,
        id: i64,
        project_id: i64,
        confidence: f64,
        source: AssignmentSource,
    ) -> Result<()>;

    // ============ Examples ============

    async fn add_assignment_example(
        &self,
        project_id: i64,
        event_type: EventType,
        event_id: i64,
        context_json: &str,
    ) -> Result<()>;

    async fn list_assignment_examples(
        &self,
        project_id: i64,
        limit: usize,
    ) -> Result<Vec<AssignmentExample>>;

    // ============ Embeddings ============

    /// Insert or replace the embedding of one event.
    async fn save_embedding(
        &self,
        event_type: EventType,
        event_id: i64,
        embedding: &[u8],
        context_text: &str,
        context_hash: &str,
    ) -> Result<()>;

    /// Every stored embedding with its event's current assignment.
    async fn labeled_embeddings(&self) -> Result<Vec<StoredEmbedding>>;

    /// Events at or after `since` that have no stored embedding.
    async fn events_without_embeddings(&self, since: i64) -> Result<Vec<ActivityEvent>>;

    // ============ Preview ============

    /// Every event whose derived context matches the rule, across all
    /// event types. Backends with an indexed search may override.
    async fn matching_events(&self, spec: &PatternSpec) -> Result<Vec<ActivityEvent>> {
        let matcher = FieldMatcher::new(&spec.pattern_value, spec.match_type);
        let mut matched = Vec::new();
        for event_type in EventType::ALL {
            for event in self.events_in_range(event_type, i64::MIN, i64::MAX).await? {
                if event_matches(&event, spec.pattern_type, &matcher) {
                    matched.push(event);
                }
            }
        }
        Ok(matched)
    }

    async fn count_matching_events(&self, spec: &PatternSpec) -> Result<usize> {
        Ok(self.matching_events(spec).await?.len())
    }

    /// Up to `limit` human-readable samples of matching events.
    async fn sample_matching_events(&self, spec: &PatternSpec, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .matching_events(spec)
            .await?
            .iter()
            .take(limit)
            .map(|e| describe_event(e, spec))
            .collect())
    }

    /// Matching events that carry no project yet.
    async fn unassigned_matching_events(&self, spec: &PatternSpec) -> Result<Vec<(EventType, i64)>> {
        Ok(self
            .matching_events(spec)
            .await?
            .into_iter()
            .filter(|e| !e.is_assigned())
            .map(|e| (e.event_type, e.id))
            .collect())
    }
}

/// Whether an event's derived context satisfies a prepared rule matcher.
pub fn event_matches(event: &ActivityEvent, pattern_type: PatternType, matcher: &FieldMatcher) -> bool {
    let ctx = AssignmentContext::from_event(event);
    field_hit(&ctx, pattern_type, matcher).is_some()
}

/// `focus #12: main.go - traq`
pub fn describe_event(event: &ActivityEvent, spec: &PatternSpec) -> String {
    let ctx = AssignmentContext::from_event(event);
    let value = ctx
        .field(spec.pattern_type)
        .or(ctx.window_title.as_deref())
        .unwrap_or_default();
    format!("{} #{}: {}", event.event_type, event.id, value)
}
