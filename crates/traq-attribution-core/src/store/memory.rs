//! In-memory [`Store`] implementation for testing.
//!
//! Uses `Vec`s behind `std::sync::RwLock` for thread safety. Ids are
//! assigned from per-table counters starting at 1, like SQLite rowids.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{
    ActivityEvent, AssignmentExample, AssignmentSource, EventType, Pattern, PatternSpec, Project,
    StoredEmbedding,
};

use super::Store;

/// Weight growth on a repeated upsert stops at this value.
pub const UPSERT_WEIGHT_CAP: f64 = 2.0;
pub const UPSERT_WEIGHT_GROWTH: f64 = 1.1;

struct StoredEmbeddingRow {
    event_type: EventType,
    event_id: i64,
    embedding: Vec<u8>,
    context_text: String,
    _context_hash: String,
}

#[derive(Default)]
struct Tables {
    projects: Vec<Project>,
    patterns: Vec<Pattern>,
    events: Vec<ActivityEvent>,
    examples: Vec<AssignmentExample>,
    embeddings: Vec<StoredEmbeddingRow>,
    next_project_id: i64,
    next_pattern_id: i64,
    next_event_id: i64,
    next_example_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-memory store for tests.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl InMemoryStore {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(&self, name: &str, color: &str, description: &str) -> Result<Project> {
        let mut t = self.write();
        let project = Project {
            id: next_id(&mut t.next_project_id),
            name: name.to_string(),
            color: color.to_string(),
            description: description.to_string(),
            created_at: now(),
        };
        t.projects.push(project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let t = self.read();
        Ok(t.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let t = self.read();
        let mut projects = t.projects.clone();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let mut t = self.write();
        match t.projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => {
                existing.name = project.name.clone();
                existing.color = project.color.clone();
                existing.description = project.description.clone();
                Ok(())
            }
            None => bail!("project {} not found", project.id),
        }
    }

    async fn delete_project(&self, id: i64) -> Result<()> {
        let mut t = self.write();
        for event in t.events.iter_mut().filter(|e| e.project_id == Some(id)) {
            event.project_id = None;
            event.project_confidence = None;
            event.project_source = Some(AssignmentSource::Unassigned.as_str().to_string());
        }
        t.patterns.retain(|p| p.project_id != id);
        t.examples.retain(|e| e.project_id != id);
        t.projects.retain(|p| p.id != id);
        Ok(())
    }

    async fn create_pattern(&self, spec: &PatternSpec) -> Result<Pattern> {
        let mut t = self.write();
        if t.patterns.iter().any(|p| same_key(p, spec)) {
            bail!(
                "pattern already exists: {} {} '{}'",
                spec.pattern_type,
                spec.match_type,
                spec.pattern_value
            );
        }
        let pattern = Pattern {
            id: next_id(&mut t.next_pattern_id),
            project_id: spec.project_id,
            pattern_type: spec.pattern_type,
            pattern_value: spec.pattern_value.clone(),
            match_type: spec.match_type,
            weight: spec.weight,
            hit_count: 0,
            last_used_at: None,
            created_at: now(),
        };
        t.patterns.push(pattern.clone());
        Ok(pattern)
    }

    async fn get_pattern(&self, id: i64) -> Result<Option<Pattern>> {
        let t = self.read();
        Ok(t.patterns.iter().find(|p| p.id == id).cloned())
    }

    async fn update_pattern(&self, id: i64, spec: &PatternSpec) -> Result<()> {
        let mut t = self.write();
        match t.patterns.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.project_id = spec.project_id;
                p.pattern_type = spec.pattern_type;
                p.pattern_value = spec.pattern_value.clone();
                p.match_type = spec.match_type;
                p.weight = spec.weight;
                Ok(())
            }
            None => bail!("pattern {} not found", id),
        }
    }

    async fn delete_pattern(&self, id: i64) -> Result<()> {
        let mut t = self.write();
        t.patterns.retain(|p| p.id != id);
        Ok(())
    }

    async fn list_patterns(&self, project_id: i64) -> Result<Vec<Pattern>> {
        let t = self.read();
        Ok(t.patterns
            .iter()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_all_patterns(&self) -> Result<Vec<Pattern>> {
        let t = self.read();
        Ok(t.patterns.clone())
    }

    async fn upsert_pattern(&self, spec: &PatternSpec) -> Result<()> {
        {
            let mut t = self.write();
            if let Some(p) = t.patterns.iter_mut().find(|p| same_key(p, spec)) {
                p.hit_count += 1;
                p.last_used_at = Some(now());
                if p.weight < UPSERT_WEIGHT_CAP {
                    p.weight *= UPSERT_WEIGHT_GROWTH;
                }
                return Ok(());
            }
        }
        self.create_pattern(spec).await.map(|_| ())
    }

    async fn insert_event(&self, event: &ActivityEvent) -> Result<i64> {
        let mut t = self.write();
        let mut stored = event.clone();
        stored.id = next_id(&mut t.next_event_id);
        if stored.project_source.is_none() {
            stored.project_source = Some(AssignmentSource::Unassigned.as_str().to_string());
        }
        let id = stored.id;
        t.events.push(stored);
        Ok(id)
    }

    async fn get_event(&self, event_type: EventType, id: i64) -> Result<Option<ActivityEvent>> {
        let t = self.read();
        Ok(t.events
            .iter()
            .find(|e| e.id == id && e.event_type == event_type)
            .cloned())
    }

    async fn events_in_range(
        &self,
        event_type: EventType,
        start: i64,
        end: i64,
    ) -> Result<Vec<ActivityEvent>> {
        let t = self.read();
        let mut events: Vec<ActivityEvent> = t
            .events
            .iter()
            .filter(|e| e.event_type == event_type && e.timestamp >= start && e.timestamp < end)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.timestamp, e.id));
        Ok(events)
    }

    async fn set_event_project(
        &self,
        event_type: EventType,
        id: i64,
        project_id: i64,
        confidence: f64,
        source: AssignmentSource,
    ) -> Result<()> {
        let mut t = self.write();
        let Some(event) = t
            .events
            .iter_mut()
            .find(|e| e.id == id && e.event_type == event_type)
        else {
            bail!("{} event {} not found", event_type, id);
        };
        if project_id == 0 {
            event.project_id = None;
            event.project_confidence = Some(0.0);
            event.project_source = Some(AssignmentSource::Unassigned.as_str().to_string());
        } else {
            event.project_id = Some(project_id);
            event.project_confidence = Some(confidence);
            event.project_source = Some(source.as_str().to_string());
        }
        Ok(())
    }

    async fn add_assignment_example(
        &self,
        project_id: i64,
        event_type: EventType,
        event_id: i64,
        context_json: &str,
    ) -> Result<()> {
        let mut t = self.write();
        let example = AssignmentExample {
            id: next_id(&mut t.next_example_id),
            project_id,
            event_type,
            event_id,
            context_json: context_json.to_string(),
            created_at: now(),
        };
        t.examples.push(example);
        Ok(())
    }

    async fn list_assignment_examples(
        &self,
        project_id: i64,
        limit: usize,
    ) -> Result<Vec<AssignmentExample>> {
        let t = self.read();
        Ok(t.examples
            .iter()
            .rev()
            .filter(|e| e.project_id == project_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_embedding(
        &self,
        event_type: EventType,
        event_id: i64,
        embedding: &[u8],
        context_text: &str,
        context_hash: &str,
    ) -> Result<()> {
        let mut t = self.write();
        t.embeddings
            .retain(|r| !(r.event_type == event_type && r.event_id == event_id));
        t.embeddings.push(StoredEmbeddingRow {
            event_type,
            event_id,
            embedding: embedding.to_vec(),
            context_text: context_text.to_string(),
            _context_hash: context_hash.to_string(),
        });
        Ok(())
    }

    async fn labeled_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let t = self.read();
        Ok(t.embeddings
            .iter()
            .map(|row| {
                let project_id = t
                    .events
                    .iter()
                    .find(|e| e.id == row.event_id && e.event_type == row.event_type)
                    .and_then(|e| e.project_id);
                let project_name = project_id.and_then(|pid| {
                    t.projects
                        .iter()
                        .find(|p| p.id == pid)
                        .map(|p| p.name.clone())
                });
                StoredEmbedding {
                    event_type: row.event_type,
                    event_id: row.event_id,
                    embedding: row.embedding.clone(),
                    context_text: row.context_text.clone(),
                    project_id,
                    project_name,
                }
            })
            .collect())
    }

    async fn events_without_embeddings(&self, since: i64) -> Result<Vec<ActivityEvent>> {
        let t = self.read();
        let mut events: Vec<ActivityEvent> = t
            .events
            .iter()
            .filter(|e| e.timestamp >= since)
            .filter(|e| {
                !t.embeddings
                    .iter()
                    .any(|r| r.event_type == e.event_type && r.event_id == e.id)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.timestamp, e.id));
        Ok(events)
    }
}

fn same_key(p: &Pattern, spec: &PatternSpec) -> bool {
    p.project_id == spec.project_id
        && p.pattern_type == spec.pattern_type
        && p.pattern_value == spec.pattern_value
        && p.match_type == spec.match_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchType, PatternType};

    fn spec(project_id: i64, value: &str) -> PatternSpec {
        PatternSpec {
            project_id,
            pattern_type: PatternType::AppName,
            pattern_value: value.to_string(),
            match_type: MatchType::Exact,
            weight: 0.5,
        }
    }

    #[tokio::test]
    async fn test_upsert_bumps_instead_of_duplicating() {
        let store = InMemoryStore::new();
        let p = store.create_project("Traq", "#fff", "").await.unwrap();

        store.upsert_pattern(&spec(p.id, "code")).await.unwrap();
        store.upsert_pattern(&spec(p.id, "code")).await.unwrap();

        let patterns = store.list_patterns(p.id).await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].hit_count, 1);
        assert!((patterns[0].weight - 0.55).abs() < 1e-9);
        assert!(patterns[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_upsert_weight_growth_stops_at_cap() {
        let store = InMemoryStore::new();
        let p = store.create_project("Traq", "#fff", "").await.unwrap();
        for _ in 0..40 {
            store.upsert_pattern(&spec(p.id, "code")).await.unwrap();
        }
        let weight = store.list_patterns(p.id).await.unwrap()[0].weight;
        assert!(weight >= UPSERT_WEIGHT_CAP);
        assert!(weight < UPSERT_WEIGHT_CAP * UPSERT_WEIGHT_GROWTH);
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let store = InMemoryStore::new();
        let p = store.create_project("Traq", "#fff", "").await.unwrap();
        store.create_pattern(&spec(p.id, "code")).await.unwrap();
        let id = store
            .insert_event(&ActivityEvent::new(EventType::Focus, 10))
            .await
            .unwrap();
        store
            .set_event_project(EventType::Focus, id, p.id, 1.0, AssignmentSource::User)
            .await
            .unwrap();
        store
            .add_assignment_example(p.id, EventType::Focus, id, "{}")
            .await
            .unwrap();

        store.delete_project(p.id).await.unwrap();

        let event = store.get_event(EventType::Focus, id).await.unwrap().unwrap();
        assert_eq!(event.project_id, None);
        assert_eq!(event.project_source.as_deref(), Some("unassigned"));
        assert!(store.list_all_patterns().await.unwrap().is_empty());
        assert!(store.list_assignment_examples(p.id, 10).await.unwrap().is_empty());
        assert!(store.get_project(p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preview_scans_all_event_types() {
        let store = InMemoryStore::new();
        let mut focus = ActivityEvent::new(EventType::Focus, 1);
        focus.app_name = Some("Code".into());
        let mut git = ActivityEvent::new(EventType::Git, 2);
        git.app_name = Some("code".into());
        let mut other = ActivityEvent::new(EventType::Focus, 3);
        other.app_name = Some("Slack".into());
        for e in [&focus, &git, &other] {
            store.insert_event(e).await.unwrap();
        }

        let rule = spec(1, "code");
        assert_eq!(store.count_matching_events(&rule).await.unwrap(), 2);
        let samples = store.sample_matching_events(&rule, 5).await.unwrap();
        assert_eq!(samples, vec!["focus #1: Code", "git #2: code"]);
        assert_eq!(store.unassigned_matching_events(&rule).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_regex_preview_uses_rule_as_written() {
        let store = InMemoryStore::new();
        for title in ["ticket-abc", "TICKET-XYZ", "ticket-123"] {
            let mut e = ActivityEvent::new(EventType::Focus, 1);
            e.window_title = Some(title.into());
            store.insert_event(&e).await.unwrap();
        }

        let rule = PatternSpec {
            project_id: 1,
            pattern_type: PatternType::WindowTitle,
            pattern_value: r"^ticket-\D+$".into(),
            match_type: MatchType::Regex,
            weight: 1.0,
        };
        let samples = store.sample_matching_events(&rule, 5).await.unwrap();
        assert_eq!(samples, vec!["focus #1: ticket-abc", "focus #2: TICKET-XYZ"]);
    }

    #[tokio::test]
    async fn test_events_without_embeddings() {
        let store = InMemoryStore::new();
        let a = store
            .insert_event(&ActivityEvent::new(EventType::Focus, 100))
            .await
            .unwrap();
        store
            .insert_event(&ActivityEvent::new(EventType::Git, 200))
            .await
            .unwrap();
        store
            .insert_event(&ActivityEvent::new(EventType::Focus, 50))
            .await
            .unwrap();
        store
            .save_embedding(EventType::Focus, a, &[0, 0, 128, 63], "app:x", "h")
            .await
            .unwrap();

        let pending = store.events_without_embeddings(60).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, EventType::Git);
    }
}
