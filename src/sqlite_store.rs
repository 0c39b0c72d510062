//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate): `projects`, `project_patterns`,
//! `assignment_examples`, `activity_events` and `activity_embeddings`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use traq_attribution_core::models::{
    ActivityEvent, AssignmentExample, AssignmentSource, EventType, Pattern, PatternSpec, Project,
    StoredEmbedding,
};
use traq_attribution_core::store::Store;

use crate::config::Config;
use crate::db;

const EVENT_COLUMNS: &str = "id, event_type, timestamp, app_name, window_title, url, domain, \
    git_repo, git_branch, file_path, project_id, project_confidence, project_source";

const PATTERN_COLUMNS: &str = "id, project_id, pattern_type, pattern_value, match_type, weight, \
    hit_count, last_used_at, created_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect using the configured database path.
    pub async fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        color: row.get("color"),
        description: row.get("description"),
        created_at: row.get("created_at"),
    }
}

fn pattern_from_row(row: &SqliteRow) -> Result<Pattern> {
    let pattern_type: String = row.get("pattern_type");
    let match_type: String = row.get("match_type");
    Ok(Pattern {
        id: row.get("id"),
        project_id: row.get("project_id"),
        pattern_type: pattern_type.parse()?,
        pattern_value: row.get("pattern_value"),
        match_type: match_type.parse()?,
        weight: row.get("weight"),
        hit_count: row.get("hit_count"),
        last_used_at: row.get("last_used_at"),
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<ActivityEvent> {
    let event_type: String = row.get("event_type");
    Ok(ActivityEvent {
        id: row.get("id"),
        event_type: event_type.parse()?,
        timestamp: row.get("timestamp"),
        app_name: row.get("app_name"),
        window_title: row.get("window_title"),
        url: row.get("url"),
        domain: row.get("domain"),
        git_repo: row.get("git_repo"),
        git_branch: row.get("git_branch"),
        file_path: row.get("file_path"),
        project_id: row.get("project_id"),
        project_confidence: row.get("project_confidence"),
        project_source: row.get("project_source"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    // ============ Projects ============

    async fn create_project(&self, name: &str, color: &str, description: &str) -> Result<Project> {
        let created_at = now();
        let result =
            sqlx::query("INSERT INTO projects (name, color, description, created_at) VALUES (?, ?, ?, ?)")
                .bind(name)
                .bind(color)
                .bind(description)
                .bind(created_at)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create project '{}'", name))?;

        Ok(Project {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            color: color.to_string(),
            description: description.to_string(),
            created_at,
        })
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, color, description, created_at FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, color, description, created_at FROM projects ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let result = sqlx::query("UPDATE projects SET name = ?, color = ?, description = ? WHERE id = ?")
            .bind(&project.name)
            .bind(&project.color)
            .bind(&project.description)
            .bind(project.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("project {} not found", project.id);
        }
        Ok(())
    }

    async fn delete_project(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE activity_events SET project_id = NULL, project_confidence = NULL, \
             project_source = 'unassigned' WHERE project_id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM project_patterns WHERE project_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM assignment_examples WHERE project_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ============ Patterns ============

    async fn create_pattern(&self, spec: &PatternSpec) -> Result<Pattern> {
        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO project_patterns (project_id, pattern_type, pattern_value, match_type,
                                          weight, hit_count, last_used_at, created_at)
            VALUES (?, ?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(spec.project_id)
        .bind(spec.pattern_type.as_str())
        .bind(&spec.pattern_value)
        .bind(spec.match_type.as_str())
        .bind(spec.weight)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to create {} rule '{}' for project {}",
                spec.pattern_type, spec.pattern_value, spec.project_id
            )
        })?;

        Ok(Pattern {
            id: result.last_insert_rowid(),
            project_id: spec.project_id,
            pattern_type: spec.pattern_type,
            pattern_value: spec.pattern_value.clone(),
            match_type: spec.match_type,
            weight: spec.weight,
            hit_count: 0,
            last_used_at: None,
            created_at,
        })
    }

    async fn get_pattern(&self, id: i64) -> Result<Option<Pattern>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM project_patterns WHERE id = ?",
            PATTERN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pattern_from_row).transpose()
    }

    async fn update_pattern(&self, id: i64, spec: &PatternSpec) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE project_patterns
            SET project_id = ?, pattern_type = ?, pattern_value = ?, match_type = ?, weight = ?
            WHERE id = ?
            "#,
        )
        .bind(spec.project_id)
        .bind(spec.pattern_type.as_str())
        .bind(&spec.pattern_value)
        .bind(spec.match_type.as_str())
        .bind(spec.weight)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("pattern {} not found", id);
        }
        Ok(())
    }

    async fn delete_pattern(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM project_patterns WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_patterns(&self, project_id: i64) -> Result<Vec<Pattern>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM project_patterns WHERE project_id = ? ORDER BY weight DESC, id",
            PATTERN_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pattern_from_row).collect()
    }

    async fn list_all_patterns(&self) -> Result<Vec<Pattern>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM project_patterns ORDER BY project_id, weight DESC, id",
            PATTERN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pattern_from_row).collect()
    }

    async fn upsert_pattern(&self, spec: &PatternSpec) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_patterns (project_id, pattern_type, pattern_value, match_type,
                                          weight, hit_count, last_used_at, created_at)
            VALUES (?, ?, ?, ?, ?, 0, NULL, ?)
            ON CONFLICT(project_id, pattern_type, pattern_value, match_type) DO UPDATE SET
                hit_count = hit_count + 1,
                last_used_at = excluded.created_at,
                weight = CASE WHEN weight < 2.0 THEN weight * 1.1 ELSE weight END
            "#,
        )
        .bind(spec.project_id)
        .bind(spec.pattern_type.as_str())
        .bind(&spec.pattern_value)
        .bind(spec.match_type.as_str())
        .bind(spec.weight)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Events ============

    async fn insert_event(&self, event: &ActivityEvent) -> Result<i64> {
        let source = event
            .project_source
            .clone()
            .unwrap_or_else(|| AssignmentSource::Unassigned.as_str().to_string());
        let result = sqlx::query(
            r#"
            INSERT INTO activity_events (event_type, timestamp, app_name, window_title, url,
                                         domain, git_repo, git_branch, file_path,
                                         project_id, project_confidence, project_source)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.app_name)
        .bind(&event.window_title)
        .bind(&event.url)
        .bind(&event.domain)
        .bind(&event.git_repo)
        .bind(&event.git_branch)
        .bind(&event.file_path)
        .bind(event.project_id)
        .bind(event.project_confidence)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_event(&self, event_type: EventType, id: i64) -> Result<Option<ActivityEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM activity_events WHERE id = ? AND event_type = ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn events_in_range(
        &self,
        event_type: EventType,
        start: i64,
        end: i64,
    ) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM activity_events \
             WHERE event_type = ? AND timestamp >= ? AND timestamp < ? \
             ORDER BY timestamp, id",
            EVENT_COLUMNS
        ))
        .bind(event_type.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn set_event_project(
        &self,
        event_type: EventType,
        id: i64,
        project_id: i64,
        confidence: f64,
        source: AssignmentSource,
    ) -> Result<()> {
        let (project, confidence, source) = if project_id == 0 {
            (None, 0.0, AssignmentSource::Unassigned)
        } else {
            (Some(project_id), confidence, source)
        };

        let result = sqlx::query(
            "UPDATE activity_events SET project_id = ?, project_confidence = ?, project_source = ? \
             WHERE id = ? AND event_type = ?",
        )
        .bind(project)
        .bind(confidence)
        .bind(source.as_str())
        .bind(id)
        .bind(event_type.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("{} event {} not found", event_type, id);
        }
        Ok(())
    }

    // ============ Examples ============

    async fn add_assignment_example(
        &self,
        project_id: i64,
        event_type: EventType,
        event_id: i64,
        context_json: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO assignment_examples (project_id, event_type, event_id, context_json, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(event_type.as_str())
        .bind(event_id)
        .bind(context_json)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_assignment_examples(
        &self,
        project_id: i64,
        limit: usize,
    ) -> Result<Vec<AssignmentExample>> {
        let rows = sqlx::query(
            "SELECT id, project_id, event_type, event_id, context_json, created_at \
             FROM assignment_examples WHERE project_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event_type: String = row.get("event_type");
                Ok(AssignmentExample {
                    id: row.get("id"),
                    project_id: row.get("project_id"),
                    event_type: event_type.parse()?,
                    event_id: row.get("event_id"),
                    context_json: row.get("context_json"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    // ============ Embeddings ============

    async fn save_embedding(
        &self,
        event_type: EventType,
        event_id: i64,
        embedding: &[u8],
        context_text: &str,
        context_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_embeddings (event_type, event_id, embedding, context_text,
                                             context_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_type, event_id) DO UPDATE SET
                embedding = excluded.embedding,
                context_text = excluded.context_text,
                context_hash = excluded.context_hash,
                created_at = excluded.created_at
            "#,
        )
        .bind(event_type.as_str())
        .bind(event_id)
        .bind(embedding)
        .bind(context_text)
        .bind(context_hash)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn labeled_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query(
            r#"
            SELECT e.event_type, e.event_id, e.embedding, e.context_text,
                   a.project_id, p.name AS project_name
            FROM activity_embeddings e
            LEFT JOIN activity_events a ON a.id = e.event_id AND a.event_type = e.event_type
            LEFT JOIN projects p ON p.id = a.project_id
            ORDER BY e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event_type: String = row.get("event_type");
                Ok(StoredEmbedding {
                    event_type: event_type.parse()?,
                    event_id: row.get("event_id"),
                    embedding: row.get("embedding"),
                    context_text: row.get("context_text"),
                    project_id: row.get("project_id"),
                    project_name: row.get("project_name"),
                })
            })
            .collect()
    }

    async fn events_without_embeddings(&self, since: i64) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM activity_events a \
             WHERE a.timestamp >= ? AND NOT EXISTS ( \
                 SELECT 1 FROM activity_embeddings e \
                 WHERE e.event_type = a.event_type AND e.event_id = a.id) \
             ORDER BY a.timestamp, a.id",
            EVENT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}
