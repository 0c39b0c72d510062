use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Create projects table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            color TEXT NOT NULL DEFAULT '#6366f1',
            description TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create project_patterns table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            pattern_type TEXT NOT NULL,
            pattern_value TEXT NOT NULL,
            match_type TEXT NOT NULL DEFAULT 'contains',
            weight REAL NOT NULL DEFAULT 1.0,
            hit_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(project_id, pattern_type, pattern_value, match_type),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create assignment_examples table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignment_examples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            event_id INTEGER NOT NULL,
            context_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create activity_events table (focus, git, browser, screenshot)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activity_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            app_name TEXT,
            window_title TEXT,
            url TEXT,
            domain TEXT,
            git_repo TEXT,
            git_branch TEXT,
            file_path TEXT,
            project_id INTEGER,
            project_confidence REAL,
            project_source TEXT NOT NULL DEFAULT 'unassigned'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create activity_embeddings table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activity_embeddings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            event_id INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            context_text TEXT NOT NULL,
            context_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(event_type, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_type_ts ON activity_events(event_type, timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_project ON activity_events(project_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_patterns_project ON project_patterns(project_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_examples_project ON assignment_examples(project_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
