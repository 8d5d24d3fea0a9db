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
    // Timestamps are unix milliseconds.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS revisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_uuid TEXT NOT NULL,
            project TEXT NOT NULL,
            provider_kind TEXT NOT NULL,
            native_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            status TEXT NOT NULL,
            origin_json TEXT NOT NULL DEFAULT '{}',
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_uuid TEXT NOT NULL,
            project TEXT NOT NULL,
            source_revision INTEGER NOT NULL,
            target_revision INTEGER NOT NULL,
            kind TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            strategy TEXT,
            FOREIGN KEY (source_revision) REFERENCES revisions(id),
            FOREIGN KEY (target_revision) REFERENCES revisions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aliases (
            legacy_id TEXT PRIMARY KEY,
            document_uuid TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            project TEXT NOT NULL,
            provider_kind TEXT NOT NULL,
            folder TEXT NOT NULL,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project, provider_kind, folder)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search replica
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            uuid TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            provider_kind TEXT NOT NULL,
            native_id TEXT NOT NULL,
            title TEXT,
            body TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                uuid UNINDEXED,
                title,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_revisions_one_canonical
        ON revisions(document_uuid, project) WHERE status = 'canonical'
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_revisions_placement
        ON revisions(project, provider_kind, native_id, last_modified DESC, id DESC)
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_revisions_document ON revisions(document_uuid, project)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(document_uuid, project) WHERE resolved_at IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}
