//! SQLite-backed search replica: a `documents` row per UUID plus an FTS5
//! index over title and body.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use docmesh_core::identity::DocumentUuid;
use docmesh_core::replica::{ReplicaDocument, SearchReplica};

use crate::sqlite_store::encode_ts;

pub struct SqliteReplica {
    pool: SqlitePool,
}

impl SqliteReplica {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// UUIDs whose title or body match an FTS5 query, best match first.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<DocumentUuid>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT uuid FROM documents_fts WHERE documents_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|u| DocumentUuid::parse(u).map_err(anyhow::Error::from))
            .collect()
    }
}

#[async_trait]
impl SearchReplica for SqliteReplica {
    async fn upsert(&self, uuid: DocumentUuid, document: &ReplicaDocument) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let uuid_text = uuid.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (uuid, project, provider_kind, native_id, title, body,
                                   content_hash, last_modified, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                project = excluded.project,
                provider_kind = excluded.provider_kind,
                native_id = excluded.native_id,
                title = excluded.title,
                body = excluded.body,
                content_hash = excluded.content_hash,
                last_modified = excluded.last_modified,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&uuid_text)
        .bind(document.project.as_str())
        .bind(document.provider.kind().as_str())
        .bind(document.provider.native_id())
        .bind(&document.title)
        .bind(&document.body)
        .bind(document.content_hash.as_str())
        .bind(encode_ts(document.last_modified))
        .bind(document.status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents_fts WHERE uuid = ?")
            .bind(&uuid_text)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO documents_fts (uuid, title, body) VALUES (?, ?, ?)")
            .bind(&uuid_text)
            .bind(document.title.as_deref().unwrap_or(""))
            .bind(&document.body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
