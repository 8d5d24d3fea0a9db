//! SQLite-backed [`RevisionStore`] and [`CursorStore`].
//!
//! All encoding between domain values and columns happens here: UUIDs as
//! hyphenated text, timestamps as unix milliseconds, enums as their
//! lowercase names, origin metadata as JSON. Multi-row operations run in
//! a single transaction; the partial unique index on `status = 'canonical'`
//! backs the one-canonical rule.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use docmesh_core::conflict::{Conflict, ConflictId, NewConflict, PendingConflict, ResolutionStrategy};
use docmesh_core::hash::ContentHash;
use docmesh_core::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use docmesh_core::revision::{NewRevision, Revision, RevisionId, RevisionStatus};
use docmesh_core::store::{Alias, CursorStore, FolderKey, RevisionStore};

const REVISION_COLUMNS: &str = "id, document_uuid, project, provider_kind, native_id, content_hash, \
     last_modified, status, origin_json, recorded_at";

const CONFLICT_COLUMNS: &str = "id, document_uuid, project, source_revision, target_revision, kind, \
     detected_at, resolved_at, strategy";

/// SQLite implementation of the persistence contracts.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Encode / decode
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn decode_ts(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| anyhow!("timestamp {millis} out of range"))
}

fn decode_revision(row: &SqliteRow) -> Result<Revision> {
    let kind: ProviderKind = row.try_get::<String, _>("provider_kind")?.parse()?;
    let origin_json: String = row.try_get("origin_json")?;
    Ok(Revision {
        id: RevisionId(row.try_get("id")?),
        uuid: DocumentUuid::parse(&row.try_get::<String, _>("document_uuid")?)?,
        project: ProjectName::new(row.try_get::<String, _>("project")?)?,
        provider: ProviderId::new(kind, row.try_get::<String, _>("native_id")?)?,
        content_hash: ContentHash::from_hex(row.try_get::<String, _>("content_hash")?)?,
        last_modified: decode_ts(row.try_get("last_modified")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        origin: serde_json::from_str(&origin_json).context("Corrupt origin_json")?,
        recorded_at: decode_ts(row.try_get("recorded_at")?)?,
    })
}

fn decode_conflict(row: &SqliteRow) -> Result<Conflict> {
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;
    let strategy: Option<String> = row.try_get("strategy")?;
    Ok(Conflict {
        id: ConflictId(row.try_get("id")?),
        uuid: DocumentUuid::parse(&row.try_get::<String, _>("document_uuid")?)?,
        project: ProjectName::new(row.try_get::<String, _>("project")?)?,
        source_revision: RevisionId(row.try_get("source_revision")?),
        target_revision: RevisionId(row.try_get("target_revision")?),
        kind: row.try_get::<String, _>("kind")?.parse()?,
        detected_at: decode_ts(row.try_get("detected_at")?)?,
        resolved_at: resolved_at.map(decode_ts).transpose()?,
        strategy: strategy.map(|s| s.parse::<ResolutionStrategy>()).transpose()?,
    })
}

async fn set_status(
    tx: &mut Transaction<'_, Sqlite>,
    id: RevisionId,
    status: RevisionStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE revisions SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id.0)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to set revision {id} to {status}"))?;
    if result.rows_affected() != 1 {
        bail!("revision {id} does not exist");
    }
    Ok(())
}

async fn fetch_conflict(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<Conflict> {
    let row = sqlx::query(&format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?"))
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    decode_conflict(&row)
}

async fn insert_revision(tx: &mut Transaction<'_, Sqlite>, revision: &NewRevision) -> Result<Revision> {
    if revision.uuid.is_zero() {
        bail!("refusing to persist a revision without a document UUID");
    }
    let origin_json = serde_json::to_string(&revision.origin)?;
    let result = sqlx::query(
        r#"
        INSERT INTO revisions (document_uuid, project, provider_kind, native_id, content_hash,
                               last_modified, status, origin_json, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(revision.uuid.to_string())
    .bind(revision.project.as_str())
    .bind(revision.provider.kind().as_str())
    .bind(revision.provider.native_id())
    .bind(revision.content_hash.as_str())
    .bind(encode_ts(revision.last_modified))
    .bind(revision.status.as_str())
    .bind(&origin_json)
    .bind(encode_ts(revision.recorded_at))
    .execute(&mut **tx)
    .await
    .with_context(|| format!("Failed to append revision for {}", revision.uuid))?;

    fetch_revision(tx, RevisionId(result.last_insert_rowid())).await
}

async fn fetch_revision(tx: &mut Transaction<'_, Sqlite>, id: RevisionId) -> Result<Revision> {
    let row = sqlx::query(&format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE id = ?"))
        .bind(id.0)
        .fetch_one(&mut **tx)
        .await?;
    decode_revision(&row)
}

/// Check both sides belong to the document, mark them `conflict`, and
/// insert the conflict row.
async fn insert_conflict(tx: &mut Transaction<'_, Sqlite>, conflict: &NewConflict) -> Result<Conflict> {
    let owned: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM revisions WHERE id IN (?, ?) AND document_uuid = ? AND project = ?",
    )
    .bind(conflict.source_revision.0)
    .bind(conflict.target_revision.0)
    .bind(conflict.uuid.to_string())
    .bind(conflict.project.as_str())
    .fetch_one(&mut **tx)
    .await?;
    if owned != 2 {
        bail!(
            "revisions {} and {} are not both revisions of {}",
            conflict.source_revision,
            conflict.target_revision,
            conflict.uuid
        );
    }

    set_status(tx, conflict.source_revision, RevisionStatus::Conflict).await?;
    set_status(tx, conflict.target_revision, RevisionStatus::Conflict).await?;

    let result = sqlx::query(
        r#"
        INSERT INTO conflicts (document_uuid, project, source_revision, target_revision, kind, detected_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(conflict.uuid.to_string())
    .bind(conflict.project.as_str())
    .bind(conflict.source_revision.0)
    .bind(conflict.target_revision.0)
    .bind(conflict.kind.as_str())
    .bind(encode_ts(conflict.detected_at))
    .execute(&mut **tx)
    .await?;

    fetch_conflict(tx, result.last_insert_rowid()).await
}

#[async_trait]
impl RevisionStore for SqliteStore {
    async fn append_revision(
        &self,
        revision: &NewRevision,
        supersede: Option<(RevisionId, RevisionStatus)>,
    ) -> Result<Revision> {
        let mut tx = self.pool.begin().await?;

        // Demote before insert so the canonical index never sees two rows.
        if let Some((id, status)) = supersede {
            set_status(&mut tx, id, status).await?;
        }
        let stored = insert_revision(&mut tx, revision).await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn append_diverging(
        &self,
        revision: &NewRevision,
        pending: &PendingConflict,
    ) -> Result<(Revision, Conflict)> {
        let mut tx = self.pool.begin().await?;

        let inserted = insert_revision(&mut tx, revision).await?;
        let conflict = insert_conflict(&mut tx, &pending.for_candidate(&inserted)).await?;
        let stored = fetch_revision(&mut tx, inserted.id).await?;

        tx.commit().await?;
        Ok((stored, conflict))
    }

    async fn latest_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<Revision>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {REVISION_COLUMNS} FROM revisions
            WHERE document_uuid = ? AND project = ? AND provider_kind = ? AND native_id = ?
            ORDER BY last_modified DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(uuid.to_string())
        .bind(project.as_str())
        .bind(provider.kind().as_str())
        .bind(provider.native_id())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_revision).transpose()
    }

    async fn latest_for_kind(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        kind: ProviderKind,
        statuses: &[RevisionStatus],
    ) -> Result<Option<Revision>> {
        if statuses.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            r#"
            SELECT {REVISION_COLUMNS} FROM revisions
            WHERE document_uuid = ? AND project = ? AND provider_kind = ? AND status IN ({placeholders})
            ORDER BY last_modified DESC, id DESC
            LIMIT 1
            "#
        );
        let mut query = sqlx::query(&sql)
            .bind(uuid.to_string())
            .bind(project.as_str())
            .bind(kind.as_str());
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_revision).transpose()
    }

    async fn canonical_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
    ) -> Result<Option<Revision>> {
        let row = sqlx::query(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions WHERE document_uuid = ? AND project = ? AND status = 'canonical'"
        ))
        .bind(uuid.to_string())
        .bind(project.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_revision).transpose()
    }

    async fn revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        let row = sqlx::query(&format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_revision).transpose()
    }

    async fn revisions(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Revision>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REVISION_COLUMNS} FROM revisions
            WHERE document_uuid = ? AND project = ?
            ORDER BY last_modified DESC, id DESC
            "#
        ))
        .bind(uuid.to_string())
        .bind(project.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_revision).collect()
    }

    async fn uuid_for_provider(
        &self,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<DocumentUuid>> {
        let uuid: Option<String> = sqlx::query_scalar(
            r#"
            SELECT document_uuid FROM revisions
            WHERE project = ? AND provider_kind = ? AND native_id = ?
            ORDER BY last_modified DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(project.as_str())
        .bind(provider.kind().as_str())
        .bind(provider.native_id())
        .fetch_optional(&self.pool)
        .await?;
        Ok(uuid.map(|u| DocumentUuid::parse(&u)).transpose()?)
    }

    async fn open_conflict(&self, conflict: &NewConflict) -> Result<Conflict> {
        let mut tx = self.pool.begin().await?;
        let stored = insert_conflict(&mut tx, conflict).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn conflict(&self, id: ConflictId) -> Result<Option<Conflict>> {
        let row = sqlx::query(&format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_conflict).transpose()
    }

    async fn open_conflicts(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Conflict>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CONFLICT_COLUMNS} FROM conflicts
            WHERE document_uuid = ? AND project = ? AND resolved_at IS NULL
            ORDER BY id
            "#
        ))
        .bind(uuid.to_string())
        .bind(project.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_conflict).collect()
    }

    async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE resolved_at IS NULL"
        };
        let rows = sqlx::query(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts {filter} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_conflict).collect()
    }

    async fn close_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_at: DateTime<Utc>,
        updates: &[(RevisionId, RevisionStatus)],
    ) -> Result<Conflict> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE conflicts SET resolved_at = ?, strategy = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(encode_ts(resolved_at))
        .bind(strategy.as_str())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            bail!("conflict {id} does not exist or is already resolved");
        }

        for &(revision, status) in updates {
            set_status(&mut tx, revision, status).await?;
        }

        let closed = fetch_conflict(&mut tx, id.0).await?;
        tx.commit().await?;
        Ok(closed)
    }

    async fn insert_alias(&self, alias: &Alias) -> Result<()> {
        if alias.uuid.is_zero() {
            bail!("alias '{}' must map to a non-zero UUID", alias.legacy_id);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO aliases (legacy_id, document_uuid, created_at) VALUES (?, ?, ?) ON CONFLICT(legacy_id) DO NOTHING",
        )
        .bind(&alias.legacy_id)
        .bind(alias.uuid.to_string())
        .bind(encode_ts(alias.created_at))
        .execute(&mut *tx)
        .await?;

        let existing: String = sqlx::query_scalar("SELECT document_uuid FROM aliases WHERE legacy_id = ?")
            .bind(&alias.legacy_id)
            .fetch_one(&mut *tx)
            .await?;
        if existing != alias.uuid.to_string() {
            bail!("alias '{}' already maps to {}", alias.legacy_id, existing);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn lookup_alias(&self, legacy_id: &str) -> Result<Option<DocumentUuid>> {
        let uuid: Option<String> = sqlx::query_scalar("SELECT document_uuid FROM aliases WHERE legacy_id = ?")
            .bind(legacy_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(uuid.map(|u| DocumentUuid::parse(&u)).transpose()?)
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn get_cursor(&self, key: &FolderKey) -> Result<Option<DateTime<Utc>>> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT cursor FROM cursors WHERE project = ? AND provider_kind = ? AND folder = ?",
        )
        .bind(key.project.as_str())
        .bind(key.provider.as_str())
        .bind(&key.folder)
        .fetch_optional(&self.pool)
        .await?;
        cursor.map(decode_ts).transpose()
    }

    async fn set_cursor(&self, key: &FolderKey, cursor: DateTime<Utc>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO cursors (project, provider_kind, folder, cursor, updated_at) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(project, provider_kind, folder) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(key.project.as_str())
        .bind(key.provider.as_str())
        .bind(&key.folder)
        .bind(encode_ts(cursor))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
