//! Persistence contracts.
//!
//! [`RevisionStore`] holds revisions, conflicts, and legacy aliases;
//! [`CursorStore`] holds per-folder sync watermarks. Both are async traits
//! returning `anyhow::Result` so backends can surface driver errors with
//! context. The in-memory backend lives in [`memory`]; the SQLite backend
//! lives in the `docmesh` crate.
//!
//! # Atomicity
//!
//! Methods that change more than one row ([`append_revision`] with a
//! supersede, [`append_diverging`], [`open_conflict`], [`close_conflict`])
//! must apply all of their changes or none. Implementations must also refuse any change
//! that would leave two `canonical` revisions for one (uuid, project).
//!
//! [`append_revision`]: RevisionStore::append_revision
//! [`append_diverging`]: RevisionStore::append_diverging
//! [`open_conflict`]: RevisionStore::open_conflict
//! [`close_conflict`]: RevisionStore::close_conflict

pub mod faulty;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::{Conflict, ConflictId, NewConflict, PendingConflict, ResolutionStrategy};
use crate::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use crate::revision::{NewRevision, Revision, RevisionId, RevisionStatus};

/// Legacy identifier → UUID mapping, kept for backward-compatible lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub legacy_id: String,
    pub uuid: DocumentUuid,
    pub created_at: DateTime<Utc>,
}

/// One monitored (project, provider, folder) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderKey {
    pub project: ProjectName,
    pub provider: ProviderKind,
    pub folder: String,
}

impl std::fmt::Display for FolderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.provider, self.folder)
    }
}

#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Append a revision. With `supersede`, also set that revision's status,
    /// atomically with the append.
    async fn append_revision(
        &self,
        revision: &NewRevision,
        supersede: Option<(RevisionId, RevisionStatus)>,
    ) -> Result<Revision>;

    /// Append a revision and open `pending` against it in one unit. Both
    /// revisions end up `conflict`; on error neither the revision nor the
    /// conflict is stored.
    async fn append_diverging(
        &self,
        revision: &NewRevision,
        pending: &PendingConflict,
    ) -> Result<(Revision, Conflict)>;

    /// Latest revision for one placement, by `(last_modified, id)` descending.
    async fn latest_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<Revision>>;

    /// Latest revision on any placement of `kind` whose status is in `statuses`.
    async fn latest_for_kind(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        kind: ProviderKind,
        statuses: &[RevisionStatus],
    ) -> Result<Option<Revision>>;

    async fn canonical_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
    ) -> Result<Option<Revision>>;

    async fn revision(&self, id: RevisionId) -> Result<Option<Revision>>;

    /// Every revision of a document in a project, newest first.
    async fn revisions(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Revision>>;

    /// The UUID previously recorded for a placement, if any.
    async fn uuid_for_provider(
        &self,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<DocumentUuid>>;

    /// Insert a conflict and mark both of its revisions `conflict`.
    async fn open_conflict(&self, conflict: &NewConflict) -> Result<Conflict>;

    async fn conflict(&self, id: ConflictId) -> Result<Option<Conflict>>;

    async fn open_conflicts(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Conflict>>;

    async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>>;

    /// Resolve an open conflict: apply `updates` in order and stamp the
    /// strategy and resolution time. Fails if the conflict is already closed.
    async fn close_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_at: DateTime<Utc>,
        updates: &[(RevisionId, RevisionStatus)],
    ) -> Result<Conflict>;

    /// Idempotent for an identical mapping; an existing mapping to a
    /// different UUID is an error.
    async fn insert_alias(&self, alias: &Alias) -> Result<()>;

    async fn lookup_alias(&self, legacy_id: &str) -> Result<Option<DocumentUuid>>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, key: &FolderKey) -> Result<Option<DateTime<Utc>>>;

    async fn set_cursor(&self, key: &FolderKey, cursor: DateTime<Utc>) -> Result<()>;
}
