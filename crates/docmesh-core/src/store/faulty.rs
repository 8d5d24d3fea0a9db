//! A store wrapper that fails chosen operations on demand.
//!
//! Used to drive the error paths of the recorder and the sync loop: arm a
//! [`StoreOp`] with [`FaultyStore::fail_next`] and the next calls of that
//! kind return an error without reaching the inner store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::conflict::{Conflict, ConflictId, NewConflict, PendingConflict, ResolutionStrategy};
use crate::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use crate::revision::{NewRevision, Revision, RevisionId, RevisionStatus};

use super::{Alias, CursorStore, FolderKey, RevisionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `append_revision`
    Append,
    /// `append_diverging`
    AppendDiverging,
    /// Every read of revisions, conflicts, or aliases.
    Read,
    OpenConflict,
    CloseConflict,
    InsertAlias,
    SetCursor,
}

pub struct FaultyStore<S> {
    inner: S,
    armed: Mutex<HashMap<StoreOp, usize>>,
    injected: AtomicUsize,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            armed: Mutex::new(HashMap::new()),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        if let Ok(mut armed) = self.armed.lock() {
            let remaining = armed.entry(op).or_default();
            *remaining = remaining.saturating_add(times);
        }
    }

    /// Fail every call of `op` until [`reset`](Self::reset).
    pub fn fail_always(&self, op: StoreOp) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(op, usize::MAX);
        }
    }

    pub fn reset(&self) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.clear();
        }
    }

    /// How many failures were injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn trip(&self, op: StoreOp) -> Result<()> {
        let mut armed = self
            .armed
            .lock()
            .map_err(|_| anyhow!("fault table lock poisoned"))?;
        match armed.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                self.injected.fetch_add(1, Ordering::SeqCst);
                bail!("injected {op:?} failure")
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S: RevisionStore> RevisionStore for FaultyStore<S> {
    async fn append_revision(
        &self,
        revision: &NewRevision,
        supersede: Option<(RevisionId, RevisionStatus)>,
    ) -> Result<Revision> {
        self.trip(StoreOp::Append)?;
        self.inner.append_revision(revision, supersede).await
    }

    async fn append_diverging(
        &self,
        revision: &NewRevision,
        pending: &PendingConflict,
    ) -> Result<(Revision, Conflict)> {
        self.trip(StoreOp::AppendDiverging)?;
        self.inner.append_diverging(revision, pending).await
    }

    async fn latest_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<Revision>> {
        self.trip(StoreOp::Read)?;
        self.inner.latest_revision(uuid, project, provider).await
    }

    async fn latest_for_kind(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        kind: ProviderKind,
        statuses: &[RevisionStatus],
    ) -> Result<Option<Revision>> {
        self.trip(StoreOp::Read)?;
        self.inner.latest_for_kind(uuid, project, kind, statuses).await
    }

    async fn canonical_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
    ) -> Result<Option<Revision>> {
        self.trip(StoreOp::Read)?;
        self.inner.canonical_revision(uuid, project).await
    }

    async fn revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        self.trip(StoreOp::Read)?;
        self.inner.revision(id).await
    }

    async fn revisions(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Revision>> {
        self.trip(StoreOp::Read)?;
        self.inner.revisions(uuid, project).await
    }

    async fn uuid_for_provider(
        &self,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<DocumentUuid>> {
        self.trip(StoreOp::Read)?;
        self.inner.uuid_for_provider(project, provider).await
    }

    async fn open_conflict(&self, conflict: &NewConflict) -> Result<Conflict> {
        self.trip(StoreOp::OpenConflict)?;
        self.inner.open_conflict(conflict).await
    }

    async fn conflict(&self, id: ConflictId) -> Result<Option<Conflict>> {
        self.trip(StoreOp::Read)?;
        self.inner.conflict(id).await
    }

    async fn open_conflicts(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Conflict>> {
        self.trip(StoreOp::Read)?;
        self.inner.open_conflicts(uuid, project).await
    }

    async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        self.trip(StoreOp::Read)?;
        self.inner.list_conflicts(include_resolved).await
    }

    async fn close_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_at: DateTime<Utc>,
        updates: &[(RevisionId, RevisionStatus)],
    ) -> Result<Conflict> {
        self.trip(StoreOp::CloseConflict)?;
        self.inner.close_conflict(id, strategy, resolved_at, updates).await
    }

    async fn insert_alias(&self, alias: &Alias) -> Result<()> {
        self.trip(StoreOp::InsertAlias)?;
        self.inner.insert_alias(alias).await
    }

    async fn lookup_alias(&self, legacy_id: &str) -> Result<Option<DocumentUuid>> {
        self.trip(StoreOp::Read)?;
        self.inner.lookup_alias(legacy_id).await
    }
}

#[async_trait]
impl<S: CursorStore> CursorStore for FaultyStore<S> {
    async fn get_cursor(&self, key: &FolderKey) -> Result<Option<DateTime<Utc>>> {
        self.inner.get_cursor(key).await
    }

    async fn set_cursor(&self, key: &FolderKey, cursor: DateTime<Utc>) -> Result<()> {
        self.trip(StoreOp::SetCursor)?;
        self.inner.set_cursor(key, cursor).await
    }
}
