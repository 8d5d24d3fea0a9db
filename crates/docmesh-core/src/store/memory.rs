//! In-memory [`RevisionStore`] and [`CursorStore`] for tests and embedding.
//!
//! All tables sit behind one `std::sync::RwLock`, so every multi-row
//! operation is trivially atomic. Status changes are applied, checked
//! against the one-canonical rule, and rolled back if the check fails.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::conflict::{Conflict, ConflictId, NewConflict, PendingConflict, ResolutionStrategy};
use crate::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use crate::revision::{NewRevision, Revision, RevisionId, RevisionStatus};

use super::{Alias, CursorStore, FolderKey, RevisionStore};

#[derive(Default)]
struct Tables {
    revisions: Vec<Revision>,
    conflicts: Vec<Conflict>,
    aliases: HashMap<String, Alias>,
    cursors: HashMap<FolderKey, DateTime<Utc>>,
}

impl Tables {
    fn revision_index(&self, id: RevisionId) -> Result<usize> {
        self.revisions
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| anyhow!("revision {id} does not exist"))
    }

    fn latest<'a>(&'a self, mut pred: impl FnMut(&Revision) -> bool) -> Option<&'a Revision> {
        self.revisions
            .iter()
            .filter(|r| pred(r))
            .max_by_key(|r| (r.last_modified, r.id))
    }

    /// Set statuses in order; undo everything if any step fails or the
    /// result has two canonical revisions for one document.
    fn apply_statuses(&mut self, updates: &[(RevisionId, RevisionStatus)]) -> Result<()> {
        let mut undo = Vec::with_capacity(updates.len());
        let result = (|| -> Result<()> {
            for &(id, status) in updates {
                let idx = self.revision_index(id)?;
                undo.push((idx, self.revisions[idx].status));
                self.revisions[idx].status = status;
                if status == RevisionStatus::Canonical {
                    let (uuid, project) = (self.revisions[idx].uuid, self.revisions[idx].project.clone());
                    self.ensure_single_canonical(uuid, &project)?;
                }
            }
            Ok(())
        })();
        if result.is_err() {
            for (idx, status) in undo.into_iter().rev() {
                self.revisions[idx].status = status;
            }
        }
        result
    }

    fn insert_conflict(&mut self, conflict: &NewConflict) -> Result<Conflict> {
        for id in [conflict.source_revision, conflict.target_revision] {
            let rev = &self.revisions[self.revision_index(id)?];
            if rev.uuid != conflict.uuid || rev.project != conflict.project {
                bail!("revision {id} does not belong to document {}", conflict.uuid);
            }
        }
        self.apply_statuses(&[
            (conflict.source_revision, RevisionStatus::Conflict),
            (conflict.target_revision, RevisionStatus::Conflict),
        ])?;
        let id = ConflictId(self.conflicts.len() as i64 + 1);
        let stored = conflict.clone().into_conflict(id);
        self.conflicts.push(stored.clone());
        Ok(stored)
    }

    fn ensure_single_canonical(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<()> {
        let count = self
            .revisions
            .iter()
            .filter(|r| r.uuid == uuid && &r.project == project && r.status == RevisionStatus::Canonical)
            .count();
        if count > 1 {
            bail!("document {uuid} in project {project} would have {count} canonical revisions");
        }
        Ok(())
    }
}

/// In-memory revision and cursor store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Number of revision rows, for idempotence checks in tests.
    pub fn revision_count(&self) -> Result<usize> {
        Ok(self.read()?.revisions.len())
    }
}

#[async_trait]
impl RevisionStore for InMemoryStore {
    async fn append_revision(
        &self,
        revision: &NewRevision,
        supersede: Option<(RevisionId, RevisionStatus)>,
    ) -> Result<Revision> {
        if revision.uuid.is_zero() {
            bail!("refusing to persist a revision without a document UUID");
        }
        let mut tables = self.write()?;
        let id = RevisionId(tables.revisions.len() as i64 + 1);
        tables.revisions.push(revision.clone().into_revision(id));

        let mut updates: Vec<_> = supersede.into_iter().collect();
        if revision.status == RevisionStatus::Canonical {
            updates.push((id, RevisionStatus::Canonical));
        }
        if let Err(e) = tables.apply_statuses(&updates) {
            tables.revisions.pop();
            return Err(e);
        }
        Ok(tables.revisions[id.0 as usize - 1].clone())
    }

    async fn append_diverging(
        &self,
        revision: &NewRevision,
        pending: &PendingConflict,
    ) -> Result<(Revision, Conflict)> {
        if revision.uuid.is_zero() {
            bail!("refusing to persist a revision without a document UUID");
        }
        let mut tables = self.write()?;
        let id = RevisionId(tables.revisions.len() as i64 + 1);
        let stored = revision.clone().into_revision(id);
        let conflict = pending.for_candidate(&stored);
        tables.revisions.push(stored);
        match tables.insert_conflict(&conflict) {
            Ok(conflict) => Ok((tables.revisions[id.0 as usize - 1].clone(), conflict)),
            Err(e) => {
                tables.revisions.pop();
                Err(e)
            }
        }
    }

    async fn latest_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<Revision>> {
        let tables = self.read()?;
        Ok(tables
            .latest(|r| r.uuid == uuid && &r.project == project && &r.provider == provider)
            .cloned())
    }

    async fn latest_for_kind(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
        kind: ProviderKind,
        statuses: &[RevisionStatus],
    ) -> Result<Option<Revision>> {
        let tables = self.read()?;
        Ok(tables
            .latest(|r| {
                r.uuid == uuid
                    && &r.project == project
                    && r.provider.kind() == kind
                    && statuses.contains(&r.status)
            })
            .cloned())
    }

    async fn canonical_revision(
        &self,
        uuid: DocumentUuid,
        project: &ProjectName,
    ) -> Result<Option<Revision>> {
        let tables = self.read()?;
        Ok(tables
            .revisions
            .iter()
            .find(|r| r.uuid == uuid && &r.project == project && r.status == RevisionStatus::Canonical)
            .cloned())
    }

    async fn revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        let tables = self.read()?;
        Ok(tables.revisions.iter().find(|r| r.id == id).cloned())
    }

    async fn revisions(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Revision>> {
        let tables = self.read()?;
        let mut out: Vec<Revision> = tables
            .revisions
            .iter()
            .filter(|r| r.uuid == uuid && &r.project == project)
            .cloned()
            .collect();
        out.sort_by(|a, b| (b.last_modified, b.id).cmp(&(a.last_modified, a.id)));
        Ok(out)
    }

    async fn uuid_for_provider(
        &self,
        project: &ProjectName,
        provider: &ProviderId,
    ) -> Result<Option<DocumentUuid>> {
        let tables = self.read()?;
        Ok(tables
            .latest(|r| &r.project == project && &r.provider == provider)
            .map(|r| r.uuid))
    }

    async fn open_conflict(&self, conflict: &NewConflict) -> Result<Conflict> {
        self.write()?.insert_conflict(conflict)
    }

    async fn conflict(&self, id: ConflictId) -> Result<Option<Conflict>> {
        let tables = self.read()?;
        Ok(tables.conflicts.iter().find(|c| c.id == id).cloned())
    }

    async fn open_conflicts(&self, uuid: DocumentUuid, project: &ProjectName) -> Result<Vec<Conflict>> {
        let tables = self.read()?;
        Ok(tables
            .conflicts
            .iter()
            .filter(|c| c.is_open() && c.uuid == uuid && &c.project == project)
            .cloned()
            .collect())
    }

    async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        let tables = self.read()?;
        Ok(tables
            .conflicts
            .iter()
            .filter(|c| include_resolved || c.is_open())
            .cloned()
            .collect())
    }

    async fn close_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_at: DateTime<Utc>,
        updates: &[(RevisionId, RevisionStatus)],
    ) -> Result<Conflict> {
        let mut tables = self.write()?;
        let idx = tables
            .conflicts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| anyhow!("conflict {id} does not exist"))?;
        if !tables.conflicts[idx].is_open() {
            bail!("conflict {id} is already resolved");
        }
        tables.apply_statuses(updates)?;
        let conflict = &mut tables.conflicts[idx];
        conflict.resolved_at = Some(resolved_at);
        conflict.strategy = Some(strategy);
        Ok(conflict.clone())
    }

    async fn insert_alias(&self, alias: &Alias) -> Result<()> {
        if alias.uuid.is_zero() {
            bail!("alias '{}' must map to a non-zero UUID", alias.legacy_id);
        }
        let mut tables = self.write()?;
        match tables.aliases.get(&alias.legacy_id) {
            Some(existing) if existing.uuid == alias.uuid => Ok(()),
            Some(existing) => bail!(
                "alias '{}' already maps to {}",
                alias.legacy_id,
                existing.uuid
            ),
            None => {
                tables.aliases.insert(alias.legacy_id.clone(), alias.clone());
                Ok(())
            }
        }
    }

    async fn lookup_alias(&self, legacy_id: &str) -> Result<Option<DocumentUuid>> {
        let tables = self.read()?;
        Ok(tables.aliases.get(legacy_id).map(|a| a.uuid))
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn get_cursor(&self, key: &FolderKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.cursors.get(key).copied())
    }

    async fn set_cursor(&self, key: &FolderKey, cursor: DateTime<Utc>) -> Result<()> {
        self.write()?.cursors.insert(key.clone(), cursor);
        Ok(())
    }
}
