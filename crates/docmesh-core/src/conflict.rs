//! Conflict records, detection, and resolution.
//!
//! While a project migrates, the same document can be edited on both the
//! source and the target. [`ConflictDetector`] notices when the two sides
//! disagree after the migration started and opens a [`Conflict`]; both
//! revisions move to `conflict` and no canonical revision exists for the
//! document until someone calls [`resolve_conflict`]. Conflicts are never
//! resolved automatically and never reopened.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{CoreError, UnknownVariant};
use crate::hash::ContentHash;
use crate::identity::{DocumentUuid, ProjectName, ProviderKind};
use crate::registry::{Project, ProjectMode};
use crate::revision::{Revision, RevisionId, RevisionStatus};
use crate::store::RevisionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub i64);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    ContentDivergence,
    ConcurrentEdit,
    MetadataMismatch,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentDivergence => "content-divergence",
            Self::ConcurrentEdit => "concurrent-edit",
            Self::MetadataMismatch => "metadata-mismatch",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content-divergence" => Ok(Self::ContentDivergence),
            "concurrent-edit" => Ok(Self::ConcurrentEdit),
            "metadata-mismatch" => Ok(Self::MetadataMismatch),
            other => Err(UnknownVariant::new("conflict kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    Manual,
    SourceWins,
    TargetWins,
    Merged,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::SourceWins => "source-wins",
            Self::TargetWins => "target-wins",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "source-wins" => Ok(Self::SourceWins),
            "target-wins" => Ok(Self::TargetWins),
            "merged" => Ok(Self::Merged),
            other => Err(UnknownVariant::new("resolution strategy", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub uuid: DocumentUuid,
    pub project: ProjectName,
    pub source_revision: RevisionId,
    pub target_revision: RevisionId,
    pub kind: ConflictKind,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub strategy: Option<ResolutionStrategy>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConflict {
    pub uuid: DocumentUuid,
    pub project: ProjectName,
    pub source_revision: RevisionId,
    pub target_revision: RevisionId,
    pub kind: ConflictKind,
    pub detected_at: DateTime<Utc>,
}

impl NewConflict {
    pub fn into_conflict(self, id: ConflictId) -> Conflict {
        Conflict {
            id,
            uuid: self.uuid,
            project: self.project,
            source_revision: self.source_revision,
            target_revision: self.target_revision,
            kind: self.kind,
            detected_at: self.detected_at,
            resolved_at: None,
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("conflict {0} not found")]
    NotFound(ConflictId),

    #[error("conflict {id} was already resolved at {resolved_at}")]
    AlreadyResolved {
        id: ConflictId,
        resolved_at: DateTime<Utc>,
    },

    #[error("revision {revision} cannot resolve conflict {conflict}: it belongs to neither side or to another document")]
    ForeignRevision {
        conflict: ConflictId,
        revision: RevisionId,
    },
}

// ═══════════════════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════════════════

/// A divergence found before the candidate revision is stored. The store
/// appends the candidate and opens the conflict as one unit through
/// [`RevisionStore::append_diverging`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConflict {
    /// The live revision on the paired provider.
    pub paired: RevisionId,
    pub candidate_is_source: bool,
    pub kind: ConflictKind,
    pub detected_at: DateTime<Utc>,
}

impl PendingConflict {
    pub fn for_candidate(&self, candidate: &Revision) -> NewConflict {
        let (source_revision, target_revision) = if self.candidate_is_source {
            (candidate.id, self.paired)
        } else {
            (self.paired, candidate.id)
        };
        NewConflict {
            uuid: candidate.uuid,
            project: candidate.project.clone(),
            source_revision,
            target_revision,
            kind: self.kind,
            detected_at: self.detected_at,
        }
    }
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Compare a not-yet-stored observation with the latest live revision
    /// on the paired provider. Returns a pending conflict when the hashes
    /// differ and the paired revision changed after the migration started.
    /// Always `None` outside migration.
    pub async fn divergence(
        store: &dyn RevisionStore,
        project: &Project,
        uuid: DocumentUuid,
        candidate_kind: ProviderKind,
        content_hash: &ContentHash,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingConflict>, CoreError> {
        let ProjectMode::Migrating {
            source, started_at, ..
        } = project.mode()
        else {
            return Ok(None);
        };
        let Some(pair) = project.pairing_provider(candidate_kind) else {
            return Ok(None);
        };

        let Some(paired) = store
            .latest_for_kind(
                uuid,
                project.name(),
                pair,
                &[RevisionStatus::Active, RevisionStatus::Canonical],
            )
            .await?
        else {
            return Ok(None);
        };

        if &paired.content_hash == content_hash || paired.last_modified <= started_at {
            return Ok(None);
        }
        Ok(Some(PendingConflict {
            paired: paired.id,
            candidate_is_source: candidate_kind == source,
            kind: ConflictKind::ContentDivergence,
            detected_at: now,
        }))
    }

    /// [`divergence`](Self::divergence) for a revision that is already
    /// stored; opens the conflict directly.
    pub async fn check(
        store: &dyn RevisionStore,
        project: &Project,
        candidate: &Revision,
        now: DateTime<Utc>,
    ) -> Result<Option<Conflict>, CoreError> {
        let pending = Self::divergence(
            store,
            project,
            candidate.uuid,
            candidate.provider.kind(),
            &candidate.content_hash,
            now,
        )
        .await?;
        let Some(pending) = pending else {
            return Ok(None);
        };
        let conflict = store.open_conflict(&pending.for_candidate(candidate)).await?;
        Self::report(&conflict);
        Ok(Some(conflict))
    }

    pub fn report(conflict: &Conflict) {
        warn!(
            conflict = %conflict.id,
            uuid = %conflict.uuid,
            project = %conflict.project,
            source_revision = %conflict.source_revision,
            target_revision = %conflict.target_revision,
            "Content diverged between migration source and target"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    SourceWins,
    TargetWins,
    /// Keep one of the two conflicting revisions.
    Manual { keep: RevisionId },
    /// A merge was written elsewhere. `superseding` (a later revision of
    /// the same document) becomes canonical if given.
    Merged { superseding: Option<RevisionId> },
}

impl Resolution {
    pub fn strategy(&self) -> ResolutionStrategy {
        match self {
            Self::SourceWins => ResolutionStrategy::SourceWins,
            Self::TargetWins => ResolutionStrategy::TargetWins,
            Self::Manual { .. } => ResolutionStrategy::Manual,
            Self::Merged { .. } => ResolutionStrategy::Merged,
        }
    }
}

/// What happens to both conflicting revisions under [`Resolution::Merged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergedPolicy {
    #[default]
    Archive,
    Demote,
}

impl MergedPolicy {
    fn status(&self) -> RevisionStatus {
        match self {
            Self::Archive => RevisionStatus::Archived,
            Self::Demote => RevisionStatus::Stale,
        }
    }
}

/// Close a conflict. The winner becomes canonical, the loser archived, and
/// any other canonical revision of the document stale, in one atomic
/// store operation.
pub async fn resolve_conflict(
    store: &dyn RevisionStore,
    id: ConflictId,
    resolution: Resolution,
    policy: MergedPolicy,
    now: DateTime<Utc>,
) -> Result<Conflict, CoreError> {
    let conflict = store.conflict(id).await?.ok_or(ConflictError::NotFound(id))?;
    if let Some(resolved_at) = conflict.resolved_at {
        return Err(ConflictError::AlreadyResolved { id, resolved_at }.into());
    }

    let (winner, losers): (Option<RevisionId>, Vec<(RevisionId, RevisionStatus)>) = match resolution {
        Resolution::SourceWins => (
            Some(conflict.source_revision),
            vec![(conflict.target_revision, RevisionStatus::Archived)],
        ),
        Resolution::TargetWins => (
            Some(conflict.target_revision),
            vec![(conflict.source_revision, RevisionStatus::Archived)],
        ),
        Resolution::Manual { keep } if keep == conflict.source_revision => (
            Some(keep),
            vec![(conflict.target_revision, RevisionStatus::Archived)],
        ),
        Resolution::Manual { keep } if keep == conflict.target_revision => (
            Some(keep),
            vec![(conflict.source_revision, RevisionStatus::Archived)],
        ),
        Resolution::Manual { keep } => {
            return Err(ConflictError::ForeignRevision {
                conflict: id,
                revision: keep,
            }
            .into())
        }
        Resolution::Merged { superseding } => {
            if let Some(rev) = superseding {
                let belongs = store
                    .revision(rev)
                    .await?
                    .is_some_and(|r| r.uuid == conflict.uuid && r.project == conflict.project);
                if !belongs || rev == conflict.source_revision || rev == conflict.target_revision {
                    return Err(ConflictError::ForeignRevision {
                        conflict: id,
                        revision: rev,
                    }
                    .into());
                }
            }
            (
                superseding,
                vec![
                    (conflict.source_revision, policy.status()),
                    (conflict.target_revision, policy.status()),
                ],
            )
        }
    };

    // Demotions first so the canonical index never sees two rows.
    let mut updates = Vec::with_capacity(losers.len() + 2);
    if let Some(current) = store.canonical_revision(conflict.uuid, &conflict.project).await? {
        if Some(current.id) != winner {
            updates.push((current.id, RevisionStatus::Stale));
        }
    }
    updates.extend(losers);
    if let Some(winner) = winner {
        updates.push((winner, RevisionStatus::Canonical));
    }

    let closed = store
        .close_conflict(id, resolution.strategy(), now, &updates)
        .await?;
    info!(
        conflict = %id,
        uuid = %closed.uuid,
        project = %closed.project,
        strategy = %resolution.strategy(),
        canonical = ?winner,
        "Conflict resolved"
    );
    Ok(closed)
}
