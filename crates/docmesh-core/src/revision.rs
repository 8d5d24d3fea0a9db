//! Revision records and observation outcomes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::Conflict;
use crate::error::UnknownVariant;
use crate::hash::ContentHash;
use crate::identity::{DocumentUuid, ProjectName, ProviderId};

/// Row ID assigned by the revision store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub i64);

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision status. Transitions are one-way:
/// `active → canonical | stale | conflict`, `canonical → stale`,
/// `conflict → canonical | archived | stale` on resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Active,
    Canonical,
    Archived,
    Conflict,
    Stale,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canonical => "canonical",
            Self::Archived => "archived",
            Self::Conflict => "conflict",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevisionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "canonical" => Ok(Self::Canonical),
            "archived" => Ok(Self::Archived),
            "conflict" => Ok(Self::Conflict),
            "stale" => Ok(Self::Stale),
            other => Err(UnknownVariant::new("revision status", other)),
        }
    }
}

/// Backend-specific facts about where a revision came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OriginDetails {
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        git_commit: Option<String>,
    },
    Google {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_folder_id: Option<String>,
    },
    RemotePeer {
        peer_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_revision: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OriginMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<OriginDetails>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub uuid: DocumentUuid,
    pub project: ProjectName,
    pub provider: ProviderId,
    pub content_hash: ContentHash,
    pub last_modified: DateTime<Utc>,
    pub status: RevisionStatus,
    pub origin: OriginMetadata,
    pub recorded_at: DateTime<Utc>,
}

/// A revision about to be appended; the store assigns the ID.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRevision {
    pub uuid: DocumentUuid,
    pub project: ProjectName,
    pub provider: ProviderId,
    pub content_hash: ContentHash,
    pub last_modified: DateTime<Utc>,
    pub status: RevisionStatus,
    pub origin: OriginMetadata,
    pub recorded_at: DateTime<Utc>,
}

impl NewRevision {
    pub fn into_revision(self, id: RevisionId) -> Revision {
        Revision {
            id,
            uuid: self.uuid,
            project: self.project,
            provider: self.provider,
            content_hash: self.content_hash,
            last_modified: self.last_modified,
            status: self.status,
            origin: self.origin,
            recorded_at: self.recorded_at,
        }
    }
}

/// One fetched item as seen by the sync loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub uuid: DocumentUuid,
    pub provider: ProviderId,
    pub content_hash: ContentHash,
    pub observed_at: DateTime<Utc>,
    pub origin: OriginMetadata,
}

/// Result of [`RevisionRecorder::record_observation`](crate::recorder::RevisionRecorder::record_observation).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Same hash as the latest revision for this placement; nothing written.
    NoChange { latest: Revision },
    /// Appended. `superseded` is the previous canonical, now stale.
    NewRevision {
        revision: Revision,
        superseded: Option<RevisionId>,
    },
    /// First revision of the document in a steady project; canonical at once.
    CanonicalPromotion { revision: Revision },
    /// Appended and found to diverge from the paired provider.
    ConflictRaised {
        revision: Revision,
        conflict: Conflict,
    },
    /// Older than the latest revision with a different hash; not appended.
    Outdated { latest: Revision },
}

impl Outcome {
    /// Whether anything was written (and so whether the replica needs it).
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Outcome::NewRevision { .. } | Outcome::CanonicalPromotion { .. } | Outcome::ConflictRaised { .. }
        )
    }

    pub fn revision(&self) -> &Revision {
        match self {
            Outcome::NoChange { latest } | Outcome::Outdated { latest } => latest,
            Outcome::NewRevision { revision, .. }
            | Outcome::CanonicalPromotion { revision }
            | Outcome::ConflictRaised { revision, .. } => revision,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::NoChange { .. } => "no-change",
            Outcome::NewRevision { .. } => "new-revision",
            Outcome::CanonicalPromotion { .. } => "canonical-promotion",
            Outcome::ConflictRaised { .. } => "conflict-raised",
            Outcome::Outdated { .. } => "outdated",
        }
    }
}
