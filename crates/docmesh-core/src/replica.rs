//! Search replica contract.
//!
//! The replica is a denormalized copy of each document's latest recorded
//! content, keyed by UUID, used for full-text search. The core only pushes
//! into it; ranking and querying belong to the replica's owner.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{normalize_content, ContentHash};
use crate::identity::{DocumentUuid, ProjectName, ProviderId};
use crate::revision::{Revision, RevisionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaDocument {
    pub uuid: DocumentUuid,
    pub project: ProjectName,
    pub provider: ProviderId,
    pub title: Option<String>,
    pub body: String,
    pub content_hash: ContentHash,
    pub last_modified: DateTime<Utc>,
    pub status: RevisionStatus,
}

impl ReplicaDocument {
    /// Build the replica row for a recorded revision and its raw content.
    pub fn from_revision(revision: &Revision, content: &[u8]) -> Self {
        Self {
            uuid: revision.uuid,
            project: revision.project.clone(),
            provider: revision.provider.clone(),
            title: revision.origin.title.clone(),
            body: normalize_content(&String::from_utf8_lossy(content)),
            content_hash: revision.content_hash.clone(),
            last_modified: revision.last_modified,
            status: revision.status,
        }
    }
}

#[async_trait]
pub trait SearchReplica: Send + Sync {
    async fn upsert(&self, uuid: DocumentUuid, document: &ReplicaDocument) -> Result<()>;
}

/// Replica held in a map, for tests and embedding.
#[derive(Default)]
pub struct InMemoryReplica {
    docs: RwLock<HashMap<DocumentUuid, ReplicaDocument>>,
    upserts: RwLock<usize>,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: DocumentUuid) -> Option<ReplicaDocument> {
        self.docs.read().ok()?.get(&uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total upsert calls, including repeats for the same UUID.
    pub fn upsert_count(&self) -> usize {
        self.upserts.read().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl SearchReplica for InMemoryReplica {
    async fn upsert(&self, uuid: DocumentUuid, document: &ReplicaDocument) -> Result<()> {
        self.docs
            .write()
            .map_err(|_| anyhow!("replica lock poisoned"))?
            .insert(uuid, document.clone());
        *self.upserts.write().map_err(|_| anyhow!("replica lock poisoned"))? += 1;
        Ok(())
    }
}
