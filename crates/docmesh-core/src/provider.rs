//! The provider contract.
//!
//! A [`Provider`] is one storage backend (a Git working tree, a Google
//! Drive, a remote docmesh peer). The core never talks to a backend
//! directly: the sync loop lists and fetches through this trait, and
//! writes go through it too. Implementations classify their failures as
//! [`ProviderError::Transient`] (retried next tick) or
//! [`ProviderError::Permanent`] (handed to the error policy).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use chrono::{DateTime, Utc};
//! use docmesh_core::identity::ProviderKind;
//! use docmesh_core::provider::{ChangedItem, FetchedItem, Provider, ProviderError};
//!
//! struct Empty;
//!
//! #[async_trait]
//! impl Provider for Empty {
//!     fn kind(&self) -> ProviderKind { ProviderKind::Local }
//!
//!     async fn list_changed_since(
//!         &self,
//!         _folder: &str,
//!         _cursor: Option<DateTime<Utc>>,
//!     ) -> Result<Vec<ChangedItem>, ProviderError> {
//!         Ok(vec![])
//!     }
//!
//!     async fn fetch(&self, native_id: &str) -> Result<FetchedItem, ProviderError> {
//!         Err(ProviderError::Permanent(format!("{native_id} not found")))
//!     }
//!
//!     async fn write(&self, native_id: &str, _content: &[u8]) -> Result<String, ProviderError> {
//!         Ok(native_id.to_string())
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::identity::{DocumentUuid, ProviderKind};
use crate::revision::OriginDetails;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network blips, rate limits, timeouts. Retried on the next tick.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Revoked credentials, deleted folders, malformed responses.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// One entry from a change listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedItem {
    pub native_id: String,
    pub last_modified: DateTime<Utc>,
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedItem {
    pub native_id: String,
    pub content: Vec<u8>,
    pub last_modified: DateTime<Utc>,
    pub title: Option<String>,
    pub details: Option<OriginDetails>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Items in `folder` modified after `cursor` (everything when `None`),
    /// in the order the backend reports them.
    async fn list_changed_since(
        &self,
        folder: &str,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangedItem>, ProviderError>;

    async fn fetch(&self, native_id: &str) -> Result<FetchedItem, ProviderError>;

    /// Write content and return the (possibly new) native ID.
    async fn write(&self, native_id: &str, content: &[u8]) -> Result<String, ProviderError>;

    /// Stamp the document's header or metadata with its UUID. Backends
    /// without writable headers keep the default no-op.
    async fn refresh_header(&self, _native_id: &str, _uuid: DocumentUuid) -> Result<(), ProviderError> {
        Ok(())
    }

    /// List then fetch, in listing order.
    async fn fetch_changed_since(
        &self,
        folder: &str,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedItem>, ProviderError> {
        let changed = self.list_changed_since(folder, cursor).await?;
        let mut out = Vec::with_capacity(changed.len());
        for item in changed {
            out.push(self.fetch(&item.native_id).await?);
        }
        Ok(out)
    }
}
