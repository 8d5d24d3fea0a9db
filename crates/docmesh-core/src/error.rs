//! Umbrella error type for the recorder and sync loop.
//!
//! Each component owns a narrow `thiserror` enum ([`IdentityError`],
//! [`RegistryError`], [`ConflictError`], [`ProviderError`]). Operations that
//! cross components return [`CoreError`], which wraps them transparently.
//! Persistence backends return `anyhow::Result` and surface here as
//! [`CoreError::Persistence`].

use thiserror::Error;

use crate::conflict::ConflictError;
use crate::identity::IdentityError;
use crate::provider::ProviderError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("observation of {provider} has no document UUID")]
    UnassignedUuid { provider: String },

    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sync aborted: {0}")]
    Aborted(String),
}

impl CoreError {
    /// Errors that must stop the sync loop rather than wait for the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Aborted(_))
    }
}

/// A stored enum value did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} '{value}'")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}
