//! Provider freshness.
//!
//! The sync loop reports each folder sync here. Read resolution never fails
//! because a provider is behind; instead the answer is labelled
//! [`Freshness::Degraded`] and the caller decides what to show.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::identity::{ProjectName, ProviderKind};
use crate::registry::{Project, ReadView, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub max_staleness: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            max_staleness: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    NeverSynced,
    Stale { age: Duration },
    ProviderError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Degraded {
        last_success: Option<DateTime<Utc>>,
        reason: DegradedReason,
    },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResolution {
    pub provider: ProviderKind,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Default)]
struct ProviderHealth {
    last_success: Option<DateTime<Utc>>,
    degraded: Option<String>,
}

#[derive(Debug, Default)]
pub struct HealthBoard {
    entries: HashMap<(ProjectName, ProviderKind), ProviderHealth>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A folder sync completed. Clears any degraded mark.
    pub fn record_success(&mut self, project: &ProjectName, kind: ProviderKind, at: DateTime<Utc>) {
        let entry = self.entries.entry((project.clone(), kind)).or_default();
        entry.last_success = Some(entry.last_success.map_or(at, |prev| prev.max(at)));
        entry.degraded = None;
    }

    pub fn mark_degraded(&mut self, project: &ProjectName, kind: ProviderKind, reason: impl Into<String>) {
        self.entries.entry((project.clone(), kind)).or_default().degraded = Some(reason.into());
    }

    pub fn is_degraded(&self, project: &ProjectName, kind: ProviderKind) -> bool {
        self.entries
            .get(&(project.clone(), kind))
            .is_some_and(|h| h.degraded.is_some())
    }

    pub fn freshness(
        &self,
        project: &ProjectName,
        kind: ProviderKind,
        policy: StalenessPolicy,
        now: DateTime<Utc>,
    ) -> Freshness {
        let Some(health) = self.entries.get(&(project.clone(), kind)) else {
            return Freshness::Degraded {
                last_success: None,
                reason: DegradedReason::NeverSynced,
            };
        };
        if let Some(err) = &health.degraded {
            return Freshness::Degraded {
                last_success: health.last_success,
                reason: DegradedReason::ProviderError(err.clone()),
            };
        }
        match health.last_success {
            None => Freshness::Degraded {
                last_success: None,
                reason: DegradedReason::NeverSynced,
            },
            Some(at) if now - at > policy.max_staleness => Freshness::Degraded {
                last_success: Some(at),
                reason: DegradedReason::Stale { age: now - at },
            },
            Some(_) => Freshness::Fresh,
        }
    }

    /// [`Project::resolve_read`] plus a freshness label.
    pub fn resolve_read(
        &self,
        project: &Project,
        view: ReadView,
        policy: StalenessPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReadResolution, RegistryError> {
        let provider = project.resolve_read(view)?;
        Ok(ReadResolution {
            provider,
            freshness: self.freshness(project.name(), provider, policy, now),
        })
    }
}
