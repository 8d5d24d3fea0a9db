//! Projects and their providers.
//!
//! A [`Project`] owns one provider per [`ProviderKind`], each in a
//! [`MigrationState`]. The valid shapes are:
//!
//! - **steady**: at most one `active` provider (plus any number archived);
//! - **migrating**: exactly one `source` and one `target`, no `active`.
//!
//! Any other combination is rejected by [`Project::new`]. There is no
//! process-wide registry: callers build `Project` values from configuration
//! and pass them down.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::UnknownVariant;
use crate::identity::{ProjectName, ProviderKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Active,
    Source,
    Target,
    Archived,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Source => "source",
            Self::Target => "target",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "source" => Ok(Self::Source),
            "target" => Ok(Self::Target),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownVariant::new("migration state", other)),
        }
    }
}

/// What a caller is asking a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    Read,
    InProgressRead,
    Write,
    Observe,
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::InProgressRead => "in-progress read",
            Self::Write => "write",
            Self::Observe => "observation",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("project '{project}' lists provider kind '{kind}' more than once")]
    DuplicateKind {
        project: ProjectName,
        kind: ProviderKind,
    },

    #[error("project '{project}' has more than one '{state}' provider")]
    DuplicateState {
        project: ProjectName,
        state: MigrationState,
    },

    #[error("project '{project}' mixes an active provider with a source/target migration pair")]
    MigrationExclusivity { project: ProjectName },

    #[error("project '{project}' has a '{present}' provider but no '{missing}' provider")]
    IncompleteMigration {
        project: ProjectName,
        present: MigrationState,
        missing: MigrationState,
    },

    #[error("project '{project}' is migrating but has no migration start time")]
    MissingMigrationStart { project: ProjectName },

    #[error("project '{project}' has no provider eligible for {role}")]
    NoEligibleProvider {
        project: ProjectName,
        role: ProviderRole,
    },

    #[error("project '{project}' has no '{kind}' provider")]
    UnknownProvider {
        project: ProjectName,
        kind: ProviderKind,
    },

    #[error("unknown project '{0}'")]
    UnknownProject(String),

    #[error("project '{0}' is not migrating")]
    NotMigrating(ProjectName),
}

// ═══════════════════════════════════════════════════════════════════════
// Provider settings
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Workspace root; local native IDs are relative to it.
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleSettings {
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_drive_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerSettings {
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    "v2".to_string()
}

/// Typed connection parameters, one variant per provider kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProviderSettings {
    Local(LocalSettings),
    Google(GoogleSettings),
    RemotePeer(RemotePeerSettings),
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Local(_) => ProviderKind::Local,
            Self::Google(_) => ProviderKind::Google,
            Self::RemotePeer(_) => ProviderKind::RemotePeer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProvider {
    pub settings: ProviderSettings,
    pub state: MigrationState,
    /// Settings the core does not interpret.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl ProjectProvider {
    pub fn new(settings: ProviderSettings, state: MigrationState) -> Self {
        Self {
            settings,
            state,
            extras: serde_json::Map::new(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.settings.kind()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Project
// ═══════════════════════════════════════════════════════════════════════

/// The project's current shape, derived once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectMode {
    Steady {
        active: Option<ProviderKind>,
    },
    Migrating {
        source: ProviderKind,
        target: ProviderKind,
        started_at: DateTime<Utc>,
    },
}

/// Which side of a migration a historical read wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadView {
    /// The source while migrating.
    #[default]
    Historical,
    /// The target while migrating.
    InProgress,
}

#[derive(Debug, Clone)]
pub struct Project {
    name: ProjectName,
    providers: Vec<ProjectProvider>,
    mode: ProjectMode,
}

impl Project {
    pub fn new(
        name: ProjectName,
        providers: Vec<ProjectProvider>,
        migration_started_at: Option<DateTime<Utc>>,
    ) -> Result<Self, RegistryError> {
        let mut active = None;
        let mut source = None;
        let mut target = None;

        for (i, provider) in providers.iter().enumerate() {
            let kind = provider.kind();
            if providers[..i].iter().any(|p| p.kind() == kind) {
                return Err(RegistryError::DuplicateKind {
                    project: name,
                    kind,
                });
            }
            let slot = match provider.state {
                MigrationState::Active => &mut active,
                MigrationState::Source => &mut source,
                MigrationState::Target => &mut target,
                MigrationState::Archived => continue,
            };
            if slot.replace(kind).is_some() {
                return Err(RegistryError::DuplicateState {
                    project: name,
                    state: provider.state,
                });
            }
        }

        let mode = match (active, source, target) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(RegistryError::MigrationExclusivity { project: name })
            }
            (active, None, None) => ProjectMode::Steady { active },
            (None, Some(_), None) => {
                return Err(RegistryError::IncompleteMigration {
                    project: name,
                    present: MigrationState::Source,
                    missing: MigrationState::Target,
                })
            }
            (None, None, Some(_)) => {
                return Err(RegistryError::IncompleteMigration {
                    project: name,
                    present: MigrationState::Target,
                    missing: MigrationState::Source,
                })
            }
            (None, Some(source), Some(target)) => {
                let Some(started_at) = migration_started_at else {
                    return Err(RegistryError::MissingMigrationStart { project: name });
                };
                ProjectMode::Migrating {
                    source,
                    target,
                    started_at,
                }
            }
        };

        Ok(Self {
            name,
            providers,
            mode,
        })
    }

    pub fn name(&self) -> &ProjectName {
        &self.name
    }

    pub fn mode(&self) -> ProjectMode {
        self.mode
    }

    pub fn providers(&self) -> &[ProjectProvider] {
        &self.providers
    }

    pub fn is_migrating(&self) -> bool {
        matches!(self.mode, ProjectMode::Migrating { .. })
    }

    pub fn migration_started_at(&self) -> Option<DateTime<Utc>> {
        match self.mode {
            ProjectMode::Migrating { started_at, .. } => Some(started_at),
            ProjectMode::Steady { .. } => None,
        }
    }

    pub fn provider(&self, kind: ProviderKind) -> Result<&ProjectProvider, RegistryError> {
        self.providers
            .iter()
            .find(|p| p.kind() == kind)
            .ok_or_else(|| RegistryError::UnknownProvider {
                project: self.name.clone(),
                kind,
            })
    }

    /// Provider to read from. Steady: the active one. Migrating: the source,
    /// or the target for [`ReadView::InProgress`].
    pub fn resolve_read(&self, view: ReadView) -> Result<ProviderKind, RegistryError> {
        match (self.mode, view) {
            (ProjectMode::Steady { active: Some(kind) }, _) => Ok(kind),
            (ProjectMode::Steady { active: None }, view) => Err(RegistryError::NoEligibleProvider {
                project: self.name.clone(),
                role: match view {
                    ReadView::Historical => ProviderRole::Read,
                    ReadView::InProgress => ProviderRole::InProgressRead,
                },
            }),
            (ProjectMode::Migrating { source, .. }, ReadView::Historical) => Ok(source),
            (ProjectMode::Migrating { target, .. }, ReadView::InProgress) => Ok(target),
        }
    }

    /// Provider to write to: the target while migrating, otherwise the active one.
    pub fn resolve_write(&self) -> Result<ProviderKind, RegistryError> {
        match self.mode {
            ProjectMode::Steady { active: Some(kind) } => Ok(kind),
            ProjectMode::Migrating { target, .. } => Ok(target),
            ProjectMode::Steady { active: None } => Err(RegistryError::NoEligibleProvider {
                project: self.name.clone(),
                role: ProviderRole::Write,
            }),
        }
    }

    /// The other half of the migration pair, if `kind` is in one.
    pub fn pairing_provider(&self, kind: ProviderKind) -> Option<ProviderKind> {
        match self.mode {
            ProjectMode::Migrating { source, target, .. } if kind == source => Some(target),
            ProjectMode::Migrating { source, target, .. } if kind == target => Some(source),
            _ => None,
        }
    }

    /// Check that observations from `kind` may be recorded.
    pub fn ensure_observable(&self, kind: ProviderKind) -> Result<MigrationState, RegistryError> {
        let provider = self.provider(kind)?;
        if provider.state == MigrationState::Archived {
            return Err(RegistryError::NoEligibleProvider {
                project: self.name.clone(),
                role: ProviderRole::Observe,
            });
        }
        Ok(provider.state)
    }
}
