//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/docmesh.sqlite"
//!
//! [sync]
//! interval_secs = 60
//! fan_out = 5
//!
//! [[projects]]
//! name = "platform-docs"
//!
//! [[projects.providers]]
//! kind = "local"
//! state = "active"
//! workspace_path = "docs"
//! folders = ["rfc"]
//! ```
//!
//! [`load_config`] parses and validates the whole file, including turning
//! every `[[projects]]` entry into a [`Project`], so a bad migration layout
//! is reported before anything touches the database.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use docmesh_core::conflict::MergedPolicy;
use docmesh_core::identity::ProjectName;
use docmesh_core::registry::{MigrationState, Project, ProjectProvider, ProviderSettings};
use docmesh_core::store::FolderKey;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermanentErrorAction {
    #[default]
    Degrade,
    Abort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,
    #[serde(default = "default_max_staleness_minutes")]
    pub max_staleness_minutes: i64,
    #[serde(default)]
    pub on_permanent_error: PermanentErrorAction,
    #[serde(default)]
    pub merged_resolution: MergedPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            fan_out: default_fan_out(),
            grace_minutes: default_grace_minutes(),
            max_staleness_minutes: default_max_staleness_minutes(),
            on_permanent_error: PermanentErrorAction::default(),
            merged_resolution: MergedPolicy::default(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}
fn default_fan_out() -> usize {
    5
}
fn default_grace_minutes() -> i64 {
    30
}
fn default_max_staleness_minutes() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub migration_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub state: MigrationState,
    /// Folders the sync loop watches on this provider.
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub extras: toml::Table,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

impl ProviderConfig {
    fn to_project_provider(&self) -> Result<ProjectProvider> {
        let extras = match serde_json::to_value(&self.extras)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Ok(ProjectProvider {
            settings: self.settings.clone(),
            state: self.state,
            extras,
        })
    }
}

impl ProjectConfig {
    pub fn to_project(&self) -> Result<Project> {
        let name = ProjectName::new(&self.name)?;
        let providers = self
            .providers
            .iter()
            .map(ProviderConfig::to_project_provider)
            .collect::<Result<Vec<_>>>()?;
        Ok(Project::new(name, providers, self.migration_started_at)?)
    }
}

impl Config {
    /// All configured projects, validated.
    pub fn projects(&self) -> Result<Vec<Project>> {
        self.projects
            .iter()
            .map(|p| {
                p.to_project()
                    .with_context(|| format!("Invalid project '{}'", p.name))
            })
            .collect()
    }

    /// Every (project, provider, folder) the sync loop should watch.
    /// Archived providers are skipped.
    pub fn watched_folders(&self) -> Result<Vec<FolderKey>> {
        let mut out = Vec::new();
        for project in &self.projects {
            let name = ProjectName::new(&project.name)?;
            for provider in &project.providers {
                if provider.state == MigrationState::Archived {
                    continue;
                }
                for folder in &provider.folders {
                    out.push(FolderKey {
                        project: name.clone(),
                        provider: provider.settings.kind(),
                        folder: folder.clone(),
                    });
                }
            }
        }
        Ok(out)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.sync.interval_secs == 0 {
        bail!("sync.interval_secs must be > 0");
    }
    if config.sync.fan_out == 0 {
        bail!("sync.fan_out must be >= 1");
    }
    if config.sync.grace_minutes < 0 {
        bail!("sync.grace_minutes must be >= 0");
    }
    if config.sync.max_staleness_minutes <= 0 {
        bail!("sync.max_staleness_minutes must be > 0");
    }

    let mut seen = HashSet::new();
    for project in &config.projects {
        if !seen.insert(project.name.as_str()) {
            bail!("Project '{}' is defined more than once", project.name);
        }
        for provider in &project.providers {
            if provider.folders.iter().any(|f| f.trim().is_empty()) {
                bail!(
                    "Project '{}': {} provider has an empty folder name",
                    project.name,
                    provider.settings.kind()
                );
            }
        }
    }
    config.projects()?;

    Ok(config)
}
