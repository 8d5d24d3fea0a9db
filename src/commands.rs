//! CLI command implementations.
//!
//! Each `run_*` function loads what it needs from the database and prints
//! a plain-text report to stdout.

use anyhow::{bail, Context, Result};
use chrono::Utc;

use docmesh_core::conflict::{resolve_conflict, Conflict, ConflictId, Resolution, ResolutionStrategy};
use docmesh_core::identity::{CompositeId, DocumentUuid, ProjectName};
use docmesh_core::registry::{ProjectMode, ReadView};
use docmesh_core::revision::RevisionId;
use docmesh_core::store::{Alias, RevisionStore};

use crate::config::Config;
use crate::db;
use crate::replica::SqliteReplica;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    Ok(SqliteStore::new(pool))
}

/// Print every project with its mode and provider resolution.
pub fn run_check(config: &Config) -> Result<()> {
    let projects = config.projects()?;
    let folders = config.watched_folders()?;

    if projects.is_empty() {
        println!("No projects configured.");
        return Ok(());
    }

    for project in &projects {
        println!("--- {} ---", project.name());
        match project.mode() {
            ProjectMode::Steady { active } => match active {
                Some(kind) => println!("mode:        steady ({kind})"),
                None => println!("mode:        steady (no active provider)"),
            },
            ProjectMode::Migrating {
                source,
                target,
                started_at,
            } => println!("mode:        migrating {source} -> {target} since {started_at}"),
        }
        for provider in project.providers() {
            println!("provider:    {:<12} {}", provider.kind().as_str(), provider.state.as_str());
        }
        match project.resolve_read(ReadView::Historical) {
            Ok(kind) => println!("read:        {kind}"),
            Err(e) => println!("read:        unavailable ({e})"),
        }
        match project.resolve_write() {
            Ok(kind) => println!("write:       {kind}"),
            Err(e) => println!("write:       unavailable ({e})"),
        }
        for folder in folders.iter().filter(|f| &f.project == project.name()) {
            println!("watching:    {}:{}", folder.provider, folder.folder);
        }
        println!();
    }
    println!("OK: {} project(s), {} folder(s)", projects.len(), folders.len());
    Ok(())
}

/// Parse a composite identifier and print all of its renderings.
pub fn run_id(text: &str) -> Result<()> {
    let id = CompositeId::parse(text)?;
    println!("uuid:     {}", id.uuid());
    match id.provider() {
        Some(p) => println!("provider: {p}"),
        None => println!("provider: -"),
    }
    match id.project() {
        Some(p) => println!("project:  {p}"),
        None => println!("project:  -"),
    }
    println!("short:    {}", id.to_short_string());
    println!("full:     {}", id.to_full_string());
    println!("uri:      {}", id.to_uri_string());
    Ok(())
}

fn print_conflict(conflict: &Conflict) {
    let status = match (conflict.resolved_at, conflict.strategy) {
        (Some(at), Some(strategy)) => format!("resolved {strategy} at {at}"),
        (Some(at), None) => format!("resolved at {at}"),
        _ => "open".to_string(),
    };
    println!(
        "#{:<5} {:<20} {} src={} tgt={} [{}] detected {}",
        conflict.id.0,
        conflict.project.as_str(),
        conflict.uuid,
        conflict.source_revision.0,
        conflict.target_revision.0,
        status,
        conflict.detected_at,
    );
}

pub async fn run_conflicts(config: &Config, include_resolved: bool) -> Result<()> {
    let store = open_store(config).await?;
    let conflicts = store.list_conflicts(include_resolved).await?;
    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for conflict in &conflicts {
        print_conflict(conflict);
    }
    Ok(())
}

/// Build a [`Resolution`] from CLI flags.
pub fn resolution_from_args(
    strategy: &str,
    keep: Option<i64>,
    superseding: Option<i64>,
) -> Result<Resolution> {
    let strategy: ResolutionStrategy = strategy.parse()?;
    Ok(match strategy {
        ResolutionStrategy::SourceWins => Resolution::SourceWins,
        ResolutionStrategy::TargetWins => Resolution::TargetWins,
        ResolutionStrategy::Manual => match keep {
            Some(id) => Resolution::Manual {
                keep: RevisionId(id),
            },
            None => bail!("--keep <revision> is required with --strategy manual"),
        },
        ResolutionStrategy::Merged => Resolution::Merged {
            superseding: superseding.map(RevisionId),
        },
    })
}

pub async fn run_resolve(config: &Config, id: i64, resolution: Resolution) -> Result<()> {
    let store = open_store(config).await?;
    let conflict = resolve_conflict(
        &store,
        ConflictId(id),
        resolution,
        config.sync.merged_resolution,
        Utc::now(),
    )
    .await
    .with_context(|| format!("Failed to resolve conflict #{id}"))?;
    print_conflict(&conflict);
    Ok(())
}

/// Print the revision history of one document in one project.
pub async fn run_history(config: &Config, id: &str, project: Option<&str>) -> Result<()> {
    let id = CompositeId::parse(id)?;
    let project = match (project, id.project()) {
        (Some(name), _) => ProjectName::new(name)?,
        (None, Some(name)) => name.clone(),
        (None, None) => bail!("a project is required: pass --project or use a full identifier"),
    };

    let store = open_store(config).await?;
    let revisions = store.revisions(id.uuid(), &project).await?;
    if revisions.is_empty() {
        println!("No revisions for {} in {}.", id.uuid(), project);
        return Ok(());
    }

    println!("--- {} in {} ({} revisions) ---", id.uuid(), project, revisions.len());
    for rev in &revisions {
        println!(
            "#{:<6} {:<9} {:<30} {} {}",
            rev.id.0,
            rev.status.as_str(),
            rev.provider.to_string(),
            rev.last_modified,
            &rev.content_hash.as_str()[..12.min(rev.content_hash.as_str().len())],
        );
    }
    for conflict in store.open_conflicts(id.uuid(), &project).await? {
        print_conflict(&conflict);
    }
    Ok(())
}

pub async fn run_alias(config: &Config, legacy_id: &str, uuid: &str) -> Result<()> {
    let uuid = DocumentUuid::parse(uuid)?;
    if uuid.is_zero() {
        bail!("cannot alias to the nil UUID");
    }
    let store = open_store(config).await?;
    store
        .insert_alias(&Alias {
            legacy_id: legacy_id.to_string(),
            uuid,
            created_at: Utc::now(),
        })
        .await?;
    println!("{legacy_id} -> {uuid}");
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let replica = SqliteReplica::new(pool);
    let hits = replica.search(query, limit).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (rank, uuid) in hits.iter().enumerate() {
        println!("{:>3}. {}", rank + 1, uuid);
    }
    Ok(())
}
