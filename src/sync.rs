//! The sync loop.
//!
//! Every tick walks the watched folders one after another. For each
//! folder it lists what changed since the stored cursor, fetches and
//! records the items with bounded concurrency, pushes recorded changes to
//! the search replica, and then moves the cursor forward only as far as
//! every item below it succeeded.
//!
//! ```text
//!   tick ──▶ retry queued replica pushes
//!        └─▶ for each folder (sequential)
//!              list_changed_since(cursor)
//!              ├─ group by native ID (listing order kept per group)
//!              ├─ groups run with fan-out N:
//!              │    fetch → hash → assign UUID → record (per-UUID lock) → replica
//!              ├─ cursor = newest success older than the oldest failure
//!              ├─ header refresh for items older than the grace window
//!              └─ provider health update
//! ```
//!
//! Transient provider errors are logged and retried next tick. Permanent
//! ones go to the [`ErrorPolicy`], which may degrade the provider or abort
//! the loop. Cancellation through the shutdown channel stops in-flight
//! fetches; a cancelled item never advances the cursor.
//!
//! Writes take the same per-document lock as the loop.
//! [`SyncLoop::write_document`] routes to the project's write provider and
//! [`SyncLoop::migrate_folder`] copies a source folder to the migration
//! target under the documents' existing UUIDs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use docmesh_core::assign::assign_uuid;
use docmesh_core::error::CoreError;
use docmesh_core::hash::ContentHash;
use docmesh_core::health::{HealthBoard, ReadResolution, StalenessPolicy};
use docmesh_core::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use docmesh_core::provider::{ChangedItem, FetchedItem, Provider, ProviderError};
use docmesh_core::recorder::RevisionRecorder;
use docmesh_core::registry::{Project, ProjectMode, ReadView, RegistryError};
use docmesh_core::replica::{ReplicaDocument, SearchReplica};
use docmesh_core::revision::{Observation, OriginMetadata, Outcome, Revision};
use docmesh_core::store::{CursorStore, FolderKey, RevisionStore};

use crate::config::{Config, PermanentErrorAction, SyncConfig};
use crate::providers::ProviderSet;
use crate::replica::SqliteReplica;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

// ═══════════════════════════════════════════════════════════════════════
// Settings and policy
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub interval: std::time::Duration,
    pub fan_out: usize,
    /// Items modified more recently than this skip the header refresh pass.
    pub grace: Duration,
    pub staleness: StalenessPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            fan_out: 5,
            grace: Duration::minutes(30),
            staleness: StalenessPolicy::default(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: std::time::Duration::from_secs(config.interval_secs),
            fan_out: config.fan_out.max(1),
            grace: Duration::minutes(config.grace_minutes),
            staleness: StalenessPolicy {
                max_staleness: Duration::minutes(config.max_staleness_minutes),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Log and carry on; the provider's freshness simply ages.
    Continue,
    /// Mark the provider degraded until its next successful folder sync.
    DegradeProvider,
    /// Stop the sync loop.
    Abort,
}

/// Decides what a permanent provider error means for the loop.
pub trait ErrorPolicy: Send + Sync {
    fn on_permanent_error(&self, folder: &FolderKey, error: &ProviderError) -> PolicyDecision;
}

pub struct DegradeAndContinue;

impl ErrorPolicy for DegradeAndContinue {
    fn on_permanent_error(&self, _folder: &FolderKey, _error: &ProviderError) -> PolicyDecision {
        PolicyDecision::DegradeProvider
    }
}

pub struct FailFast;

impl ErrorPolicy for FailFast {
    fn on_permanent_error(&self, _folder: &FolderKey, _error: &ProviderError) -> PolicyDecision {
        PolicyDecision::Abort
    }
}

pub fn policy_for(action: PermanentErrorAction) -> Arc<dyn ErrorPolicy> {
    match action {
        PermanentErrorAction::Degrade => Arc::new(DegradeAndContinue),
        PermanentErrorAction::Abort => Arc::new(FailFast),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct FolderReport {
    pub folder: FolderKey,
    pub listed: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub outdated: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// The new cursor, when it moved.
    pub cursor_advanced_to: Option<DateTime<Utc>>,
    pub headers_refreshed: usize,
    pub headers_deferred: usize,
}

impl FolderReport {
    fn new(folder: FolderKey) -> Self {
        Self {
            folder,
            listed: 0,
            changed: 0,
            unchanged: 0,
            outdated: 0,
            conflicts: 0,
            failed: 0,
            cursor_advanced_to: None,
            headers_refreshed: 0,
            headers_deferred: 0,
        }
    }
}

/// Result of copying one source folder to the migration target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub listed: usize,
    pub copied: usize,
    /// Dry run only: documents that would have been copied.
    pub planned: usize,
    /// Documents the target already holds a revision of.
    pub already_in_target: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationStep {
    Copied,
    Planned,
    AlreadyInTarget,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub folders: Vec<FolderReport>,
    pub failed_folders: usize,
    pub replica_retried: usize,
    pub replica_pending: usize,
    pub cancelled: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// Per-document serialization
// ═══════════════════════════════════════════════════════════════════════

/// One async mutex per document UUID.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<DocumentUuid, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, uuid: DocumentUuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().await.entry(uuid).or_default().clone();
        lock.lock_owned().await
    }

    async fn prune(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(mut shutdown: watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

struct ItemSuccess {
    native_id: String,
    listed_at: DateTime<Utc>,
    uuid: DocumentUuid,
    outcome: Outcome,
}

struct ItemFailure {
    native_id: String,
    listed_at: DateTime<Utc>,
    error: CoreError,
}

type ItemResult = Result<ItemSuccess, ItemFailure>;

// ═══════════════════════════════════════════════════════════════════════
// SyncLoop
// ═══════════════════════════════════════════════════════════════════════

pub struct SyncLoop {
    projects: HashMap<ProjectName, Project>,
    folders: Vec<FolderKey>,
    providers: ProviderSet,
    recorder: RevisionRecorder,
    cursors: Arc<dyn CursorStore>,
    replica: Arc<dyn SearchReplica>,
    policy: Arc<dyn ErrorPolicy>,
    settings: SyncSettings,
    health: RwLock<HealthBoard>,
    locks: KeyedLocks,
    pending_replica: Mutex<HashMap<DocumentUuid, ReplicaDocument>>,
}

impl SyncLoop {
    pub fn new(
        revisions: Arc<dyn RevisionStore>,
        cursors: Arc<dyn CursorStore>,
        replica: Arc<dyn SearchReplica>,
        providers: ProviderSet,
        settings: SyncSettings,
    ) -> Self {
        Self {
            projects: HashMap::new(),
            folders: Vec::new(),
            providers,
            recorder: RevisionRecorder::new(revisions),
            cursors,
            replica,
            policy: Arc::new(DegradeAndContinue),
            settings: SyncSettings {
                fan_out: settings.fan_out.max(1),
                ..settings
            },
            health: RwLock::new(HealthBoard::new()),
            locks: KeyedLocks::default(),
            pending_replica: Mutex::new(HashMap::new()),
        }
    }

    /// Build a loop over every project and folder in the configuration.
    pub fn from_config<S>(
        config: &Config,
        store: Arc<S>,
        replica: Arc<dyn SearchReplica>,
        providers: ProviderSet,
    ) -> anyhow::Result<Self>
    where
        S: RevisionStore + CursorStore + 'static,
    {
        let mut sync = Self::new(
            store.clone(),
            store,
            replica,
            providers,
            SyncSettings::from_config(&config.sync),
        )
        .with_policy(policy_for(config.sync.on_permanent_error));

        for project in config.projects()? {
            sync.add_project(project);
        }
        for folder in config.watched_folders()? {
            sync.watch_folder(folder.clone())
                .with_context(|| format!("Cannot watch folder {folder}"))?;
        }
        Ok(sync)
    }

    pub fn with_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_project(&mut self, project: Project) {
        self.projects.insert(project.name().clone(), project);
    }

    /// Watch a folder. The project must be known and must have a
    /// non-archived provider of the folder's kind.
    pub fn watch_folder(&mut self, folder: FolderKey) -> Result<(), CoreError> {
        self.project(&folder.project)?.ensure_observable(folder.provider)?;
        if !self.folders.contains(&folder) {
            self.folders.push(folder);
        }
        Ok(())
    }

    pub fn folders(&self) -> &[FolderKey] {
        &self.folders
    }

    fn project(&self, name: &ProjectName) -> Result<&Project, RegistryError> {
        self.projects
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProject(name.to_string()))
    }

    /// Read resolution with a freshness label. Never fails for staleness.
    pub async fn resolve_read(
        &self,
        project: &ProjectName,
        view: ReadView,
        now: DateTime<Utc>,
    ) -> Result<ReadResolution, CoreError> {
        let project = self.project(project)?;
        Ok(self
            .health
            .read()
            .await
            .resolve_read(project, view, self.settings.staleness, now)?)
    }

    fn provider(&self, project: &ProjectName, kind: ProviderKind) -> Result<Arc<dyn Provider>, RegistryError> {
        self.providers
            .get(project, kind)
            .ok_or_else(|| RegistryError::UnknownProvider {
                project: project.clone(),
                kind,
            })
    }

    /// Write a document through the project's write provider (the target
    /// while migrating) and record the stored content under `uuid`.
    pub async fn write_document(
        &self,
        project: &ProjectName,
        uuid: DocumentUuid,
        native_id: &str,
        content: &[u8],
    ) -> Result<Outcome, CoreError> {
        if uuid.is_zero() {
            return Err(CoreError::UnassignedUuid {
                provider: native_id.to_string(),
            });
        }
        let project = self.project(project)?;
        let kind = project.resolve_write()?;
        let provider = self.provider(project.name(), kind)?;

        let _guard = self.locks.lock(uuid).await;
        let stored_id = provider.write(native_id, content).await?;
        let outcome = self
            .recorder
            .record_observation(
                project,
                Observation {
                    uuid,
                    provider: ProviderId::new(kind, stored_id)?,
                    content_hash: ContentHash::of(content),
                    observed_at: Utc::now(),
                    origin: OriginMetadata::default(),
                },
            )
            .await?;
        info!(
            uuid = %uuid,
            provider = %outcome.revision().provider,
            outcome = outcome.label(),
            "Document written"
        );

        if outcome.is_change() {
            self.push_replica(uuid, outcome.revision(), content).await;
        }
        Ok(outcome)
    }

    /// Copy every document in a source folder to the migration target,
    /// keeping each document's UUID. Documents the target already holds a
    /// revision of are skipped. A dry run writes and records nothing.
    pub async fn migrate_folder(
        &self,
        project: &ProjectName,
        folder: &str,
        dry_run: bool,
    ) -> Result<MigrationReport, CoreError> {
        let project = self.project(project)?;
        let ProjectMode::Migrating { source, target, .. } = project.mode() else {
            return Err(RegistryError::NotMigrating(project.name().clone()).into());
        };
        let from = self.provider(project.name(), source)?;
        let to = self.provider(project.name(), target)?;

        let items = from.fetch_changed_since(folder, None).await?;
        info!(project = %project.name(), folder, items = items.len(), dry_run, "Migration started");
        let mut report = MigrationReport {
            dry_run,
            listed: items.len(),
            ..MigrationReport::default()
        };

        let to = to.as_ref();
        let results: Vec<(String, Result<MigrationStep, CoreError>)> = stream::iter(items)
            .map(move |item| async move {
                let native_id = item.native_id.clone();
                let step = self.migrate_item(project, source, to, item, dry_run).await;
                (native_id, step)
            })
            .buffer_unordered(self.settings.fan_out)
            .collect()
            .await;

        for (native_id, result) in results {
            match result {
                Ok(MigrationStep::Copied) => report.copied += 1,
                Ok(MigrationStep::Planned) => report.planned += 1,
                Ok(MigrationStep::AlreadyInTarget) => report.already_in_target += 1,
                Err(e) => {
                    warn!(native_id = %native_id, error = %e, "Document migration failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            project = %project.name(),
            folder,
            copied = report.copied,
            planned = report.planned,
            already_in_target = report.already_in_target,
            failed = report.failed,
            "Migration finished"
        );
        Ok(report)
    }

    async fn migrate_item(
        &self,
        project: &Project,
        source: ProviderKind,
        target: &dyn Provider,
        item: FetchedItem,
        dry_run: bool,
    ) -> Result<MigrationStep, CoreError> {
        let source_id = ProviderId::new(source, item.native_id.as_str())?;
        let store = self.recorder.store().as_ref();
        let uuid = assign_uuid(store, project.name(), &source_id, &item.content)
            .await?
            .uuid;

        let _guard = self.locks.lock(uuid).await;
        let in_target = store
            .revisions(uuid, project.name())
            .await?
            .iter()
            .any(|r| r.provider.kind() == target.kind());
        if in_target {
            warn!(uuid = %uuid, native_id = %item.native_id, "Document already exists in target; skipping");
            return Ok(MigrationStep::AlreadyInTarget);
        }
        if dry_run {
            info!(uuid = %uuid, native_id = %item.native_id, "Dry run: would migrate document");
            return Ok(MigrationStep::Planned);
        }

        let content_hash = ContentHash::of(&item.content);
        // Pin the source placement to this UUID before the copy exists.
        let recorded = self
            .recorder
            .record_observation(
                project,
                Observation {
                    uuid,
                    provider: source_id.clone(),
                    content_hash: content_hash.clone(),
                    observed_at: item.last_modified,
                    origin: OriginMetadata {
                        title: item.title.clone(),
                        details: item.details.clone(),
                        extras: serde_json::Map::new(),
                    },
                },
            )
            .await?;
        if recorded.is_change() {
            self.push_replica(uuid, recorded.revision(), &item.content).await;
        }

        let stored_id = target.write(&item.native_id, &item.content).await?;
        let mut extras = serde_json::Map::new();
        extras.insert("migrated_from".into(), source_id.to_string().into());
        let copied = self
            .recorder
            .record_observation(
                project,
                Observation {
                    uuid,
                    provider: ProviderId::new(target.kind(), stored_id)?,
                    content_hash,
                    observed_at: Utc::now(),
                    origin: OriginMetadata {
                        title: item.title,
                        details: None,
                        extras,
                    },
                },
            )
            .await?;
        info!(
            uuid = %uuid,
            source = %source_id,
            target = %copied.revision().provider,
            "Document migrated"
        );
        Ok(MigrationStep::Copied)
    }

    /// Run ticks at the configured interval until shutdown is signalled or
    /// a fatal error occurs. Ticks never overlap.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            folders = self.folders.len(),
            interval_secs = self.settings.interval.as_secs(),
            fan_out = self.settings.fan_out,
            "Sync loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancelled(shutdown.clone()) => {
                    info!("Sync loop shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.tick(&shutdown).await {
                Ok(report) => {
                    if report.cancelled {
                        info!("Sync loop shutting down");
                        return Ok(());
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Sync loop aborted");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Tick failed; retrying next interval"),
            }
        }
    }

    /// One pass over every watched folder.
    pub async fn tick(&self, shutdown: &watch::Receiver<bool>) -> Result<TickReport, CoreError> {
        let mut report = TickReport::default();
        info!(folders = self.folders.len(), "Tick started");

        self.retry_replica(&mut report).await;

        for folder in &self.folders {
            if *shutdown.borrow() {
                info!("Tick cancelled");
                report.cancelled = true;
                break;
            }
            match self.sync_folder(folder, shutdown).await {
                Ok(folder_report) => report.folders.push(folder_report),
                Err(CoreError::Cancelled) => {
                    info!(folder = %folder, "Tick cancelled");
                    report.cancelled = true;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(folder = %folder, error = %e, "Folder sync failed");
                    report.failed_folders += 1;
                }
            }
        }

        self.locks.prune().await;
        report.replica_pending = self.pending_replica.lock().await.len();

        let changed: usize = report.folders.iter().map(|f| f.changed).sum();
        let failed: usize = report.folders.iter().map(|f| f.failed).sum();
        info!(
            folders = report.folders.len(),
            failed_folders = report.failed_folders,
            changed,
            failed_items = failed,
            replica_pending = report.replica_pending,
            "Tick finished"
        );
        Ok(report)
    }

    async fn retry_replica(&self, report: &mut TickReport) {
        let queued: Vec<DocumentUuid> = self.pending_replica.lock().await.keys().copied().collect();
        for uuid in queued {
            let _guard = self.locks.lock(uuid).await;
            let Some(doc) = self.pending_replica.lock().await.get(&uuid).cloned() else {
                continue;
            };
            match self.replica.upsert(uuid, &doc).await {
                Ok(()) => {
                    self.pending_replica.lock().await.remove(&uuid);
                    report.replica_retried += 1;
                }
                Err(e) => warn!(uuid = %uuid, error = %e, "Replica retry failed; keeping queued"),
            }
        }
    }

    /// Push a recorded change to the replica, queueing it on failure. The
    /// caller holds the document's lock, so a queued entry is never older
    /// than what the replica already has.
    async fn push_replica(&self, uuid: DocumentUuid, revision: &Revision, content: &[u8]) {
        let doc = ReplicaDocument::from_revision(revision, content);
        match self.replica.upsert(uuid, &doc).await {
            Ok(()) => {
                self.pending_replica.lock().await.remove(&uuid);
            }
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Replica upsert failed; queued for next tick");
                self.pending_replica.lock().await.insert(uuid, doc);
            }
        }
    }

    async fn sync_folder(
        &self,
        folder: &FolderKey,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<FolderReport, CoreError> {
        let project = self.project(&folder.project)?;
        let provider = self.provider(&folder.project, folder.provider)?;
        let mut report = FolderReport::new(folder.clone());

        let cursor = self.cursors.get_cursor(folder).await?;
        let listing = tokio::select! {
            biased;
            _ = cancelled(shutdown.clone()) => return Err(CoreError::Cancelled),
            listing = provider.list_changed_since(&folder.folder, cursor) => listing,
        };
        let items = match listing {
            Ok(items) => items,
            Err(e) => return Err(self.provider_failure(folder, e).await),
        };
        report.listed = items.len();
        debug!(folder = %folder, items = items.len(), cursor = ?cursor, "Listed changes");

        let groups = group_by_native_id(items);
        let results: Vec<ItemResult> = stream::iter(groups)
            .map(|group| self.process_group(project, provider.as_ref(), group, shutdown))
            .buffer_unordered(self.settings.fan_out)
            .collect::<Vec<Vec<ItemResult>>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut permanent = None;
        let mut was_cancelled = false;
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(done) => {
                    match &done.outcome {
                        Outcome::NoChange { .. } => report.unchanged += 1,
                        Outcome::Outdated { .. } => report.outdated += 1,
                        Outcome::ConflictRaised { .. } => {
                            report.changed += 1;
                            report.conflicts += 1;
                        }
                        Outcome::NewRevision { .. } | Outcome::CanonicalPromotion { .. } => {
                            report.changed += 1
                        }
                    }
                    successes.push(done);
                }
                Err(failure) => {
                    report.failed += 1;
                    match &failure.error {
                        CoreError::Cancelled => was_cancelled = true,
                        CoreError::Provider(e) if !e.is_transient() => {
                            permanent.get_or_insert_with(|| e.clone());
                        }
                        _ => {}
                    }
                    warn!(
                        folder = %folder,
                        native_id = %failure.native_id,
                        error = %failure.error,
                        "Item failed; cursor held below it"
                    );
                    failures.push(failure);
                }
            }
        }

        let listed: Vec<(DateTime<Utc>, bool)> = successes
            .iter()
            .map(|s| (s.listed_at, true))
            .chain(failures.iter().map(|f| (f.listed_at, false)))
            .collect();
        if let Some(next) = next_cursor(cursor, &listed) {
            self.cursors.set_cursor(folder, next).await?;
            report.cursor_advanced_to = Some(next);
            debug!(folder = %folder, cursor = %next, "Cursor advanced");
        }

        if was_cancelled {
            return Err(CoreError::Cancelled);
        }

        self.refresh_headers(provider.as_ref(), &successes, &mut report, shutdown)
            .await;

        match permanent {
            Some(e) => return Err(self.provider_failure(folder, e).await),
            None => {
                self.health
                    .write()
                    .await
                    .record_success(&folder.project, folder.provider, Utc::now());
            }
        }

        info!(
            folder = %folder,
            listed = report.listed,
            changed = report.changed,
            unchanged = report.unchanged,
            conflicts = report.conflicts,
            failed = report.failed,
            "Folder synced"
        );
        Ok(report)
    }

    /// Classify a provider error. Transient errors and `Continue` surface
    /// as a plain provider error; `Abort` becomes fatal.
    async fn provider_failure(&self, folder: &FolderKey, err: ProviderError) -> CoreError {
        if err.is_transient() {
            warn!(folder = %folder, error = %err, "Transient provider error; retrying next tick");
            return CoreError::Provider(err);
        }
        let decision = self.policy.on_permanent_error(folder, &err);
        error!(folder = %folder, error = %err, decision = ?decision, "Permanent provider error");
        match decision {
            PolicyDecision::Continue => CoreError::Provider(err),
            PolicyDecision::DegradeProvider => {
                self.health
                    .write()
                    .await
                    .mark_degraded(&folder.project, folder.provider, err.to_string());
                CoreError::Provider(err)
            }
            PolicyDecision::Abort => CoreError::Aborted(format!("{folder}: {err}")),
        }
    }

    /// Items of one native ID, in listing order. Stops at the first
    /// failure so later versions are not recorded ahead of it.
    async fn process_group(
        &self,
        project: &Project,
        provider: &dyn Provider,
        (native_id, items): (String, Vec<ChangedItem>),
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ItemResult> {
        let mut out = Vec::with_capacity(items.len());
        let mut failed = false;
        for item in items {
            if failed {
                out.push(Err(ItemFailure {
                    native_id: native_id.clone(),
                    listed_at: item.last_modified,
                    error: CoreError::Provider(ProviderError::Transient(
                        "skipped after an earlier version failed".into(),
                    )),
                }));
                continue;
            }
            let result = self.process_item(project, provider, &item, shutdown).await;
            match result {
                Ok((uuid, outcome)) => out.push(Ok(ItemSuccess {
                    native_id: item.native_id,
                    listed_at: item.last_modified,
                    uuid,
                    outcome,
                })),
                Err(error) => {
                    failed = true;
                    out.push(Err(ItemFailure {
                        native_id: item.native_id,
                        listed_at: item.last_modified,
                        error,
                    }));
                }
            }
        }
        out
    }

    async fn process_item(
        &self,
        project: &Project,
        provider: &dyn Provider,
        item: &ChangedItem,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(DocumentUuid, Outcome), CoreError> {
        if *shutdown.borrow() {
            return Err(CoreError::Cancelled);
        }
        let fetched = tokio::select! {
            biased;
            _ = cancelled(shutdown.clone()) => return Err(CoreError::Cancelled),
            fetched = provider.fetch(&item.native_id) => fetched?,
        };

        let provider_id = ProviderId::new(provider.kind(), fetched.native_id.as_str())?;
        let content_hash = ContentHash::of(&fetched.content);
        let assignment = assign_uuid(
            self.recorder.store().as_ref(),
            project.name(),
            &provider_id,
            &fetched.content,
        )
        .await?;
        let uuid = assignment.uuid;

        let _guard = self.locks.lock(uuid).await;
        let outcome = self
            .recorder
            .record_observation(
                project,
                Observation {
                    uuid,
                    provider: provider_id,
                    content_hash,
                    observed_at: fetched.last_modified,
                    origin: OriginMetadata {
                        title: fetched.title.clone(),
                        details: fetched.details.clone(),
                        extras: serde_json::Map::new(),
                    },
                },
            )
            .await?;
        debug!(uuid = %uuid, native_id = %item.native_id, outcome = outcome.label(), source = ?assignment.source, "Observation recorded");

        if outcome.is_change() {
            self.push_replica(uuid, outcome.revision(), &fetched.content).await;
        }
        Ok((uuid, outcome))
    }

    /// Stamp UUIDs into headers of items past the grace window. Failures
    /// are logged only; the pass is retried whenever the item changes again.
    async fn refresh_headers(
        &self,
        provider: &dyn Provider,
        successes: &[ItemSuccess],
        report: &mut FolderReport,
        shutdown: &watch::Receiver<bool>,
    ) {
        let horizon = Utc::now() - self.settings.grace;
        for done in successes {
            if *shutdown.borrow() {
                return;
            }
            if done.listed_at > horizon {
                report.headers_deferred += 1;
                continue;
            }
            match provider.refresh_header(&done.native_id, done.uuid).await {
                Ok(()) => report.headers_refreshed += 1,
                Err(e) => warn!(native_id = %done.native_id, error = %e, "Header refresh failed"),
            }
        }
    }
}

/// Open the configured database, apply the schema, and run the loop over
/// SQLite until `shutdown` flips to `true`.
pub async fn run_sync(
    config: &Config,
    providers: ProviderSet,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let replica = Arc::new(SqliteReplica::new(pool.clone()));

    let sync = SyncLoop::from_config(config, store, replica, providers)?;
    let result = sync.run(shutdown).await;
    pool.close().await;
    Ok(result?)
}

/// Group a listing by native ID. Groups keep first-appearance order and
/// items inside a group keep listing order.
fn group_by_native_id(items: Vec<ChangedItem>) -> Vec<(String, Vec<ChangedItem>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<ChangedItem>)> = Vec::new();
    for item in items {
        match index.get(&item.native_id) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(item.native_id.clone(), groups.len());
                groups.push((item.native_id.clone(), vec![item]));
            }
        }
    }
    groups
}

/// The newest successful timestamp strictly below the oldest failure, if
/// that is ahead of the current cursor.
fn next_cursor(
    current: Option<DateTime<Utc>>,
    items: &[(DateTime<Utc>, bool)],
) -> Option<DateTime<Utc>> {
    let oldest_failure = items.iter().filter(|(_, ok)| !ok).map(|(ts, _)| *ts).min();
    let candidate = items
        .iter()
        .filter(|(ts, ok)| *ok && oldest_failure.map_or(true, |f| *ts < f))
        .map(|(ts, _)| *ts)
        .max()?;
    match current {
        Some(current) if candidate <= current => None,
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn cursor_stops_below_oldest_failure() {
        let items = [(ts(1), true), (ts(2), true), (ts(3), false), (ts(4), true)];
        assert_eq!(next_cursor(None, &items), Some(ts(2)));
    }

    #[test]
    fn cursor_takes_max_when_all_succeed() {
        let items = [(ts(4), true), (ts(1), true), (ts(9), true)];
        assert_eq!(next_cursor(Some(ts(0)), &items), Some(ts(9)));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let items = [(ts(3), true)];
        assert_eq!(next_cursor(Some(ts(5)), &items), None);
        assert_eq!(next_cursor(Some(ts(5)), &[]), None);
        assert_eq!(next_cursor(None, &[(ts(1), false)]), None);
    }

    #[test]
    fn grouping_keeps_listing_order() {
        let item = |id: &str, at| ChangedItem {
            native_id: id.into(),
            last_modified: ts(at),
        };
        let groups = group_by_native_id(vec![item("a", 1), item("b", 2), item("a", 3)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert_eq!(
            groups[0].1.iter().map(|i| i.last_modified).collect::<Vec<_>>(),
            vec![ts(1), ts(3)]
        );
        assert_eq!(groups[1].0, "b");
    }
}
