use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use docmesh::providers::ProviderSet;
use docmesh::sync::{FailFast, MigrationReport, SyncLoop, SyncSettings};
use docmesh_core::error::CoreError;
use docmesh_core::health::{DegradedReason, Freshness};
use docmesh_core::identity::{DocumentUuid, ProjectName, ProviderKind};
use docmesh_core::provider::{ChangedItem, FetchedItem, Provider, ProviderError};
use docmesh_core::registry::{
    GoogleSettings, LocalSettings, MigrationState, Project, ProjectProvider, ProviderSettings,
    ReadView, RegistryError,
};
use docmesh_core::replica::{InMemoryReplica, ReplicaDocument, SearchReplica};
use docmesh_core::revision::{Outcome, RevisionStatus};
use docmesh_core::store::faulty::{FaultyStore, StoreOp};
use docmesh_core::store::memory::InMemoryStore;
use docmesh_core::store::{CursorStore, FolderKey, RevisionStore};

const FOLDER: &str = "rfc";

// ── Fake provider ──────────────────────────────────────────────────────

struct Doc {
    id: String,
    body: String,
    modified: DateTime<Utc>,
}

struct FakeProvider {
    kind: ProviderKind,
    docs: Mutex<Vec<Doc>>,
    fetch_errors: Mutex<HashMap<String, ProviderError>>,
    list_error: Mutex<Option<ProviderError>>,
    refreshed: Mutex<Vec<String>>,
    fetch_delay: Option<std::time::Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeProvider {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            docs: Mutex::new(Vec::new()),
            fetch_errors: Mutex::new(HashMap::new()),
            list_error: Mutex::new(None),
            refreshed: Mutex::new(Vec::new()),
            fetch_delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    fn put(&self, id: &str, body: &str, modified: DateTime<Utc>) {
        let mut docs = self.docs.lock().unwrap();
        docs.retain(|d| d.id != id);
        docs.push(Doc {
            id: id.to_string(),
            body: body.to_string(),
            modified,
        });
    }

    fn fail_fetch(&self, id: &str, error: ProviderError) {
        self.fetch_errors.lock().unwrap().insert(id.to_string(), error);
    }

    fn heal(&self) {
        self.fetch_errors.lock().unwrap().clear();
        *self.list_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_changed_since(
        &self,
        _folder: &str,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangedItem>, ProviderError> {
        if let Some(e) = self.list_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|d| cursor.map_or(true, |c| d.modified > c))
            .map(|d| ChangedItem {
                native_id: d.id.clone(),
                last_modified: d.modified,
            })
            .collect())
    }

    async fn fetch(&self, native_id: &str) -> Result<FetchedItem, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = self.fetch_errors.lock().unwrap().get(native_id) {
            return Err(e.clone());
        }
        let docs = self.docs.lock().unwrap();
        let doc = docs
            .iter()
            .find(|d| d.id == native_id)
            .ok_or_else(|| ProviderError::Permanent(format!("{native_id} is gone")))?;
        Ok(FetchedItem {
            native_id: doc.id.clone(),
            content: doc.body.clone().into_bytes(),
            last_modified: doc.modified,
            title: Some(doc.id.clone()),
            details: None,
        })
    }

    async fn write(&self, native_id: &str, content: &[u8]) -> Result<String, ProviderError> {
        // Drive hands out its own ID when a file is created from a path.
        let drive_safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        let stored = match self.kind {
            ProviderKind::Google if !native_id.chars().all(drive_safe) => {
                format!("1Copy_{}", native_id.replace(|c: char| !drive_safe(c), "_"))
            }
            _ => native_id.to_string(),
        };
        let body = String::from_utf8_lossy(content).to_string();
        self.put(&stored, &body, Utc::now());
        Ok(stored)
    }

    async fn refresh_header(&self, native_id: &str, _uuid: DocumentUuid) -> Result<(), ProviderError> {
        self.refreshed.lock().unwrap().push(native_id.to_string());
        Ok(())
    }
}

/// Fails the first `failures` upserts, then delegates.
struct FlakyReplica {
    inner: InMemoryReplica,
    failures: AtomicUsize,
}

#[async_trait]
impl SearchReplica for FlakyReplica {
    async fn upsert(&self, uuid: DocumentUuid, document: &ReplicaDocument) -> anyhow::Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("replica unavailable");
        }
        self.inner.upsert(uuid, document).await
    }
}

/// Holds its first upsert for a while, so a later push for the same
/// document could overtake it if pushes were not serialized.
struct SlowFirstReplica {
    inner: InMemoryReplica,
    first: AtomicBool,
}

#[async_trait]
impl SearchReplica for SlowFirstReplica {
    async fn upsert(&self, uuid: DocumentUuid, document: &ReplicaDocument) -> anyhow::Result<()> {
        if self.first.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.inner.upsert(uuid, document).await
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

fn name() -> ProjectName {
    ProjectName::new("platform-docs").unwrap()
}

fn local(state: MigrationState) -> ProjectProvider {
    ProjectProvider::new(
        ProviderSettings::Local(LocalSettings {
            workspace_path: "docs".into(),
            git_branch: None,
        }),
        state,
    )
}

fn google(state: MigrationState) -> ProjectProvider {
    ProjectProvider::new(
        ProviderSettings::Google(GoogleSettings {
            workspace_id: "C01".into(),
            shared_drive_ids: vec![],
            credentials_path: None,
        }),
        state,
    )
}

fn folder(kind: ProviderKind) -> FolderKey {
    FolderKey {
        project: name(),
        provider: kind,
        folder: FOLDER.into(),
    }
}

fn hours_ago(h: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(h)
}

struct Harness {
    store: Arc<InMemoryStore>,
    replica: Arc<InMemoryReplica>,
    provider: Arc<FakeProvider>,
    sync: SyncLoop,
}

fn steady_harness(provider: FakeProvider, settings: SyncSettings) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let replica = Arc::new(InMemoryReplica::new());
    let provider = Arc::new(provider);

    let mut providers = ProviderSet::new();
    providers.register(name(), provider.clone());

    let mut sync = SyncLoop::new(store.clone(), store.clone(), replica.clone(), providers, settings);
    sync.add_project(Project::new(name(), vec![local(MigrationState::Active)], None).unwrap());
    sync.watch_folder(folder(ProviderKind::Local)).unwrap();

    Harness {
        store,
        replica,
        provider,
        sync,
    }
}

struct MigrationHarness {
    store: Arc<InMemoryStore>,
    source: Arc<FakeProvider>,
    target: Arc<FakeProvider>,
    sync: SyncLoop,
}

fn migration_harness() -> MigrationHarness {
    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(FakeProvider::new(ProviderKind::Local));
    let target = Arc::new(FakeProvider::new(ProviderKind::Google));
    let mut providers = ProviderSet::new();
    providers.register(name(), source.clone());
    providers.register(name(), target.clone());

    let mut sync = SyncLoop::new(
        store.clone(),
        store.clone(),
        Arc::new(InMemoryReplica::new()),
        providers,
        SyncSettings::default(),
    );
    sync.add_project(
        Project::new(
            name(),
            vec![local(MigrationState::Source), google(MigrationState::Target)],
            Some(hours_ago(3)),
        )
        .unwrap(),
    );
    MigrationHarness {
        store,
        source,
        target,
        sync,
    }
}

fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_tick_records_everything_and_advances_cursor() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(3));
    h.provider.put("b.md", "beta", hours_ago(2));
    h.provider.put("c.md", "gamma", hours_ago(1));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.listed, 3);
    assert_eq!(f.changed, 3);
    assert_eq!(f.failed, 0);
    assert_eq!(h.replica.len(), 3);
    assert_eq!(h.store.revision_count().unwrap(), 3);

    let cursor = h.store.get_cursor(&folder(ProviderKind::Local)).await.unwrap();
    assert_eq!(cursor, Some(h.provider.docs.lock().unwrap()[2].modified));

    // Nothing newer than the cursor.
    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].listed, 0);
    assert_eq!(h.store.revision_count().unwrap(), 3);
}

#[tokio::test]
async fn failed_item_holds_cursor_until_it_succeeds() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    let times: Vec<_> = (1..=5).map(|i| hours_ago(10 - i)).collect();
    // The failing third item carries the newest timestamp.
    h.provider.put("1.md", "one", times[0]);
    h.provider.put("2.md", "two", times[1]);
    h.provider.put("3.md", "three", times[4]);
    h.provider.put("4.md", "four", times[2]);
    h.provider.put("5.md", "five", times[3]);
    h.provider
        .fail_fetch("3.md", ProviderError::Transient("timeout".into()));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.changed, 4);
    assert_eq!(f.failed, 1);
    assert_eq!(f.cursor_advanced_to, Some(times[3]));

    h.provider.heal();
    let report = h.sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.listed, 1);
    assert_eq!(f.changed, 1);
    assert_eq!(f.cursor_advanced_to, Some(times[4]));
    assert_eq!(h.store.revision_count().unwrap(), 5);
}

#[tokio::test]
async fn cursor_stays_below_an_older_failure() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(3));
    h.provider.put("b.md", "beta", hours_ago(2));
    h.provider.put("c.md", "gamma", hours_ago(1));
    h.provider
        .fail_fetch("b.md", ProviderError::Transient("rate limited".into()));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].cursor_advanced_to, Some(h.provider.docs.lock().unwrap()[0].modified));

    // b and c are listed again; c is already recorded.
    h.provider.heal();
    let report = h.sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.listed, 2);
    assert_eq!(f.changed, 1);
    assert_eq!(f.unchanged, 1);
    assert_eq!(h.store.revision_count().unwrap(), 3);
}

#[tokio::test]
async fn header_refresh_waits_for_grace_window() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("old.md", "settled", hours_ago(2));
    h.provider.put("new.md", "being edited", Utc::now() - Duration::minutes(1));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.headers_refreshed, 1);
    assert_eq!(f.headers_deferred, 1);
    assert_eq!(*h.provider.refreshed.lock().unwrap(), vec!["old.md".to_string()]);
}

#[tokio::test]
async fn fan_out_bounds_concurrent_fetches() {
    let settings = SyncSettings {
        fan_out: 2,
        ..SyncSettings::default()
    };
    let provider = FakeProvider::new(ProviderKind::Local).with_delay(std::time::Duration::from_millis(20));
    let h = steady_harness(provider, settings);
    for i in 0..6 {
        h.provider.put(&format!("{i}.md"), &format!("body {i}"), hours_ago(8 - i));
    }
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].changed, 6);
    let max = h.provider.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 2, "saw {max} concurrent fetches");
}

#[tokio::test]
async fn permanent_error_degrades_provider_until_next_success() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(1));
    *h.provider.list_error.lock().unwrap() = Some(ProviderError::Permanent("credentials revoked".into()));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.failed_folders, 1);
    let read = h
        .sync
        .resolve_read(&name(), ReadView::Historical, Utc::now())
        .await
        .unwrap();
    assert_eq!(read.provider, ProviderKind::Local);
    match read.freshness {
        Freshness::Degraded {
            reason: DegradedReason::ProviderError(msg),
            ..
        } => assert!(msg.contains("credentials revoked")),
        other => panic!("expected degraded, got {other:?}"),
    }

    h.provider.heal();
    h.sync.tick(&rx).await.unwrap();
    let read = h
        .sync
        .resolve_read(&name(), ReadView::Historical, Utc::now())
        .await
        .unwrap();
    assert!(read.freshness.is_fresh());
}

#[tokio::test]
async fn fail_fast_policy_aborts_tick() {
    let mut h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.sync = h.sync.with_policy(Arc::new(FailFast));
    h.provider.put("a.md", "alpha", hours_ago(1));
    h.provider
        .fail_fetch("a.md", ProviderError::Permanent("file deleted".into()));
    let (_tx, rx) = no_shutdown();

    let err = h.sync.tick(&rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CoreError::Aborted(_)));
}

#[tokio::test]
async fn transient_listing_error_is_retried_next_tick() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(1));
    *h.provider.list_error.lock().unwrap() = Some(ProviderError::Transient("503".into()));
    let (_tx, rx) = no_shutdown();

    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.failed_folders, 1);
    assert_eq!(h.store.revision_count().unwrap(), 0);

    h.provider.heal();
    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].changed, 1);
}

#[tokio::test]
async fn shutdown_before_tick_records_nothing() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(1));
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let report = h.sync.tick(&rx).await.unwrap();
    assert!(report.cancelled);
    assert!(report.folders.is_empty());
    assert_eq!(h.store.revision_count().unwrap(), 0);
}

#[tokio::test]
async fn shutdown_during_fetch_leaves_cursor_alone() {
    let provider = FakeProvider::new(ProviderKind::Local).with_delay(std::time::Duration::from_secs(30));
    let h = steady_harness(provider, SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(1));
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });

    let report = tokio::time::timeout(std::time::Duration::from_secs(5), h.sync.tick(&rx))
        .await
        .expect("tick should stop promptly")
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(h.store.revision_count().unwrap(), 0);
    assert_eq!(h.store.get_cursor(&folder(ProviderKind::Local)).await.unwrap(), None);
}

#[tokio::test]
async fn run_returns_when_shutdown_is_signalled() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    h.provider.put("a.md", "alpha", hours_ago(1));
    let (tx, rx) = watch::channel(false);
    let store = h.store.clone();

    let stopper = tokio::spawn(async move {
        // The first tick fires immediately.
        while store.revision_count().unwrap() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), h.sync.run(rx))
        .await
        .expect("run should return after shutdown")
        .unwrap();
    stopper.await.unwrap();
}

#[tokio::test]
async fn failed_replica_push_is_retried_next_tick() {
    let store = Arc::new(InMemoryStore::new());
    let replica = Arc::new(FlakyReplica {
        inner: InMemoryReplica::new(),
        failures: AtomicUsize::new(1),
    });
    let provider = Arc::new(FakeProvider::new(ProviderKind::Local));
    provider.put("a.md", "alpha", hours_ago(1));
    let mut providers = ProviderSet::new();
    providers.register(name(), provider.clone());

    let mut sync = SyncLoop::new(
        store.clone(),
        store.clone(),
        replica.clone(),
        providers,
        SyncSettings::default(),
    );
    sync.add_project(Project::new(name(), vec![local(MigrationState::Active)], None).unwrap());
    sync.watch_folder(folder(ProviderKind::Local)).unwrap();
    let (_tx, rx) = no_shutdown();

    let report = sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].changed, 1);
    assert_eq!(report.replica_pending, 1);
    assert!(replica.inner.is_empty());

    let report = sync.tick(&rx).await.unwrap();
    assert_eq!(report.replica_retried, 1);
    assert_eq!(report.replica_pending, 0);
    assert_eq!(replica.inner.len(), 1);
}

#[tokio::test]
async fn divergent_edits_during_migration_raise_a_conflict() {
    let uuid = "6f9619ff-8b86-d011-b42d-00c04fc964ff";
    let store = Arc::new(InMemoryStore::new());
    let replica = Arc::new(InMemoryReplica::new());
    let source = Arc::new(FakeProvider::new(ProviderKind::Local));
    let target = Arc::new(FakeProvider::new(ProviderKind::Google));
    source.put("rfc-7.md", &format!("---\nuuid: {uuid}\n---\nsource edit"), hours_ago(2));
    target.put("1AbC_drive", &format!("---\nuuid: {uuid}\n---\ntarget edit"), hours_ago(1));

    let mut providers = ProviderSet::new();
    providers.register(name(), source.clone());
    providers.register(name(), target.clone());

    let mut sync = SyncLoop::new(store.clone(), store.clone(), replica.clone(), providers, SyncSettings::default());
    sync.add_project(
        Project::new(
            name(),
            vec![local(MigrationState::Source), google(MigrationState::Target)],
            Some(hours_ago(3)),
        )
        .unwrap(),
    );
    sync.watch_folder(folder(ProviderKind::Local)).unwrap();
    sync.watch_folder(folder(ProviderKind::Google)).unwrap();
    let (_tx, rx) = no_shutdown();

    let report = sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].conflicts, 0);
    assert_eq!(report.folders[1].conflicts, 1);

    let uuid = DocumentUuid::parse(uuid).unwrap();
    let open = store.open_conflicts(uuid, &name()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(store.canonical_revision(uuid, &name()).await.unwrap(), None);
}

#[tokio::test]
async fn watching_an_unknown_project_is_rejected() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    let mut sync = h.sync;
    let err = sync
        .watch_folder(FolderKey {
            project: ProjectName::new("elsewhere").unwrap(),
            provider: ProviderKind::Local,
            folder: FOLDER.into(),
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Registry(_)));
    assert_eq!(sync.folders().len(), 1);
}

#[tokio::test]
async fn store_failure_fails_the_item_and_holds_the_cursor() {
    let store = Arc::new(FaultyStore::new(InMemoryStore::new()));
    let provider = Arc::new(FakeProvider::new(ProviderKind::Local));
    provider.put("a.md", "alpha", hours_ago(2));
    provider.put("b.md", "beta", hours_ago(1));
    let mut providers = ProviderSet::new();
    providers.register(name(), provider.clone());

    let mut sync = SyncLoop::new(
        store.clone(),
        store.clone(),
        Arc::new(InMemoryReplica::new()),
        providers,
        SyncSettings::default(),
    );
    sync.add_project(Project::new(name(), vec![local(MigrationState::Active)], None).unwrap());
    sync.watch_folder(folder(ProviderKind::Local)).unwrap();
    let (_tx, rx) = no_shutdown();

    store.fail_always(StoreOp::Append);
    let report = sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.failed, 2);
    assert_eq!(f.changed, 0);
    assert_eq!(f.cursor_advanced_to, None);
    assert_eq!(store.get_cursor(&folder(ProviderKind::Local)).await.unwrap(), None);
    assert_eq!(store.inner().revision_count().unwrap(), 0);

    // A store failure is not a provider failure.
    let read = sync
        .resolve_read(&name(), ReadView::Historical, Utc::now())
        .await
        .unwrap();
    assert!(read.freshness.is_fresh());

    store.reset();
    let report = sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].changed, 2);
    assert_eq!(
        store.get_cursor(&folder(ProviderKind::Local)).await.unwrap(),
        Some(provider.docs.lock().unwrap()[1].modified)
    );
}

#[tokio::test]
async fn native_ids_sharing_a_frontmatter_uuid_are_recorded_in_turn() {
    let uuid = "0b7c1d2e-3f40-4a5b-8c6d-7e8f9a0b1c2d";
    let store = Arc::new(InMemoryStore::new());
    let replica = Arc::new(SlowFirstReplica {
        inner: InMemoryReplica::new(),
        first: AtomicBool::new(true),
    });
    let provider = Arc::new(FakeProvider::new(ProviderKind::Local));
    provider.put("handbook.md", &format!("---\nuuid: {uuid}\n---\nfirst copy"), hours_ago(2));
    provider.put("handbook-old.md", &format!("---\nuuid: {uuid}\n---\nsecond copy"), hours_ago(1));
    let mut providers = ProviderSet::new();
    providers.register(name(), provider.clone());

    let settings = SyncSettings {
        fan_out: 2,
        ..SyncSettings::default()
    };
    let mut sync = SyncLoop::new(store.clone(), store.clone(), replica.clone(), providers, settings);
    sync.add_project(Project::new(name(), vec![local(MigrationState::Active)], None).unwrap());
    sync.watch_folder(folder(ProviderKind::Local)).unwrap();
    let (_tx, rx) = no_shutdown();

    let report = sync.tick(&rx).await.unwrap();
    let f = &report.folders[0];
    assert_eq!(f.changed, 2);
    assert_eq!(f.failed, 0);

    let uuid = DocumentUuid::parse(uuid).unwrap();
    let revisions = store.revisions(uuid, &name()).await.unwrap();
    assert_eq!(revisions.len(), 2);
    let canonical: Vec<_> = revisions
        .iter()
        .filter(|r| r.status == RevisionStatus::Canonical)
        .collect();
    assert_eq!(canonical.len(), 1);
    assert!(revisions.iter().any(|r| r.status == RevisionStatus::Stale));

    // The replica ends on the revision recorded last, not the slow first push.
    let pushed = replica.inner.get(uuid).unwrap();
    assert_eq!(pushed.content_hash, canonical[0].content_hash);
    assert_eq!(replica.inner.upsert_count(), 2);
}

#[tokio::test]
async fn zero_fan_out_is_treated_as_one() {
    let settings = SyncSettings {
        fan_out: 0,
        ..SyncSettings::default()
    };
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), settings);
    h.provider.put("a.md", "alpha", hours_ago(2));
    h.provider.put("b.md", "beta", hours_ago(1));
    let (_tx, rx) = no_shutdown();

    let report = tokio::time::timeout(std::time::Duration::from_secs(5), h.sync.tick(&rx))
        .await
        .expect("tick must not stall")
        .unwrap();
    assert_eq!(report.folders[0].changed, 2);
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn writes_go_to_the_active_provider_and_are_recorded() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    let uuid = DocumentUuid::generate();

    let outcome = h
        .sync
        .write_document(&name(), uuid, "notes/oncall.md", b"# On-call\n")
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::CanonicalPromotion { .. }));
    assert_eq!(outcome.revision().provider.native_id(), "notes/oncall.md");
    assert_eq!(h.provider.docs.lock().unwrap().len(), 1);
    assert_eq!(h.replica.get(uuid).unwrap().body, "# On-call");

    // The loop sees the written file as already recorded.
    let (_tx, rx) = no_shutdown();
    let report = h.sync.tick(&rx).await.unwrap();
    assert_eq!(report.folders[0].unchanged, 1);
    assert_eq!(h.store.revision_count().unwrap(), 1);

    let err = h
        .sync
        .write_document(&name(), DocumentUuid::nil(), "notes/x.md", b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnassignedUuid { .. }));
    assert_eq!(h.provider.docs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn writes_during_migration_go_to_the_target() {
    let h = migration_harness();
    let uuid = DocumentUuid::generate();

    let outcome = h
        .sync
        .write_document(&name(), uuid, "1NewDriveDoc", b"draft")
        .await
        .unwrap();
    assert_eq!(outcome.revision().provider.kind(), ProviderKind::Google);
    assert_eq!(outcome.revision().status, RevisionStatus::Active);
    assert_eq!(h.target.docs.lock().unwrap().len(), 1);
    assert!(h.source.docs.lock().unwrap().is_empty());
    assert_eq!(h.store.revisions(uuid, &name()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn migration_dry_run_writes_nothing() {
    let h = migration_harness();
    h.source.put("rfc/1.md", "one", hours_ago(5));
    h.source.put("rfc/2.md", "two", hours_ago(4));

    let report = h.sync.migrate_folder(&name(), FOLDER, true).await.unwrap();
    assert_eq!(
        report,
        MigrationReport {
            dry_run: true,
            listed: 2,
            planned: 2,
            ..MigrationReport::default()
        }
    );
    assert!(h.target.docs.lock().unwrap().is_empty());
    assert_eq!(h.store.revision_count().unwrap(), 0);
}

#[tokio::test]
async fn migration_copies_under_the_same_uuid_once() {
    let uuid = "5a6b7c8d-9e0f-4a1b-8c2d-3e4f5a6b7c8d";
    let h = migration_harness();
    h.source.put("rfc/1.md", &format!("---\nuuid: {uuid}\n---\nbody"), hours_ago(5));
    h.source.put("rfc/2.md", "no frontmatter", hours_ago(4));

    let report = h.sync.migrate_folder(&name(), FOLDER, false).await.unwrap();
    assert_eq!(report.copied, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(h.target.docs.lock().unwrap().len(), 2);

    let uuid = DocumentUuid::parse(uuid).unwrap();
    let revisions = h.store.revisions(uuid, &name()).await.unwrap();
    let mut kinds: Vec<_> = revisions.iter().map(|r| r.provider.kind()).collect();
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, vec![ProviderKind::Google, ProviderKind::Local]);
    let copy = revisions
        .iter()
        .find(|r| r.provider.kind() == ProviderKind::Google)
        .unwrap();
    assert_eq!(copy.origin.extras["migrated_from"], "local:rfc/1.md");
    assert!(h.store.list_conflicts(true).await.unwrap().is_empty());

    // Everything is already in the target now.
    let again = h.sync.migrate_folder(&name(), FOLDER, false).await.unwrap();
    assert_eq!(again.copied, 0);
    assert_eq!(again.already_in_target, 2);
    assert_eq!(h.target.docs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn migration_needs_a_migrating_project() {
    let h = steady_harness(FakeProvider::new(ProviderKind::Local), SyncSettings::default());
    let err = h.sync.migrate_folder(&name(), FOLDER, true).await.unwrap_err();
    assert!(matches!(err, CoreError::Registry(RegistryError::NotMigrating(_))));
}
