use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use docmesh::db;
use docmesh::migrate::apply_schema;
use docmesh::replica::SqliteReplica;
use docmesh::sqlite_store::SqliteStore;
use docmesh_core::conflict::{
    resolve_conflict, ConflictKind, MergedPolicy, NewConflict, PendingConflict, Resolution,
};
use docmesh_core::hash::ContentHash;
use docmesh_core::identity::{DocumentUuid, ProjectName, ProviderId, ProviderKind};
use docmesh_core::recorder::RevisionRecorder;
use docmesh_core::registry::{
    LocalSettings, MigrationState, Project, ProjectProvider, ProviderSettings,
};
use docmesh_core::replica::{ReplicaDocument, SearchReplica};
use docmesh_core::revision::{
    NewRevision, Observation, OriginDetails, OriginMetadata, Outcome, RevisionStatus,
};
use docmesh_core::store::{Alias, CursorStore, FolderKey, RevisionStore};

async fn setup() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data/docmesh.sqlite"))
        .await
        .unwrap();
    apply_schema(&pool).await.unwrap();
    // Applying twice is harmless.
    apply_schema(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn project_name() -> ProjectName {
    ProjectName::new("platform-docs").unwrap()
}

fn revision(uuid: DocumentUuid, provider: ProviderId, body: &str, at: i64, status: RevisionStatus) -> NewRevision {
    NewRevision {
        uuid,
        project: project_name(),
        provider,
        content_hash: ContentHash::of_str(body),
        last_modified: ts(at),
        status,
        origin: OriginMetadata {
            title: Some("RFC-7".into()),
            details: Some(OriginDetails::Local {
                git_commit: Some("abc123".into()),
            }),
            extras: serde_json::Map::new(),
        },
        recorded_at: ts(at),
    }
}

#[tokio::test]
async fn revisions_round_trip_and_order_newest_first() {
    let (_tmp, store) = setup().await;
    let uuid = DocumentUuid::generate();
    let path = ProviderId::local("rfc/7.md").unwrap();

    let first = store
        .append_revision(&revision(uuid, path.clone(), "v1", 10, RevisionStatus::Canonical), None)
        .await
        .unwrap();
    let second = store
        .append_revision(
            &revision(uuid, path.clone(), "v2", 20, RevisionStatus::Canonical),
            Some((first.id, RevisionStatus::Stale)),
        )
        .await
        .unwrap();

    let latest = store.latest_revision(uuid, &project_name(), &path).await.unwrap().unwrap();
    assert_eq!(latest, second);
    assert_eq!(latest.origin.title.as_deref(), Some("RFC-7"));

    let all = store.revisions(uuid, &project_name()).await.unwrap();
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);
    assert_eq!(all[1].status, RevisionStatus::Stale);

    let canonical = store.canonical_revision(uuid, &project_name()).await.unwrap().unwrap();
    assert_eq!(canonical.id, second.id);
    assert_eq!(
        store.uuid_for_provider(&project_name(), &path).await.unwrap(),
        Some(uuid)
    );
}

#[tokio::test]
async fn second_canonical_is_rejected_atomically() {
    let (_tmp, store) = setup().await;
    let uuid = DocumentUuid::generate();
    let path = ProviderId::local("rfc/7.md").unwrap();

    store
        .append_revision(&revision(uuid, path.clone(), "v1", 10, RevisionStatus::Canonical), None)
        .await
        .unwrap();
    let err = store
        .append_revision(&revision(uuid, path.clone(), "v2", 20, RevisionStatus::Canonical), None)
        .await;
    assert!(err.is_err());
    assert_eq!(store.revisions(uuid, &project_name()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn conflict_resolution_restores_single_canonical() {
    let (_tmp, store) = setup().await;
    let uuid = DocumentUuid::generate();
    let source = store
        .append_revision(
            &revision(uuid, ProviderId::local("rfc/7.md").unwrap(), "source", 10, RevisionStatus::Active),
            None,
        )
        .await
        .unwrap();
    let target = store
        .append_revision(
            &revision(uuid, ProviderId::google("1AbC").unwrap(), "target", 20, RevisionStatus::Active),
            None,
        )
        .await
        .unwrap();

    let conflict = store
        .open_conflict(&NewConflict {
            uuid,
            project: project_name(),
            source_revision: source.id,
            target_revision: target.id,
            kind: ConflictKind::ContentDivergence,
            detected_at: ts(30),
        })
        .await
        .unwrap();
    assert!(conflict.is_open());
    assert_eq!(
        store.revision(source.id).await.unwrap().unwrap().status,
        RevisionStatus::Conflict
    );
    assert_eq!(store.list_conflicts(false).await.unwrap().len(), 1);

    let closed = resolve_conflict(&store, conflict.id, Resolution::TargetWins, MergedPolicy::Archive, ts(40))
        .await
        .unwrap();
    assert_eq!(closed.resolved_at, Some(ts(40)));

    let canonical = store.canonical_revision(uuid, &project_name()).await.unwrap().unwrap();
    assert_eq!(canonical.id, target.id);
    assert_eq!(
        store.revision(source.id).await.unwrap().unwrap().status,
        RevisionStatus::Archived
    );
    assert!(store.list_conflicts(false).await.unwrap().is_empty());
    assert_eq!(store.list_conflicts(true).await.unwrap().len(), 1);

    // Terminal.
    assert!(
        resolve_conflict(&store, conflict.id, Resolution::SourceWins, MergedPolicy::Archive, ts(50))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn diverging_append_rolls_back_with_its_conflict() {
    let (_tmp, store) = setup().await;
    let uuid = DocumentUuid::generate();
    let source = store
        .append_revision(
            &revision(uuid, ProviderId::local("rfc/7.md").unwrap(), "source", 10, RevisionStatus::Active),
            None,
        )
        .await
        .unwrap();
    let target = || revision(uuid, ProviderId::google("1AbC").unwrap(), "target", 20, RevisionStatus::Active);

    // The paired revision belongs to another document: nothing is kept.
    let other = store
        .append_revision(
            &revision(DocumentUuid::generate(), ProviderId::local("rfc/8.md").unwrap(), "x", 10, RevisionStatus::Active),
            None,
        )
        .await
        .unwrap();
    let foreign = PendingConflict {
        paired: other.id,
        candidate_is_source: false,
        kind: ConflictKind::ContentDivergence,
        detected_at: ts(21),
    };
    assert!(store.append_diverging(&target(), &foreign).await.is_err());
    assert_eq!(store.revisions(uuid, &project_name()).await.unwrap().len(), 1);
    assert!(store.list_conflicts(true).await.unwrap().is_empty());

    let pending = PendingConflict {
        paired: source.id,
        ..foreign
    };
    let (stored, conflict) = store.append_diverging(&target(), &pending).await.unwrap();
    assert_eq!(stored.status, RevisionStatus::Conflict);
    assert_eq!(conflict.source_revision, source.id);
    assert_eq!(conflict.target_revision, stored.id);
    assert_eq!(
        store.revision(source.id).await.unwrap().unwrap().status,
        RevisionStatus::Conflict
    );
    assert_eq!(store.list_conflicts(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn alias_insert_is_idempotent_but_never_remaps() {
    let (_tmp, store) = setup().await;
    let uuid = DocumentUuid::generate();
    let alias = Alias {
        legacy_id: "google:1AbC".into(),
        uuid,
        created_at: ts(1),
    };
    store.insert_alias(&alias).await.unwrap();
    store.insert_alias(&alias).await.unwrap();
    assert_eq!(store.lookup_alias("google:1AbC").await.unwrap(), Some(uuid));

    let remap = Alias {
        uuid: DocumentUuid::generate(),
        ..alias
    };
    assert!(store.insert_alias(&remap).await.is_err());
    assert_eq!(store.lookup_alias("google:1AbC").await.unwrap(), Some(uuid));
    assert_eq!(store.lookup_alias("google:missing").await.unwrap(), None);
}

#[tokio::test]
async fn cursors_are_per_folder() {
    let (_tmp, store) = setup().await;
    let key = |folder: &str| FolderKey {
        project: project_name(),
        provider: ProviderKind::Google,
        folder: folder.into(),
    };

    assert_eq!(store.get_cursor(&key("rfc")).await.unwrap(), None);
    store.set_cursor(&key("rfc"), ts(100)).await.unwrap();
    store.set_cursor(&key("rfc"), ts(200)).await.unwrap();
    assert_eq!(store.get_cursor(&key("rfc")).await.unwrap(), Some(ts(200)));
    assert_eq!(store.get_cursor(&key("prd")).await.unwrap(), None);
}

#[tokio::test]
async fn recorder_runs_against_sqlite() {
    let (_tmp, store) = setup().await;
    let store = Arc::new(store);
    let recorder = RevisionRecorder::new(store.clone());
    let project = Project::new(
        project_name(),
        vec![ProjectProvider::new(
            ProviderSettings::Local(LocalSettings {
                workspace_path: "docs".into(),
                git_branch: None,
            }),
            MigrationState::Active,
        )],
        None,
    )
    .unwrap();
    let uuid = DocumentUuid::generate();
    let observe = |body: &str, at| Observation {
        uuid,
        provider: ProviderId::local("rfc/7.md").unwrap(),
        content_hash: ContentHash::of_str(body),
        observed_at: ts(at),
        origin: OriginMetadata::default(),
    };

    let first = recorder.record_observation(&project, observe("v1", 10)).await.unwrap();
    assert!(matches!(first, Outcome::CanonicalPromotion { .. }));

    let again = recorder.record_observation(&project, observe("v1\r\n", 11)).await.unwrap();
    assert!(matches!(again, Outcome::NoChange { .. }));

    let second = recorder.record_observation(&project, observe("v2", 20)).await.unwrap();
    match second {
        Outcome::NewRevision {
            revision,
            superseded: Some(old),
        } => {
            assert_eq!(revision.status, RevisionStatus::Canonical);
            assert_eq!(old, first.revision().id);
        }
        other => panic!("unexpected outcome {}", other.label()),
    }
    assert_eq!(store.revisions(uuid, &project_name()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn replica_upsert_replaces_and_is_searchable() {
    let (_tmp, store) = setup().await;
    let replica = SqliteReplica::new(store.pool().clone());
    let uuid = DocumentUuid::generate();
    let rev = store
        .append_revision(
            &revision(uuid, ProviderId::local("rfc/7.md").unwrap(), "zebra", 10, RevisionStatus::Canonical),
            None,
        )
        .await
        .unwrap();

    replica
        .upsert(uuid, &ReplicaDocument::from_revision(&rev, b"Migrating the zebra service"))
        .await
        .unwrap();
    assert_eq!(replica.search("zebra", 10).await.unwrap(), vec![uuid]);

    replica
        .upsert(uuid, &ReplicaDocument::from_revision(&rev, b"Now about giraffes"))
        .await
        .unwrap();
    assert!(replica.search("zebra", 10).await.unwrap().is_empty());
    assert_eq!(replica.search("giraffes", 10).await.unwrap(), vec![uuid]);
}
