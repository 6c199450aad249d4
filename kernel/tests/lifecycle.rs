use std::sync::Barrier;
use std::thread;

use claps_kernel::chain::new_version;
use claps_kernel::kinds::{Video, View};
use claps_kernel::query::Scope;
use claps_kernel::{
    bootstrap, catalog, Changes, Condition, Entity, ListOptions, MemoryStore, RecordStore,
    SqliteStore, StoreConfig, StoreError, VersionedStore, EMPTY_VERSION,
};
use tempfile::TempDir;

fn sqlite_store(dir: &TempDir) -> VersionedStore<SqliteStore> {
    let config = StoreConfig {
        database_path: dir.path().join("claps.db"),
        ..StoreConfig::default()
    };
    let backend = SqliteStore::open(&config).unwrap();
    bootstrap(&backend, &catalog(), &config.drift_policy).unwrap();
    VersionedStore::new(backend)
}

fn memory_store() -> VersionedStore<MemoryStore> {
    let backend = MemoryStore::new();
    bootstrap(&backend, &catalog(), &Default::default()).unwrap();
    VersionedStore::new(backend)
}

fn create_update_delete<S: RecordStore>(store: &VersionedStore<S>) {
    let kind = Video::kind();

    let created = store
        .create(&kind, Changes::new().set("title", "A").fields, None)
        .unwrap();
    assert_eq!(created.previous_version.as_str(), EMPTY_VERSION);
    assert!(created.latest && created.active);

    let updated = store
        .update(&kind, &created, Changes::new().set("title", "B"), None)
        .unwrap();
    assert_eq!(updated.previous_version, created.version);
    assert_eq!(updated.text("title"), Some("B"));

    let current = store
        .get_current(&kind, "entity_id", created.entity_id.as_str())
        .unwrap()
        .unwrap();
    assert_eq!(current.version, updated.version);

    let tombstone = store.delete(&kind, &updated, None).unwrap();
    assert!(!tombstone.active);

    assert!(store
        .get_current(&kind, "entity_id", created.entity_id.as_str())
        .unwrap()
        .is_none());

    let history = store.history(&kind, &created.entity_id).unwrap();
    assert_eq!(history.len(), 3);
    assert!(!history[0].latest);
    assert!(!history[1].latest);
    assert_eq!(history[2], tombstone);

    // every hop links to its predecessor, back to the sentinel
    for pair in history.windows(2) {
        assert_eq!(pair[1].previous_version, pair[0].version);
    }

    let summary = store.verify(&kind, &created.entity_id).unwrap();
    assert_eq!(summary.rows, 3);
    assert_eq!(summary.current_version, tombstone.version);
    assert!(!summary.active);

    let latest = store
        .list(&kind, Scope::Latest, Condition::All, ListOptions::default())
        .unwrap();
    assert_eq!(latest.count(), 1);
}

#[test]
fn lifecycle_on_sqlite() {
    let dir = TempDir::new().unwrap();
    create_update_delete(&sqlite_store(&dir));
}

#[test]
fn lifecycle_in_memory() {
    create_update_delete(&memory_store());
}

fn written_record_matches_reread<S: RecordStore>(store: &VersionedStore<S>) {
    let kind = Video::kind();

    let created = store
        .create(&kind, Changes::new().set("title", "A").fields, None)
        .unwrap();
    assert_eq!(created.fields.len(), kind.fields().len());

    let reread = store
        .get_current(&kind, "entity_id", created.entity_id.as_str())
        .unwrap()
        .unwrap();
    assert_eq!(created, reread);

    let updated = store
        .update(&kind, &created, Changes::new().set("deleted", true), None)
        .unwrap();
    let reread = store
        .get_current(&kind, "entity_id", created.entity_id.as_str())
        .unwrap()
        .unwrap();
    assert_eq!(updated, reread);
}

#[test]
fn written_record_matches_reread_on_sqlite() {
    let dir = TempDir::new().unwrap();
    written_record_matches_reread(&sqlite_store(&dir));
}

#[test]
fn written_record_matches_reread_in_memory() {
    written_record_matches_reread(&memory_store());
}

fn duplicate_current_rows_are_integrity_errors<S: RecordStore>(store: &VersionedStore<S>) {
    let kind = Video::kind();
    let first = store
        .create(&kind, Changes::new().set("title", "A").fields, None)
        .unwrap();

    // a second latest row for the same entity, bypassing the pipeline
    let twin = claps_kernel::VersionedRecord {
        version: new_version(),
        ..first.clone()
    };
    store.backend().insert_first(&kind, &twin).unwrap();

    let err = store
        .get_current(&kind, "entity_id", first.entity_id.as_str())
        .unwrap_err();
    assert!(matches!(err, StoreError::Integrity { .. }), "unexpected error: {err}");

    let err = store
        .update(&kind, &first, Changes::new().set("title", "B"), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::Integrity { .. }), "unexpected error: {err}");

    let rows = store
        .list(&kind, Scope::History, Condition::All, ListOptions::default())
        .unwrap();
    assert_eq!(rows.count(), 2);
}

#[test]
fn duplicate_current_rows_on_sqlite() {
    let dir = TempDir::new().unwrap();
    duplicate_current_rows_are_integrity_errors(&sqlite_store(&dir));
}

#[test]
fn duplicate_current_rows_in_memory() {
    duplicate_current_rows_are_integrity_errors(&memory_store());
}

#[test]
fn reads_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    let kind = View::kind();

    for user in ["u1", "u2", "u3"] {
        store
            .create(
                &kind,
                Changes::new().set("video_id", "v1").set("user_id", user).fields,
                None,
            )
            .unwrap();
    }

    let read = || -> Vec<_> {
        store
            .list_current(
                &kind,
                Condition::eq("video_id", "v1"),
                ListOptions::default().order_by("user_id", false),
            )
            .unwrap()
            .collect()
    };

    let first = read();
    assert_eq!(first.len(), 3);
    assert_eq!(first, read());
}

#[test]
fn unknown_entity_cannot_be_verified() {
    let store = memory_store();
    let ghost = claps_kernel::chain::new_identity();

    assert!(store.history(&Video::kind(), &ghost).unwrap().is_empty());
    let err = store.verify(&Video::kind(), &ghost).unwrap_err();
    assert!(matches!(err, StoreError::EntityNotFound { .. }));
}

fn racing_updates<S: RecordStore>(store: &VersionedStore<S>) {
    const WRITERS: usize = 8;
    let kind = Video::kind();
    let base = store
        .create(&kind, Changes::new().set("title", "A").fields, None)
        .unwrap();

    let barrier = Barrier::new(WRITERS);
    let outcomes: Vec<Result<_, StoreError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let (kind, base, barrier) = (&kind, &base, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    store.update(kind, base, Changes::new().set("title", format!("writer {i}")), None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, WRITERS - 1);

    let history = store.history(&kind, &base.entity_id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|r| r.latest).count(), 1);
}

#[test]
fn concurrent_updates_on_sqlite_append_once() {
    let dir = TempDir::new().unwrap();
    racing_updates(&sqlite_store(&dir));
}

#[test]
fn concurrent_updates_in_memory_append_once() {
    racing_updates(&memory_store());
}

#[test]
fn concurrent_creates_yield_distinct_entities() {
    const WRITERS: usize = 8;
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    let barrier = Barrier::new(WRITERS);

    let ids: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let (store, barrier) = (&store, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let kind = if i % 2 == 0 { Video::kind() } else { View::kind() };
                    store.create(&kind, Default::default(), None).unwrap().entity_id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), WRITERS);
}
