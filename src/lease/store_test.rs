use super::*;

fn lease(owner: Uuid, claimed_at: i64, expires_at: i64) -> Lease {
    Lease { object_id: Uuid::new_v4(), owner_id: owner, owner_name: "ada".into(), claimed_at, expires_at }
}

#[test]
fn new_store_is_empty() {
    let store = LeaseStore::new();
    assert!(store.all().is_empty());
    assert_eq!(store.version(), 0);
    assert!(store.snapshot().is_empty());
}

#[test]
fn upsert_get_remove() {
    let store = LeaseStore::new();
    let l = lease(Uuid::new_v4(), 0, 100);
    let id = l.object_id;

    assert!(store.upsert(l.clone()));
    assert_eq!(store.get(id), Some(l.clone()));
    assert_eq!(store.all().len(), 1);

    assert_eq!(store.remove(id), Some(l));
    assert!(store.get(id).is_none());
}

#[test]
fn malformed_lease_is_refused() {
    let store = LeaseStore::new();
    let l = lease(Uuid::new_v4(), 100, 100);
    assert!(!store.upsert(l.clone()));
    assert!(store.get(l.object_id).is_none());
    assert_eq!(store.version(), 0);
}

#[test]
fn version_bumps_only_on_real_changes() {
    let store = LeaseStore::new();
    let l = lease(Uuid::new_v4(), 0, 100);
    store.upsert(l.clone());
    assert_eq!(store.version(), 1);

    assert!(store.remove(Uuid::new_v4()).is_none());
    assert_eq!(store.version(), 1);

    store.sync(l.object_id, Some(l.clone()));
    assert_eq!(store.version(), 1, "syncing an identical lease is a no-op");

    store.sync(l.object_id, None);
    assert_eq!(store.version(), 2);
}

#[test]
fn snapshots_are_isolated_from_later_writes() {
    let store = LeaseStore::new();
    let first = lease(Uuid::new_v4(), 0, 100);
    store.upsert(first.clone());

    let before = store.snapshot();
    store.upsert(lease(Uuid::new_v4(), 0, 100));
    store.remove(first.object_id);

    assert_eq!(before.len(), 1);
    assert!(before.get(&first.object_id).is_some());
    assert_eq!(store.snapshot().len(), 1);
    assert!(store.get(first.object_id).is_none());
}

#[tokio::test]
async fn subscribers_observe_writes() {
    let store = LeaseStore::new();
    let mut rx = store.subscribe();
    let l = lease(Uuid::new_v4(), 0, 100);

    store.upsert(l.clone());
    rx.changed().await.expect("store should still be alive");
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.get(&l.object_id), Some(&l));
}
