use super::*;

const TIMEOUT_MS: i64 = 30_000;

#[test]
fn connect_creates_record() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let user = Uuid::new_v4();

    let record = tracker.connect(user, "ada", 10);
    assert_eq!(record.user_id, user);
    assert_eq!(record.display_name, "ada");
    assert_eq!(record.last_seen, 10);
    assert!(record.cursor.is_none());
    assert_eq!(tracker.len(), 1);
}

#[test]
fn cursor_updates_are_last_writer_wins() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let user = Uuid::new_v4();
    tracker.connect(user, "ada", 0);

    assert!(tracker.move_cursor(user, Position { x: 1.0, y: 1.0 }, 200, 200));
    // Delayed frame from before the last applied one.
    assert!(!tracker.move_cursor(user, Position { x: 9.0, y: 9.0 }, 100, 250));
    assert_eq!(tracker.get(user).unwrap().cursor, Some(Position { x: 1.0, y: 1.0 }));

    assert!(tracker.move_cursor(user, Position { x: 2.0, y: 2.0 }, 300, 300));
    let record = tracker.get(user).unwrap();
    assert_eq!(record.cursor, Some(Position { x: 2.0, y: 2.0 }));
    assert_eq!(record.last_seen, 300);
}

#[test]
fn future_client_clock_does_not_keep_user_alive() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let user = Uuid::new_v4();
    tracker.connect(user, "ada", 0);

    assert!(tracker.move_cursor(user, Position { x: 1.0, y: 1.0 }, i64::MAX / 2, 10));
    assert_eq!(tracker.get(user).unwrap().last_seen, 10);
    assert_eq!(tracker.prune(10 + TIMEOUT_MS + 1), vec![user]);
}

#[test]
fn unknown_users_are_ignored() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let ghost = Uuid::new_v4();
    assert!(!tracker.heartbeat(ghost, 1));
    assert!(!tracker.move_cursor(ghost, Position { x: 0.0, y: 0.0 }, 1, 1));
    assert!(!tracker.select(ghost, vec![], 1));
    assert!(!tracker.disconnect(ghost));
    assert!(tracker.is_empty());
}

#[test]
fn select_replaces_selection() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let user = Uuid::new_v4();
    tracker.connect(user, "ada", 0);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    tracker.select(user, vec![a, b], 5);
    tracker.select(user, vec![b], 6);
    assert_eq!(tracker.get(user).unwrap().selected, vec![b]);
}

#[test]
fn user_stays_until_last_connection_leaves() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let user = Uuid::new_v4();
    tracker.connect(user, "ada", 0);
    tracker.connect(user, "ada", 1);

    assert!(!tracker.disconnect(user));
    assert!(tracker.get(user).is_some());
    assert!(tracker.disconnect(user));
    assert!(tracker.get(user).is_none());
}

#[test]
fn prune_drops_idle_users_only() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    let idle = Uuid::new_v4();
    let active = Uuid::new_v4();
    tracker.connect(idle, "idle", 0);
    tracker.connect(active, "active", 0);
    tracker.heartbeat(active, 20_000);

    // Exactly at the timeout boundary nobody is pruned.
    assert!(tracker.prune(TIMEOUT_MS).is_empty());

    let removed = tracker.prune(TIMEOUT_MS + 1);
    assert_eq!(removed, vec![idle]);
    assert!(tracker.get(active).is_some());
}

#[test]
fn snapshot_is_sorted_by_name() {
    let tracker = PresenceTracker::new(TIMEOUT_MS);
    tracker.connect(Uuid::new_v4(), "zed", 0);
    tracker.connect(Uuid::new_v4(), "ada", 0);

    let names: Vec<String> = tracker.snapshot().into_iter().map(|r| r.display_name).collect();
    assert_eq!(names, vec!["ada".to_owned(), "zed".to_owned()]);
}

#[test]
fn record_serializes_with_stable_fields() {
    let record = PresenceRecord {
        user_id: Uuid::nil(),
        display_name: "ada".into(),
        cursor: Some(Position { x: 1.0, y: 2.0 }),
        last_seen: 3,
        selected: vec![],
    };
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["cursor"]["x"], 1.0);
    assert_eq!(value["last_seen"], 3);
    assert!(value["selected"].as_array().unwrap().is_empty());
}
