use super::*;
use serde_json::json;

#[test]
fn ownership_claimed_wire_shape() {
    let object_id = Uuid::new_v4();
    let owner_id = Uuid::new_v4();
    let event = SyncEvent::OwnershipClaimed {
        object_id,
        owner_id,
        owner_name: "ada".into(),
        claimed_at: 0,
        expires_at: 30_000,
    };

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "ownership_claimed",
            "object_id": object_id,
            "owner_id": owner_id,
            "owner_name": "ada",
            "claimed_at": 0,
            "expires_at": 30_000
        })
    );
}

#[test]
fn rejected_released_expired_field_names() {
    let id = Uuid::new_v4();
    let user = Uuid::new_v4();

    let rejected = serde_json::to_value(SyncEvent::OwnershipRejected {
        object_id: id,
        requesting_user_id: user,
        current_owner_id: user,
        current_owner_name: "bob".into(),
    })
    .unwrap();
    assert_eq!(rejected["type"], "ownership_rejected");
    assert_eq!(rejected["current_owner_name"], "bob");
    assert!(rejected.get("requesting_user_id").is_some());

    let released =
        serde_json::to_value(SyncEvent::OwnershipReleased { object_id: id, former_owner_id: user, released_at: 7 })
            .unwrap();
    assert_eq!(released["type"], "ownership_released");
    assert_eq!(released["released_at"], 7);

    let expired =
        serde_json::to_value(SyncEvent::OwnershipExpired { object_id: id, former_owner_id: user, expired_at: 9 })
            .unwrap();
    assert_eq!(expired["type"], "ownership_expired");
    assert_eq!(expired["expired_at"], 9);
}

#[test]
fn cursor_moved_parses_from_wire() {
    let user = Uuid::new_v4();
    let raw = json!({
        "type": "cursor_moved",
        "user_id": user,
        "display_name": "ada",
        "position": {"x": 3.5, "y": -1.0},
        "timestamp": 12
    });
    let event: SyncEvent = serde_json::from_value(raw).unwrap();
    assert_eq!(
        event,
        SyncEvent::CursorMoved {
            user_id: user,
            display_name: "ada".into(),
            position: Position { x: 3.5, y: -1.0 },
            timestamp: 12
        }
    );
}

#[test]
fn claimed_event_converts_back_to_lease() {
    let lease = Lease::issue(Uuid::new_v4(), Uuid::new_v4(), "ada", 10, 100);
    let event = SyncEvent::claimed(&lease);
    assert_eq!(event.as_lease(), Some(lease.clone()));
    assert_eq!(event.ownership_object(), Some(lease.object_id));
    assert_eq!(event.name(), "ownership_claimed");
}

#[test]
fn non_ownership_events_have_no_object() {
    let event = SyncEvent::ObjectsDeleted { object_ids: vec![Uuid::new_v4()] };
    assert!(event.ownership_object().is_none());
    assert!(event.as_lease().is_none());
}

#[test]
fn envelope_addressing() {
    let me = Uuid::new_v4();
    let other = Uuid::new_v4();
    let mut envelope = Envelope {
        id: Uuid::new_v4(),
        sender_id: Uuid::new_v4(),
        seq: 1,
        recipient: None,
        event: SyncEvent::ObjectsDeleted { object_ids: vec![] },
    };
    assert!(envelope.is_for(Some(me)));
    assert!(envelope.is_for(None));

    envelope.recipient = Some(me);
    assert!(envelope.is_for(Some(me)));
    assert!(!envelope.is_for(Some(other)));
    assert!(!envelope.is_for(None));
}
