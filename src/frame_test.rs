use super::*;
use crate::sync::event::Position;

#[test]
fn request_sets_fields() {
    let frame = Frame::request("lease:claim", Data::new());
    assert_eq!(frame.syscall, "lease:claim");
    assert_eq!(frame.status, Status::Request);
    assert!(frame.parent_id.is_none());
    assert!(frame.canvas_id.is_none());
    assert!(frame.ts > 0);
}

#[test]
fn reply_inherits_context() {
    let canvas_id = Uuid::new_v4();
    let req = Frame::request("object:update", Data::new()).with_canvas_id(canvas_id);
    let done = req.done_with(Data::new());

    assert_eq!(done.parent_id, Some(req.id));
    assert_eq!(done.canvas_id, Some(canvas_id));
    assert_eq!(done.syscall, "object:update");
    assert_eq!(done.status, Status::Done);
}

#[test]
fn terminal_statuses() {
    assert!(Status::Done.is_terminal());
    assert!(Status::Error.is_terminal());
    assert!(!Status::Request.is_terminal());
}

#[test]
fn prefix_and_op_extraction() {
    let frame = Frame::request("lease:claim", Data::new());
    assert_eq!(frame.prefix(), "lease");
    assert_eq!(frame.op(), "claim");

    let frame = Frame::request("noseparator", Data::new());
    assert_eq!(frame.prefix(), "noseparator");
    assert_eq!(frame.op(), "");
}

#[test]
fn field_helpers_parse_typed_values() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let frame = Frame::request("object:delete", Data::new())
        .with_data("object_id", a.to_string())
        .with_data("object_ids", serde_json::json!([a.to_string(), "junk", b.to_string()]))
        .with_data("x", 12.5)
        .with_data("name", "ada");

    assert_eq!(frame.field_uuid("object_id"), Some(a));
    assert_eq!(frame.field_uuids("object_ids"), vec![a, b]);
    assert_eq!(frame.field_f64("x"), Some(12.5));
    assert_eq!(frame.field_str("name"), Some("ada"));
    assert_eq!(frame.field_uuid("missing"), None);
}

#[test]
fn error_from_typed() {
    #[derive(Debug, thiserror::Error)]
    #[error("held elsewhere")]
    struct Held;

    impl ErrorCode for Held {
        fn error_code(&self) -> &'static str {
            "E_HELD"
        }

        fn retryable(&self) -> bool {
            true
        }
    }

    let req = Frame::request("lease:claim", Data::new());
    let err = req.error_from(&Held);

    assert_eq!(err.status, Status::Error);
    assert_eq!(err.data.get("code").and_then(|v| v.as_str()), Some("E_HELD"));
    assert_eq!(err.data.get("message").and_then(|v| v.as_str()), Some("held elsewhere"));
    assert_eq!(err.data.get("retryable").and_then(serde_json::Value::as_bool), Some(true));
}

#[test]
fn event_frame_carries_wire_fields() {
    let canvas_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let event = SyncEvent::CursorMoved {
        user_id,
        display_name: "ada".into(),
        position: Position { x: 1.0, y: 2.0 },
        timestamp: 42,
    };

    let frame = Frame::event(canvas_id, &event);
    assert_eq!(frame.syscall, "cursor_moved");
    assert_eq!(frame.canvas_id, Some(canvas_id));
    assert_eq!(frame.field_uuid("user_id"), Some(user_id));
    assert_eq!(frame.data.get("position"), Some(&serde_json::json!({"x": 1.0, "y": 2.0})));
    assert!(!frame.data.contains_key("type"));
}

#[test]
fn json_accepts_frames_without_optional_fields() {
    let raw = serde_json::json!({
        "id": Uuid::new_v4(),
        "parent_id": null,
        "ts": 1,
        "syscall": "canvas:sync",
        "status": "request"
    });
    let frame: Frame = serde_json::from_value(raw).expect("frame should parse");
    assert!(frame.data.is_empty());
    assert!(frame.from.is_none());
}
