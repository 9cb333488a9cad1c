//! WebSocket handler — frame relay between browser clients and the coordinator.
//!
//! DESIGN
//! ======
//! On upgrade, binds the socket to one canvas and one user, subscribes a
//! per-connection channel adapter to the canvas's broadcast and presence
//! channels, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Events from either channel → forward to client as pushed frames
//!
//! Handler functions validate, call the arbitrator or object store, and
//! return an `Outcome`. They never write to the socket. Anything peers must
//! see goes out through the channel adapter, so the sender sees its own
//! effects the same way every other participant does.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → subscribe → send `session:connected`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Close → drop subscriptions → presence disconnect
//!
//! Closing the socket does not release leases. A dropped connection and a
//! closed tab look the same from here; the TTL bounds both.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::lease::{ClaimOutcome, ExtendOutcome, Lease, LeaseError, ReleaseOutcome, now_ms};
use crate::services;
use crate::services::object::{ObjectPatch, StoreError};
use crate::state::{AppState, CanvasState, SharedObject};
use crate::sync::adapter::{SubscriptionHandle, SyncChannelAdapter};
use crate::sync::event::{Position, SyncEvent};
use crate::sync::transport::TransportError;

const CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_DISPLAY_NAME: &str = "anonymous";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. Peers learn about effects through
/// the channel adapter, so an outcome only describes the sender's reply.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
    /// No reply. Used for cursor moves.
    Silent,
}

// =============================================================================
// CONNECTION
// =============================================================================

/// One socket's binding to a canvas. Dropping it ends event delivery.
struct Connection {
    client_id: Uuid,
    user_id: Uuid,
    display_name: String,
    canvas: CanvasState,
    adapter: Arc<SyncChannelAdapter>,
    subscriptions: Vec<SubscriptionHandle>,
}

/// Bind a new connection to `canvas_id` and start forwarding both channels
/// into `client_tx`.
async fn open_connection(
    state: &AppState,
    canvas_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    client_tx: &mpsc::Sender<Frame>,
) -> Result<Connection, TransportError> {
    let canvas = state.canvas(canvas_id).await;
    let adapter = Arc::new(SyncChannelAdapter::new(state.hub.clone(), canvas_id, Some(user_id), &state.config));

    let objects_tx = client_tx.clone();
    let objects = adapter.subscribe(move |event: SyncEvent| forward(&objects_tx, canvas_id, &event))?;

    let presence_tx = client_tx.clone();
    let presence = adapter.subscribe_presence(move |event: SyncEvent| {
        // Own cursor echoes are noise.
        if matches!(&event, SyncEvent::CursorMoved { user_id: mover, .. } if *mover == user_id) {
            return;
        }
        forward(&presence_tx, canvas_id, &event);
    })?;

    Ok(Connection {
        client_id: Uuid::new_v4(),
        user_id,
        display_name: display_name.to_owned(),
        canvas,
        adapter,
        subscriptions: vec![objects, presence],
    })
}

fn forward(tx: &mpsc::Sender<Frame>, canvas_id: Uuid, event: &SyncEvent) {
    if let Err(e) = tx.try_send(Frame::event(canvas_id, event)) {
        warn!(%canvas_id, event = event.name(), error = %e, "ws: client queue rejected event");
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(canvas_id) = params.get("canvas_id").and_then(|s| s.parse::<Uuid>().ok()) else {
        return (StatusCode::BAD_REQUEST, "canvas_id required").into_response();
    };
    let user_id = match params.get("user_id") {
        Some(raw) => match raw.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid user_id").into_response(),
        },
        None => Uuid::new_v4(),
    };
    let display_name = params
        .get("name")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME)
        .to_owned();

    ws.on_upgrade(move |socket| run_ws(socket, state, canvas_id, user_id, display_name))
}

async fn run_ws(mut socket: WebSocket, state: AppState, canvas_id: Uuid, user_id: Uuid, display_name: String) {
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_CHANNEL_CAPACITY);

    let conn = match open_connection(&state, canvas_id, user_id, &display_name, &client_tx).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%canvas_id, %user_id, error = %e, "ws: subscription failed");
            return;
        }
    };

    conn.canvas.presence.connect(user_id, &display_name, now_ms());
    services::canvas::publish_presence(&conn.canvas).await;

    let welcome = Frame::request("session:connected", Data::new())
        .with_canvas_id(canvas_id)
        .with_data("client_id", conn.client_id.to_string())
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        close_connection(conn).await;
        return;
    }

    info!(client_id = %conn.client_id, %canvas_id, %user_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(&state, &conn, &text).await {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    close_connection(conn).await;
}

async fn close_connection(conn: Connection) {
    let Connection { client_id, user_id, canvas, subscriptions, .. } = conn;
    drop(subscriptions);
    if canvas.presence.disconnect(user_id) {
        services::canvas::publish_presence(&canvas).await;
    }
    info!(%client_id, canvas_id = %canvas.canvas_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch end-to-end.
async fn process_inbound_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %conn.client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data(FRAME_MESSAGE, format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // The socket's identity wins over whatever the client claims.
    req.from = Some(conn.user_id.to_string());
    req.canvas_id = Some(conn.canvas.canvas_id);

    let prefix = req.prefix();
    if prefix != "cursor" {
        info!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");
    }

    let result = match prefix {
        "lease" => handle_lease(state, conn, &req).await,
        "object" => handle_object(state, conn, &req).await,
        "cursor" => handle_cursor(conn, &req).await,
        "presence" => handle_presence(conn, &req).await,
        "canvas" => handle_canvas(state, conn, &req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// LEASE HANDLERS
// =============================================================================

async fn handle_lease(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let Some(object_id) = req.field_uuid("object_id") else {
        return Err(req.error("object_id required"));
    };
    let arbitrator = &conn.canvas.arbitrator;
    let now = now_ms();

    match req.op() {
        "claim" => {
            load_object(state, conn, object_id).await.map_err(|e| req.error_from(&e))?;
            match arbitrator.attempt_claim(object_id, conn.user_id, &conn.display_name, now).await {
                Ok(ClaimOutcome::Accepted { lease }) => Ok(Outcome::Reply(lease_data(&lease))),
                Ok(ClaimOutcome::Rejected { current_owner_id, current_owner_name }) => {
                    Err(req.error_from(&LeaseError::ClaimRejected {
                        object_id,
                        owner_id: current_owner_id,
                        owner_name: current_owner_name,
                    }))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "extend" => match arbitrator.extend(object_id, conn.user_id, now).await {
            Ok(ExtendOutcome::Accepted { lease }) => Ok(Outcome::Reply(lease_data(&lease))),
            Ok(ExtendOutcome::Rejected { .. }) => Err(req.error_from(&LeaseError::StaleLease(object_id))),
            Err(e) => Err(req.error_from(&e)),
        },
        "release" => match arbitrator.release(object_id, conn.user_id, now).await {
            Ok(outcome) => {
                let mut data = Data::new();
                data.insert("released".into(), serde_json::json!(outcome == ReleaseOutcome::Released));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        op => Err(req.error(format!("unknown lease op: {op}"))),
    }
}

/// The object, if it exists on this connection's canvas.
async fn load_object(state: &AppState, conn: &Connection, object_id: Uuid) -> Result<SharedObject, LeaseError> {
    state
        .objects
        .get_objects_by_ids(&[object_id])
        .await?
        .into_iter()
        .find(|o| o.canvas_id == conn.canvas.canvas_id)
        .ok_or(LeaseError::ObjectGone(object_id))
}

fn lease_data(lease: &Lease) -> Data {
    let mut data = Data::new();
    data.insert("lease".into(), serde_json::to_value(lease).unwrap_or_default());
    data
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let canvas = &conn.canvas;
    let now = now_ms();

    match req.op() {
        "update" => {
            let Some(object_id) = req.field_uuid("id") else {
                return Err(req.error("id required"));
            };
            let patch = ObjectPatch::from_data(&req.data);
            if patch.is_empty() {
                return Err(req.error("no updatable fields"));
            }

            canvas
                .arbitrator
                .verify_holder(object_id, conn.user_id, now)
                .await
                .map_err(|e| req.error_from(&e))?;

            match state.objects.update_object(object_id, &patch).await {
                Ok(obj) => {
                    let data = object_data(&obj);
                    publish(canvas, SyncEvent::ObjectUpdated { object: obj }).await;
                    Ok(Outcome::Reply(data))
                }
                Err(StoreError::NotFound(_)) => {
                    if let Err(e) = canvas.arbitrator.drop_leases(&[object_id]).await {
                        warn!(%object_id, error = %e, "ws: failed to drop lease on vanished object");
                    }
                    Err(req.error_from(&LeaseError::ObjectGone(object_id)))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "delete" => {
            let mut ids = req.field_uuids("ids");
            if ids.is_empty() {
                ids.extend(req.field_uuid("id"));
            }
            if ids.is_empty() {
                return Err(req.error("ids required"));
            }

            // Someone else mid-edit keeps the object alive.
            let leases = canvas.arbitrator.resync(&ids).await.map_err(|e| req.error_from(&e))?;
            if let Some(held) = leases.iter().find(|l| l.owner_id != conn.user_id && !l.is_expired(now)) {
                return Err(req.error_from(&LeaseError::ClaimRejected {
                    object_id: held.object_id,
                    owner_id: held.owner_id,
                    owner_name: held.owner_name.clone(),
                }));
            }

            state.objects.delete_objects(&ids).await.map_err(|e| req.error_from(&e))?;
            if let Err(e) = canvas.arbitrator.drop_leases(&ids).await {
                warn!(count = ids.len(), error = %e, "ws: failed to drop leases on deleted objects");
            }
            publish(canvas, SyncEvent::ObjectsDeleted { object_ids: ids.clone() }).await;

            let mut data = Data::new();
            data.insert("ids".into(), serde_json::json!(ids));
            Ok(Outcome::Reply(data))
        }
        "list" => match state.objects.list_objects(canvas.canvas_id).await {
            Ok(objects) => {
                let mut data = Data::new();
                data.insert("objects".into(), serde_json::to_value(&objects).unwrap_or_default());
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        op => Err(req.error(format!("unknown object op: {op}"))),
    }
}

fn object_data(obj: &SharedObject) -> Data {
    let mut data = Data::new();
    data.insert("object".into(), serde_json::to_value(obj).unwrap_or_default());
    data
}

/// Broadcast an object event. The store write already happened, so a failed
/// publish is logged and the caller still succeeds.
async fn publish(canvas: &CanvasState, event: SyncEvent) {
    let name = event.name();
    if let Err(e) = canvas.adapter.publish(event).await {
        warn!(canvas_id = %canvas.canvas_id, event = name, error = %e, "ws: committed but broadcast failed");
    }
}

// =============================================================================
// CURSOR + PRESENCE HANDLERS
// =============================================================================

async fn handle_cursor(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    if req.op() != "move" {
        return Err(req.error(format!("unknown cursor op: {}", req.op())));
    }
    let (Some(x), Some(y)) = (req.field_f64("x"), req.field_f64("y")) else {
        return Err(req.error("x and y required"));
    };

    let position = Position { x, y };
    if conn.canvas.presence.move_cursor(conn.user_id, position, req.ts, now_ms()) {
        let event = SyncEvent::CursorMoved {
            user_id: conn.user_id,
            display_name: conn.display_name.clone(),
            position,
            timestamp: req.ts,
        };
        // Best effort; the next move supersedes it anyway.
        let _ = conn.adapter.publish_presence(event).await;
    }
    Ok(Outcome::Silent)
}

async fn handle_presence(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let presence = &conn.canvas.presence;
    let now = now_ms();

    match req.op() {
        "heartbeat" => {
            if !presence.heartbeat(conn.user_id, now) {
                // Pruned while the socket stayed open; come back.
                presence.connect(conn.user_id, &conn.display_name, now);
                services::canvas::publish_presence(&conn.canvas).await;
            }
            Ok(Outcome::Done)
        }
        "select" => {
            let selected = req.field_uuids("object_ids");
            if presence.select(conn.user_id, selected, now) {
                services::canvas::publish_presence(&conn.canvas).await;
            }
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown presence op: {op}"))),
    }
}

// =============================================================================
// CANVAS HANDLERS
// =============================================================================

async fn handle_canvas(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "sync" => match services::canvas::sync_snapshot(state, &conn.canvas).await {
            Ok(data) => Ok(Outcome::Reply(data)),
            Err(e) => Err(req.error_from(&e)),
        },
        op => Err(req.error(format!("unknown canvas op: {op}"))),
    }
}

// =============================================================================
// SOCKET OUTPUT
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if !frame.syscall.starts_with("cursor") {
        if frame.status == Status::Error {
            let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
            let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("-");
            warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
        }
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
