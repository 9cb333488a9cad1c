//! Canvas service — sync snapshots, presence fan-out, per-process maintenance.
//!
//! DESIGN
//! ======
//! A background task wakes every `SWEEP_INTERVAL_MS`, sweeps expired leases on
//! every loaded canvas and prunes presence records that stopped heartbeating.
//! Every process runs one; sweeps are idempotent against the authority so
//! overlapping processes never double-expire.

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::Data;
use crate::lease::sweeper::sweep_once;
use crate::lease::{LeaseError, now_ms};
use crate::state::{AppState, CanvasState};
use crate::sync::event::SyncEvent;

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub pruned: usize,
}

/// Full canvas state for a joining or reconnecting client: every object, the
/// authority's current leases on them, and who is online.
///
/// # Errors
///
/// Fails when the object store or the authority cannot be read.
pub async fn sync_snapshot(state: &AppState, canvas: &CanvasState) -> Result<Data, LeaseError> {
    let objects = state.objects.list_objects(canvas.canvas_id).await?;
    let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
    let leases = canvas.arbitrator.resync(&ids).await?;

    let mut data = Data::new();
    data.insert("objects".into(), serde_json::to_value(&objects).unwrap_or_default());
    data.insert("leases".into(), serde_json::to_value(&leases).unwrap_or_default());
    data.insert("presence".into(), serde_json::to_value(canvas.presence.snapshot()).unwrap_or_default());
    Ok(data)
}

/// Publish the canvas's current presence view on the presence channel.
pub async fn publish_presence(canvas: &CanvasState) {
    let event = SyncEvent::PresenceSnapshot { records: canvas.presence.snapshot() };
    if let Err(e) = canvas.adapter.publish_presence(event).await {
        warn!(canvas_id = %canvas.canvas_id, error = %e, "presence: snapshot publish failed");
    }
}

/// One maintenance pass over every loaded canvas at `now`. Canvases are
/// independent, so they are swept concurrently.
pub async fn maintain_once(state: &AppState, now: i64) -> MaintenanceReport {
    let canvases = state.loaded_canvases().await;
    let passes = join_all(canvases.iter().map(|canvas| maintain_canvas(canvas, now))).await;
    passes.into_iter().fold(MaintenanceReport::default(), |total, pass| MaintenanceReport {
        expired: total.expired + pass.expired,
        pruned: total.pruned + pass.pruned,
    })
}

async fn maintain_canvas(canvas: &CanvasState, now: i64) -> MaintenanceReport {
    let expired = sweep_once(&canvas.arbitrator, now).await.len();
    let pruned = canvas.presence.prune(now).len();
    if pruned > 0 {
        publish_presence(canvas).await;
    }
    MaintenanceReport { expired, pruned }
}

/// Spawn the background maintenance task. Returns a handle for shutdown.
pub fn spawn_maintenance_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let report = maintain_once(&state, now_ms()).await;
            if report != MaintenanceReport::default() {
                info!(expired = report.expired, pruned = report.pruned, "maintenance: pass complete");
            }
        }
    })
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
