//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the lease authority and object store shared by every canvas, the
//! in-process transport hub, and a map of live canvas states. Each canvas
//! gets its own claim arbitrator (and therefore its own local lease view),
//! its own channel adapter, and its own presence tracker. Ownership events
//! from other processes on the same canvas are folded into that lease view,
//! so the local sweeper also sees leases it did not grant.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::lease::arbitrator::ClaimArbitrator;
use crate::lease::authority::{LeaseAuthority, MemoryAuthority};
use crate::services::object::{MemoryObjectStore, ObjectStore};
use crate::sync::adapter::{SubscriptionHandle, SyncChannelAdapter};
use crate::sync::event::SyncEvent;
use crate::sync::presence::PresenceTracker;
use crate::sync::transport::LocalHub;

// =============================================================================
// SHARED OBJECT
// =============================================================================

/// A shape on a canvas. Mirrors the `canvas_objects` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SharedObject {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: f64,
    pub z_index: i32,
    pub color: Option<String>,
    pub props: serde_json::Value,
    pub created_by: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i32,
}

// =============================================================================
// CANVAS STATE
// =============================================================================

/// Per-canvas live coordination state. Cheap to clone.
#[derive(Clone)]
pub struct CanvasState {
    pub canvas_id: Uuid,
    pub arbitrator: Arc<ClaimArbitrator>,
    pub adapter: Arc<SyncChannelAdapter>,
    pub presence: Arc<PresenceTracker>,
    /// Feeds ownership events published by other processes into the
    /// arbitrator's lease view. `None` if the transport refused it.
    pub observer: Option<Arc<SubscriptionHandle>>,
}

impl CanvasState {
    fn new(
        canvas_id: Uuid,
        hub: Arc<LocalHub>,
        authority: Arc<dyn LeaseAuthority>,
        config: &CoordinatorConfig,
    ) -> Self {
        let adapter = Arc::new(SyncChannelAdapter::new(hub, canvas_id, None, config));
        let arbitrator = Arc::new(ClaimArbitrator::new(authority, adapter.clone(), config));

        let weak = Arc::downgrade(&arbitrator);
        let observer = match adapter.subscribe_remote(move |event: SyncEvent| {
            if let Some(arbitrator) = weak.upgrade() {
                arbitrator.observe(&event);
            }
        }) {
            Ok(handle) => Some(Arc::new(handle)),
            Err(e) => {
                warn!(%canvas_id, error = %e, "canvas: remote lease events unavailable");
                None
            }
        };

        Self {
            canvas_id,
            arbitrator,
            adapter,
            presence: Arc::new(PresenceTracker::new(config.presence_timeout_ms)),
            observer,
        }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub config: CoordinatorConfig,
    pub node_id: Uuid,
    pub hub: Arc<LocalHub>,
    pub authority: Arc<dyn LeaseAuthority>,
    pub objects: Arc<dyn ObjectStore>,
    pub canvases: Arc<RwLock<HashMap<Uuid, CanvasState>>>,
}

impl AppState {
    #[must_use]
    pub fn new(config: CoordinatorConfig, authority: Arc<dyn LeaseAuthority>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            node_id: Uuid::new_v4(),
            hub: Arc::new(LocalHub::new()),
            authority,
            objects,
            canvases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// State backed by the in-memory authority and object store.
    #[must_use]
    pub fn in_memory(config: CoordinatorConfig) -> Self {
        Self::new(config, Arc::new(MemoryAuthority::new()), Arc::new(MemoryObjectStore::new()))
    }

    /// Canvas state for `canvas_id`, created on first use.
    pub async fn canvas(&self, canvas_id: Uuid) -> CanvasState {
        if let Some(canvas) = self.canvases.read().await.get(&canvas_id) {
            return canvas.clone();
        }

        let mut canvases = self.canvases.write().await;
        canvases
            .entry(canvas_id)
            .or_insert_with(|| CanvasState::new(canvas_id, self.hub.clone(), self.authority.clone(), &self.config))
            .clone()
    }

    pub async fn loaded_canvases(&self) -> Vec<CanvasState> {
        self.canvases.read().await.values().cloned().collect()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
