//! Dual-channel synchronization.
//!
//! ARCHITECTURE
//! ============
//! Two logical channels per canvas:
//! - broadcast (`canvas:{id}:objects`): domain events, at-most-once and
//!   ordered per sender, no order across senders;
//! - presence (`canvas:{id}:presence`): who is online, where their cursor
//!   is, what they have selected. Never ownership truth.
//!
//! `transport` is the publish/subscribe seam, `adapter` turns it into typed
//! event delivery, `presence` tracks the ephemeral per-user overlay.

pub mod adapter;
pub mod event;
pub mod presence;
pub mod transport;

use async_trait::async_trait;
use uuid::Uuid;

use event::SyncEvent;
use transport::TransportError;

/// Outbound side of the broadcast channel, as the arbitrator sees it.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver to every subscriber of the canvas.
    async fn broadcast(&self, event: SyncEvent) -> Result<(), TransportError>;

    /// Deliver to `recipient` only.
    async fn unicast(&self, recipient: Uuid, event: SyncEvent) -> Result<(), TransportError>;
}
