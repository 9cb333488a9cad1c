//! Sync channel adapter — typed events over the transport.
//!
//! DESIGN
//! ======
//! One adapter per participant per canvas. Publishing wraps the event in an
//! `Envelope` stamped with this adapter's sender id and the next sequence
//! number; publishes are serialized per adapter so sequence order equals
//! delivery order. Subscribers drop envelopes addressed to someone else and
//! any envelope whose sequence is not newer than the last one seen from the
//! same sender.
//!
//! ERROR HANDLING
//! ==============
//! `Unavailable` publishes are retried with exponential backoff plus jitter.
//! After the last retry the error surfaces to the caller. Nothing here ever
//! replays history: after a reconnect, callers re-fetch authoritative state
//! through `on_reconnect`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::frame::ErrorCode;
use crate::sync::EventSink;
use crate::sync::event::{Envelope, SyncEvent};
use crate::sync::transport::{ConnectionState, Transport, TransportError, objects_channel, presence_channel};

/// Background delivery task. Dropping the handle stops delivery.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Per-sender sequence filter: at-most-once, in sender order.
#[derive(Debug, Default)]
pub struct SenderOrder {
    last_seq: HashMap<Uuid, u64>,
}

impl SenderOrder {
    /// `true` if the envelope is newer than anything seen from its sender.
    pub fn accept(&mut self, envelope: &Envelope) -> bool {
        let last = self.last_seq.entry(envelope.sender_id).or_insert(0);
        if envelope.seq <= *last {
            return false;
        }
        *last = envelope.seq;
        true
    }
}

pub struct SyncChannelAdapter {
    transport: Arc<dyn Transport>,
    canvas_id: Uuid,
    sender_id: Uuid,
    /// Identity used to filter unicast envelopes. `None` receives broadcasts only.
    user_id: Option<Uuid>,
    /// Last sequence number issued; held across the publish to keep order.
    seq: Mutex<u64>,
    retries: usize,
    retry_base_ms: u64,
}

impl SyncChannelAdapter {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        canvas_id: Uuid,
        user_id: Option<Uuid>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            canvas_id,
            sender_id: Uuid::new_v4(),
            user_id,
            seq: Mutex::new(0),
            retries: config.publish_retries,
            retry_base_ms: config.publish_retry_base_ms,
        }
    }

    #[must_use]
    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    #[must_use]
    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.transport.connection_state().borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Publish a domain event on the broadcast channel.
    ///
    /// # Errors
    ///
    /// Returns the transport error once retries are exhausted.
    pub async fn publish(&self, event: SyncEvent) -> Result<(), TransportError> {
        self.send(objects_channel(self.canvas_id), None, event).await
    }

    /// Publish on the broadcast channel, addressed to one user.
    ///
    /// # Errors
    ///
    /// Returns the transport error once retries are exhausted.
    pub async fn publish_to(&self, recipient: Uuid, event: SyncEvent) -> Result<(), TransportError> {
        self.send(objects_channel(self.canvas_id), Some(recipient), event).await
    }

    /// Publish on the presence channel.
    ///
    /// # Errors
    ///
    /// Returns the transport error once retries are exhausted.
    pub async fn publish_presence(&self, event: SyncEvent) -> Result<(), TransportError> {
        self.send(presence_channel(self.canvas_id), None, event).await
    }

    async fn send(&self, channel: String, recipient: Option<Uuid>, event: SyncEvent) -> Result<(), TransportError> {
        let mut seq = self.seq.lock().await;
        let envelope = Envelope { id: Uuid::new_v4(), sender_id: self.sender_id, seq: *seq + 1, recipient, event };

        let mut attempt: u32 = 0;
        loop {
            match self.transport.publish(&channel, envelope.clone()).await {
                Ok(()) => {
                    *seq = envelope.seq;
                    return Ok(());
                }
                Err(e) if e.retryable() && (attempt as usize) < self.retries => {
                    let base = self.retry_base_ms.saturating_mul(1_u64 << attempt.min(16));
                    let jitter = rand::rng().random_range(0..=base / 2);
                    debug!(%channel, attempt, delay_ms = base + jitter, "sync: publish retry");
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(%channel, event = envelope.event.name(), error = %e, "sync: publish failed");
                    return Err(e);
                }
            }
        }
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    /// Deliver broadcast-channel events to `handler` until the handle drops.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the subscription.
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionHandle, TransportError>
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        let channel = objects_channel(self.canvas_id);
        let rx = self.transport.subscribe(&channel)?;
        Ok(spawn_forwarder(rx, channel, self.user_id, None, handler))
    }

    /// Like `subscribe`, but skips envelopes this adapter published itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the subscription.
    pub fn subscribe_remote<F>(&self, handler: F) -> Result<SubscriptionHandle, TransportError>
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        let channel = objects_channel(self.canvas_id);
        let rx = self.transport.subscribe(&channel)?;
        Ok(spawn_forwarder(rx, channel, self.user_id, Some(self.sender_id), handler))
    }

    /// Deliver presence-channel events to `handler` until the handle drops.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the subscription.
    pub fn subscribe_presence<F>(&self, handler: F) -> Result<SubscriptionHandle, TransportError>
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        let channel = presence_channel(self.canvas_id);
        let rx = self.transport.subscribe(&channel)?;
        Ok(spawn_forwarder(rx, channel, self.user_id, None, handler))
    }

    /// Run `callback` every time the transport comes back after having been
    /// connected and then lost.
    pub fn on_reconnect<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn() + Send + 'static,
    {
        let mut rx = self.transport.connection_state();
        let canvas_id = self.canvas_id;
        let task = tokio::spawn(async move {
            let mut was_connected = *rx.borrow_and_update() == ConnectionState::Connected;
            let mut lost = false;
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        if was_connected && lost {
                            info!(%canvas_id, "sync: transport reconnected");
                            callback();
                        }
                        was_connected = true;
                        lost = false;
                    }
                    ConnectionState::Reconnecting | ConnectionState::Error => {
                        lost = was_connected;
                    }
                    ConnectionState::Connecting => {}
                }
            }
        });
        SubscriptionHandle { task }
    }
}

fn spawn_forwarder<F>(
    mut rx: broadcast::Receiver<Envelope>,
    channel: String,
    user_id: Option<Uuid>,
    skip_sender: Option<Uuid>,
    handler: F,
) -> SubscriptionHandle
where
    F: Fn(SyncEvent) + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut order = SenderOrder::default();
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let own = skip_sender == Some(envelope.sender_id);
                    if !own && envelope.is_for(user_id) && order.accept(&envelope) {
                        handler(envelope.event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%channel, skipped, "sync: subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    SubscriptionHandle { task }
}

#[async_trait]
impl EventSink for SyncChannelAdapter {
    async fn broadcast(&self, event: SyncEvent) -> Result<(), TransportError> {
        self.publish(event).await
    }

    async fn unicast(&self, recipient: Uuid, event: SyncEvent) -> Result<(), TransportError> {
        self.publish_to(recipient, event).await
    }
}

#[cfg(test)]
#[path = "adapter_test.rs"]
mod tests;
