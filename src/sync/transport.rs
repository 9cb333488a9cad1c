//! Transport seam — channel publish/subscribe plus connection state.
//!
//! `LocalHub` is the in-process transport: one `tokio::sync::broadcast`
//! channel per name, created on first use. A slow subscriber that falls
//! behind loses envelopes instead of blocking publishers, which matches the
//! at-most-once contract. The connection state can be driven by hand so
//! reconnect behaviour is testable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::sync::event::Envelope;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable ({0:?})")]
    Unavailable(ConnectionState),
    #[error("channel closed: {0}")]
    Closed(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_TRANSPORT_UNAVAILABLE",
            Self::Closed(_) => "E_CHANNEL_CLOSED",
            Self::Codec(_) => "E_CODEC",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Broadcast channel for a canvas.
#[must_use]
pub fn objects_channel(canvas_id: Uuid) -> String {
    format!("canvas:{canvas_id}:objects")
}

/// Presence channel for a canvas.
#[must_use]
pub fn presence_channel(canvas_id: Uuid) -> String {
    format!("canvas:{canvas_id}:presence")
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), TransportError>;

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Envelope>, TransportError>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

pub struct LocalHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    state: watch::Sender<ConnectionState>,
    capacity: usize,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Connected);
        Self { channels: Mutex::new(HashMap::new()), state, capacity: capacity.max(1) }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Envelope> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::Unavailable(state));
        }
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.sender(channel).send(envelope);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Envelope>, TransportError> {
        Ok(self.sender(channel).subscribe())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
