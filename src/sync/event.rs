//! Domain events and their wire envelope.
//!
//! Events serialize as `type`-tagged JSON with stable snake_case field names,
//! e.g. `{"type":"ownership_claimed","object_id":...,"owner_id":...}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::Data;
use crate::lease::Lease;
use crate::state::SharedObject;
use crate::sync::presence::PresenceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ObjectCreated {
        object: SharedObject,
    },
    ObjectUpdated {
        object: SharedObject,
    },
    ObjectsDeleted {
        object_ids: Vec<Uuid>,
    },
    ObjectsDuplicated {
        objects: Vec<SharedObject>,
    },
    OwnershipClaimed {
        object_id: Uuid,
        owner_id: Uuid,
        owner_name: String,
        claimed_at: i64,
        expires_at: i64,
    },
    OwnershipReleased {
        object_id: Uuid,
        former_owner_id: Uuid,
        released_at: i64,
    },
    OwnershipExpired {
        object_id: Uuid,
        former_owner_id: Uuid,
        expired_at: i64,
    },
    /// Unicast to the requester, never broadcast.
    OwnershipRejected {
        object_id: Uuid,
        requesting_user_id: Uuid,
        current_owner_id: Uuid,
        current_owner_name: String,
    },
    CursorMoved {
        user_id: Uuid,
        display_name: String,
        position: Position,
        timestamp: i64,
    },
    PresenceSnapshot {
        records: Vec<PresenceRecord>,
    },
}

impl SyncEvent {
    #[must_use]
    pub fn claimed(lease: &Lease) -> Self {
        Self::OwnershipClaimed {
            object_id: lease.object_id,
            owner_id: lease.owner_id,
            owner_name: lease.owner_name.clone(),
            claimed_at: lease.claimed_at,
            expires_at: lease.expires_at,
        }
    }

    /// Wire type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ObjectCreated { .. } => "object_created",
            Self::ObjectUpdated { .. } => "object_updated",
            Self::ObjectsDeleted { .. } => "objects_deleted",
            Self::ObjectsDuplicated { .. } => "objects_duplicated",
            Self::OwnershipClaimed { .. } => "ownership_claimed",
            Self::OwnershipReleased { .. } => "ownership_released",
            Self::OwnershipExpired { .. } => "ownership_expired",
            Self::OwnershipRejected { .. } => "ownership_rejected",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::PresenceSnapshot { .. } => "presence_snapshot",
        }
    }

    /// The lease this event describes, for ownership-claimed events.
    #[must_use]
    pub fn as_lease(&self) -> Option<Lease> {
        match self {
            Self::OwnershipClaimed { object_id, owner_id, owner_name, claimed_at, expires_at } => Some(Lease {
                object_id: *object_id,
                owner_id: *owner_id,
                owner_name: owner_name.clone(),
                claimed_at: *claimed_at,
                expires_at: *expires_at,
            }),
            _ => None,
        }
    }

    /// Ownership events concern exactly one object.
    #[must_use]
    pub fn ownership_object(&self) -> Option<Uuid> {
        match self {
            Self::OwnershipClaimed { object_id, .. }
            | Self::OwnershipReleased { object_id, .. }
            | Self::OwnershipExpired { object_id, .. }
            | Self::OwnershipRejected { object_id, .. } => Some(*object_id),
            _ => None,
        }
    }

    /// Wire fields without the `type` tag, for frame payloads.
    #[must_use]
    pub fn to_data(&self) -> Data {
        let Ok(serde_json::Value::Object(mut map)) = serde_json::to_value(self) else {
            return Data::new();
        };
        map.remove("type");
        map.into_iter().collect()
    }
}

/// What actually travels on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Publishing adapter instance.
    pub sender_id: Uuid,
    /// Strictly increasing per sender.
    pub seq: u64,
    /// `Some` for unicast delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Uuid>,
    pub event: SyncEvent,
}

impl Envelope {
    #[must_use]
    pub fn is_for(&self, user_id: Option<Uuid>) -> bool {
        match (self.recipient, user_id) {
            (None, _) => true,
            (Some(recipient), Some(user)) => recipient == user,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
