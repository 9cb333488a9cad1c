//! Ownership leases — the exclusivity core.
//!
//! ARCHITECTURE
//! ============
//! A lease is a time-bounded exclusive claim on one shared object. The
//! arbitration authority (`authority`) is the single serialization point and
//! offers one strong primitive, `compare_and_swap_lease`. Each process keeps a
//! local copy-on-write view of the leases it knows about (`store`), written
//! only by the claim arbitrator (`arbitrator`). The expiry sweeper
//! (`sweeper`) runs in every process; expiry is idempotent, so redundant
//! sweeps are harmless.
//!
//! Time is milliseconds since the Unix epoch, passed explicitly as `now` so
//! every decision is reproducible in tests.

pub mod arbitrator;
pub mod authority;
pub mod store;
pub mod sweeper;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::services::object::StoreError;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// LEASE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lease {
    pub object_id: Uuid,
    pub owner_id: Uuid,
    /// Display name for UI feedback only.
    pub owner_name: String,
    pub claimed_at: i64,
    pub expires_at: i64,
}

/// Lease status relative to an observer. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Available,
    HeldBySelf,
    HeldByOther,
    Expired,
}

impl Lease {
    /// Issue a fresh lease starting at `now`.
    #[must_use]
    pub fn issue(object_id: Uuid, owner_id: Uuid, owner_name: &str, now: i64, ttl_ms: i64) -> Self {
        Self {
            object_id,
            owner_id,
            owner_name: owner_name.to_owned(),
            claimed_at: now,
            expires_at: now.saturating_add(ttl_ms.max(1)),
        }
    }

    /// Same holder, new expiry window.
    #[must_use]
    pub fn extended(&self, now: i64, ttl_ms: i64) -> Self {
        Self { expires_at: now.saturating_add(ttl_ms.max(1)).max(self.claimed_at + 1), ..self.clone() }
    }

    /// Time-based expiry is authoritative over any cached "held" state.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.expires_at > self.claimed_at
    }

    #[must_use]
    pub fn status_for(&self, observer_id: Uuid, now: i64) -> LeaseStatus {
        if self.is_expired(now) {
            LeaseStatus::Expired
        } else if self.owner_id == observer_id {
            LeaseStatus::HeldBySelf
        } else {
            LeaseStatus::HeldByOther
        }
    }
}

/// Status of an optional lease; a missing lease is available.
#[must_use]
pub fn status_of(lease: Option<&Lease>, observer_id: Uuid, now: i64) -> LeaseStatus {
    lease.map_or(LeaseStatus::Available, |l| l.status_for(observer_id, now))
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted { lease: Lease },
    Rejected { current_owner_id: Uuid, current_owner_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Accepted { lease: Lease },
    /// Caller no longer holds the lease. `current` is whoever does, if anyone.
    Rejected { current: Option<Lease> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Expired { former_owner_id: Uuid },
    NoOp,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Recoverable coordination failures. Nothing here is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("object {object_id} is held by {owner_name}")]
    ClaimRejected { object_id: Uuid, owner_id: Uuid, owner_name: String },
    #[error("lease on {0} is no longer held")]
    StaleLease(Uuid),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("object {0} is gone")]
    ObjectGone(Uuid),
    #[error("lease on {0} is contended; retry")]
    Contended(Uuid),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ErrorCode for LeaseError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ClaimRejected { .. } => "E_CLAIM_REJECTED",
            Self::StaleLease(_) => "E_STALE_LEASE",
            Self::TransportUnavailable(_) => "E_TRANSPORT_UNAVAILABLE",
            Self::ObjectGone(_) => "E_OBJECT_GONE",
            Self::Contended(_) => "E_LEASE_CONTENDED",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_) | Self::Contended(_))
    }
}

impl From<crate::sync::transport::TransportError> for LeaseError {
    fn from(err: crate::sync::transport::TransportError) -> Self {
        Self::TransportUnavailable(err.to_string())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
