//! Lease store — local copy-on-write view of known leases.
//!
//! DESIGN
//! ======
//! The map lives in an `Arc<LeaseSnapshot>` published through a
//! `tokio::sync::watch` channel. Readers clone the `Arc` and walk it without
//! holding any lock; writers use `Arc::make_mut`, which copies the map only
//! while a reader still holds the previous snapshot. Every write bumps
//! `version` and wakes subscribers, so UI bindings can follow changes.
//!
//! The store has no business logic. Writes are crate-private: the claim
//! arbitrator is the only writer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use super::Lease;

#[derive(Debug, Clone, Default)]
pub struct LeaseSnapshot {
    pub version: u64,
    leases: HashMap<Uuid, Lease>,
}

impl LeaseSnapshot {
    #[must_use]
    pub fn get(&self, object_id: &Uuid) -> Option<&Lease> {
        self.leases.get(object_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

pub struct LeaseStore {
    tx: watch::Sender<Arc<LeaseSnapshot>>,
}

impl LeaseStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(LeaseSnapshot::default()));
        Self { tx }
    }

    #[must_use]
    pub fn get(&self, object_id: Uuid) -> Option<Lease> {
        self.tx.borrow().get(&object_id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Lease> {
        self.tx.borrow().iter().cloned().collect()
    }

    /// Current snapshot. Cheap; holds no lock once returned.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LeaseSnapshot> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Receiver woken on every write.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<LeaseSnapshot>> {
        self.tx.subscribe()
    }

    /// Insert or replace a lease. Malformed leases (`expires_at <= claimed_at`)
    /// are refused and `false` is returned.
    pub(crate) fn upsert(&self, lease: Lease) -> bool {
        if !lease.is_well_formed() {
            warn!(object_id = %lease.object_id, claimed_at = lease.claimed_at, expires_at = lease.expires_at, "lease store: refused malformed lease");
            return false;
        }
        self.tx.send_modify(|snapshot| {
            let next = Arc::make_mut(snapshot);
            next.leases.insert(lease.object_id, lease);
            next.version += 1;
        });
        true
    }

    /// Remove a lease. Returns the removed record, if any. No version bump
    /// when nothing was stored.
    pub(crate) fn remove(&self, object_id: Uuid) -> Option<Lease> {
        let mut removed = None;
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.leases.contains_key(&object_id) {
                return false;
            }
            let next = Arc::make_mut(snapshot);
            removed = next.leases.remove(&object_id);
            next.version += 1;
            true
        });
        removed
    }

    /// Replace the local view for `object_id` with what the authority holds.
    pub(crate) fn sync(&self, object_id: Uuid, lease: Option<Lease>) {
        match lease {
            Some(lease) => {
                if self.get(object_id).as_ref() != Some(&lease) {
                    self.upsert(lease);
                }
            }
            None => {
                self.remove(object_id);
            }
        }
    }
}

impl Default for LeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
