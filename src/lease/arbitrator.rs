//! Claim arbitrator — decides claims, extensions, releases and expiries.
//!
//! DESIGN
//! ======
//! Every decision is a read of the authority followed by a conditional write
//! through `compare_and_swap_lease`. The first durable commit wins; a loser
//! re-reads the authority and is rejected naming the winner. Conflicts are
//! retried a bounded number of times before giving up with `Contended`.
//!
//! The arbitrator is the only writer of its `LeaseStore`. Events go out only
//! after the authority has committed, so observers never see an ownership
//! change that could still be rolled back. A publish failure after a commit
//! is logged and swallowed: the lease is real, and TTL expiry bounds how long
//! a missed broadcast can mislead anyone.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::authority::{CasOutcome, LeaseAuthority};
use super::store::LeaseStore;
use super::{ClaimOutcome, ExpireOutcome, ExtendOutcome, Lease, LeaseError, ReleaseOutcome};
use crate::config::CoordinatorConfig;
use crate::sync::EventSink;
use crate::sync::event::SyncEvent;

pub struct ClaimArbitrator {
    authority: Arc<dyn LeaseAuthority>,
    events: Arc<dyn EventSink>,
    store: LeaseStore,
    ttl_ms: i64,
    cas_retries: usize,
}

impl ClaimArbitrator {
    #[must_use]
    pub fn new(authority: Arc<dyn LeaseAuthority>, events: Arc<dyn EventSink>, config: &CoordinatorConfig) -> Self {
        Self {
            authority,
            events,
            store: LeaseStore::new(),
            ttl_ms: config.claim_duration_ms.max(1),
            cas_retries: config.claim_cas_retries,
        }
    }

    /// Read-only view of the leases this process knows about.
    #[must_use]
    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    #[must_use]
    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    // =========================================================================
    // CLAIM
    // =========================================================================

    /// Claim `object_id` for `requester_id`.
    ///
    /// Accepted when there is no lease, the lease has expired, or the
    /// requester already holds it (re-claim re-issues the window).
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable, `Contended` if every
    /// conditional write lost to a writer that then vanished.
    pub async fn attempt_claim(
        &self,
        object_id: Uuid,
        requester_id: Uuid,
        requester_name: &str,
        now: i64,
    ) -> Result<ClaimOutcome, LeaseError> {
        let mut current = self.authority.load(object_id).await?;

        for attempt in 0..=self.cas_retries {
            if let Some(held) = current.as_ref().filter(|l| blocks(l, requester_id, now)) {
                self.store.sync(object_id, Some(held.clone()));
                return Ok(self.reject(object_id, requester_id, held).await);
            }

            let lease = Lease::issue(object_id, requester_id, requester_name, now, self.ttl_ms);
            let cas = self
                .authority
                .compare_and_swap_lease(object_id, current.as_ref(), Some(&lease))
                .await?;
            match cas {
                CasOutcome::Swapped => {
                    self.store.upsert(lease.clone());
                    info!(%object_id, owner_id = %requester_id, expires_at = lease.expires_at, "lease: claimed");
                    self.announce(SyncEvent::claimed(&lease)).await;
                    return Ok(ClaimOutcome::Accepted { lease });
                }
                CasOutcome::Conflict { current: latest } => {
                    debug!(%object_id, attempt, "lease: claim lost conditional write");
                    current = latest;
                }
            }
        }

        match current {
            Some(held) if blocks(&held, requester_id, now) => {
                self.store.sync(object_id, Some(held.clone()));
                Ok(self.reject(object_id, requester_id, &held).await)
            }
            _ => {
                warn!(%object_id, requester_id = %requester_id, retries = self.cas_retries, "lease: claim retries exhausted");
                Err(LeaseError::Contended(object_id))
            }
        }
    }

    async fn reject(&self, object_id: Uuid, requester_id: Uuid, held: &Lease) -> ClaimOutcome {
        debug!(%object_id, requester_id = %requester_id, owner_id = %held.owner_id, "lease: claim rejected");
        let event = SyncEvent::OwnershipRejected {
            object_id,
            requesting_user_id: requester_id,
            current_owner_id: held.owner_id,
            current_owner_name: held.owner_name.clone(),
        };
        if let Err(e) = self.events.unicast(requester_id, event).await {
            warn!(%object_id, error = %e, "lease: rejection notice not delivered");
        }
        ClaimOutcome::Rejected { current_owner_id: held.owner_id, current_owner_name: held.owner_name.clone() }
    }

    // =========================================================================
    // EXTEND / RELEASE
    // =========================================================================

    /// Push the expiry of a held lease to `now + TTL`.
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable, `Contended` on repeated
    /// conflicts while the requester still holds the lease.
    pub async fn extend(&self, object_id: Uuid, requester_id: Uuid, now: i64) -> Result<ExtendOutcome, LeaseError> {
        let mut current = self.authority.load(object_id).await?;

        for _ in 0..=self.cas_retries {
            let Some(held) = current.as_ref().filter(|l| l.owner_id == requester_id && !l.is_expired(now)) else {
                self.store.sync(object_id, current.clone());
                return Ok(ExtendOutcome::Rejected { current: current.filter(|l| !l.is_expired(now)) });
            };

            let lease = held.extended(now, self.ttl_ms);
            let cas = self
                .authority
                .compare_and_swap_lease(object_id, current.as_ref(), Some(&lease))
                .await?;
            match cas {
                CasOutcome::Swapped => {
                    self.store.upsert(lease.clone());
                    debug!(%object_id, owner_id = %requester_id, expires_at = lease.expires_at, "lease: extended");
                    self.announce(SyncEvent::claimed(&lease)).await;
                    return Ok(ExtendOutcome::Accepted { lease });
                }
                CasOutcome::Conflict { current: latest } => current = latest,
            }
        }

        Err(LeaseError::Contended(object_id))
    }

    /// Give up a held lease. Anyone other than the current non-expired holder
    /// gets `NoOp`.
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable, `Contended` on repeated
    /// conflicts while the requester still holds the lease.
    pub async fn release(&self, object_id: Uuid, requester_id: Uuid, now: i64) -> Result<ReleaseOutcome, LeaseError> {
        let mut current = self.authority.load(object_id).await?;

        for _ in 0..=self.cas_retries {
            let Some(held) = current.as_ref().filter(|l| l.owner_id == requester_id && !l.is_expired(now)) else {
                self.store.sync(object_id, current.clone());
                return Ok(ReleaseOutcome::NoOp);
            };

            let cas = self.authority.compare_and_swap_lease(object_id, Some(held), None).await?;
            match cas {
                CasOutcome::Swapped => {
                    self.store.remove(object_id);
                    info!(%object_id, owner_id = %requester_id, "lease: released");
                    self.announce(SyncEvent::OwnershipReleased {
                        object_id,
                        former_owner_id: requester_id,
                        released_at: now,
                    })
                    .await;
                    return Ok(ReleaseOutcome::Released);
                }
                CasOutcome::Conflict { current: latest } => current = latest,
            }
        }

        Err(LeaseError::Contended(object_id))
    }

    // =========================================================================
    // EXPIRE
    // =========================================================================

    /// Clear a lease whose window has passed, re-checked against the
    /// authority. Idempotent: whoever loses the race gets `NoOp`.
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable.
    pub async fn force_expire(&self, object_id: Uuid, now: i64) -> Result<ExpireOutcome, LeaseError> {
        let current = self.authority.load(object_id).await?;
        let Some(stale) = current.as_ref().filter(|l| l.is_expired(now)) else {
            self.store.sync(object_id, current);
            return Ok(ExpireOutcome::NoOp);
        };

        let cas = self.authority.compare_and_swap_lease(object_id, Some(stale), None).await?;
        match cas {
            CasOutcome::Swapped => {
                let former_owner_id = stale.owner_id;
                self.store.remove(object_id);
                info!(%object_id, owner_id = %former_owner_id, "lease: expired");
                self.announce(SyncEvent::OwnershipExpired { object_id, former_owner_id, expired_at: now })
                    .await;
                Ok(ExpireOutcome::Expired { former_owner_id })
            }
            CasOutcome::Conflict { current: latest } => {
                self.store.sync(object_id, latest);
                Ok(ExpireOutcome::NoOp)
            }
        }
    }

    // =========================================================================
    // LOCAL VIEW MAINTENANCE
    // =========================================================================

    /// Fold an authoritative event from another process into the local view.
    pub fn observe(&self, event: &SyncEvent) {
        match event {
            SyncEvent::OwnershipClaimed { object_id, .. } => {
                let Some(lease) = event.as_lease() else {
                    return;
                };
                let newer = self
                    .store
                    .get(*object_id)
                    .is_none_or(|known| lease.expires_at >= known.expires_at);
                if newer {
                    self.store.upsert(lease);
                }
            }
            SyncEvent::OwnershipReleased { object_id, former_owner_id, .. }
            | SyncEvent::OwnershipExpired { object_id, former_owner_id, .. } => {
                if self
                    .store
                    .get(*object_id)
                    .is_some_and(|known| known.owner_id == *former_owner_id)
                {
                    self.store.remove(*object_id);
                }
            }
            SyncEvent::ObjectsDeleted { object_ids } => {
                for id in object_ids {
                    self.store.remove(*id);
                }
            }
            _ => {}
        }
    }

    /// Drop leases for deleted objects, at the authority and locally.
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable.
    pub async fn drop_leases(&self, object_ids: &[Uuid]) -> Result<(), LeaseError> {
        self.authority.purge(object_ids).await?;
        for id in object_ids {
            self.store.remove(*id);
        }
        Ok(())
    }

    /// Reload leases for `object_ids` from the authority, replacing the local
    /// view. Returns what the authority holds.
    ///
    /// # Errors
    ///
    /// `Store` if the authority is unreachable.
    pub async fn resync(&self, object_ids: &[Uuid]) -> Result<Vec<Lease>, LeaseError> {
        let leases = self.authority.load_many(object_ids).await?;
        for id in object_ids {
            let found = leases.iter().find(|l| l.object_id == *id).cloned();
            self.store.sync(*id, found);
        }
        Ok(leases)
    }

    /// Non-expired holder according to the local view.
    #[must_use]
    pub fn holder(&self, object_id: Uuid, now: i64) -> Option<Lease> {
        self.store.get(object_id).filter(|l| !l.is_expired(now))
    }

    /// Confirm against the authority that `user_id` holds `object_id`.
    ///
    /// # Errors
    ///
    /// `StaleLease` when the user does not hold a live lease, `Store` if the
    /// authority is unreachable.
    pub async fn verify_holder(&self, object_id: Uuid, user_id: Uuid, now: i64) -> Result<Lease, LeaseError> {
        match self.authority.load(object_id).await? {
            Some(lease) if lease.owner_id == user_id && !lease.is_expired(now) => Ok(lease),
            _ => Err(LeaseError::StaleLease(object_id)),
        }
    }

    async fn announce(&self, event: SyncEvent) {
        let name = event.name();
        if let Err(e) = self.events.broadcast(event).await {
            warn!(event = name, error = %e, "lease: committed but broadcast failed");
        }
    }
}

/// A live lease held by someone other than `requester_id`.
fn blocks(lease: &Lease, requester_id: Uuid, now: i64) -> bool {
    lease.owner_id != requester_id && !lease.is_expired(now)
}

#[cfg(test)]
#[path = "arbitrator_test.rs"]
mod tests;
