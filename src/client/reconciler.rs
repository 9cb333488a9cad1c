//! Local reconciler — per-object ownership state as one participant sees it.
//!
//! DESIGN
//! ======
//! A sans-IO state machine. Callers feed it claim requests, claim results,
//! authoritative sync events and clock ticks; it answers with `Action`s for
//! the caller to carry out (release an unwanted lease, roll back an
//! optimistic edit, tell the user who holds an object).
//!
//! States per object: `Available`, `ClaimPending`, `HeldBySelf`,
//! `HeldByOther`, `Expired`. An optimistic edit made while a claim is in
//! flight is recorded with its pre-edit object, so every optimistic
//! transition has a compensating rollback.
//!
//! Local time is authoritative for expiry: a held lease whose `expires_at`
//! has passed becomes `Expired` without any broadcast, then `Available` once
//! the grace period has elapsed.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::frame::ErrorCode;
use crate::lease::{ClaimOutcome, ExtendOutcome, Lease, LeaseError};
use crate::state::SharedObject;
use crate::sync::event::SyncEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalState {
    #[default]
    Available,
    ClaimPending,
    HeldBySelf,
    HeldByOther,
    Expired,
}

/// Side effects the caller must perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// An abandoned claim was accepted anyway; hand the lease back.
    Release { object_id: Uuid },
    /// Restore the object as it was before the optimistic edit.
    Rollback { object: SharedObject },
    NotifyRejected { object_id: Uuid, owner_id: Uuid, owner_name: String },
    /// The claim could not be decided; treated as a rejection.
    ClaimFailed { object_id: Uuid, code: &'static str, reason: String },
    ObjectGone { object_id: Uuid },
    /// The claim was won but the edits made while pending could not be saved.
    CommitFailed { object_id: Uuid, code: &'static str, reason: String },
}

#[derive(Debug, Default)]
struct Entry {
    state: LocalState,
    lease: Option<Lease>,
    pending: Option<ClaimTicket>,
    snapshot: Option<SharedObject>,
    /// When the current state was entered.
    since: i64,
}

impl Entry {
    fn become_available(&mut self, now: i64) {
        self.state = LocalState::Available;
        self.lease = None;
        self.since = now;
    }

    fn take_rollback(&mut self) -> Option<Action> {
        self.snapshot.take().map(|object| Action::Rollback { object })
    }

    fn is_idle(&self) -> bool {
        self.state == LocalState::Available && self.pending.is_none() && self.snapshot.is_none()
    }
}

#[derive(Debug)]
struct Intent {
    object_id: Uuid,
    started_at: i64,
    abandoned: bool,
    rejected_seen: bool,
}

#[derive(Debug)]
pub struct LocalReconciler {
    user_id: Uuid,
    ttl_ms: i64,
    grace_ms: i64,
    visual_timeout_ms: i64,
    entries: HashMap<Uuid, Entry>,
    intents: HashMap<ClaimTicket, Intent>,
    next_ticket: u64,
}

impl LocalReconciler {
    #[must_use]
    pub fn new(user_id: Uuid, config: &CoordinatorConfig) -> Self {
        Self {
            user_id,
            ttl_ms: config.claim_duration_ms.max(1),
            grace_ms: config.expiry_grace_ms.max(0),
            visual_timeout_ms: config.visual_claim_timeout_ms.max(0),
            entries: HashMap::new(),
            intents: HashMap::new(),
            next_ticket: 0,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn state(&self, object_id: Uuid) -> LocalState {
        self.entries.get(&object_id).map_or(LocalState::Available, |e| e.state)
    }

    #[must_use]
    pub fn lease(&self, object_id: Uuid) -> Option<&Lease> {
        self.entries.get(&object_id).and_then(|e| e.lease.as_ref())
    }

    /// Interaction is allowed while holding or optimistically claiming.
    #[must_use]
    pub fn can_edit(&self, object_id: Uuid) -> bool {
        matches!(self.state(object_id), LocalState::HeldBySelf | LocalState::ClaimPending)
    }

    /// Cosmetic: until when a pending claim should be drawn as pending.
    #[must_use]
    pub fn visual_pending_until(&self, object_id: Uuid) -> Option<i64> {
        let entry = self.entries.get(&object_id)?;
        (entry.state == LocalState::ClaimPending).then(|| entry.since.saturating_add(self.visual_timeout_ms))
    }

    #[must_use]
    pub fn held_objects(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == LocalState::HeldBySelf)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // =========================================================================
    // CLAIM LIFECYCLE
    // =========================================================================

    /// Start a claim. `None` when the object is already held, already being
    /// claimed, or held by someone else with a live lease.
    pub fn begin_claim(&mut self, object_id: Uuid, now: i64) -> Option<ClaimTicket> {
        let entry = self.entries.entry(object_id).or_default();
        match entry.state {
            LocalState::HeldBySelf | LocalState::ClaimPending => return None,
            LocalState::HeldByOther if entry.lease.as_ref().is_some_and(|l| !l.is_expired(now)) => return None,
            _ => {}
        }

        self.next_ticket += 1;
        let ticket = ClaimTicket(self.next_ticket);
        entry.state = LocalState::ClaimPending;
        entry.pending = Some(ticket);
        entry.since = now;
        self.intents.insert(ticket, Intent { object_id, started_at: now, abandoned: false, rejected_seen: false });
        Some(ticket)
    }

    /// Remember the pre-edit object for an optimistic edit. Only the first
    /// edit of a claim is kept; later edits roll back to the same point.
    /// Returns `false` when editing is not allowed.
    pub fn record_optimistic_edit(&mut self, before: &SharedObject) -> bool {
        let Some(entry) = self.entries.get_mut(&before.id) else {
            return false;
        };
        match entry.state {
            LocalState::ClaimPending => {
                if entry.snapshot.is_none() {
                    entry.snapshot = Some(before.clone());
                }
                true
            }
            LocalState::HeldBySelf => true,
            _ => false,
        }
    }

    /// An authoritative copy of `object` arrived while our optimistic edit is
    /// pending. It replaces the rollback point, so a rejection restores the
    /// newest known object. `false` when no optimistic edit is outstanding.
    pub fn rebase(&mut self, object: &SharedObject) -> bool {
        match self.entries.get_mut(&object.id) {
            Some(entry) if entry.state == LocalState::ClaimPending && entry.snapshot.is_some() => {
                entry.snapshot = Some(object.clone());
                true
            }
            _ => false,
        }
    }

    /// Apply the arbitrator's answer to a claim started with `begin_claim`.
    pub fn resolve_claim(
        &mut self,
        ticket: ClaimTicket,
        outcome: Result<ClaimOutcome, LeaseError>,
        now: i64,
    ) -> Vec<Action> {
        let Some(intent) = self.intents.remove(&ticket) else {
            return Vec::new();
        };
        let object_id = intent.object_id;

        if intent.abandoned {
            // Late accept: give it back. Late reject: nothing to do.
            return match outcome {
                Ok(ClaimOutcome::Accepted { lease }) if lease.owner_id == self.user_id => {
                    vec![Action::Release { object_id }]
                }
                _ => Vec::new(),
            };
        }

        let ttl_ms = self.ttl_ms;
        let entry = self.entries.entry(object_id).or_default();
        if entry.pending == Some(ticket) {
            entry.pending = None;
        }

        let mut actions = Vec::new();
        match outcome {
            Ok(ClaimOutcome::Accepted { lease }) => {
                entry.state = LocalState::HeldBySelf;
                entry.lease = Some(lease);
                entry.snapshot = None;
                entry.since = now;
            }
            Ok(ClaimOutcome::Rejected { current_owner_id, current_owner_name }) => {
                let known = entry.lease.as_ref().is_some_and(|l| l.owner_id == current_owner_id);
                if !known {
                    // The holder's real window is unknown; assume a full one.
                    entry.lease =
                        Some(Lease::issue(object_id, current_owner_id, &current_owner_name, now, ttl_ms));
                }
                entry.state = LocalState::HeldByOther;
                entry.since = now;
                actions.extend(entry.take_rollback());
                if !intent.rejected_seen {
                    actions.push(Action::NotifyRejected {
                        object_id,
                        owner_id: current_owner_id,
                        owner_name: current_owner_name,
                    });
                }
            }
            Err(LeaseError::ObjectGone(_)) => {
                actions.extend(entry.take_rollback());
                self.entries.remove(&object_id);
                actions.push(Action::ObjectGone { object_id });
            }
            Err(err) => {
                // Fail closed: an undecided claim is a lost claim.
                if entry.state == LocalState::ClaimPending {
                    entry.become_available(now);
                }
                actions.extend(entry.take_rollback());
                actions.push(Action::ClaimFailed { object_id, code: err.error_code(), reason: err.to_string() });
            }
        }
        actions
    }

    /// Give up on an in-flight claim for `object_id`.
    pub fn abandon(&mut self, object_id: Uuid, now: i64) -> Vec<Action> {
        let Some(entry) = self.entries.get_mut(&object_id) else {
            return Vec::new();
        };
        let Some(ticket) = entry.pending.take() else {
            return Vec::new();
        };
        if let Some(intent) = self.intents.get_mut(&ticket) {
            intent.abandoned = true;
        }
        if entry.state == LocalState::ClaimPending {
            entry.become_available(now);
        }
        entry.take_rollback().into_iter().collect()
    }

    /// Apply the outcome of an extend.
    pub fn resolve_extend(&mut self, object_id: Uuid, outcome: &ExtendOutcome, now: i64) {
        let user_id = self.user_id;
        let entry = self.entries.entry(object_id).or_default();
        match outcome {
            ExtendOutcome::Accepted { lease } => {
                entry.state = LocalState::HeldBySelf;
                entry.lease = Some(lease.clone());
            }
            ExtendOutcome::Rejected { current: Some(lease) } if lease.owner_id != user_id => {
                entry.state = LocalState::HeldByOther;
                entry.lease = Some(lease.clone());
                entry.since = now;
            }
            ExtendOutcome::Rejected { .. } => entry.become_available(now),
        }
    }

    /// The lease on `object_id` was handed back (or was already gone).
    pub fn released_locally(&mut self, object_id: Uuid, now: i64) {
        if let Some(entry) = self.entries.get_mut(&object_id) {
            if entry.state == LocalState::HeldBySelf || entry.state == LocalState::Expired {
                entry.become_available(now);
            }
        }
    }

    // =========================================================================
    // AUTHORITATIVE EVENTS
    // =========================================================================

    /// Fold a sync event into local state. Authoritative events beat the
    /// local cache.
    pub fn apply_event(&mut self, event: &SyncEvent, now: i64) -> Vec<Action> {
        match event {
            SyncEvent::OwnershipClaimed { object_id, owner_id, .. } => {
                let Some(lease) = event.as_lease() else {
                    return Vec::new();
                };
                let entry = self.entries.entry(*object_id).or_default();
                if entry.lease.as_ref().is_some_and(|known| {
                    known.owner_id == lease.owner_id && known.expires_at > lease.expires_at
                }) {
                    return Vec::new();
                }
                entry.lease = Some(lease);
                entry.since = now;
                if *owner_id == self.user_id {
                    entry.state = LocalState::HeldBySelf;
                    entry.snapshot = None;
                    Vec::new()
                } else {
                    entry.state = LocalState::HeldByOther;
                    entry.take_rollback().into_iter().collect()
                }
            }
            SyncEvent::OwnershipReleased { object_id, former_owner_id, .. }
            | SyncEvent::OwnershipExpired { object_id, former_owner_id, .. } => {
                if let Some(entry) = self.entries.get_mut(object_id) {
                    let matches_owner = entry.lease.as_ref().is_some_and(|l| l.owner_id == *former_owner_id);
                    if matches_owner && entry.state != LocalState::ClaimPending {
                        entry.become_available(now);
                    }
                }
                Vec::new()
            }
            SyncEvent::OwnershipRejected { object_id, requesting_user_id, current_owner_id, current_owner_name } => {
                if *requesting_user_id != self.user_id {
                    return Vec::new();
                }
                let ttl_ms = self.ttl_ms;
                let Some(entry) = self.entries.get_mut(object_id) else {
                    return Vec::new();
                };
                let Some(intent) = entry.pending.and_then(|t| self.intents.get_mut(&t)) else {
                    return Vec::new();
                };
                if intent.abandoned || intent.rejected_seen {
                    return Vec::new();
                }
                intent.rejected_seen = true;
                if !entry.lease.as_ref().is_some_and(|l| l.owner_id == *current_owner_id) {
                    entry.lease = Some(Lease::issue(*object_id, *current_owner_id, current_owner_name, now, ttl_ms));
                }
                entry.state = LocalState::HeldByOther;
                entry.since = now;
                let mut actions: Vec<Action> = entry.take_rollback().into_iter().collect();
                actions.push(Action::NotifyRejected {
                    object_id: *object_id,
                    owner_id: *current_owner_id,
                    owner_name: current_owner_name.clone(),
                });
                actions
            }
            SyncEvent::ObjectsDeleted { object_ids } => {
                let mut actions = Vec::new();
                for object_id in object_ids {
                    let Some(mut entry) = self.entries.remove(object_id) else {
                        continue;
                    };
                    if let Some(intent) = entry.pending.and_then(|t| self.intents.get_mut(&t)) {
                        intent.abandoned = true;
                    }
                    entry.snapshot = None;
                    actions.push(Action::ObjectGone { object_id: *object_id });
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    // =========================================================================
    // TIME
    // =========================================================================

    /// Advance local time. Held leases past `expires_at` become `Expired`,
    /// expired ones become `Available` after the grace period, and claims
    /// pending for a whole TTL are abandoned.
    pub fn tick(&mut self, now: i64) -> Vec<Action> {
        let mut stale_claims = Vec::new();
        for (object_id, entry) in &mut self.entries {
            match entry.state {
                LocalState::HeldBySelf | LocalState::HeldByOther => {
                    if let Some(expires_at) = entry.lease.as_ref().map(|l| l.expires_at) {
                        if expires_at <= now {
                            entry.state = LocalState::Expired;
                            entry.since = expires_at;
                        }
                    }
                }
                LocalState::ClaimPending => {
                    let started = entry
                        .pending
                        .and_then(|t| self.intents.get(&t))
                        .map_or(entry.since, |i| i.started_at);
                    if now.saturating_sub(started) >= self.ttl_ms {
                        stale_claims.push(*object_id);
                    }
                }
                LocalState::Expired | LocalState::Available => {}
            }
            if entry.state == LocalState::Expired && now >= entry.since.saturating_add(self.grace_ms) {
                entry.become_available(now);
            }
        }

        let mut actions = Vec::new();
        for object_id in stale_claims {
            actions.extend(self.abandon(object_id, now));
        }
        self.entries.retain(|_, entry| !entry.is_idle());
        actions
    }

    /// Replace all local state with a freshly loaded set of leases, as after
    /// a reconnect. In-flight claims are abandoned and rolled back.
    pub fn reset(&mut self, leases: &[Lease], now: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        for intent in self.intents.values_mut() {
            intent.abandoned = true;
        }
        for entry in self.entries.values_mut() {
            entry.pending = None;
            actions.extend(entry.take_rollback());
        }
        self.entries.clear();

        for lease in leases.iter().filter(|l| !l.is_expired(now)) {
            let state = if lease.owner_id == self.user_id { LocalState::HeldBySelf } else { LocalState::HeldByOther };
            self.entries.insert(
                lease.object_id,
                Entry { state, lease: Some(lease.clone()), pending: None, snapshot: None, since: now },
            );
        }
        actions
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
