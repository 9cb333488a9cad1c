//! Client session — one participant on one canvas.
//!
//! DESIGN
//! ======
//! The session owns a `LocalReconciler` and carries out the actions it asks
//! for. A claim is split in two: `request_claim` flips the object to
//! `ClaimPending` synchronously and starts the arbitrator call in the
//! background, so the user can keep dragging; `complete_claim` applies the
//! answer and commits any edits made in the meantime.
//!
//! Edits reach the object store only while the lease is held. Edits made
//! while a claim is pending stay local and are merged into one patch, which
//! is committed on accept and discarded (rolled back) on reject.
//!
//! Incoming sync events are queued by the adapter subscription and applied
//! in `process_incoming`, so all state changes happen on the caller's task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::reconciler::{Action, ClaimTicket, LocalReconciler, LocalState};
use crate::config::CoordinatorConfig;
use crate::frame::ErrorCode;
use crate::lease::arbitrator::ClaimArbitrator;
use crate::lease::{ClaimOutcome, ExtendOutcome, LeaseError, ReleaseOutcome, now_ms};
use crate::services::object::{ObjectPatch, ObjectStore, StoreError};
use crate::state::{AppState, SharedObject};
use crate::sync::adapter::{SubscriptionHandle, SyncChannelAdapter};
use crate::sync::event::SyncEvent;
use crate::sync::transport::TransportError;

/// A claim whose answer has not been applied yet.
pub struct PendingClaim {
    pub object_id: Uuid,
    ticket: ClaimTicket,
    task: JoinHandle<Result<ClaimOutcome, LeaseError>>,
}

enum Incoming {
    Event(SyncEvent),
    Reconnected,
}

pub struct ClientSession {
    user_id: Uuid,
    display_name: String,
    canvas_id: Uuid,
    arbitrator: Arc<ClaimArbitrator>,
    adapter: Arc<SyncChannelAdapter>,
    objects: Arc<dyn ObjectStore>,
    reconciler: LocalReconciler,
    auto_release_on_blur: bool,
    /// Last known version of every object on the canvas.
    local: HashMap<Uuid, SharedObject>,
    /// Edits made while a claim was pending, merged.
    pending_edits: HashMap<Uuid, ObjectPatch>,
    /// Abandoned claims still waiting for their answer.
    abandoned: Vec<PendingClaim>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: mpsc::UnboundedReceiver<Incoming>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl ClientSession {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        display_name: &str,
        arbitrator: Arc<ClaimArbitrator>,
        adapter: Arc<SyncChannelAdapter>,
        objects: Arc<dyn ObjectStore>,
        config: &CoordinatorConfig,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            user_id,
            display_name: display_name.to_owned(),
            canvas_id: adapter.canvas_id(),
            arbitrator,
            adapter,
            objects,
            reconciler: LocalReconciler::new(user_id, config),
            auto_release_on_blur: config.auto_release_on_blur,
            local: HashMap::new(),
            pending_edits: HashMap::new(),
            abandoned: Vec::new(),
            incoming_tx,
            incoming_rx,
            subscriptions: Vec::new(),
        }
    }

    /// Join `canvas_id` on this process: subscribe and load current state.
    ///
    /// # Errors
    ///
    /// Fails if the subscription or the initial load fails.
    pub async fn join(state: &AppState, canvas_id: Uuid, user_id: Uuid, display_name: &str) -> Result<Self, LeaseError> {
        let canvas = state.canvas(canvas_id).await;
        let adapter = Arc::new(SyncChannelAdapter::new(state.hub.clone(), canvas_id, Some(user_id), &state.config));
        let mut session =
            Self::new(user_id, display_name, canvas.arbitrator, adapter, state.objects.clone(), &state.config);
        session.subscribe()?;
        session.resync(now_ms()).await?;
        info!(%canvas_id, %user_id, "session: joined");
        Ok(session)
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn state(&self, object_id: Uuid) -> LocalState {
        self.reconciler.state(object_id)
    }

    #[must_use]
    pub fn reconciler(&self) -> &LocalReconciler {
        &self.reconciler
    }

    #[must_use]
    pub fn object(&self, object_id: Uuid) -> Option<&SharedObject> {
        self.local.get(&object_id)
    }

    /// Start delivering broadcast events and reconnect signals to this
    /// session. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails if the transport refuses the subscription.
    pub fn subscribe(&mut self) -> Result<(), TransportError> {
        if !self.subscriptions.is_empty() {
            return Ok(());
        }
        let tx = self.incoming_tx.clone();
        let events = self.adapter.subscribe(move |event| {
            let _ = tx.send(Incoming::Event(event));
        })?;
        let tx = self.incoming_tx.clone();
        let reconnect = self.adapter.on_reconnect(move || {
            let _ = tx.send(Incoming::Reconnected);
        });
        self.subscriptions = vec![events, reconnect];
        Ok(())
    }

    // =========================================================================
    // CLAIM
    // =========================================================================

    /// Optimistically claim `object_id` and ask the arbitrator in the
    /// background. `Ok(None)` when the object is already held or pending.
    ///
    /// # Errors
    ///
    /// `TransportUnavailable` while disconnected (fail closed),
    /// `ClaimRejected` when the local view already shows a live holder.
    pub fn request_claim(&mut self, object_id: Uuid, now: i64) -> Result<Option<PendingClaim>, LeaseError> {
        if !self.adapter.is_connected() {
            return Err(LeaseError::TransportUnavailable(format!("{:?}", self.adapter.connection_state())));
        }
        if self.reconciler.state(object_id) == LocalState::HeldByOther {
            if let Some(lease) = self.reconciler.lease(object_id).filter(|l| !l.is_expired(now)) {
                return Err(LeaseError::ClaimRejected {
                    object_id,
                    owner_id: lease.owner_id,
                    owner_name: lease.owner_name.clone(),
                });
            }
        }
        let Some(ticket) = self.reconciler.begin_claim(object_id, now) else {
            return Ok(None);
        };

        let arbitrator = self.arbitrator.clone();
        let user_id = self.user_id;
        let name = self.display_name.clone();
        let task = tokio::spawn(async move { arbitrator.attempt_claim(object_id, user_id, &name, now).await });
        Ok(Some(PendingClaim { object_id, ticket, task }))
    }

    /// Apply the arbitrator's answer. On accept, edits made while pending
    /// are committed; a failed commit is reported as `CommitFailed`.
    pub async fn complete_claim(&mut self, pending: PendingClaim, now: i64) -> Vec<Action> {
        let PendingClaim { object_id, ticket, task } = pending;
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(LeaseError::TransportUnavailable(format!("claim task failed: {e}"))),
        };
        let mut actions = self.reconciler.resolve_claim(ticket, outcome, now);
        self.run_actions(&actions, now).await;

        if self.reconciler.state(object_id) == LocalState::HeldBySelf {
            if let Some(patch) = self.pending_edits.remove(&object_id) {
                if let Err(e) = self.commit(object_id, &patch, now).await {
                    let failed = Action::CommitFailed { object_id, code: e.error_code(), reason: e.to_string() };
                    self.run_actions(std::slice::from_ref(&failed), now).await;
                    actions.push(failed);
                }
            }
        }
        actions
    }

    /// Claim and wait for the answer.
    ///
    /// # Errors
    ///
    /// Same as `request_claim`.
    pub async fn claim(&mut self, object_id: Uuid, now: i64) -> Result<Vec<Action>, LeaseError> {
        match self.request_claim(object_id, now)? {
            Some(pending) => Ok(self.complete_claim(pending, now).await),
            None => Ok(Vec::new()),
        }
    }

    /// Stop waiting for a claim. Optimistic edits are rolled back; if the
    /// claim is accepted anyway, the lease is handed straight back.
    pub async fn abandon(&mut self, pending: PendingClaim, now: i64) -> Vec<Action> {
        let actions = self.reconciler.abandon(pending.object_id, now);
        self.pending_edits.remove(&pending.object_id);
        self.run_actions(&actions, now).await;
        self.abandoned.push(pending);
        actions
    }

    // =========================================================================
    // EDIT
    // =========================================================================

    /// Apply `patch` to `object_id`.
    ///
    /// Held: written to the store and broadcast. Pending: applied locally
    /// and held back until the claim resolves.
    ///
    /// # Errors
    ///
    /// `ClaimRejected` when someone else holds the object, `StaleLease` when
    /// nobody does or our lease has run out, `ObjectGone` if the object was
    /// deleted.
    pub async fn edit(&mut self, object_id: Uuid, patch: ObjectPatch, now: i64) -> Result<SharedObject, LeaseError> {
        match self.reconciler.state(object_id) {
            LocalState::HeldBySelf => {
                if self.reconciler.lease(object_id).is_some_and(|l| !l.is_expired(now)) {
                    return self.commit(object_id, &patch, now).await;
                }
                // Lapsed since the last tick: catch up before refusing.
                let actions = self.reconciler.tick(now);
                self.run_actions(&actions, now).await;
                Err(LeaseError::StaleLease(object_id))
            }
            LocalState::ClaimPending => {
                let mut object = self.load_object(object_id).await?;
                self.reconciler.record_optimistic_edit(&object);
                patch.apply_to(&mut object);
                self.local.insert(object_id, object.clone());
                let merged = match self.pending_edits.remove(&object_id) {
                    Some(earlier) => earlier.merge(patch),
                    None => patch,
                };
                self.pending_edits.insert(object_id, merged);
                Ok(object)
            }
            LocalState::HeldByOther => {
                let (owner_id, owner_name) = self
                    .reconciler
                    .lease(object_id)
                    .map_or((Uuid::nil(), String::new()), |l| (l.owner_id, l.owner_name.clone()));
                Err(LeaseError::ClaimRejected { object_id, owner_id, owner_name })
            }
            LocalState::Available | LocalState::Expired => Err(LeaseError::StaleLease(object_id)),
        }
    }

    async fn commit(&mut self, object_id: Uuid, patch: &ObjectPatch, now: i64) -> Result<SharedObject, LeaseError> {
        match self.objects.update_object(object_id, patch).await {
            Ok(object) => {
                self.local.insert(object_id, object.clone());
                if let Err(e) = self.adapter.publish(SyncEvent::ObjectUpdated { object: object.clone() }).await {
                    warn!(%object_id, error = %e, "session: update saved but not broadcast");
                }
                Ok(object)
            }
            Err(StoreError::NotFound(_)) => {
                self.forget_objects(&[object_id], now);
                Err(LeaseError::ObjectGone(object_id))
            }
            Err(e) => {
                warn!(%object_id, error = %e, "session: update rejected by store");
                self.refresh_object(object_id).await;
                Err(e.into())
            }
        }
    }

    async fn load_object(&mut self, object_id: Uuid) -> Result<SharedObject, LeaseError> {
        if let Some(object) = self.local.get(&object_id) {
            return Ok(object.clone());
        }
        let object = self
            .objects
            .get_objects_by_ids(&[object_id])
            .await?
            .into_iter()
            .next()
            .ok_or(LeaseError::ObjectGone(object_id))?;
        self.local.insert(object_id, object.clone());
        Ok(object)
    }

    async fn refresh_object(&mut self, object_id: Uuid) {
        match self.objects.get_objects_by_ids(&[object_id]).await {
            Ok(found) => match found.into_iter().next() {
                Some(object) => {
                    self.local.insert(object_id, object);
                }
                None => {
                    self.local.remove(&object_id);
                }
            },
            Err(e) => warn!(%object_id, error = %e, "session: refresh failed"),
        }
    }

    // =========================================================================
    // EXTEND / RELEASE
    // =========================================================================

    /// End of a gesture on a held object: extend the lease.
    ///
    /// # Errors
    ///
    /// `StaleLease` if the object is not held, or whatever the arbitrator
    /// returns.
    pub async fn finish_gesture(&mut self, object_id: Uuid, now: i64) -> Result<ExtendOutcome, LeaseError> {
        if self.reconciler.state(object_id) != LocalState::HeldBySelf {
            return Err(LeaseError::StaleLease(object_id));
        }
        let outcome = self.arbitrator.extend(object_id, self.user_id, now).await?;
        self.reconciler.resolve_extend(object_id, &outcome, now);
        Ok(outcome)
    }

    /// Hand a held lease back.
    ///
    /// # Errors
    ///
    /// Whatever the arbitrator returns.
    pub async fn release(&mut self, object_id: Uuid, now: i64) -> Result<ReleaseOutcome, LeaseError> {
        let outcome = self.arbitrator.release(object_id, self.user_id, now).await?;
        self.reconciler.released_locally(object_id, now);
        Ok(outcome)
    }

    async fn release_all(&mut self, now: i64) -> Vec<Uuid> {
        let mut released = Vec::new();
        for object_id in self.reconciler.held_objects() {
            match self.release(object_id, now).await {
                Ok(_) => released.push(object_id),
                Err(e) => warn!(%object_id, error = %e, "session: release failed"),
            }
        }
        released
    }

    /// Window lost focus. Releases every held lease when configured to.
    pub async fn blur(&mut self, now: i64) -> Vec<Uuid> {
        if !self.auto_release_on_blur {
            return Vec::new();
        }
        self.release_all(now).await
    }

    /// Leave the canvas: release held leases and stop listening.
    pub async fn disconnect(&mut self, now: i64) -> Vec<Uuid> {
        let released = self.release_all(now).await;
        self.subscriptions.clear();
        info!(canvas_id = %self.canvas_id, user_id = %self.user_id, released = released.len(), "session: left");
        released
    }

    // =========================================================================
    // INCOMING
    // =========================================================================

    /// Apply one sync event.
    pub async fn handle_event(&mut self, event: &SyncEvent, now: i64) -> Vec<Action> {
        match event {
            SyncEvent::ObjectCreated { object } | SyncEvent::ObjectUpdated { object } => {
                // Optimistic edits stay visible; the update becomes their rollback base.
                if !self.reconciler.rebase(object) {
                    self.local.insert(object.id, object.clone());
                }
                Vec::new()
            }
            SyncEvent::ObjectsDuplicated { objects } => {
                for object in objects {
                    self.local.insert(object.id, object.clone());
                }
                Vec::new()
            }
            SyncEvent::ObjectsDeleted { object_ids } => self.forget_objects(object_ids, now),
            _ => {
                let actions = self.reconciler.apply_event(event, now);
                self.run_actions(&actions, now).await;
                actions
            }
        }
    }

    /// Drain queued events and reconnect signals. A reconnect triggers a
    /// full resync.
    ///
    /// # Errors
    ///
    /// Fails only if a resync fails.
    pub async fn process_incoming(&mut self, now: i64) -> Result<Vec<Action>, LeaseError> {
        let mut actions = Vec::new();
        let mut reconnected = false;
        while let Ok(incoming) = self.incoming_rx.try_recv() {
            match incoming {
                Incoming::Event(event) => actions.extend(self.handle_event(&event, now).await),
                Incoming::Reconnected => reconnected = true,
            }
        }
        if reconnected {
            actions.extend(self.resync(now).await?);
        }
        Ok(actions)
    }

    /// Advance local time: lapse expired leases, give up stale claims,
    /// settle abandoned claims that have been answered.
    pub async fn tick(&mut self, now: i64) -> Vec<Action> {
        let mut actions = self.settle_abandoned(now).await;
        let ticked = self.reconciler.tick(now);
        self.run_actions(&ticked, now).await;
        actions.extend(ticked);
        actions
    }

    /// Re-fetch every object and lease on the canvas and rebuild local
    /// state from them.
    ///
    /// # Errors
    ///
    /// Fails if the store or the authority is unreachable.
    pub async fn resync(&mut self, now: i64) -> Result<Vec<Action>, LeaseError> {
        let objects = self.objects.list_objects(self.canvas_id).await?;
        let ids: Vec<Uuid> = objects.iter().map(|o| o.id).collect();
        let leases = self.arbitrator.resync(&ids).await?;

        self.local = objects.into_iter().map(|o| (o.id, o)).collect();
        self.pending_edits.clear();
        // Rollbacks are moot: the fresh objects are already authoritative.
        let actions = self.reconciler.reset(&leases, now);
        debug!(canvas_id = %self.canvas_id, objects = self.local.len(), leases = leases.len(), "session: resynced");
        Ok(actions)
    }

    async fn settle_abandoned(&mut self, now: i64) -> Vec<Action> {
        let (done, waiting): (Vec<PendingClaim>, Vec<PendingClaim>) =
            std::mem::take(&mut self.abandoned).into_iter().partition(|p| p.task.is_finished());
        self.abandoned = waiting;

        let mut actions = Vec::new();
        for pending in done {
            let outcome = match pending.task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(LeaseError::TransportUnavailable(e.to_string())),
            };
            let resolved = self.reconciler.resolve_claim(pending.ticket, outcome, now);
            self.run_actions(&resolved, now).await;
            actions.extend(resolved);
        }
        actions
    }

    fn forget_objects(&mut self, object_ids: &[Uuid], now: i64) -> Vec<Action> {
        for id in object_ids {
            self.local.remove(id);
            self.pending_edits.remove(id);
        }
        self.reconciler.apply_event(&SyncEvent::ObjectsDeleted { object_ids: object_ids.to_vec() }, now)
    }

    async fn run_actions(&mut self, actions: &[Action], now: i64) {
        for action in actions {
            match action {
                Action::Release { object_id } => {
                    if let Err(e) = self.arbitrator.release(*object_id, self.user_id, now).await {
                        warn!(%object_id, error = %e, "session: compensating release failed");
                    }
                }
                Action::Rollback { object } => {
                    self.pending_edits.remove(&object.id);
                    self.local.insert(object.id, object.clone());
                }
                Action::ObjectGone { object_id } => {
                    self.local.remove(object_id);
                    self.pending_edits.remove(object_id);
                }
                Action::NotifyRejected { object_id, owner_name, .. } => {
                    debug!(%object_id, owner = %owner_name, "session: claim rejected");
                }
                Action::ClaimFailed { object_id, code, .. } => {
                    debug!(%object_id, code, "session: claim failed");
                }
                Action::CommitFailed { object_id, code, reason } => {
                    warn!(%object_id, code, %reason, "session: pending edits not saved");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
