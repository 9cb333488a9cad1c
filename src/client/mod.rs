//! Participant side of the coordinator.
//!
//! `reconciler` is the pure per-object state machine; `session` drives it
//! against the arbitrator, a sync channel adapter and the object store.

pub mod reconciler;
pub mod session;
