//! Leaseboard — ownership leases and dual-channel sync for shared canvases.
//!
//! ARCHITECTURE
//! ============
//! Many clients view a canvas at once, but at most one may mutate a given
//! object. Exclusivity is expressed as a time-bounded lease per object:
//!
//! - `lease`: lease records, the copy-on-write lease store, the claim
//!   arbitrator backed by a compare-and-swap authority, and the expiry sweeper.
//! - `sync`: wire events, the transport seam, the channel adapter (broadcast +
//!   presence), and the presence tracker.
//! - `client`: the per-client optimistic reconciler and the session that
//!   drives it against the arbitrator and the object store.
//! - `routes` / `services` / `state`: the websocket server that hosts the
//!   arbitration point for browser clients.

pub mod client;
pub mod config;
pub mod db;
pub mod frame;
pub mod lease;
pub mod routes;
pub mod services;
pub mod state;
pub mod sync;
