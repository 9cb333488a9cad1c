//! Domain services used by the websocket routes.
//!
//! ARCHITECTURE
//! ============
//! `object` is the object store seam (memory + Postgres); `canvas` owns
//! per-canvas snapshots and the background maintenance loop.

pub mod canvas;
pub mod object;
