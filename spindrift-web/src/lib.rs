//! Spindrift web layer.
//!
//! Translates inbound HTTP requests into session lookups, bounded segment
//! waits, and manifest rendering. All transcoding state lives in
//! `spindrift-core`; this crate only maps it onto status codes and
//! payloads.

pub mod handlers;
pub mod server;

pub use server::{AppState, build_router, run_server};
