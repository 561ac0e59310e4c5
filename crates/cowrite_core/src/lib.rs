//! Core client library for cowrite, a real-time collaborative editing
//! system.
//!
//! This crate contains everything a client embeds:
//!
//! - [`protocol`]: the JSON wire protocol shared with the sync server.
//!   Document and awareness payloads are opaque bytes end to end; the CRDT
//!   library that produces and consumes them lives outside this crate.
//! - [`sync`]: the [`SyncAgent`](sync::SyncAgent) that batches outbound
//!   changes, relays inbound ones, and survives reconnects.
//! - [`session_cache`]: client-local identity persistence so a returning
//!   user silently resumes their seat in a room.
//!
//! The server side lives in the `cowrite_sync_server` crate.

pub mod protocol;
pub mod session_cache;
pub mod sync;
