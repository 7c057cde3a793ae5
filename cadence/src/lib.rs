//! Realtime reconciliation and drift-corrected session timers.
//!
//! The engine keeps a local, ordered mirror of a remote collection in sync
//! with the store's change stream while accepting optimistic local writes,
//! batches those writes through a debounce/heartbeat scheduler, and runs
//! focus/break/leisure timers whose remaining time is always recomputed from
//! a persisted wall-clock anchor.

pub mod cache;
pub mod channel;
pub mod clock;
pub mod collection_sync;
pub mod commands;
pub mod config;
pub mod cycle;
pub mod diagnostics;
pub mod duration_fmt;
pub mod error;
pub mod logging;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod session_sync;
pub mod store;
pub mod timer;
pub mod types;
