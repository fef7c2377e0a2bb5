//! theradash-core: sync engine for the theradash monitoring dashboard.
//!
//! This crate owns the local relational model (identities, conversations,
//! messages, watermark, run lock, sync log), the collaborator interfaces for
//! the participant registry, the chat event store and the alert sender, and
//! the engine that reconciles them on every scheduled run.

pub mod clients;
pub mod clock;
pub mod config;
pub mod errors;
pub mod records;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{SyncError, SyncResultT};
pub use sync::{SyncEngine, SyncResult, SyncStatus};
