//! Command implementations.

mod backfill;
mod log;
mod status;
mod sync;

pub use backfill::run_backfill;
pub use log::run_log;
pub use status::run_status;
pub use sync::run_sync;

use std::path::Path;

use anyhow::Result;

use crate::snapshot::{LogAlertSender, SnapshotEventStore, SnapshotRegistry};
use theradash_core::config::SyncConfig;
use theradash_core::store::SyncDb;
use theradash_core::SyncEngine;

pub type SnapshotEngine = SyncEngine<SnapshotRegistry, SnapshotEventStore, LogAlertSender>;

/// Open the store and wire the engine to the snapshot collaborators.
pub fn open_engine(
    db_path: &Path,
    config: SyncConfig,
    snapshot: &Path,
) -> Result<SnapshotEngine> {
    let db = SyncDb::open_initialized(db_path)?;
    let events = SnapshotEventStore::load(snapshot)?;
    Ok(SyncEngine::new(
        db,
        config,
        SnapshotRegistry::new(snapshot),
        events,
        LogAlertSender,
    ))
}
