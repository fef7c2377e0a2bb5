//! Implementation of `theradash backfill`.

use std::path::Path;

use anyhow::Result;

use super::open_engine;
use crate::output::{Formatter, OutputFormat};
use theradash_core::config::SyncConfig;

/// Backfill missing events, or with `alerts` every unsent risk alert.
#[tracing::instrument(skip(config, format))]
pub fn run_backfill(
    db_path: &Path,
    config: SyncConfig,
    snapshot: &Path,
    dry_run: bool,
    alerts: bool,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(db_path, config, snapshot)?;
    let formatter = Formatter::new(format);
    if alerts {
        formatter.print(&engine.backfill_alerts()?)
    } else {
        formatter.print(&engine.backfill(dry_run)?)
    }
}
