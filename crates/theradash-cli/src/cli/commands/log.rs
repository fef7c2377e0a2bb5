//! Implementation of `theradash log`.

use std::path::Path;

use anyhow::Result;

use crate::output::{Formatter, OutputFormat};
use theradash_core::store::{sync_log, SyncDb};

#[tracing::instrument(skip(format))]
pub fn run_log(db_path: &Path, limit: usize, format: OutputFormat) -> Result<()> {
    let db = SyncDb::open_initialized(db_path)?;
    let runs = sync_log::recent(db.conn(), limit)?;
    Formatter::new(format).print_list(&runs, "No sync runs recorded.", "runs")
}
