//! Implementation of `theradash status`.

use std::path::Path;

use anyhow::Result;

use crate::output::{Formatter, OutputFormat};
use theradash_core::store::SyncDb;
use theradash_core::sync::EngineStatus;

#[tracing::instrument(skip(format))]
pub fn run_status(db_path: &Path, format: OutputFormat) -> Result<()> {
    let db = SyncDb::open_initialized(db_path)?;
    let status = EngineStatus::load(&db)?;
    Formatter::new(format).print(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_on_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        run_status(&db_path, OutputFormat::Json).unwrap();
        assert!(db_path.exists());
    }
}
