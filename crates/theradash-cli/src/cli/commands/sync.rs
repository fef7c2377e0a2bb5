//! Implementation of `theradash sync`.

use std::path::Path;

use anyhow::Result;

use super::open_engine;
use crate::output::{Formatter, OutputFormat};
use theradash_core::config::SyncConfig;

/// Run one full sync and print its result. Returns whether it succeeded.
#[tracing::instrument(skip(config, format))]
pub fn run_sync(
    db_path: &Path,
    config: SyncConfig,
    snapshot: &Path,
    format: OutputFormat,
) -> Result<bool> {
    let engine = open_engine(db_path, config, snapshot)?;
    let result = engine.full_sync();
    Formatter::new(format).print(&result)?;
    Ok(result.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use theradash_core::config::SelectionMode;
    use theradash_core::store::{sync_log, SyncDb};

    fn snapshot(dir: &Path) {
        fs::write(
            dir.join("conversations.json"),
            r#"[{"id": "c1", "account_id": "a1", "timestamp": "2025-03-01T01:00:00Z"}]"#,
        )
        .unwrap();
        fs::write(
            dir.join("messages.json"),
            r#"[{"id": "m1", "conversation_id": "c1", "account_id": "a1", "text": "hello",
                 "timestamp": "2025-03-01T01:05:00Z", "risk_label": true}]"#,
        )
        .unwrap();
    }

    #[test]
    fn test_sync_ingests_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        snapshot(dir.path());
        let db_path = dir.path().join("state/sync.db");
        let config = SyncConfig {
            selection_mode: SelectionMode::All,
            ..SyncConfig::default()
        };

        let ok = run_sync(&db_path, config.clone(), dir.path(), OutputFormat::Json).unwrap();
        assert!(ok);
        let ok = run_sync(&db_path, config, dir.path(), OutputFormat::Text).unwrap();
        assert!(ok);

        let db = SyncDb::open_initialized(&db_path).unwrap();
        let counts = db.table_counts().unwrap();
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.sync_runs, 2);
        let last = sync_log::latest(db.conn()).unwrap().unwrap();
        assert_eq!(last.messages_synced, 0);
    }

    #[test]
    fn test_failed_project_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::from_json(r#"{"projects": [{"id": "p1", "name": "Pilot"}], "retry": {"attempts": 1}}"#)
            .unwrap();
        let ok = run_sync(&dir.path().join("sync.db"), config, dir.path(), OutputFormat::Text)
            .unwrap();
        assert!(!ok);
    }
}
