//! Per-project reconcile metadata.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{opt_ts_column, ts_to_sql};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRow {
    pub project_id: String,
    pub name: String,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Record a successful reconcile of a project. Clears any previous error.
pub fn record_success(
    conn: &Connection,
    project_id: &str,
    name: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO projects (project_id, name, last_reconciled_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(project_id) DO UPDATE SET
            name = excluded.name,
            last_reconciled_at = excluded.last_reconciled_at,
            last_error = NULL,
            last_error_at = NULL",
        params![project_id, name, ts_to_sql(now)],
    )
    .with_context(|| format!("Failed to record reconcile of project {project_id}"))?;
    Ok(())
}

/// Record a failed reconcile. `last_reconciled_at` keeps the last good run.
pub fn record_failure(
    conn: &Connection,
    project_id: &str,
    name: &str,
    error: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO projects (project_id, name, last_error, last_error_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(project_id) DO UPDATE SET
            name = excluded.name,
            last_error = excluded.last_error,
            last_error_at = excluded.last_error_at",
        params![project_id, name, error, ts_to_sql(now)],
    )
    .with_context(|| format!("Failed to record failure of project {project_id}"))?;
    Ok(())
}

pub fn list(conn: &Connection) -> Result<Vec<ProjectRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT project_id, name, last_reconciled_at, last_error, last_error_at
             FROM projects ORDER BY project_id",
        )
        .context("Failed to prepare project list")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProjectRow {
                project_id: row.get(0)?,
                name: row.get(1)?,
                last_reconciled_at: opt_ts_column(row, 2)?,
                last_error: row.get(3)?,
                last_error_at: opt_ts_column(row, 4)?,
            })
        })
        .context("Failed to list projects")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read project row")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncDb;
    use chrono::TimeZone;

    #[test]
    fn test_failure_keeps_last_success() {
        let db = SyncDb::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let conn = db.conn();
        let t1 = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 2, 2, 0, 0, 0).unwrap();

        record_success(conn, "p1", "Pilot", &t1).unwrap();
        record_failure(conn, "p1", "Pilot", "registry down", &t2).unwrap();

        let rows = list(conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_reconciled_at, Some(t1));
        assert_eq!(rows[0].last_error.as_deref(), Some("registry down"));

        record_success(conn, "p1", "Pilot v2", &t2).unwrap();
        let rows = list(conn).unwrap();
        assert_eq!(rows[0].name, "Pilot v2");
        assert_eq!(rows[0].last_error, None);
    }
}
