//! Watermark tracker.
//!
//! A single-row table holding the timestamp incremental fetches start from.
//! It only moves forward, and only while the advancing run still owns the
//! run lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{opt_ts_column, ts_to_sql};

/// The stored watermark row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub value: Option<DateTime<Utc>>,
    pub advanced_at: Option<DateTime<Utc>>,
    pub advanced_by_run: Option<i64>,
}

pub fn load(conn: &Connection) -> Result<Watermark> {
    conn.query_row(
        "SELECT value, advanced_at, advanced_by_run FROM watermark WHERE id = 1",
        [],
        |row| {
            Ok(Watermark {
                value: opt_ts_column(row, 0)?,
                advanced_at: opt_ts_column(row, 1)?,
                advanced_by_run: row.get(2)?,
            })
        },
    )
    .context("Failed to read watermark")
}

/// The current watermark; `None` before the first successful run.
pub fn current(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    Ok(load(conn)?.value)
}

/// Advance the watermark on behalf of `run_seq`.
///
/// Returns `false` when nothing changed: either `to` is not later than the
/// stored value, or `run_seq` no longer holds the run lock.
pub fn advance(conn: &Connection, to: &DateTime<Utc>, run_seq: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE watermark
             SET value = ?1, advanced_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                 advanced_by_run = ?2
             WHERE id = 1
               AND (value IS NULL OR value < ?1)
               AND EXISTS (
                   SELECT 1 FROM job_state
                   WHERE id = 1 AND state = 'running' AND run_seq = ?2
               )",
            params![ts_to_sql(to), run_seq],
        )
        .context("Failed to advance watermark")?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{job, SyncDb};
    use chrono::TimeZone;
    use std::time::Duration;

    fn setup_running() -> (SyncDb, i64) {
        let db = SyncDb::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let run = job::try_acquire(db.conn(), &t, Duration::from_secs(60))
            .unwrap()
            .run_seq()
            .unwrap();
        (db, run)
    }

    #[test]
    fn test_starts_empty() {
        let (db, _) = setup_running();
        assert_eq!(current(db.conn()).unwrap(), None);
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let (db, run) = setup_running();
        let conn = db.conn();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap();

        assert!(advance(conn, &t1, run).unwrap());
        assert!(!advance(conn, &t0, run).unwrap());
        assert!(!advance(conn, &t1, run).unwrap());
        assert_eq!(current(conn).unwrap(), Some(t1));
        assert_eq!(load(conn).unwrap().advanced_by_run, Some(run));
    }

    #[test]
    fn test_advance_requires_lock() {
        let (db, run) = setup_running();
        let conn = db.conn();
        let t = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();

        // Wrong run.
        assert!(!advance(conn, &t, run + 1).unwrap());

        // Released lock.
        job::finish(conn, run, job::JobStatus::Completed, &t).unwrap();
        assert!(!advance(conn, &t, run).unwrap());
        assert_eq!(current(conn).unwrap(), None);
    }
}
