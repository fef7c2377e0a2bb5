//! Append-only audit log of sync runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{opt_ts_column, ts_column, ts_to_sql};

/// How a logged run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One immutable sync log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub run_seq: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub users_synced: usize,
    pub conversations_synced: usize,
    pub messages_synced: usize,
    pub alerts_sent: usize,
    pub record_errors: usize,
    pub notification_errors: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
}

pub fn append(conn: &Connection, entry: &SyncLogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_log (
            run_seq, status, started_at, completed_at, users_synced, conversations_synced,
            messages_synced, alerts_sent, record_errors, notification_errors,
            duration_seconds, error, watermark_before, watermark_after
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            entry.run_seq,
            entry.status.as_str(),
            ts_to_sql(&entry.started_at),
            ts_to_sql(&entry.completed_at),
            entry.users_synced as i64,
            entry.conversations_synced as i64,
            entry.messages_synced as i64,
            entry.alerts_sent as i64,
            entry.record_errors as i64,
            entry.notification_errors as i64,
            entry.duration_seconds,
            entry.error,
            entry.watermark_before.as_ref().map(ts_to_sql),
            entry.watermark_after.as_ref().map(ts_to_sql),
        ],
    )
    .with_context(|| format!("Failed to write sync log for run {}", entry.run_seq))?;
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let raw_status: String = row.get(1)?;
    let status = match raw_status.as_str() {
        "completed" => RunStatus::Completed,
        _ => RunStatus::Failed,
    };
    let count = |idx: usize| -> rusqlite::Result<usize> { Ok(row.get::<_, i64>(idx)? as usize) };
    Ok(SyncLogEntry {
        run_seq: row.get(0)?,
        status,
        started_at: ts_column(row, 2)?,
        completed_at: ts_column(row, 3)?,
        users_synced: count(4)?,
        conversations_synced: count(5)?,
        messages_synced: count(6)?,
        alerts_sent: count(7)?,
        record_errors: count(8)?,
        notification_errors: count(9)?,
        duration_seconds: row.get(10)?,
        error: row.get(11)?,
        watermark_before: opt_ts_column(row, 12)?,
        watermark_after: opt_ts_column(row, 13)?,
    })
}

/// The most recent entries, newest first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<SyncLogEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT run_seq, status, started_at, completed_at, users_synced,
                    conversations_synced, messages_synced, alerts_sent, record_errors,
                    notification_errors, duration_seconds, error, watermark_before,
                    watermark_after
             FROM sync_log ORDER BY id DESC LIMIT ?",
        )
        .context("Failed to prepare sync log query")?;
    let rows = stmt
        .query_map(params![limit as i64], entry_from_row)
        .context("Failed to query sync log")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read sync log row")
}

pub fn latest(conn: &Connection) -> Result<Option<SyncLogEntry>> {
    Ok(recent(conn, 1)?.into_iter().next())
}
