//! Local relational store for theradash.
//!
//! Holds identities, conversations, messages, the watermark, the run lock and
//! the sync log in one SQLite database. Writers take a `&Connection` so the
//! same functions work inside a phase transaction
//! (`SyncDb::conn().unchecked_transaction()`) and outside one.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

pub mod events;
pub mod identity;
pub mod job;
pub mod projects;
pub mod sync_log;
pub mod watermark;

pub use events::{ConversationRow, MessageRow, PendingAlert};
pub use identity::{Identity, LinkageState};
pub use job::{JobState, JobStatus, LockAttempt};
pub use projects::ProjectRow;
pub use sync_log::{RunStatus, SyncLogEntry};
pub use watermark::Watermark;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

/// The sync engine's database.
pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::configure(conn)
    }

    /// Create an in-memory database (tests and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        // Two processes may race on the run lock; wait instead of failing.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(Self { conn })
    }

    /// Open a file database and make sure its schema exists.
    pub fn open_initialized(path: &Path) -> Result<Self> {
        let db = Self::open(path)?;
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema.
    ///
    /// Creates all tables, indexes and triggers if they don't exist.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Get a reference to the underlying connection.
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Row counts of the synced tables, for status output and tests.
    pub fn table_counts(&self) -> Result<TableCounts> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("Failed to count {table}"))?;
            Ok(n as usize)
        };
        Ok(TableCounts {
            identities: count("identities")?,
            conversations: count("conversations")?,
            messages: count("messages")?,
            sync_runs: count("sync_log")?,
        })
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TableCounts {
    pub identities: usize,
    pub conversations: usize,
    pub messages: usize,
    pub sync_runs: usize,
}

// ============================================================================
// Column helpers
// ============================================================================

/// Timestamps are stored as fixed-width RFC 3339 UTC so that string
/// comparison in SQL matches time order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn date_to_sql(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn opt_date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

// ============================================================================
// Schema SQL
// ============================================================================

const SCHEMA_SQL: &str = r"
-- RUN LOCK
CREATE TABLE IF NOT EXISTS job_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL DEFAULT 'idle'
        CHECK (state IN ('idle', 'running', 'completed', 'failed')),
    run_seq INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    finished_at TEXT
);

INSERT OR IGNORE INTO job_state (id) VALUES (1);

-- WATERMARK
CREATE TABLE IF NOT EXISTS watermark (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value TEXT,
    advanced_at TEXT,
    advanced_by_run INTEGER
);

INSERT OR IGNORE INTO watermark (id) VALUES (1);

-- PROJECTS
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    last_reconciled_at TEXT,
    last_error TEXT,
    last_error_at TEXT
);

-- IDENTITIES
CREATE TABLE IF NOT EXISTS identities (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_account_id TEXT UNIQUE,
    observed_account_id TEXT,
    project_id TEXT,
    registry_record_id TEXT,
    linkage_state TEXT NOT NULL
        CHECK (linkage_state IN ('placeholder', 'resolved')),
    display_identifier TEXT,
    assigned_staff TEXT,
    study_start TEXT,
    study_end TEXT,
    dropped INTEGER NOT NULL DEFAULT 0,
    dropped_surveys INTEGER NOT NULL DEFAULT 0,
    full_refetch INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    last_seen_run INTEGER,
    last_synced_at TEXT,
    created_at TEXT NOT NULL,
    CHECK ((linkage_state = 'resolved') = (external_account_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_identities_registry_key
    ON identities(project_id, registry_record_id);
CREATE INDEX IF NOT EXISTS idx_identities_observed ON identities(observed_account_id);
CREATE INDEX IF NOT EXISTS idx_identities_active ON identities(active);

CREATE TRIGGER IF NOT EXISTS trg_identities_linkage_one_way
BEFORE UPDATE OF external_account_id, linkage_state ON identities
WHEN OLD.linkage_state = 'resolved'
    AND (NEW.linkage_state != 'resolved'
         OR NEW.external_account_id IS NOT OLD.external_account_id)
BEGIN
    SELECT RAISE(ABORT, 'resolved identity linkage is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_identities_no_delete
BEFORE DELETE ON identities
BEGIN
    SELECT RAISE(ABORT, 'identities are deactivated, never deleted');
END;

-- CUSTOM FIELDS
CREATE TABLE IF NOT EXISTS identity_custom_fields (
    local_id INTEGER NOT NULL REFERENCES identities(local_id),
    field_label TEXT NOT NULL,
    field_value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (local_id, field_label)
);

-- CONVERSATIONS
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    local_id INTEGER NOT NULL REFERENCES identities(local_id),
    prompt TEXT,
    started_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_local_id ON conversations(local_id);

-- MESSAGES
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    local_id INTEGER NOT NULL REFERENCES identities(local_id),
    text TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    is_risky INTEGER NOT NULL DEFAULT 0,
    alert_sent INTEGER NOT NULL DEFAULT 0,
    alert_pending INTEGER NOT NULL DEFAULT 0,
    alert_attempts INTEGER NOT NULL DEFAULT 0,
    last_alert_error TEXT,
    alert_sent_at TEXT,
    reviewed INTEGER NOT NULL DEFAULT 0,
    inserted_run INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_local_id ON messages(local_id);
CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);
CREATE INDEX IF NOT EXISTS idx_messages_alert_pending ON messages(alert_pending)
    WHERE alert_pending = 1;

CREATE TRIGGER IF NOT EXISTS trg_messages_alert_monotone
BEFORE UPDATE OF alert_sent ON messages
WHEN OLD.alert_sent = 1 AND NEW.alert_sent = 0
BEGIN
    SELECT RAISE(ABORT, 'alert_sent cannot be cleared');
END;

-- SYNC LOG
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_seq INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    users_synced INTEGER NOT NULL DEFAULT 0,
    conversations_synced INTEGER NOT NULL DEFAULT 0,
    messages_synced INTEGER NOT NULL DEFAULT 0,
    alerts_sent INTEGER NOT NULL DEFAULT 0,
    record_errors INTEGER NOT NULL DEFAULT 0,
    notification_errors INTEGER NOT NULL DEFAULT 0,
    duration_seconds REAL NOT NULL,
    error TEXT,
    watermark_before TEXT,
    watermark_after TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_log_completed_at ON sync_log(completed_at);

CREATE TRIGGER IF NOT EXISTS trg_sync_log_immutable
BEFORE UPDATE ON sync_log
BEGIN
    SELECT RAISE(ABORT, 'sync log entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_sync_log_no_delete
BEFORE DELETE ON sync_log
BEGIN
    SELECT RAISE(ABORT, 'sync log is append-only');
END;
";

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_open_and_init_schema() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("theradash.db");

        let db = SyncDb::open(&db_path).unwrap();
        db.init_schema().unwrap();
        assert!(db_path.exists());

        let counts = db.table_counts().unwrap();
        assert_eq!(counts.identities, 0);
        assert_eq!(counts.sync_runs, 0);
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("theradash.db");
        {
            let db = SyncDb::open_initialized(&db_path).unwrap();
            let now = Utc::now();
            let run = job::try_acquire(db.conn(), &now, std::time::Duration::from_secs(60))
                .unwrap()
                .run_seq()
                .unwrap();
            assert!(watermark::advance(db.conn(), &now, run).unwrap());
        }
        let db = SyncDb::open_initialized(&db_path).unwrap();
        // Singleton rows survive re-initialization.
        assert!(watermark::current(db.conn()).unwrap().is_some());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(ts_to_sql(&a) < ts_to_sql(&b));
        assert_eq!(ts_to_sql(&a).len(), ts_to_sql(&b).len());
    }
}
