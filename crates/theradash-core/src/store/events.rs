//! Conversations and messages.
//!
//! Both are keyed by their event-store id and are written once. After
//! insert, only the notifier bookkeeping columns of a message change, and
//! `alert_sent` can only go from 0 to 1 (enforced by a schema trigger).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{opt_ts_column, ts_column, ts_to_sql};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRow {
    pub id: i64,
    pub external_id: String,
    pub local_id: i64,
    pub prompt: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub external_id: String,
    pub conversation_id: i64,
    pub local_id: i64,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub is_risky: bool,
    pub alert_sent: bool,
    pub alert_pending: bool,
    pub alert_attempts: i64,
    pub last_alert_error: Option<String>,
    pub alert_sent_at: Option<DateTime<Utc>>,
    pub reviewed: bool,
    pub inserted_run: Option<i64>,
}

/// A risky message waiting for its alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlert {
    pub message_id: i64,
    pub external_id: String,
    pub account_id: String,
    pub text: String,
}

/// A message about to be inserted.
#[derive(Debug, Clone, Copy)]
pub struct NewMessage<'a> {
    pub external_id: &'a str,
    pub conversation_id: i64,
    pub local_id: i64,
    pub text: &'a str,
    pub sent_at: &'a DateTime<Utc>,
    pub is_risky: bool,
    /// Queue an alert for this message (ignored unless risky).
    pub queue_alert: bool,
}

// ============================================================================
// Conversations
// ============================================================================

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        local_id: row.get(2)?,
        prompt: row.get(3)?,
        started_at: opt_ts_column(row, 4)?,
    })
}

pub fn get_conversation(conn: &Connection, external_id: &str) -> Result<Option<ConversationRow>> {
    conn.query_row(
        "SELECT id, external_id, local_id, prompt, started_at
         FROM conversations WHERE external_id = ?",
        params![external_id],
        conversation_from_row,
    )
    .optional()
    .context("Failed to query conversation")
}

pub fn insert_conversation(
    conn: &Connection,
    external_id: &str,
    local_id: i64,
    prompt: Option<&str>,
    started_at: Option<&DateTime<Utc>>,
    now: &DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO conversations (external_id, local_id, prompt, started_at, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            external_id,
            local_id,
            prompt,
            started_at.map(ts_to_sql),
            ts_to_sql(now)
        ],
    )
    .with_context(|| format!("Failed to insert conversation {external_id}"))?;
    Ok(conn.last_insert_rowid())
}

/// Fill in prompt / start time from a re-observed event.
///
/// Only non-empty values are applied; an event never blanks a stored value.
/// Returns `true` if anything changed.
pub fn refresh_conversation(
    conn: &Connection,
    id: i64,
    prompt: Option<&str>,
    started_at: Option<&DateTime<Utc>>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE conversations
             SET prompt = COALESCE(?2, prompt), started_at = COALESCE(?3, started_at)
             WHERE id = ?1
               AND ((?2 IS NOT NULL AND prompt IS NOT ?2)
                    OR (?3 IS NOT NULL AND started_at IS NOT ?3))",
            params![id, prompt, started_at.map(ts_to_sql)],
        )
        .context("Failed to refresh conversation")?;
    Ok(changed > 0)
}

// ============================================================================
// Messages
// ============================================================================

const MESSAGE_COLUMNS: &str = "id, external_id, conversation_id, local_id, text, sent_at, \
     is_risky, alert_sent, alert_pending, alert_attempts, last_alert_error, alert_sent_at, \
     reviewed, inserted_run";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        conversation_id: row.get(2)?,
        local_id: row.get(3)?,
        text: row.get(4)?,
        sent_at: ts_column(row, 5)?,
        is_risky: row.get::<_, i64>(6)? != 0,
        alert_sent: row.get::<_, i64>(7)? != 0,
        alert_pending: row.get::<_, i64>(8)? != 0,
        alert_attempts: row.get(9)?,
        last_alert_error: row.get(10)?,
        alert_sent_at: opt_ts_column(row, 11)?,
        reviewed: row.get::<_, i64>(12)? != 0,
        inserted_run: row.get(13)?,
    })
}

pub fn get_message(conn: &Connection, external_id: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?"),
        params![external_id],
        message_from_row,
    )
    .optional()
    .context("Failed to query message")
}

pub fn message_exists(conn: &Connection, external_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE external_id = ?)",
        params![external_id],
        |row| row.get(0),
    )
    .context("Failed to check message existence")
}

/// Insert a message. A risky message starts out pending an alert unless
/// `queue_alert` is off.
pub fn insert_message(
    conn: &Connection,
    message: &NewMessage<'_>,
    run_seq: Option<i64>,
    now: &DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO messages (
            external_id, conversation_id, local_id, text, sent_at, is_risky,
            alert_pending, inserted_run, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.external_id,
            message.conversation_id,
            message.local_id,
            message.text,
            ts_to_sql(message.sent_at),
            message.is_risky,
            message.is_risky && message.queue_alert,
            run_seq,
            ts_to_sql(now),
        ],
    )
    .with_context(|| format!("Failed to insert message {}", message.external_id))?;
    Ok(conn.last_insert_rowid())
}

const PENDING_ALERT_SELECT: &str = "SELECT m.id, m.external_id,
        COALESCE(i.external_account_id, i.observed_account_id, ''), m.text
     FROM messages m JOIN identities i ON i.local_id = m.local_id";

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingAlert> {
    Ok(PendingAlert {
        message_id: row.get(0)?,
        external_id: row.get(1)?,
        account_id: row.get(2)?,
        text: row.get(3)?,
    })
}

fn query_alerts(conn: &Connection, where_clause: &str) -> Result<Vec<PendingAlert>> {
    let sql = format!("{PENDING_ALERT_SELECT} {where_clause} ORDER BY m.sent_at, m.id");
    let mut stmt = conn.prepare(&sql).context("Failed to prepare alert query")?;
    let rows = stmt
        .query_map([], pending_from_row)
        .context("Failed to query alerts")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read alert row")
}

/// Risky messages whose alert has not gone out since they were ingested.
pub fn pending_alerts(conn: &Connection) -> Result<Vec<PendingAlert>> {
    query_alerts(
        conn,
        "WHERE m.is_risky = 1 AND m.alert_sent = 0 AND m.alert_pending = 1",
    )
}

/// Every risky message without a successful alert, pending or not.
pub fn unsent_risky(conn: &Connection) -> Result<Vec<PendingAlert>> {
    query_alerts(conn, "WHERE m.is_risky = 1 AND m.alert_sent = 0")
}

/// Look up a single alert candidate by message id.
pub fn alert_candidate(conn: &Connection, message_id: i64) -> Result<Option<PendingAlert>> {
    conn.query_row(
        &format!("{PENDING_ALERT_SELECT} WHERE m.id = ? AND m.is_risky = 1 AND m.alert_sent = 0"),
        params![message_id],
        pending_from_row,
    )
    .optional()
    .context("Failed to query alert candidate")
}

/// Record a successful alert. Returns `false` if it was already recorded.
pub fn mark_alert_sent(conn: &Connection, message_id: i64, now: &DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE messages
             SET alert_sent = 1, alert_pending = 0, alert_sent_at = ?2,
                 alert_attempts = alert_attempts + 1, last_alert_error = NULL
             WHERE id = ?1 AND alert_sent = 0",
            params![message_id, ts_to_sql(now)],
        )
        .context("Failed to mark alert sent")?;
    Ok(changed == 1)
}

/// Record a failed alert. The message stays pending for the next run.
pub fn record_alert_failure(conn: &Connection, message_id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages
         SET alert_pending = 1, alert_attempts = alert_attempts + 1, last_alert_error = ?2
         WHERE id = ?1 AND alert_sent = 0",
        params![message_id, error],
    )
    .context("Failed to record alert failure")?;
    Ok(())
}
