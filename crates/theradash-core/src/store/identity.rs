//! Identity store: local participant identities and their linkage state.
//!
//! An identity starts as a `placeholder` when the registry (or the monitored
//! account list) knows about a participant whose event-store account is not
//! yet verified, and becomes `resolved` once the account is confirmed. The
//! transition is one-way; a trigger in the schema rejects any update that
//! would clear or change a resolved identity's account.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{date_to_sql, opt_date_column, opt_ts_column, ts_to_sql};
use crate::records::RegistryRecord;

/// Staff label given to directly monitored accounts with no registry record.
pub const EXTERNAL_TESTER_STAFF: &str = "External Tester";

/// Whether an identity is linked to a verified event-store account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkageState {
    Placeholder,
    Resolved,
}

impl LinkageState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Placeholder => "placeholder",
            Self::Resolved => "resolved",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "placeholder" => Some(Self::Placeholder),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A local participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub local_id: i64,
    pub external_account_id: Option<String>,
    pub observed_account_id: Option<String>,
    pub project_id: Option<String>,
    pub registry_record_id: Option<String>,
    pub linkage: LinkageState,
    pub display_identifier: Option<String>,
    pub assigned_staff: Option<String>,
    pub study_start: Option<NaiveDate>,
    pub study_end: Option<NaiveDate>,
    pub dropped: bool,
    pub dropped_surveys: bool,
    pub full_refetch: bool,
    pub active: bool,
    pub last_seen_run: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Identity {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self.linkage, LinkageState::Resolved)
    }
}

const IDENTITY_COLUMNS: &str = "local_id, external_account_id, observed_account_id, project_id, \
     registry_record_id, linkage_state, display_identifier, assigned_staff, study_start, \
     study_end, dropped, dropped_surveys, full_refetch, active, last_seen_run, last_synced_at";

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let linkage_raw: String = row.get(5)?;
    let linkage = LinkageState::parse(&linkage_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown linkage state: {linkage_raw}").into(),
        )
    })?;
    Ok(Identity {
        local_id: row.get(0)?,
        external_account_id: row.get(1)?,
        observed_account_id: row.get(2)?,
        project_id: row.get(3)?,
        registry_record_id: row.get(4)?,
        linkage,
        display_identifier: row.get(6)?,
        assigned_staff: row.get(7)?,
        study_start: opt_date_column(row, 8)?,
        study_end: opt_date_column(row, 9)?,
        dropped: row.get::<_, i64>(10)? != 0,
        dropped_surveys: row.get::<_, i64>(11)? != 0,
        full_refetch: row.get::<_, i64>(12)? != 0,
        active: row.get::<_, i64>(13)? != 0,
        last_seen_run: row.get(14)?,
        last_synced_at: opt_ts_column(row, 15)?,
    })
}

fn query_one(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Identity>> {
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities {where_clause} LIMIT 1");
    conn.query_row(&sql, params, identity_from_row)
        .optional()
        .context("Failed to query identity")
}

// ============================================================================
// Lookups
// ============================================================================

pub fn get(conn: &Connection, local_id: i64) -> Result<Option<Identity>> {
    query_one(conn, "WHERE local_id = ?", params![local_id])
}

/// The resolved identity linked to an event-store account.
pub fn find_by_account(conn: &Connection, account_id: &str) -> Result<Option<Identity>> {
    query_one(conn, "WHERE external_account_id = ?", params![account_id])
}

/// The identity holding a registry key.
///
/// A key can be held by more than one row when an account was linked to a
/// different identity than the key's placeholder; the most recently synced
/// row wins.
pub fn find_by_registry_key(
    conn: &Connection,
    project_id: &str,
    record_id: &str,
) -> Result<Option<Identity>> {
    query_one(
        conn,
        "WHERE project_id = ? AND registry_record_id = ?
         ORDER BY last_synced_at DESC, local_id DESC",
        params![project_id, record_id],
    )
}

/// A placeholder holding a registry key, if any.
pub fn find_placeholder_by_registry_key(
    conn: &Connection,
    project_id: &str,
    record_id: &str,
) -> Result<Option<Identity>> {
    query_one(
        conn,
        "WHERE project_id = ? AND registry_record_id = ? AND linkage_state = 'placeholder'
         ORDER BY last_synced_at DESC, local_id DESC",
        params![project_id, record_id],
    )
}

/// A placeholder created for a monitored account (no registry key).
pub fn find_unregistered_placeholder(
    conn: &Connection,
    observed_account_id: &str,
) -> Result<Option<Identity>> {
    query_one(
        conn,
        "WHERE observed_account_id = ? AND linkage_state = 'placeholder'
           AND registry_record_id IS NULL
         ORDER BY local_id DESC",
        params![observed_account_id],
    )
}

/// All identities, optionally only active ones, in creation order.
pub fn list(conn: &Connection, active_only: bool) -> Result<Vec<Identity>> {
    let sql = format!(
        "SELECT {IDENTITY_COLUMNS} FROM identities {} ORDER BY local_id",
        if active_only { "WHERE active = 1" } else { "" }
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare identity list")?;
    let rows = stmt
        .query_map([], identity_from_row)
        .context("Failed to list identities")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read identity row")
}

/// Accounts whose full history is fetched on every run.
pub fn full_refetch_accounts(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT external_account_id FROM identities
             WHERE full_refetch = 1 AND active = 1 AND linkage_state = 'resolved'
             ORDER BY local_id",
        )
        .context("Failed to prepare full-refetch query")?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .context("Failed to query full-refetch accounts")?;
    rows.collect::<rusqlite::Result<Vec<String>>>()
        .context("Failed to read full-refetch account")
}

// ============================================================================
// Writes
// ============================================================================

/// Create a placeholder identity.
pub fn insert_placeholder(
    conn: &Connection,
    registry_key: Option<(&str, &str)>,
    observed_account_id: Option<&str>,
    run_seq: i64,
    now: &DateTime<Utc>,
) -> Result<i64> {
    let (project_id, record_id) = registry_key.unzip();
    conn.execute(
        "INSERT INTO identities (
            observed_account_id, project_id, registry_record_id, linkage_state,
            active, last_seen_run, last_synced_at, created_at
        ) VALUES (?, ?, ?, 'placeholder', 1, ?, ?, ?)",
        params![
            observed_account_id,
            project_id,
            record_id,
            run_seq,
            ts_to_sql(now),
            ts_to_sql(now),
        ],
    )
    .context("Failed to insert placeholder identity")?;
    Ok(conn.last_insert_rowid())
}

/// Create an identity already linked to a verified account.
pub fn insert_resolved(
    conn: &Connection,
    account_id: &str,
    registry_key: Option<(&str, &str)>,
    run_seq: i64,
    now: &DateTime<Utc>,
) -> Result<i64> {
    let (project_id, record_id) = registry_key.unzip();
    conn.execute(
        "INSERT INTO identities (
            external_account_id, observed_account_id, project_id, registry_record_id,
            linkage_state, display_identifier, active, last_seen_run, last_synced_at,
            created_at
        ) VALUES (?1, ?1, ?2, ?3, 'resolved', ?1, 1, ?4, ?5, ?5)",
        params![account_id, project_id, record_id, run_seq, ts_to_sql(now)],
    )
    .with_context(|| format!("Failed to insert resolved identity for {account_id}"))?;
    Ok(conn.last_insert_rowid())
}

/// Link a placeholder to a verified account.
pub fn promote(conn: &Connection, local_id: i64, account_id: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE identities
             SET linkage_state = 'resolved', external_account_id = ?2,
                 observed_account_id = ?2,
                 display_identifier = COALESCE(display_identifier, ?2)
             WHERE local_id = ?1 AND linkage_state = 'placeholder'",
            params![local_id, account_id],
        )
        .with_context(|| format!("Failed to promote identity {local_id}"))?;
    if changed != 1 {
        bail!("Identity {local_id} is not a placeholder and cannot be promoted");
    }
    Ok(())
}

/// Remember (or forget) the unverified account a placeholder was seen with.
///
/// No effect on resolved identities.
pub fn set_observed_account(
    conn: &Connection,
    local_id: i64,
    observed_account_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE identities SET observed_account_id = ?2
         WHERE local_id = ?1 AND linkage_state = 'placeholder'",
        params![local_id, observed_account_id],
    )
    .context("Failed to update observed account")?;
    Ok(())
}

/// Overwrite the registry-owned fields of an identity and mark it seen.
pub fn apply_registry_record(
    conn: &Connection,
    local_id: i64,
    project_id: &str,
    record: &RegistryRecord,
    run_seq: i64,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE identities SET
            project_id = ?2,
            registry_record_id = ?3,
            display_identifier = COALESCE(?4, display_identifier),
            assigned_staff = ?5,
            study_start = ?6,
            study_end = ?7,
            dropped = ?8,
            dropped_surveys = ?9,
            active = 1,
            last_seen_run = ?10,
            last_synced_at = ?11
         WHERE local_id = ?1",
        params![
            local_id,
            project_id,
            record.record_id,
            record.username,
            record.assigned_staff,
            record.study_start.as_ref().map(date_to_sql),
            record.study_end.as_ref().map(date_to_sql),
            record.dropped,
            record.dropped_surveys,
            run_seq,
            ts_to_sql(now),
        ],
    )
    .with_context(|| format!("Failed to apply registry record to identity {local_id}"))?;
    replace_custom_fields(conn, local_id, &record.custom_fields, now)
}

/// Replace an identity's custom fields with exactly `fields`.
pub fn replace_custom_fields(
    conn: &Connection,
    local_id: i64,
    fields: &BTreeMap<String, String>,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "DELETE FROM identity_custom_fields WHERE local_id = ?",
        params![local_id],
    )
    .context("Failed to clear custom fields")?;
    let mut stmt = conn
        .prepare(
            "INSERT INTO identity_custom_fields (local_id, field_label, field_value, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .context("Failed to prepare custom field insert")?;
    let updated_at = ts_to_sql(now);
    for (label, value) in fields {
        stmt.execute(params![local_id, label, value, updated_at])
            .with_context(|| format!("Failed to store custom field '{label}'"))?;
    }
    Ok(())
}

pub fn custom_fields(conn: &Connection, local_id: i64) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn
        .prepare(
            "SELECT field_label, field_value FROM identity_custom_fields
             WHERE local_id = ? ORDER BY field_label",
        )
        .context("Failed to prepare custom field query")?;
    let rows = stmt
        .query_map(params![local_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("Failed to query custom fields")?;
    rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
        .context("Failed to read custom field")
}

/// Overwrite the label shown for an identity.
pub fn set_display_identifier(conn: &Connection, local_id: i64, identifier: &str) -> Result<()> {
    conn.execute(
        "UPDATE identities SET display_identifier = ?2 WHERE local_id = ?1",
        params![local_id, identifier],
    )
    .context("Failed to update display identifier")?;
    Ok(())
}

/// Mark a directly monitored identity: always fully re-fetched, and labelled
/// as an external tester when no registry record describes it.
pub fn mark_monitored(
    conn: &Connection,
    local_id: i64,
    run_seq: i64,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE identities SET
            full_refetch = 1,
            assigned_staff = CASE WHEN registry_record_id IS NULL THEN ?4 ELSE assigned_staff END,
            display_identifier = COALESCE(display_identifier, observed_account_id),
            active = 1,
            last_seen_run = ?2,
            last_synced_at = ?3
         WHERE local_id = ?1",
        params![local_id, run_seq, ts_to_sql(now), EXTERNAL_TESTER_STAFF],
    )
    .context("Failed to mark identity monitored")?;
    Ok(())
}

/// Clear the full-refetch flag everywhere; the monitored list re-sets it.
pub fn reset_full_refetch(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE identities SET full_refetch = 0 WHERE full_refetch = 1", [])
        .context("Failed to reset full-refetch flags")?;
    Ok(())
}

/// Deactivate every active identity not seen in `run_seq`.
///
/// Identities belonging to `exempt_projects` keep their state; those projects
/// could not be fetched this run, so their absence means nothing.
pub fn deactivate_unseen(conn: &Connection, run_seq: i64, exempt_projects: &[String]) -> Result<usize> {
    let exempt = serde_json::to_string(exempt_projects).context("Failed to encode project list")?;
    let changed = conn
        .execute(
            "UPDATE identities SET active = 0
             WHERE active = 1
               AND (last_seen_run IS NULL OR last_seen_run != ?1)
               AND (project_id IS NULL
                    OR project_id NOT IN (SELECT value FROM json_each(?2)))",
            params![run_seq, exempt],
        )
        .context("Failed to deactivate unseen identities")?;
    Ok(changed)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncDb;
    use chrono::TimeZone;

    fn setup() -> SyncDb {
        let db = SyncDb::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
    }

    fn record(id: &str) -> RegistryRecord {
        RegistryRecord {
            record_id: id.to_string(),
            account_id: None,
            assigned_staff: Some("Dana".to_string()),
            username: Some(format!("user{id}")),
            study_start: NaiveDate::from_ymd_opt(2025, 3, 1),
            study_end: None,
            dropped: false,
            dropped_surveys: true,
            custom_fields: BTreeMap::from([("arm".to_string(), "B".to_string())]),
        }
    }

    #[test]
    fn test_placeholder_then_promote() {
        let db = setup();
        let conn = db.conn();

        let id = insert_placeholder(conn, Some(("p1", "42")), None, 1, &now()).unwrap();
        let found = find_by_registry_key(conn, "p1", "42").unwrap().unwrap();
        assert_eq!(found.local_id, id);
        assert_eq!(found.linkage, LinkageState::Placeholder);
        assert_eq!(found.external_account_id, None);

        promote(conn, id, "acct-123").unwrap();
        let resolved = find_by_account(conn, "acct-123").unwrap().unwrap();
        assert_eq!(resolved.local_id, id);
        assert!(resolved.is_resolved());

        // A second promotion is refused.
        assert!(promote(conn, id, "acct-999").is_err());
    }

    #[test]
    fn test_resolved_account_cannot_change() {
        let db = setup();
        let conn = db.conn();
        let id = insert_resolved(conn, "acct-1", None, 1, &now()).unwrap();

        let err = conn
            .execute(
                "UPDATE identities SET external_account_id = 'acct-2' WHERE local_id = ?",
                params![id],
            )
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));

        let err = conn
            .execute(
                "UPDATE identities SET linkage_state = 'placeholder', external_account_id = NULL
                 WHERE local_id = ?",
                params![id],
            )
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn test_identities_cannot_be_deleted() {
        let db = setup();
        insert_placeholder(db.conn(), None, Some("acct"), 1, &now()).unwrap();
        assert!(db.conn().execute("DELETE FROM identities", []).is_err());
    }

    #[test]
    fn test_apply_registry_record_replaces_custom_fields() {
        let db = setup();
        let conn = db.conn();
        let id = insert_placeholder(conn, Some(("p1", "7")), None, 1, &now()).unwrap();

        apply_registry_record(conn, id, "p1", &record("7"), 2, &now()).unwrap();
        let identity = get(conn, id).unwrap().unwrap();
        assert_eq!(identity.assigned_staff.as_deref(), Some("Dana"));
        assert_eq!(identity.display_identifier.as_deref(), Some("user7"));
        assert_eq!(identity.study_start, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert!(identity.dropped_surveys);
        assert_eq!(identity.last_seen_run, Some(2));
        assert_eq!(custom_fields(conn, id).unwrap()["arm"], "B");

        let mut changed = record("7");
        changed.custom_fields = BTreeMap::from([("phq9".to_string(), "11".to_string())]);
        apply_registry_record(conn, id, "p1", &changed, 3, &now()).unwrap();
        let fields = custom_fields(conn, id).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["phq9"], "11");
    }

    #[test]
    fn test_registry_key_prefers_most_recent() {
        let db = setup();
        let conn = db.conn();
        let older = insert_placeholder(conn, Some(("p1", "1")), None, 1, &now()).unwrap();
        let newer = insert_resolved(conn, "acct", None, 1, &now()).unwrap();
        apply_registry_record(
            conn,
            newer,
            "p1",
            &record("1"),
            2,
            &(now() + chrono::Duration::hours(1)),
        )
        .unwrap();

        let found = find_by_registry_key(conn, "p1", "1").unwrap().unwrap();
        assert_eq!(found.local_id, newer);
        let placeholder = find_placeholder_by_registry_key(conn, "p1", "1").unwrap().unwrap();
        assert_eq!(placeholder.local_id, older);
    }

    #[test]
    fn test_monitored_identity_gets_external_tester_staff() {
        let db = setup();
        let conn = db.conn();
        let id = insert_placeholder(conn, None, Some("acct-x"), 1, &now()).unwrap();
        mark_monitored(conn, id, 1, &now()).unwrap();

        let identity = get(conn, id).unwrap().unwrap();
        assert!(identity.full_refetch);
        assert_eq!(identity.assigned_staff.as_deref(), Some(EXTERNAL_TESTER_STAFF));
        assert_eq!(identity.display_identifier.as_deref(), Some("acct-x"));
        assert_eq!(
            find_unregistered_placeholder(conn, "acct-x").unwrap().map(|i| i.local_id),
            Some(id)
        );

        // Placeholders are never fully re-fetched; there's no account to fetch.
        assert!(full_refetch_accounts(conn).unwrap().is_empty());
        promote(conn, id, "acct-x").unwrap();
        assert_eq!(full_refetch_accounts(conn).unwrap(), vec!["acct-x"]);

        reset_full_refetch(conn).unwrap();
        assert!(full_refetch_accounts(conn).unwrap().is_empty());
    }

    #[test]
    fn test_deactivate_unseen_respects_exempt_projects() {
        let db = setup();
        let conn = db.conn();
        let seen = insert_placeholder(conn, Some(("p1", "1")), None, 2, &now()).unwrap();
        let stale = insert_placeholder(conn, Some(("p1", "2")), None, 1, &now()).unwrap();
        let exempt = insert_placeholder(conn, Some(("p2", "3")), None, 1, &now()).unwrap();
        let loose = insert_resolved(conn, "acct", None, 1, &now()).unwrap();

        let changed = deactivate_unseen(conn, 2, &["p2".to_string()]).unwrap();
        assert_eq!(changed, 2);

        let active = |id| get(conn, id).unwrap().unwrap().active;
        assert!(active(seen));
        assert!(!active(stale));
        assert!(active(exempt));
        assert!(!active(loose));
        assert_eq!(list(conn, true).unwrap().len(), 2);
        assert_eq!(list(conn, false).unwrap().len(), 4);
    }
}
