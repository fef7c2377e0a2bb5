//! Registry reconciler.
//!
//! Maps registry participants (and directly monitored event-store accounts)
//! onto local identities. Account existence is checked before the phase
//! transaction opens, so no collaborator call runs while the database is
//! locked for writing. Afterwards the display identifier of every resolved
//! identity touched this run is refreshed from the auth provider.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::report::{Applied, PhaseReport, SkipReason};
use crate::clients::{call_with_retry, EventStoreClient, RegistryClient};
use crate::config::{ProjectConfig, RetryPolicy};
use crate::errors::{SyncError, SyncResultT};
use crate::records::{DecodeError, RegistryRecord};
use crate::store::{identity, projects, SyncDb};

/// Result of an `account_exists` check.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AccountCheck {
    Exists,
    Missing,
    Failed(String),
}

/// Outcome of one registry project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectOutcome {
    pub project_id: String,
    pub report: PhaseReport,
    /// Set when the project's rows could not be fetched.
    pub error: Option<String>,
}

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub projects: Vec<ProjectOutcome>,
    pub accounts: PhaseReport,
    /// Identities touched this run.
    pub touched: BTreeSet<i64>,
    /// Accounts linked to an identity for the first time this run.
    pub newly_resolved: Vec<String>,
    /// Display identifiers replaced from auth profiles.
    pub identifiers_refreshed: usize,
}

impl ReconcileOutcome {
    /// Projects whose fetch failed.
    #[must_use]
    pub fn failed_projects(&self) -> Vec<String> {
        self.projects
            .iter()
            .filter(|p| p.error.is_some())
            .map(|p| p.project_id.clone())
            .collect()
    }

    /// First project-level error, for the run summary.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.projects
            .iter()
            .find_map(|p| p.error.as_ref().map(|e| format!("project {}: {e}", p.project_id)))
    }

    #[must_use]
    pub fn record_errors(&self) -> usize {
        self.projects.iter().map(|p| p.report.errors()).sum::<usize>() + self.accounts.errors()
    }
}

/// Reconciles registry projects and monitored accounts into the identity store.
pub struct Reconciler<'a, R, E> {
    db: &'a SyncDb,
    registry: &'a R,
    events: &'a E,
    retry: &'a RetryPolicy,
    run_seq: i64,
    now: DateTime<Utc>,
}

impl<'a, R: RegistryClient, E: EventStoreClient> Reconciler<'a, R, E> {
    pub const fn new(
        db: &'a SyncDb,
        registry: &'a R,
        events: &'a E,
        retry: &'a RetryPolicy,
        run_seq: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            db,
            registry,
            events,
            retry,
            run_seq,
            now,
        }
    }

    /// Reconcile every project, then the monitored account list.
    ///
    /// A project whose rows cannot be fetched is recorded as failed and the
    /// remaining projects continue. Local persistence errors abort.
    pub fn reconcile(
        &self,
        projects: &[ProjectConfig],
        monitored_accounts: &[String],
    ) -> SyncResultT<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        for project in projects {
            let project_outcome = self.reconcile_project(project, &mut outcome)?;
            outcome.projects.push(project_outcome);
        }
        outcome.accounts = self.reconcile_accounts(monitored_accounts, &mut outcome)?;
        outcome.identifiers_refreshed = self.refresh_identifiers(&outcome.touched)?;
        Ok(outcome)
    }

    fn reconcile_project(
        &self,
        project: &ProjectConfig,
        outcome: &mut ReconcileOutcome,
    ) -> SyncResultT<ProjectOutcome> {
        let operation = format!("fetch participants for project {}", project.id);
        let rows = match call_with_retry(self.retry, &operation, || {
            self.registry.fetch_participants(project)
        }) {
            Ok(rows) => rows,
            Err(err @ SyncError::Connectivity { .. }) => {
                tracing::error!(project = %project.id, error = %err, "registry fetch failed");
                projects::record_failure(
                    self.db.conn(),
                    &project.id,
                    &project.name,
                    &err.to_string(),
                    &self.now,
                )?;
                return Ok(ProjectOutcome {
                    project_id: project.id.clone(),
                    report: PhaseReport::default(),
                    error: Some(err.to_string()),
                });
            }
            Err(err) => return Err(err),
        };

        let mut report = PhaseReport::default();
        let mut decoded = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            match RegistryRecord::decode(row, project) {
                Ok(record) => decoded.push(record),
                Err(err) => report.record(
                    format!("{}/row{idx}", project.id),
                    Err(match err {
                        DecodeError::MissingRecordId => SkipReason::MissingRecordId,
                        other => SkipReason::Malformed(other.to_string()),
                    }),
                ),
            }
        }

        let checks = self.check_accounts(decoded.iter().filter_map(|r| r.account_id.as_deref()));

        let tx = self.db.conn().unchecked_transaction()?;
        for record in &decoded {
            let key = format!("{}/{}", project.id, record.record_id);
            let check = record.account_id.as_deref().and_then(|a| checks.get(a));
            let (local_id, applied) = self.apply_record(&tx, &project.id, record, check, outcome)?;
            outcome.touched.insert(local_id);
            match check {
                Some(AccountCheck::Failed(detail)) => report.record_degraded(
                    key,
                    applied,
                    SkipReason::AccountCheckFailed(detail.clone()),
                ),
                _ => report.record(key, Ok(applied)),
            }
        }
        projects::record_success(&tx, &project.id, &project.name, &self.now)?;
        tx.commit()?;

        tracing::info!(
            project = %project.id,
            rows = rows.len(),
            inserted = report.inserted,
            updated = report.updated,
            errors = report.errors(),
            "project reconciled"
        );
        Ok(ProjectOutcome {
            project_id: project.id.clone(),
            report,
            error: None,
        })
    }

    /// Apply one decoded registry record. Returns the identity it landed on.
    fn apply_record(
        &self,
        conn: &Connection,
        project_id: &str,
        record: &RegistryRecord,
        check: Option<&AccountCheck>,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(i64, Applied)> {
        let (run, now) = (self.run_seq, &self.now);
        let record_id = record.record_id.as_str();

        if let (Some(account), Some(AccountCheck::Exists)) = (record.account_id.as_deref(), check) {
            let (local_id, applied) =
                if let Some(existing) = identity::find_by_account(conn, account)? {
                    (existing.local_id, Applied::Updated)
                } else if let Some(placeholder) =
                    identity::find_placeholder_by_registry_key(conn, project_id, record_id)?
                {
                    identity::promote(conn, placeholder.local_id, account)?;
                    tracing::info!(
                        local_id = placeholder.local_id,
                        project = project_id,
                        record = record_id,
                        account,
                        "placeholder promoted"
                    );
                    outcome.newly_resolved.push(account.to_string());
                    (placeholder.local_id, Applied::Updated)
                } else {
                    let id = identity::insert_resolved(
                        conn,
                        account,
                        Some((project_id, record_id)),
                        run,
                        now,
                    )?;
                    outcome.newly_resolved.push(account.to_string());
                    (id, Applied::Inserted)
                };
            identity::apply_registry_record(conn, local_id, project_id, record, run, now)?;
            return Ok((local_id, applied));
        }

        // No verified account: the registry key is the identity's only handle.
        let (local_id, applied) =
            match identity::find_by_registry_key(conn, project_id, record_id)? {
                Some(existing) => (existing.local_id, Applied::Updated),
                None => {
                    let id = identity::insert_placeholder(
                        conn,
                        Some((project_id, record_id)),
                        record.account_id.as_deref(),
                        run,
                        now,
                    )?;
                    (id, Applied::Inserted)
                }
            };
        identity::set_observed_account(conn, local_id, record.account_id.as_deref())?;
        identity::apply_registry_record(conn, local_id, project_id, record, run, now)?;
        Ok((local_id, applied))
    }

    /// Reconcile the directly monitored accounts.
    ///
    /// Always runs so that accounts dropped from the list lose their
    /// full-refetch flag.
    fn reconcile_accounts(
        &self,
        accounts: &[String],
        outcome: &mut ReconcileOutcome,
    ) -> SyncResultT<PhaseReport> {
        let checks = self.check_accounts(accounts.iter().map(String::as_str));
        let (run, now) = (self.run_seq, &self.now);
        let mut report = PhaseReport::default();

        let tx = self.db.conn().unchecked_transaction()?;
        identity::reset_full_refetch(&tx)?;
        for account in accounts {
            let check = checks
                .get(account.as_str())
                .cloned()
                .unwrap_or(AccountCheck::Missing);
            let (local_id, applied) = if let Some(existing) = identity::find_by_account(&tx, account)? {
                (existing.local_id, Applied::Updated)
            } else if let Some(placeholder) = identity::find_unregistered_placeholder(&tx, account)? {
                if check == AccountCheck::Exists {
                    identity::promote(&tx, placeholder.local_id, account)?;
                    outcome.newly_resolved.push(account.clone());
                }
                (placeholder.local_id, Applied::Updated)
            } else if check == AccountCheck::Exists {
                let id = identity::insert_resolved(&tx, account, None, run, now)?;
                outcome.newly_resolved.push(account.clone());
                (id, Applied::Inserted)
            } else {
                let id = identity::insert_placeholder(&tx, None, Some(account), run, now)?;
                (id, Applied::Inserted)
            };
            identity::mark_monitored(&tx, local_id, run, now)?;
            outcome.touched.insert(local_id);

            match check {
                AccountCheck::Failed(detail) => report.record_degraded(
                    account.clone(),
                    applied,
                    SkipReason::AccountCheckFailed(detail),
                ),
                _ => report.record(account.clone(), Ok(applied)),
            }
        }
        tx.commit()?;

        if !accounts.is_empty() {
            tracing::info!(
                accounts = accounts.len(),
                inserted = report.inserted,
                errors = report.errors(),
                "monitored accounts reconciled"
            );
        }
        Ok(report)
    }

    /// Replace the display identifier of each touched, resolved identity
    /// with the label from its auth profile.
    ///
    /// Lookups run before the write transaction opens. A missing profile or
    /// a failed lookup keeps the current identifier.
    fn refresh_identifiers(&self, touched: &BTreeSet<i64>) -> SyncResultT<usize> {
        let mut resolved = Vec::new();
        for &local_id in touched {
            let Some(found) = identity::get(self.db.conn(), local_id)? else {
                continue;
            };
            if let Some(account) = found.external_account_id {
                resolved.push((local_id, account, found.display_identifier));
            }
        }

        let mut updates = Vec::new();
        for (local_id, account, current) in &resolved {
            match call_with_retry(self.retry, "fetch auth record", || {
                self.events.fetch_auth_record(account)
            }) {
                Ok(Some(record)) => match record.identifier() {
                    Some(label) if current.as_deref() != Some(label) => {
                        updates.push((*local_id, label.to_string()));
                    }
                    _ => {}
                },
                Ok(None) => {
                    tracing::debug!(account = account.as_str(), "no auth profile");
                }
                Err(err) => {
                    tracing::warn!(
                        account = account.as_str(),
                        error = %err,
                        "auth lookup failed, keeping identifier"
                    );
                }
            }
        }

        if updates.is_empty() {
            return Ok(0);
        }
        let tx = self.db.conn().unchecked_transaction()?;
        for (local_id, label) in &updates {
            identity::set_display_identifier(&tx, *local_id, label)?;
        }
        tx.commit()?;
        tracing::info!(refreshed = updates.len(), "display identifiers refreshed");
        Ok(updates.len())
    }

    /// Check each distinct account once.
    fn check_accounts<'s>(
        &self,
        accounts: impl Iterator<Item = &'s str>,
    ) -> HashMap<&'s str, AccountCheck> {
        let mut checks = HashMap::new();
        for account in accounts {
            if checks.contains_key(account) {
                continue;
            }
            let check = match call_with_retry(self.retry, "check account", || {
                self.events.account_exists(account)
            }) {
                Ok(true) => AccountCheck::Exists,
                Ok(false) => AccountCheck::Missing,
                Err(err) => {
                    tracing::warn!(account, error = %err, "account check failed, keeping placeholder");
                    AccountCheck::Failed(err.to_string())
                }
            };
            checks.insert(account, check);
        }
        checks
    }
}
