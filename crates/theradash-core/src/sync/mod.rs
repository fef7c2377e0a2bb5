//! Sync orchestrator.
//!
//! One run: take the run lock, snapshot the watermark, reconcile registry
//! projects and monitored accounts, deactivate identities nobody vouched
//! for, ingest conversations then messages, send risk alerts, advance the
//! watermark if everything went well, log the run, release the lock.

pub mod ingest;
pub mod notify;
pub mod reconcile;
pub mod report;


pub use ingest::{EventBatch, Ingestor, MissingEvents};
pub use notify::{excerpt, Notifier, NotifyReport};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use report::{Applied, PhaseReport, Skip, SkipReason};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clients::{AlertSender, EventStoreClient, RegistryClient};
use crate::clock::{Clock, SystemClock};
use crate::config::{ProjectConfig, SyncConfig};
use crate::errors::{SyncError, SyncResultT};
use crate::store::{
    events, identity, job, projects, sync_log, watermark, JobState, JobStatus, LockAttempt,
    ProjectRow, RunStatus, SyncDb, SyncLogEntry, TableCounts, Watermark,
};

/// How a `full_sync` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    Failed,
    /// Another run held the lock; nothing was done.
    AlreadyRunning,
}

/// Run summary returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub status: SyncStatus,
    pub run_seq: Option<i64>,
    pub users_synced: usize,
    pub conversations_synced: usize,
    pub messages_synced: usize,
    pub alerts_sent: usize,
    pub record_errors: usize,
    pub notification_errors: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

impl SyncResult {
    fn already_running(holder: i64) -> Self {
        Self::not_started(
            SyncStatus::AlreadyRunning,
            SyncError::AlreadyRunning { run_seq: holder }.to_string(),
        )
    }

    fn not_started(status: SyncStatus, error: String) -> Self {
        Self {
            success: false,
            status,
            run_seq: None,
            users_synced: 0,
            conversations_synced: 0,
            messages_synced: 0,
            alerts_sent: 0,
            record_errors: 0,
            notification_errors: 0,
            duration_seconds: 0.0,
            error: Some(error),
        }
    }
}

/// Outcome of a backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub run_seq: i64,
    pub dry_run: bool,
    pub missing: MissingEvents,
    pub conversations_inserted: usize,
    pub messages_inserted: usize,
    pub record_errors: usize,
}

/// Read-only view of the engine's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub job: JobState,
    pub watermark: Watermark,
    pub last_run: Option<SyncLogEntry>,
    pub counts: TableCounts,
    pub pending_alerts: usize,
    pub projects: Vec<ProjectRow>,
}

impl EngineStatus {
    /// Read the status straight from a store; needs no collaborators.
    pub fn load(db: &SyncDb) -> SyncResultT<Self> {
        let conn = db.conn();
        Ok(Self {
            job: job::load(conn)?,
            watermark: watermark::load(conn)?,
            last_run: sync_log::latest(conn)?,
            counts: db.table_counts()?,
            pending_alerts: events::pending_alerts(conn)?.len(),
            projects: projects::list(conn)?,
        })
    }
}

/// Counters accumulated across the phases of one run.
#[derive(Debug, Default)]
struct RunTally {
    users_synced: usize,
    conversations_synced: usize,
    messages_synced: usize,
    alerts_sent: usize,
    record_errors: usize,
    notification_errors: usize,
    /// A registry project failed; the run continues but is not a success.
    project_error: Option<String>,
    earliest_orphan: Option<DateTime<Utc>>,
}

/// The sync engine.
///
/// Collaborators are injected; pass references (`&FakeRegistry`) to keep
/// access to them from the caller.
pub struct SyncEngine<R, E, A, C = SystemClock> {
    db: SyncDb,
    config: SyncConfig,
    registry: R,
    events: E,
    alerts: A,
    clock: C,
}

impl<R, E, A> SyncEngine<R, E, A, SystemClock>
where
    R: RegistryClient,
    E: EventStoreClient,
    A: AlertSender,
{
    pub const fn new(db: SyncDb, config: SyncConfig, registry: R, events: E, alerts: A) -> Self {
        Self {
            db,
            config,
            registry,
            events,
            alerts,
            clock: SystemClock,
        }
    }
}

impl<R, E, A, C> SyncEngine<R, E, A, C>
where
    R: RegistryClient,
    E: EventStoreClient,
    A: AlertSender,
    C: Clock,
{
    /// Replace the clock.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> SyncEngine<R, E, A, C2> {
        SyncEngine {
            db: self.db,
            config: self.config,
            registry: self.registry,
            events: self.events,
            alerts: self.alerts,
            clock,
        }
    }

    #[must_use]
    pub const fn db(&self) -> &SyncDb {
        &self.db
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========================================================================
    // Full sync
    // ========================================================================

    /// Run one full sync.
    ///
    /// Never returns an error: failures are reported in the result (and in
    /// the sync log, once the run holds the lock).
    #[tracing::instrument(skip(self), fields(mode = %self.config.selection_mode))]
    pub fn full_sync(&self) -> SyncResult {
        let started = self.clock.now();
        let run_seq = match job::try_acquire(self.db.conn(), &started, self.config.lock_timeout()) {
            Ok(LockAttempt::Acquired { run_seq, .. }) => run_seq,
            Ok(LockAttempt::Busy { run_seq, .. }) => {
                tracing::info!(holder = run_seq, "sync already in progress, skipping");
                return SyncResult::already_running(run_seq);
            }
            Err(err) => {
                tracing::error!(error = %err, "could not take the sync lock");
                return SyncResult::not_started(SyncStatus::Failed, format!("{err:#}"));
            }
        };
        tracing::info!(run_seq, "sync started");

        let mut tally = RunTally::default();
        let watermark_before = match watermark::current(self.db.conn()) {
            Ok(value) => value,
            Err(err) => {
                return self.finish_run(run_seq, started, None, &tally, Err(err.into()));
            }
        };
        let phases = self.run_phases(run_seq, started, watermark_before, &mut tally);
        self.finish_run(run_seq, started, watermark_before, &tally, phases)
    }

    fn run_phases(
        &self,
        run_seq: i64,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        tally: &mut RunTally,
    ) -> SyncResultT<()> {
        let mode = self.config.selection_mode;
        let retry = &self.config.retry;
        let conn = self.db.conn();

        let projects: &[ProjectConfig] = if mode.uses_registry() {
            &self.config.projects
        } else {
            &[]
        };
        let accounts: &[String] = if mode.uses_account_list() {
            &self.config.monitored_accounts
        } else {
            &[]
        };
        let outcome = Reconciler::new(&self.db, &self.registry, &self.events, retry, run_seq, now)
            .reconcile(projects, accounts)?;
        tally.users_synced = outcome.touched.len();
        tally.record_errors += outcome.record_errors();
        tally.project_error = outcome.first_error();

        if mode.absence_deactivates() {
            let deactivated = identity::deactivate_unseen(conn, run_seq, &outcome.failed_projects())?;
            if deactivated > 0 {
                tracing::info!(deactivated, "identities deactivated");
            }
        }
        self.ensure_lock(run_seq)?;

        let mut history = identity::full_refetch_accounts(conn)?;
        history.extend(outcome.newly_resolved);
        let ingestor = Ingestor::new(&self.db, &self.events, retry, mode, run_seq, now);
        let batch = ingestor.fetch(since, &history)?;

        let conversations = ingestor.ingest_conversations(&batch.conversations)?;
        tally.conversations_synced = conversations.report.written();
        tally.users_synced += conversations.identities_created;
        tally.record_errors += conversations.report.errors();

        let messages = ingestor.ingest_messages(&batch.messages)?;
        tally.messages_synced = messages.report.inserted;
        tally.record_errors += messages.report.errors();
        tally.earliest_orphan = messages.earliest_orphan;
        self.ensure_lock(run_seq)?;

        let notified = Notifier::new(&self.db, &self.alerts, self.config.alert_excerpt_chars, now)
            .notify(&messages.risky_new)?;
        tally.alerts_sent = notified.alerts_sent;
        tally.notification_errors = notified.failures.len();
        Ok(())
    }

    fn ensure_lock(&self, run_seq: i64) -> SyncResultT<()> {
        if job::holds(self.db.conn(), run_seq)? {
            Ok(())
        } else {
            Err(SyncError::LockLost { run_seq })
        }
    }

    /// Advance the watermark (on success), log the run and release the lock.
    fn finish_run(
        &self,
        run_seq: i64,
        started: DateTime<Utc>,
        watermark_before: Option<DateTime<Utc>>,
        tally: &RunTally,
        phases: SyncResultT<()>,
    ) -> SyncResult {
        let conn = self.db.conn();
        let mut error = match phases {
            Ok(()) => tally.project_error.clone(),
            Err(err) => {
                tracing::error!(run_seq, error = %err, "sync failed");
                Some(err.to_string())
            }
        };

        if error.is_none() {
            let next = next_watermark(started, tally.earliest_orphan);
            match watermark::advance(conn, &next, run_seq) {
                Ok(true) => tracing::debug!(watermark = %next, "watermark advanced"),
                Ok(false) => match job::holds(conn, run_seq) {
                    Ok(true) => tracing::debug!(watermark = %next, "watermark held back"),
                    Ok(false) => error = Some(SyncError::LockLost { run_seq }.to_string()),
                    Err(err) => error = Some(format!("{err:#}")),
                },
                Err(err) => error = Some(format!("{err:#}")),
            }
        }

        let finished = self.clock.now();
        let duration_seconds = (finished - started)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let watermark_after = watermark::current(conn).unwrap_or(watermark_before);

        let status = if error.is_none() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let entry = SyncLogEntry {
            run_seq,
            status,
            started_at: started,
            completed_at: finished,
            users_synced: tally.users_synced,
            conversations_synced: tally.conversations_synced,
            messages_synced: tally.messages_synced,
            alerts_sent: tally.alerts_sent,
            record_errors: tally.record_errors,
            notification_errors: tally.notification_errors,
            duration_seconds,
            error: error.clone(),
            watermark_before,
            watermark_after,
        };
        if let Err(err) = sync_log::append(conn, &entry) {
            tracing::error!(run_seq, error = %err, "failed to write sync log");
            error.get_or_insert_with(|| format!("{err:#}"));
        }

        let job_status = if error.is_none() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        match job::finish(conn, run_seq, job_status, &finished) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(run_seq, "sync lock was taken over before release"),
            Err(err) => tracing::error!(run_seq, error = %err, "failed to release sync lock"),
        }

        let success = error.is_none();
        tracing::info!(
            run_seq,
            success,
            users = tally.users_synced,
            conversations = tally.conversations_synced,
            messages = tally.messages_synced,
            alerts = tally.alerts_sent,
            record_errors = tally.record_errors,
            notification_errors = tally.notification_errors,
            duration_seconds,
            "sync finished"
        );
        SyncResult {
            success,
            status: if success {
                SyncStatus::Completed
            } else {
                SyncStatus::Failed
            },
            run_seq: Some(run_seq),
            users_synced: tally.users_synced,
            conversations_synced: tally.conversations_synced,
            messages_synced: tally.messages_synced,
            alerts_sent: tally.alerts_sent,
            record_errors: tally.record_errors,
            notification_errors: tally.notification_errors,
            duration_seconds,
            error,
        }
    }

    // ========================================================================
    // Backfill
    // ========================================================================

    /// Compare the full event-store history against the store and, unless
    /// `dry_run`, ingest what is missing. Leaves the watermark and the sync
    /// log alone; risky messages found this way are not queued for alerts.
    #[tracing::instrument(skip(self))]
    pub fn backfill(&self, dry_run: bool) -> SyncResultT<BackfillReport> {
        self.with_lock(|run_seq, now| {
            let retry = &self.config.retry;
            let mode = self.config.selection_mode;
            let ingestor = Ingestor::new(&self.db, &self.events, retry, mode, run_seq, now)
                .without_alert_queue();
            let batch = ingestor.fetch(None, &[])?;
            let missing = ingestor.missing(&batch)?;
            tracing::info!(
                conversations = missing.conversations.len(),
                messages = missing.messages.len(),
                dry_run,
                "missing events found"
            );

            let mut report = BackfillReport {
                run_seq,
                dry_run,
                missing,
                ..BackfillReport::default()
            };
            if dry_run {
                return Ok(report);
            }
            let conversations = ingestor.ingest_conversations(&batch.conversations)?;
            let messages = ingestor.ingest_messages(&batch.messages)?;
            report.conversations_inserted = conversations.report.inserted;
            report.messages_inserted = messages.report.inserted;
            report.record_errors = conversations.report.errors() + messages.report.errors();
            Ok(report)
        })
    }

    /// Alert every risky message that has never been alerted successfully.
    #[tracing::instrument(skip(self))]
    pub fn backfill_alerts(&self) -> SyncResultT<NotifyReport> {
        self.with_lock(|_, now| {
            Notifier::new(&self.db, &self.alerts, self.config.alert_excerpt_chars, now).backfill()
        })
    }

    fn with_lock<T>(&self, body: impl FnOnce(i64, DateTime<Utc>) -> SyncResultT<T>) -> SyncResultT<T> {
        let now = self.clock.now();
        let run_seq = match job::try_acquire(self.db.conn(), &now, self.config.lock_timeout())? {
            LockAttempt::Acquired { run_seq, .. } => run_seq,
            LockAttempt::Busy { run_seq, .. } => {
                return Err(SyncError::AlreadyRunning { run_seq });
            }
        };
        let result = body(run_seq, now);
        let status = if result.is_ok() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job::finish(self.db.conn(), run_seq, status, &self.clock.now())?;
        result
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> SyncResultT<EngineStatus> {
        EngineStatus::load(&self.db)
    }
}

/// The watermark a successful run moves to: its start time, held back to
/// just before the earliest message that was skipped for a missing
/// conversation so that message is fetched again next run.
fn next_watermark(started: DateTime<Utc>, earliest_orphan: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match earliest_orphan {
        Some(orphan) if orphan <= started => orphan - chrono::Duration::microseconds(1),
        _ => started,
    }
}
