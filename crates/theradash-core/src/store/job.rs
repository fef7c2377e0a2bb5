//! Durable run lock.
//!
//! A single `job_state` row guards sync runs across processes. Acquiring the
//! lock is one conditional `UPDATE ... RETURNING`, so two processes racing
//! for it cannot both win. Every acquisition bumps `run_seq`, which doubles
//! as the run's identifier everywhere else in the store.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{opt_ts_column, ts_to_sql};

/// Job state machine: `Idle → Running → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `job_state` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    pub run_seq: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of trying to take the run lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired {
        run_seq: i64,
        /// The previous holder was still `running` but past the lock timeout.
        took_over: Option<i64>,
    },
    Busy {
        run_seq: i64,
        started_at: Option<DateTime<Utc>>,
    },
}

impl LockAttempt {
    /// The acquired run's sequence number, if the lock was taken.
    #[must_use]
    pub const fn run_seq(&self) -> Option<i64> {
        match self {
            Self::Acquired { run_seq, .. } => Some(*run_seq),
            Self::Busy { .. } => None,
        }
    }
}

pub fn load(conn: &Connection) -> Result<JobState> {
    let (raw_status, run_seq, started_at, finished_at) = conn
        .query_row(
            "SELECT state, run_seq, started_at, finished_at FROM job_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    opt_ts_column(row, 2)?,
                    opt_ts_column(row, 3)?,
                ))
            },
        )
        .context("Failed to read job state")?;
    let status =
        JobStatus::parse(&raw_status).ok_or_else(|| anyhow!("Unknown job state: {raw_status}"))?;
    Ok(JobState {
        status,
        run_seq,
        started_at,
        finished_at,
    })
}

/// Try to take the run lock at `now`.
///
/// A `running` row whose `started_at` is older than `timeout` belongs to a
/// run that died without releasing the lock and is taken over.
pub fn try_acquire(conn: &Connection, now: &DateTime<Utc>, timeout: Duration) -> Result<LockAttempt> {
    let previous = load(conn)?;
    let stale_before = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let acquired: Option<i64> = conn
        .query_row(
            "UPDATE job_state
             SET state = 'running', run_seq = run_seq + 1, started_at = ?1, finished_at = NULL
             WHERE id = 1
               AND (state != 'running' OR started_at IS NULL OR started_at < ?2)
             RETURNING run_seq",
            params![ts_to_sql(now), ts_to_sql(&stale_before)],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to acquire run lock")?;

    match acquired {
        Some(run_seq) => {
            let took_over = (previous.status == JobStatus::Running).then_some(previous.run_seq);
            if let Some(stale_run) = took_over {
                tracing::warn!(
                    stale_run,
                    run_seq,
                    started_at = ?previous.started_at,
                    "taking over abandoned sync lock"
                );
            }
            Ok(LockAttempt::Acquired { run_seq, took_over })
        }
        None => {
            let holder = load(conn)?;
            Ok(LockAttempt::Busy {
                run_seq: holder.run_seq,
                started_at: holder.started_at,
            })
        }
    }
}

/// Whether `run_seq` still holds the lock.
pub fn holds(conn: &Connection, run_seq: i64) -> Result<bool> {
    let state = load(conn)?;
    Ok(state.status == JobStatus::Running && state.run_seq == run_seq)
}

/// Release the lock held by `run_seq`, recording how the run ended.
///
/// Returns `false` if the lock had already been taken over.
pub fn finish(
    conn: &Connection,
    run_seq: i64,
    status: JobStatus,
    now: &DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE job_state SET state = ?1, finished_at = ?2
             WHERE id = 1 AND state = 'running' AND run_seq = ?3",
            params![status.as_str(), ts_to_sql(now), run_seq],
        )
        .context("Failed to release run lock")?;
    Ok(changed == 1)
}
