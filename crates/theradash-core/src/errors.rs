//! Typed error types for the sync service layer.

use thiserror::Error;

use crate::clients::ClientError;

/// Result type alias for sync service operations.
pub type SyncResultT<T> = Result<T, SyncError>;

/// Run-level failures.
///
/// Anything in here aborts the current phase and prevents the watermark from
/// advancing. Per-record problems are not errors at this level; they are
/// collected as [`crate::sync::SkipReason`]s in the phase reports.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A collaborator stayed unreachable after all retries.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Connectivity {
        operation: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    /// Another run holds the run lock.
    #[error("sync already in progress (run {run_seq})")]
    AlreadyRunning { run_seq: i64 },

    /// The run lock was taken over while this run was still working.
    #[error("run {run_seq} no longer holds the sync lock")]
    LockLost { run_seq: i64 },

    /// A local storage or database error.
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.into())
    }
}
