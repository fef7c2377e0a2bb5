//! Collaborator interfaces consumed by the sync engine.
//!
//! Wire protocols live outside this crate. Implementations own their request
//! timeouts and report them as [`ClientError::Timeout`]; the engine wraps
//! every call in [`call_with_retry`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{ProjectConfig, RetryPolicy};
use crate::errors::SyncError;
use crate::records::{AuthRecord, ConversationEvent, MessageEvent, RegistryRow};

/// Failure of a single collaborator call.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered, but with something we cannot use.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// The clinical-records registry.
pub trait RegistryClient {
    /// Fetch the rows selected by the project's filter.
    fn fetch_participants(&self, project: &ProjectConfig) -> ClientResult<Vec<RegistryRow>>;
}

/// The real-time chat event store.
pub trait EventStoreClient {
    /// Conversations with a source timestamp after `since` (all when `None`).
    fn fetch_conversations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<ConversationEvent>>;

    /// Messages with a source timestamp after `since` (all when `None`).
    fn fetch_messages_since(&self, since: Option<DateTime<Utc>>)
        -> ClientResult<Vec<MessageEvent>>;

    /// Full conversation history of one account.
    fn fetch_conversations_for_account(
        &self,
        account_id: &str,
    ) -> ClientResult<Vec<ConversationEvent>>;

    /// Full message history of one account.
    fn fetch_messages_for_account(&self, account_id: &str) -> ClientResult<Vec<MessageEvent>>;

    fn account_exists(&self, account_id: &str) -> ClientResult<bool>;

    /// The auth profile behind an account, `None` when there is none.
    fn fetch_auth_record(&self, account_id: &str) -> ClientResult<Option<AuthRecord>>;
}

/// Sends risk alerts to on-call staff.
pub trait AlertSender {
    /// Returns `Ok(false)` when the sender ran but nobody was reached.
    fn send_risk_alert(&self, account_id: &str, excerpt: &str) -> ClientResult<bool>;
}

impl<T: RegistryClient + ?Sized> RegistryClient for &T {
    fn fetch_participants(&self, project: &ProjectConfig) -> ClientResult<Vec<RegistryRow>> {
        (**self).fetch_participants(project)
    }
}

impl<T: EventStoreClient + ?Sized> EventStoreClient for &T {
    fn fetch_conversations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<ConversationEvent>> {
        (**self).fetch_conversations_since(since)
    }

    fn fetch_messages_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<MessageEvent>> {
        (**self).fetch_messages_since(since)
    }

    fn fetch_conversations_for_account(
        &self,
        account_id: &str,
    ) -> ClientResult<Vec<ConversationEvent>> {
        (**self).fetch_conversations_for_account(account_id)
    }

    fn fetch_messages_for_account(&self, account_id: &str) -> ClientResult<Vec<MessageEvent>> {
        (**self).fetch_messages_for_account(account_id)
    }

    fn account_exists(&self, account_id: &str) -> ClientResult<bool> {
        (**self).account_exists(account_id)
    }

    fn fetch_auth_record(&self, account_id: &str) -> ClientResult<Option<AuthRecord>> {
        (**self).fetch_auth_record(account_id)
    }
}

impl<T: AlertSender + ?Sized> AlertSender for &T {
    fn send_risk_alert(&self, account_id: &str, excerpt: &str) -> ClientResult<bool> {
        (**self).send_risk_alert(account_id, excerpt)
    }
}

/// Run `call` up to `policy.attempts` times with exponential backoff.
///
/// Non-retryable errors return immediately. Exhaustion becomes
/// [`SyncError::Connectivity`].
pub fn call_with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: impl FnMut() -> ClientResult<T>,
) -> Result<T, SyncError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= attempts {
                    return Err(SyncError::Connectivity {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "collaborator call failed, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
