//! Collaborators backed by a directory of JSON exports.
//!
//! Layout:
//!
//! ```text
//! DIR/registry/<project id>.json   array of flat registry rows
//! DIR/conversations.json           array of conversation documents
//! DIR/messages.json                array of message documents
//! DIR/accounts.json                array of account ids (optional)
//! DIR/auth.json                    account id -> auth profile (optional)
//! ```
//!
//! A missing registry file makes that project's fetch fail, the same as an
//! unreachable registry. Missing event files read as empty.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use theradash_core::clients::{
    AlertSender, ClientError, ClientResult, EventStoreClient, RegistryClient,
};
use theradash_core::config::ProjectConfig;
use theradash_core::records::{AuthRecord, ConversationEvent, MessageEvent, RegistryRow};

pub struct SnapshotRegistry {
    dir: PathBuf,
}

impl SnapshotRegistry {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.join("registry"),
        }
    }
}

impl RegistryClient for SnapshotRegistry {
    fn fetch_participants(&self, project: &ProjectConfig) -> ClientResult<Vec<RegistryRow>> {
        let path = self.dir.join(format!("{}.json", project.id));
        let raw = fs::read_to_string(&path).map_err(|err| {
            ClientError::Unavailable(format!("{}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|err| ClientError::Rejected(format!("{}: {err}", path.display())))
    }
}

/// Event store loaded once from the snapshot directory.
#[derive(Debug, Default)]
pub struct SnapshotEventStore {
    conversations: Vec<ConversationEvent>,
    messages: Vec<MessageEvent>,
    accounts: HashSet<String>,
    auth: HashMap<String, AuthRecord>,
}

impl SnapshotEventStore {
    pub fn load(dir: &Path) -> Result<Self> {
        let conversations: Vec<ConversationEvent> =
            read_optional(&dir.join("conversations.json"))?;
        let messages: Vec<MessageEvent> = read_optional(&dir.join("messages.json"))?;
        let listed: Vec<String> = read_optional(&dir.join("accounts.json"))?;
        let auth: HashMap<String, AuthRecord> = read_optional(&dir.join("auth.json"))?;

        let accounts = listed
            .into_iter()
            .chain(conversations.iter().map(|c| c.account_id.clone()))
            .chain(messages.iter().map(|m| m.account_id.clone()))
            .collect();
        tracing::debug!(
            conversations = conversations.len(),
            messages = messages.len(),
            dir = %dir.display(),
            "loaded event snapshot"
        );
        Ok(Self {
            conversations,
            messages,
            accounts,
            auth,
        })
    }
}

fn read_optional<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Whether an event stamped `ts` is newer than `since`. Undated events
/// only show up in full-history fetches.
fn newer(ts: Option<DateTime<Utc>>, since: Option<DateTime<Utc>>) -> bool {
    match since {
        None => true,
        Some(since) => ts.is_some_and(|ts| ts > since),
    }
}

impl EventStoreClient for SnapshotEventStore {
    fn fetch_conversations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<ConversationEvent>> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| newer(c.timestamp, since))
            .cloned()
            .collect())
    }

    fn fetch_messages_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<MessageEvent>> {
        Ok(self
            .messages
            .iter()
            .filter(|m| newer(m.timestamp, since))
            .cloned()
            .collect())
    }

    fn fetch_conversations_for_account(
        &self,
        account_id: &str,
    ) -> ClientResult<Vec<ConversationEvent>> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect())
    }

    fn fetch_messages_for_account(&self, account_id: &str) -> ClientResult<Vec<MessageEvent>> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect())
    }

    fn account_exists(&self, account_id: &str) -> ClientResult<bool> {
        Ok(self.accounts.contains(account_id))
    }

    fn fetch_auth_record(&self, account_id: &str) -> ClientResult<Option<AuthRecord>> {
        Ok(self.auth.get(account_id).cloned())
    }
}

/// Writes risk alerts to the log instead of paging anyone.
#[derive(Debug, Default)]
pub struct LogAlertSender;

impl AlertSender for LogAlertSender {
    fn send_risk_alert(&self, account_id: &str, excerpt: &str) -> ClientResult<bool> {
        tracing::warn!(account = account_id, excerpt, "risk alert");
        Ok(true)
    }
}
