//! In-memory collaborators and a manual clock for tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clients::{AlertSender, ClientError, ClientResult, EventStoreClient, RegistryClient};
use crate::clock::Clock;
use crate::config::ProjectConfig;
use crate::records::{AuthRecord, ConversationEvent, MessageEvent, RegistryRow, RiskLabel};

// ============================================================================
// Clock
// ============================================================================

pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Cell::new(now) }
    }

    /// A clock at 2025-01-01 00:00 UTC.
    pub fn epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct FakeRegistry {
    rows: RefCell<HashMap<String, Vec<RegistryRow>>>,
    failing: RefCell<HashSet<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, project: &str, rows: Vec<RegistryRow>) {
        self.rows.borrow_mut().insert(project.to_string(), rows);
    }

    pub fn fail_project(&self, project: &str) {
        self.failing.borrow_mut().insert(project.to_string());
    }
}

impl RegistryClient for FakeRegistry {
    fn fetch_participants(&self, project: &ProjectConfig) -> ClientResult<Vec<RegistryRow>> {
        if self.failing.borrow().contains(&project.id) {
            return Err(ClientError::Unavailable(format!("registry {} down", project.id)));
        }
        Ok(self.rows.borrow().get(&project.id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Event store
// ============================================================================

#[derive(Default)]
pub struct FakeEventStore {
    conversations: RefCell<Vec<ConversationEvent>>,
    messages: RefCell<Vec<MessageEvent>>,
    accounts: RefCell<HashSet<String>>,
    auth_records: RefCell<HashMap<String, AuthRecord>>,
    fail_fetches: Cell<bool>,
    fail_account_checks: Cell<bool>,
    fail_auth_lookups: Cell<bool>,
    account_checks: Cell<usize>,
    history_fetches: RefCell<Vec<String>>,
}

impl FakeEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: &str) {
        self.accounts.borrow_mut().insert(account.to_string());
    }

    pub fn add_conversation(&self, id: &str, account: &str, at: DateTime<Utc>) {
        self.add_account(account);
        self.conversations.borrow_mut().push(ConversationEvent {
            id: id.to_string(),
            account_id: account.to_string(),
            prompt: Some(format!("prompt for {id}")),
            timestamp: Some(at),
        });
    }

    pub fn add_message(
        &self,
        id: &str,
        conversation: &str,
        account: &str,
        text: &str,
        at: Option<DateTime<Utc>>,
        risky: bool,
    ) {
        self.messages.borrow_mut().push(MessageEvent {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            account_id: account.to_string(),
            text: text.to_string(),
            timestamp: at,
            risk_label: RiskLabel::from(risky),
        });
    }

    /// Make every fetch fail (account checks are controlled separately).
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.set(fail);
    }

    pub fn fail_account_checks(&self, fail: bool) {
        self.fail_account_checks.set(fail);
    }

    pub fn set_auth_record(&self, account: &str, record: AuthRecord) {
        self.auth_records.borrow_mut().insert(account.to_string(), record);
    }

    pub fn fail_auth_lookups(&self, fail: bool) {
        self.fail_auth_lookups.set(fail);
    }

    pub fn account_checks(&self) -> usize {
        self.account_checks.get()
    }

    /// Accounts whose full history was requested, in call order.
    pub fn history_fetches(&self) -> Vec<String> {
        self.history_fetches.borrow().clone()
    }

    fn check_fetch(&self) -> ClientResult<()> {
        if self.fail_fetches.get() {
            Err(ClientError::Timeout("event store timed out".to_string()))
        } else {
            Ok(())
        }
    }
}

fn after(ts: Option<DateTime<Utc>>, since: Option<DateTime<Utc>>) -> bool {
    match (ts, since) {
        (_, None) => true,
        (Some(ts), Some(since)) => ts > since,
        (None, Some(_)) => false,
    }
}

impl EventStoreClient for FakeEventStore {
    fn fetch_conversations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<ConversationEvent>> {
        self.check_fetch()?;
        Ok(self
            .conversations
            .borrow()
            .iter()
            .filter(|c| after(c.timestamp, since))
            .cloned()
            .collect())
    }

    fn fetch_messages_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<MessageEvent>> {
        self.check_fetch()?;
        Ok(self
            .messages
            .borrow()
            .iter()
            .filter(|m| after(m.timestamp, since))
            .cloned()
            .collect())
    }

    fn fetch_conversations_for_account(
        &self,
        account_id: &str,
    ) -> ClientResult<Vec<ConversationEvent>> {
        self.check_fetch()?;
        self.history_fetches.borrow_mut().push(account_id.to_string());
        Ok(self
            .conversations
            .borrow()
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect())
    }

    fn fetch_messages_for_account(&self, account_id: &str) -> ClientResult<Vec<MessageEvent>> {
        self.check_fetch()?;
        Ok(self
            .messages
            .borrow()
            .iter()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect())
    }

    fn account_exists(&self, account_id: &str) -> ClientResult<bool> {
        self.account_checks.set(self.account_checks.get() + 1);
        if self.fail_account_checks.get() {
            return Err(ClientError::Timeout("account lookup timed out".to_string()));
        }
        Ok(self.accounts.borrow().contains(account_id))
    }

    fn fetch_auth_record(&self, account_id: &str) -> ClientResult<Option<AuthRecord>> {
        if self.fail_auth_lookups.get() {
            return Err(ClientError::Unavailable("auth provider down".to_string()));
        }
        Ok(self.auth_records.borrow().get(account_id).cloned())
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Default)]
pub struct FakeAlerts {
    sent: RefCell<Vec<(String, String)>>,
    /// Excerpts containing any of these strings fail to send.
    failing: RefCell<Vec<String>>,
    unreachable: Cell<bool>,
}

impl FakeAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when_excerpt_contains(&self, needle: &str) {
        self.failing.borrow_mut().push(needle.to_string());
    }

    pub fn heal(&self) {
        self.failing.borrow_mut().clear();
        self.unreachable.set(false);
    }

    /// The sender runs but reaches nobody (`Ok(false)`).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.set(unreachable);
    }

    /// Successful sends as `(account, excerpt)`.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }
}

impl AlertSender for FakeAlerts {
    fn send_risk_alert(&self, account_id: &str, excerpt: &str) -> ClientResult<bool> {
        if self
            .failing
            .borrow()
            .iter()
            .any(|needle| excerpt.contains(needle.as_str()))
        {
            return Err(ClientError::Unavailable("sms gateway down".to_string()));
        }
        if self.unreachable.get() {
            return Ok(false);
        }
        self.sent
            .borrow_mut()
            .push((account_id.to_string(), excerpt.to_string()));
        Ok(true)
    }
}
