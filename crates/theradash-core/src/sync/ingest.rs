//! Event ingestor.
//!
//! Pulls conversations and messages from the event store and upserts them by
//! their event-store ids. Conversations are always written before messages;
//! a message whose conversation is not stored yet is skipped and picked up
//! again by a later run.

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::report::{Applied, PhaseReport, SkipReason};
use crate::clients::{call_with_retry, EventStoreClient};
use crate::config::{RetryPolicy, SelectionMode};
use crate::errors::SyncResultT;
use crate::records::{ConversationEvent, MessageEvent};
use crate::store::events::{self, NewMessage};
use crate::store::{identity, SyncDb};

/// Events gathered for one ingest pass, de-duplicated by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub conversations: Vec<ConversationEvent>,
    pub messages: Vec<MessageEvent>,
}

impl EventBatch {
    fn extend_conversations(&mut self, seen: &mut HashSet<String>, batch: Vec<ConversationEvent>) {
        self.conversations
            .extend(batch.into_iter().filter(|c| seen.insert(c.id.clone())));
    }

    fn extend_messages(&mut self, seen: &mut HashSet<String>, batch: Vec<MessageEvent>) {
        self.messages
            .extend(batch.into_iter().filter(|m| seen.insert(m.id.clone())));
    }
}

/// Result of the conversation phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationIngest {
    pub report: PhaseReport,
    /// Identities created for unknown accounts (accept-all mode).
    pub identities_created: usize,
}

/// Result of the message phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageIngest {
    pub report: PhaseReport,
    /// Local ids of risky messages inserted by this pass.
    pub risky_new: Vec<i64>,
    /// Timestamp of the earliest message skipped for a missing conversation.
    pub earliest_orphan: Option<DateTime<Utc>>,
}

/// Event ids present upstream but not stored locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MissingEvents {
    pub conversations: Vec<String>,
    pub messages: Vec<String>,
}

pub struct Ingestor<'a, E> {
    db: &'a SyncDb,
    events: &'a E,
    retry: &'a RetryPolicy,
    mode: SelectionMode,
    run_seq: i64,
    now: DateTime<Utc>,
    queue_alerts: bool,
}

impl<'a, E: EventStoreClient> Ingestor<'a, E> {
    pub const fn new(
        db: &'a SyncDb,
        events: &'a E,
        retry: &'a RetryPolicy,
        mode: SelectionMode,
        run_seq: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            db,
            events,
            retry,
            mode,
            run_seq,
            now,
            queue_alerts: true,
        }
    }

    /// Insert risky messages without queueing alerts for them (historical
    /// backfill; `backfill_alerts` reaches them explicitly).
    #[must_use]
    pub fn without_alert_queue(mut self) -> Self {
        self.queue_alerts = false;
        self
    }

    /// Fetch everything newer than `since`, plus the full history of
    /// `history_accounts`.
    ///
    /// Messages that reference a conversation neither in the batch nor in
    /// the store trigger a full conversation fetch for their account, so a
    /// conversation observed late (with an older timestamp) still lands.
    pub fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        history_accounts: &[String],
    ) -> SyncResultT<EventBatch> {
        let mut batch = EventBatch::default();
        let mut seen_conversations = HashSet::new();
        let mut seen_messages = HashSet::new();

        let conversations = call_with_retry(self.retry, "fetch conversations", || {
            self.events.fetch_conversations_since(since)
        })?;
        batch.extend_conversations(&mut seen_conversations, conversations);
        let messages = call_with_retry(self.retry, "fetch messages", || {
            self.events.fetch_messages_since(since)
        })?;
        batch.extend_messages(&mut seen_messages, messages);

        let mut fetched_accounts = BTreeSet::new();
        for account in history_accounts {
            if !fetched_accounts.insert(account.clone()) {
                continue;
            }
            let conversations = call_with_retry(self.retry, "fetch account conversations", || {
                self.events.fetch_conversations_for_account(account)
            })?;
            batch.extend_conversations(&mut seen_conversations, conversations);
            let messages = call_with_retry(self.retry, "fetch account messages", || {
                self.events.fetch_messages_for_account(account)
            })?;
            batch.extend_messages(&mut seen_messages, messages);
        }

        let repair = self.orphan_accounts(&batch, &seen_conversations, &fetched_accounts)?;
        for account in &repair {
            tracing::debug!(account = %account, "fetching conversations for orphaned messages");
            let conversations = call_with_retry(self.retry, "fetch account conversations", || {
                self.events.fetch_conversations_for_account(account)
            })?;
            batch.extend_conversations(&mut seen_conversations, conversations);
        }

        tracing::debug!(
            conversations = batch.conversations.len(),
            messages = batch.messages.len(),
            history_accounts = fetched_accounts.len(),
            repaired_accounts = repair.len(),
            "events fetched"
        );
        Ok(batch)
    }

    /// Accounts with messages whose conversation is nowhere to be found.
    fn orphan_accounts(
        &self,
        batch: &EventBatch,
        batch_conversations: &HashSet<String>,
        already_fetched: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let conn = self.db.conn();
        let mut accounts = BTreeSet::new();
        for message in &batch.messages {
            if batch_conversations.contains(&message.conversation_id)
                || already_fetched.contains(&message.account_id)
                || accounts.contains(&message.account_id)
                || message.account_id.trim().is_empty()
            {
                continue;
            }
            if events::message_exists(conn, &message.id)?
                || events::get_conversation(conn, &message.conversation_id)?.is_some()
            {
                continue;
            }
            if self.owns_account(conn, &message.account_id)? {
                accounts.insert(message.account_id.clone());
            }
        }
        Ok(accounts)
    }

    /// Whether events from `account` can be attributed to an identity.
    fn owns_account(&self, conn: &Connection, account: &str) -> Result<bool> {
        let account = account.trim();
        if account.is_empty() {
            return Ok(false);
        }
        Ok(self.mode.accepts_unknown_accounts()
            || identity::find_by_account(conn, account)?.is_some())
    }

    /// Upsert conversations in one transaction.
    pub fn ingest_conversations(
        &self,
        conversations: &[ConversationEvent],
    ) -> SyncResultT<ConversationIngest> {
        let mut ingest = ConversationIngest::default();
        let tx = self.db.conn().unchecked_transaction()?;
        for event in conversations {
            let outcome = self.apply_conversation(&tx, event, &mut ingest.identities_created)?;
            ingest.report.record(event.id.clone(), outcome);
        }
        tx.commit()?;

        tracing::info!(
            inserted = ingest.report.inserted,
            updated = ingest.report.updated,
            skipped = ingest.report.errors(),
            identities_created = ingest.identities_created,
            "conversations ingested"
        );
        Ok(ingest)
    }

    fn apply_conversation(
        &self,
        conn: &Connection,
        event: &ConversationEvent,
        identities_created: &mut usize,
    ) -> Result<Result<Applied, SkipReason>> {
        let prompt = event.prompt.as_deref().filter(|p| !p.trim().is_empty());

        if let Some(existing) = events::get_conversation(conn, &event.id)? {
            let changed =
                events::refresh_conversation(conn, existing.id, prompt, event.timestamp.as_ref())?;
            return Ok(Ok(if changed {
                Applied::Updated
            } else {
                Applied::Unchanged
            }));
        }

        let account = event.account_id.trim();
        if account.is_empty() {
            return Ok(Err(SkipReason::Malformed("missing account id".to_string())));
        }
        let owner = match identity::find_by_account(conn, account)? {
            Some(owner) => owner.local_id,
            None if self.mode.accepts_unknown_accounts() => {
                let id = identity::insert_resolved(conn, account, None, self.run_seq, &self.now)?;
                tracing::info!(local_id = id, account, "identity created for unseen account");
                *identities_created += 1;
                id
            }
            None => return Ok(Err(SkipReason::UnknownAccount(account.to_string()))),
        };

        events::insert_conversation(
            conn,
            &event.id,
            owner,
            prompt,
            event.timestamp.as_ref(),
            &self.now,
        )?;
        Ok(Ok(Applied::Inserted))
    }

    /// Insert new messages in one transaction.
    pub fn ingest_messages(&self, messages: &[MessageEvent]) -> SyncResultT<MessageIngest> {
        let mut ingest = MessageIngest::default();
        let tx = self.db.conn().unchecked_transaction()?;
        for event in messages {
            let outcome = self.apply_message(&tx, event, &mut ingest)?;
            ingest.report.record(event.id.clone(), outcome);
        }
        tx.commit()?;

        let orphans = ingest
            .report
            .skips_where(|r| matches!(r, SkipReason::ConversationMissing(_)))
            .count();
        if orphans > 0 {
            tracing::warn!(orphans, "messages skipped until their conversation arrives");
        }
        tracing::info!(
            inserted = ingest.report.inserted,
            risky = ingest.risky_new.len(),
            skipped = ingest.report.errors(),
            "messages ingested"
        );
        Ok(ingest)
    }

    fn apply_message(
        &self,
        conn: &Connection,
        event: &MessageEvent,
        ingest: &mut MessageIngest,
    ) -> Result<Result<Applied, SkipReason>> {
        if events::message_exists(conn, &event.id)? {
            return Ok(Ok(Applied::Unchanged));
        }
        let Some(sent_at) = event.timestamp else {
            return Ok(Err(SkipReason::MissingTimestamp));
        };
        let Some(conversation) = events::get_conversation(conn, &event.conversation_id)? else {
            // Only owned accounts hold the watermark back; a stranger's
            // conversation is never going to be stored.
            if self.owns_account(conn, &event.account_id)? {
                ingest.earliest_orphan = Some(match ingest.earliest_orphan {
                    Some(current) => current.min(sent_at),
                    None => sent_at,
                });
            }
            return Ok(Err(SkipReason::ConversationMissing(
                event.conversation_id.clone(),
            )));
        };

        let is_risky = event.risk_label.is_risky();
        let id = events::insert_message(
            conn,
            &NewMessage {
                external_id: &event.id,
                conversation_id: conversation.id,
                local_id: conversation.local_id,
                text: &event.text,
                sent_at: &sent_at,
                is_risky,
                queue_alert: self.queue_alerts,
            },
            Some(self.run_seq),
            &self.now,
        )?;
        if is_risky && self.queue_alerts {
            ingest.risky_new.push(id);
        }
        Ok(Ok(Applied::Inserted))
    }

    /// Ids in `batch` that the store does not have.
    pub fn missing(&self, batch: &EventBatch) -> SyncResultT<MissingEvents> {
        let conn = self.db.conn();
        let mut missing = MissingEvents::default();
        for conversation in &batch.conversations {
            if events::get_conversation(conn, &conversation.id)?.is_none() {
                missing.conversations.push(conversation.id.clone());
            }
        }
        for message in &batch.messages {
            if !events::message_exists(conn, &message.id)? {
                missing.messages.push(message.id.clone());
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEventStore;
    use chrono::{Duration, TimeZone};

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn setup() -> SyncDb {
        let db = SyncDb::open_in_memory().unwrap();
        db.init_schema().unwrap();
        identity::insert_resolved(db.conn(), "acct-1", None, 1, &t(0)).unwrap();
        db
    }

    fn ingestor<'a>(
        db: &'a SyncDb,
        events: &'a FakeEventStore,
        retry: &'a RetryPolicy,
        mode: SelectionMode,
    ) -> Ingestor<'a, FakeEventStore> {
        Ingestor::new(db, events, retry, mode, 1, t(60))
    }

    #[test]
    fn test_conversations_need_a_known_owner() {
        let db = setup();
        let events = FakeEventStore::new();
        events.add_conversation("c1", "acct-1", t(1));
        events.add_conversation("c2", "stranger", t(2));
        let retry = RetryPolicy::immediate(1);
        let ingestor = ingestor(&db, &events, &retry, SelectionMode::Registry);

        let batch = ingestor.fetch(None, &[]).unwrap();
        let ingest = ingestor.ingest_conversations(&batch.conversations).unwrap();
        assert_eq!(ingest.report.inserted, 1);
        assert_eq!(
            ingest.report.skipped[0].reason,
            SkipReason::UnknownAccount("stranger".to_string())
        );

        // Second pass: nothing new, nothing blanked.
        let again = ingestor.ingest_conversations(&batch.conversations).unwrap();
        assert_eq!(again.report.inserted, 0);
        assert_eq!(again.report.unchanged, 1);
    }

    #[test]
    fn test_accept_all_creates_identities() {
        let db = setup();
        let events = FakeEventStore::new();
        events.add_conversation("c2", "stranger", t(2));
        let retry = RetryPolicy::immediate(1);
        let ingestor = ingestor(&db, &events, &retry, SelectionMode::All);

        let batch = ingestor.fetch(None, &[]).unwrap();
        let ingest = ingestor.ingest_conversations(&batch.conversations).unwrap();
        assert_eq!(ingest.identities_created, 1);
        let created = identity::find_by_account(db.conn(), "stranger").unwrap().unwrap();
        assert!(created.is_resolved());
    }

    #[test]
    fn test_messages_skip_without_conversation_or_timestamp() {
        let db = setup();
        let events = FakeEventStore::new();
        events.add_conversation("c1", "acct-1", t(1));
        events.add_message("m1", "c1", "acct-1", "hello", Some(t(2)), false);
        events.add_message("m2", "c9", "acct-1", "lost", Some(t(3)), true);
        events.add_message("m3", "c1", "acct-1", "when?", None, false);
        events.add_message("m4", "c1", "acct-1", "help", Some(t(4)), true);
        let retry = RetryPolicy::immediate(1);
        let ingestor = ingestor(&db, &events, &retry, SelectionMode::Registry);

        let batch = ingestor.fetch(None, &[]).unwrap();
        ingestor.ingest_conversations(&batch.conversations).unwrap();
        let ingest = ingestor.ingest_messages(&batch.messages).unwrap();
        assert_eq!(ingest.report.inserted, 2);
        assert_eq!(ingest.risky_new.len(), 1);
        assert_eq!(ingest.earliest_orphan, Some(t(3)));
        let reasons: Vec<_> = ingest.report.skipped.iter().map(|s| &s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                &SkipReason::ConversationMissing("c9".to_string()),
                &SkipReason::MissingTimestamp
            ]
        );

        let stored = events::get_message(db.conn(), "m4").unwrap().unwrap();
        assert!(stored.is_risky);
        assert!(stored.alert_pending);
        assert!(!stored.alert_sent);
    }

    #[test]
    fn test_stranger_orphans_do_not_hold_back() {
        let db = setup();
        let events = FakeEventStore::new();
        events.add_conversation("c-x", "stranger", t(1));
        events.add_message("m-x", "c-x", "stranger", "hi", Some(t(2)), false);
        let retry = RetryPolicy::immediate(1);

        let registry = ingestor(&db, &events, &retry, SelectionMode::Registry);
        let batch = registry.fetch(None, &[]).unwrap();
        registry.ingest_conversations(&batch.conversations).unwrap();
        let ingest = registry.ingest_messages(&batch.messages).unwrap();
        assert_eq!(ingest.report.inserted, 0);
        assert_eq!(ingest.earliest_orphan, None);

        // Accepting every account makes the stranger an owner after all.
        let mut strangers = batch.messages.clone();
        strangers[0].conversation_id = "c-unseen".to_string();
        let accept_all = ingestor(&db, &events, &retry, SelectionMode::All);
        let ingest = accept_all.ingest_messages(&strangers).unwrap();
        assert_eq!(ingest.earliest_orphan, Some(t(2)));
    }

    #[test]
    fn test_reingest_is_noop() {
        let db = setup();
        let events = FakeEventStore::new();
        events.add_conversation("c1", "acct-1", t(1));
        events.add_message("m1", "c1", "acct-1", "help", Some(t(2)), true);
        let retry = RetryPolicy::immediate(1);
        let ingestor = ingestor(&db, &events, &retry, SelectionMode::Registry);

        let batch = ingestor.fetch(None, &[]).unwrap();
        ingestor.ingest_conversations(&batch.conversations).unwrap();
        ingestor.ingest_messages(&batch.messages).unwrap();
        let id = events::get_message(db.conn(), "m1").unwrap().unwrap().id;
        events::mark_alert_sent(db.conn(), id, &t(5)).unwrap();

        let again = ingestor.ingest_messages(&batch.messages).unwrap();
        assert_eq!(again.report.unchanged, 1);
        assert!(again.risky_new.is_empty());
        assert!(events::get_message(db.conn(), "m1").unwrap().unwrap().alert_sent);
    }

    #[test]
    fn test_history_and_orphan_repair_fetches() {
        let db = setup();
        let events = FakeEventStore::new();
        // Old conversation, older than the watermark, observed late.
        events.add_conversation("c-old", "acct-1", t(1));
        events.add_message("m-new", "c-old", "acct-1", "hi", Some(t(30)), false);
        events.add_account("acct-2");
        identity::insert_resolved(db.conn(), "acct-2", None, 1, &t(0)).unwrap();
        events.add_conversation("c-2", "acct-2", t(2));
        let retry = RetryPolicy::immediate(1);
        let ingestor = ingestor(&db, &events, &retry, SelectionMode::Registry);

        let batch = ingestor.fetch(Some(t(10)), &["acct-2".to_string()]).unwrap();
        let mut ids: Vec<_> = batch.conversations.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["c-2", "c-old"]);
        assert_eq!(events.history_fetches(), vec!["acct-2", "acct-1"]);

        let missing = ingestor.missing(&batch).unwrap();
        assert_eq!(missing.conversations.len(), 2);
        assert_eq!(missing.messages, vec!["m-new"]);
    }
}
