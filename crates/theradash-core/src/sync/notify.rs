//! Risk notifier.
//!
//! Sends one alert per risky message and records the outcome. Alerts are
//! sent first and the outcomes written afterwards in a single transaction;
//! a crash in between means the alerts are sent again next run.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clients::AlertSender;
use crate::errors::SyncResultT;
use crate::store::events::{self, PendingAlert};
use crate::store::SyncDb;

/// The first `max_chars` characters of `text`, with `...` when cut short.
#[must_use]
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// An alert that did not go out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertFailure {
    pub message_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub attempted: usize,
    pub alerts_sent: usize,
    pub failures: Vec<AlertFailure>,
}

enum Delivery {
    Sent,
    Failed(String),
}

pub struct Notifier<'a, A> {
    db: &'a SyncDb,
    alerts: &'a A,
    excerpt_chars: usize,
    now: DateTime<Utc>,
}

impl<'a, A: AlertSender> Notifier<'a, A> {
    pub const fn new(db: &'a SyncDb, alerts: &'a A, excerpt_chars: usize, now: DateTime<Utc>) -> Self {
        Self {
            db,
            alerts,
            excerpt_chars,
            now,
        }
    }

    /// Alert the risky messages this run inserted, plus any still pending
    /// from earlier runs.
    pub fn notify(&self, newly_inserted: &[i64]) -> SyncResultT<NotifyReport> {
        let conn = self.db.conn();
        let mut candidates = Vec::new();
        for &id in newly_inserted {
            if let Some(candidate) = events::alert_candidate(conn, id)? {
                candidates.push(candidate);
            }
        }
        candidates.extend(events::pending_alerts(conn)?);
        self.deliver(candidates)
    }

    /// Alert every risky message that never got a successful alert.
    pub fn backfill(&self) -> SyncResultT<NotifyReport> {
        let candidates = events::unsent_risky(self.db.conn())?;
        self.deliver(candidates)
    }

    fn deliver(&self, candidates: Vec<PendingAlert>) -> SyncResultT<NotifyReport> {
        let mut seen = HashSet::new();
        let mut outcomes = Vec::new();
        for candidate in candidates {
            if !seen.insert(candidate.message_id) {
                continue;
            }
            let text = excerpt(&candidate.text, self.excerpt_chars);
            let delivery = match self.alerts.send_risk_alert(&candidate.account_id, &text) {
                Ok(true) => Delivery::Sent,
                Ok(false) => Delivery::Failed("no recipient reached".to_string()),
                Err(err) => Delivery::Failed(err.to_string()),
            };
            outcomes.push((candidate, delivery));
        }

        let mut report = NotifyReport {
            attempted: outcomes.len(),
            ..NotifyReport::default()
        };
        let tx = self.db.conn().unchecked_transaction()?;
        for (candidate, delivery) in outcomes {
            match delivery {
                Delivery::Sent => {
                    if events::mark_alert_sent(&tx, candidate.message_id, &self.now)? {
                        report.alerts_sent += 1;
                    }
                }
                Delivery::Failed(error) => {
                    tracing::warn!(
                        message = %candidate.external_id,
                        account = %candidate.account_id,
                        error = %error,
                        "risk alert failed, will retry next run"
                    );
                    events::record_alert_failure(&tx, candidate.message_id, &error)?;
                    report.failures.push(AlertFailure {
                        message_id: candidate.external_id,
                        error,
                    });
                }
            }
        }
        tx.commit()?;

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                sent = report.alerts_sent,
                failed = report.failures.len(),
                "risk alerts processed"
            );
        }
        Ok(report)
    }
}
