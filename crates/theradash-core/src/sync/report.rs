//! Per-record outcomes and per-phase reports.

use serde::Serialize;

/// What a single record did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Unchanged,
}

/// Why a record was skipped. Every skip is a RecordError.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// A registry row had no usable record id.
    MissingRecordId,
    /// A registry row could not be decoded.
    Malformed(String),
    /// No monitored identity owns this account.
    UnknownAccount(String),
    /// The message's conversation is not stored locally (yet).
    ConversationMissing(String),
    MissingTimestamp,
    /// `account_exists` failed after all retries; the row was kept as a
    /// placeholder.
    AccountCheckFailed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRecordId => f.write_str("missing record id"),
            Self::Malformed(detail) => write!(f, "malformed record: {detail}"),
            Self::UnknownAccount(account) => write!(f, "unknown account {account}"),
            Self::ConversationMissing(convo) => write!(f, "conversation {convo} not stored"),
            Self::MissingTimestamp => f.write_str("missing timestamp"),
            Self::AccountCheckFailed(detail) => write!(f, "account check failed: {detail}"),
        }
    }
}

/// A skipped record and the key it was skipped under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skip {
    pub key: String,
    pub reason: SkipReason,
}

/// Counters for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: Vec<Skip>,
}

impl PhaseReport {
    /// Fold one record's outcome into the counters.
    pub fn record(&mut self, key: impl Into<String>, outcome: Result<Applied, SkipReason>) {
        self.processed += 1;
        match outcome {
            Ok(Applied::Inserted) => self.inserted += 1,
            Ok(Applied::Updated) => self.updated += 1,
            Ok(Applied::Unchanged) => self.unchanged += 1,
            Err(reason) => {
                let key = key.into();
                tracing::debug!(key = %key, reason = %reason, "record skipped");
                self.skipped.push(Skip { key, reason });
            }
        }
    }

    /// Count a record that was applied but also produced a RecordError
    /// (e.g. an account check that fell back to a placeholder).
    pub fn record_degraded(&mut self, key: impl Into<String>, applied: Applied, reason: SkipReason) {
        let key = key.into();
        self.record(key.clone(), Ok(applied));
        self.skipped.push(Skip { key, reason });
    }

    /// Inserted plus updated records.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.inserted + self.updated
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.skipped.len()
    }

    /// Skips matching a predicate, for assertions and summaries.
    pub fn skips_where(&self, pred: impl Fn(&SkipReason) -> bool) -> impl Iterator<Item = &Skip> {
        self.skipped.iter().filter(move |skip| pred(&skip.reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut report = PhaseReport::default();
        report.record("a", Ok(Applied::Inserted));
        report.record("b", Ok(Applied::Updated));
        report.record("c", Ok(Applied::Unchanged));
        report.record("d", Err(SkipReason::MissingTimestamp));

        assert_eq!(report.processed, 4);
        assert_eq!(report.written(), 2);
        assert_eq!(report.errors(), 1);
        assert_eq!(report.skipped[0].key, "d");
        assert_eq!(
            report
                .skips_where(|r| matches!(r, SkipReason::MissingTimestamp))
                .count(),
            1
        );
    }
}
