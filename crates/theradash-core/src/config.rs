//! Sync configuration.
//!
//! Everything the engine needs to know about which participants to monitor
//! and how to talk to its collaborators. Deserialized from JSON with defaults
//! for every field, so an empty object is a valid (registry-mode, no
//! projects) configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which participants a run monitors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Registry participants only.
    #[default]
    Registry,
    /// The configured list of event-store accounts only.
    Accounts,
    /// Registry participants plus the configured accounts.
    Both,
    /// Every account seen in the event store (accept-all).
    All,
}

impl SelectionMode {
    /// Whether registry projects are reconciled in this mode.
    #[must_use]
    pub const fn uses_registry(self) -> bool {
        matches!(self, Self::Registry | Self::Both | Self::All)
    }

    /// Whether the monitored account list is reconciled in this mode.
    #[must_use]
    pub const fn uses_account_list(self) -> bool {
        matches!(self, Self::Accounts | Self::Both)
    }

    /// Whether identities missing from this run's roster become inactive.
    ///
    /// In accept-all mode the roster is open-ended, so absence means nothing.
    #[must_use]
    pub const fn absence_deactivates(self) -> bool {
        !matches!(self, Self::All)
    }

    /// Whether ingest may create identities for unknown accounts.
    #[must_use]
    pub const fn accepts_unknown_accounts(self) -> bool {
        matches!(self, Self::All)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Accounts => "accounts",
            Self::Both => "both",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registry field surfaced on the dashboard under a display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldConfig {
    pub field: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl CustomFieldConfig {
    /// The label to store the value under (falls back to the field name).
    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.field)
    }
}

/// One registry project and the field names its rows use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,
    /// Selection predicate handed to the registry client verbatim.
    pub filter: Option<String>,
    pub record_id_field: String,
    pub account_id_field: String,
    pub staff_field: String,
    pub username_field: String,
    pub study_start_field: Option<String>,
    pub study_end_field: Option<String>,
    pub dropped_field: String,
    pub dropped_surveys_field: String,
    pub custom_fields: Vec<CustomFieldConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            filter: None,
            record_id_field: "record_id".to_string(),
            account_id_field: "firebase_id".to_string(),
            staff_field: "ra".to_string(),
            username_field: "username".to_string(),
            study_start_field: None,
            study_end_field: None,
            dropped_field: "dropped".to_string(),
            dropped_surveys_field: "dropped_surveys".to_string(),
            custom_fields: Vec::new(),
        }
    }
}

impl ProjectConfig {
    /// A project with default field names.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Retry policy for collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (0-based), doubling each time.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub selection_mode: SelectionMode,
    pub projects: Vec<ProjectConfig>,
    /// Event-store accounts monitored directly, outside any registry.
    pub monitored_accounts: Vec<String>,
    pub retry: RetryPolicy,
    /// A `running` lock older than this is treated as abandoned.
    pub lock_timeout_secs: u64,
    pub alert_excerpt_chars: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            selection_mode: SelectionMode::default(),
            projects: Vec::new(),
            monitored_accounts: Vec::new(),
            retry: RetryPolicy::default(),
            lock_timeout_secs: 30 * 60,
            alert_excerpt_chars: 100,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.normalize();
        Ok(config)
    }

    /// Add monitored accounts from a comma-separated list (e.g. an env var).
    pub fn extend_monitored_accounts(&mut self, csv: &str) {
        self.monitored_accounts
            .extend(csv.split(',').map(str::trim).map(String::from));
        self.normalize();
    }

    /// Trim and de-duplicate the account list, dropping blanks.
    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.monitored_accounts = std::mem::take(&mut self.monitored_accounts)
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty() && seen.insert(a.clone()))
            .collect();
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = SyncConfig::from_json("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.selection_mode, SelectionMode::Registry);
        assert_eq!(config.alert_excerpt_chars, 100);
    }

    #[test]
    fn test_project_field_defaults() {
        let config = SyncConfig::from_json(
            r#"{"selection_mode":"both","projects":[{"id":"p1","name":"Pilot",
                "custom_fields":[{"field":"phq9"},{"field":"arm","label":"Study arm"}]}]}"#,
        )
        .unwrap();
        assert_eq!(config.selection_mode, SelectionMode::Both);
        let project = &config.projects[0];
        assert_eq!(project.account_id_field, "firebase_id");
        assert_eq!(project.staff_field, "ra");
        assert_eq!(project.custom_fields[0].label(), "phq9");
        assert_eq!(project.custom_fields[1].label(), "Study arm");
    }

    #[test]
    fn test_monitored_accounts_normalized() {
        let mut config =
            SyncConfig::from_json(r#"{"monitored_accounts":[" a ","","b","a"]}"#).unwrap();
        assert_eq!(config.monitored_accounts, vec!["a", "b"]);

        config.extend_monitored_accounts("c, b,,d ");
        assert_eq!(config.monitored_accounts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 1_500,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_500));
        assert_eq!(policy.delay_for(63), Duration::from_millis(1_500));
        assert_eq!(RetryPolicy::immediate(2).delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_mode_semantics() {
        assert!(SelectionMode::Registry.absence_deactivates());
        assert!(!SelectionMode::All.absence_deactivates());
        assert!(SelectionMode::All.accepts_unknown_accounts());
        assert!(SelectionMode::Both.uses_account_list());
        assert!(!SelectionMode::Accounts.uses_registry());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"lock_timeout_secs": 60}"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));

        let missing = SyncConfig::load(&dir.path().join("nope.json"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read config file"));
    }
}
