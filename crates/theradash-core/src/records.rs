//! Typed records at the collaborator boundary.
//!
//! Registry rows arrive as flat, loosely-typed JSON objects and are decoded
//! here into [`RegistryRecord`]s. Event-store documents deserialize straight
//! into [`ConversationEvent`] / [`MessageEvent`]; the aliases accept the field
//! names the event store exports (`firebase_message_id`, `convoID`,
//! `userID`, `riskScore`).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::config::ProjectConfig;

/// One raw registry row, as returned by the registry API.
pub type RegistryRow = Value;

/// Date formats the registry is known to emit.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y", "%m-%d-%Y"];

/// Why a registry row could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("registry row is not an object")]
    NotAnObject,

    #[error("registry row has no record id")]
    MissingRecordId,

    #[error("field '{field}' has an unsupported {kind} value")]
    UnsupportedValue { field: String, kind: &'static str },
}

/// A decoded registry participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub record_id: String,
    /// `None` when the registry has no account id for this participant yet.
    pub account_id: Option<String>,
    pub assigned_staff: Option<String>,
    pub username: Option<String>,
    pub study_start: Option<NaiveDate>,
    pub study_end: Option<NaiveDate>,
    pub dropped: bool,
    pub dropped_surveys: bool,
    /// Display label → value, for every configured custom field.
    pub custom_fields: BTreeMap<String, String>,
}

impl RegistryRecord {
    /// Decode a raw row using the project's field mapping.
    pub fn decode(row: &RegistryRow, project: &ProjectConfig) -> Result<Self, DecodeError> {
        let Value::Object(map) = row else {
            return Err(DecodeError::NotAnObject);
        };
        let field = |name: &str| -> Result<Option<String>, DecodeError> {
            scalar_text(name, map.get(name))
        };

        let record_id = match field(&project.record_id_field)? {
            Some(id) => id,
            None => field("id")?.ok_or(DecodeError::MissingRecordId)?,
        };

        let study_start = match &project.study_start_field {
            Some(name) => field(name)?.and_then(|raw| parse_date(name, &raw)),
            None => None,
        };
        let study_end = match &project.study_end_field {
            Some(name) => field(name)?.and_then(|raw| parse_date(name, &raw)),
            None => None,
        };

        let mut custom_fields = BTreeMap::new();
        for custom in &project.custom_fields {
            if custom.field.is_empty() {
                continue;
            }
            let value = field(&custom.field)?.unwrap_or_default();
            custom_fields.insert(custom.label().to_string(), value);
        }

        Ok(Self {
            record_id,
            account_id: field(&project.account_id_field)?,
            assigned_staff: field(&project.staff_field)?,
            username: field(&project.username_field)?,
            study_start,
            study_end,
            dropped: parse_flag(map.get(&project.dropped_field)),
            dropped_surveys: parse_flag(map.get(&project.dropped_surveys_field)),
            custom_fields,
        })
    }
}

/// Read a scalar field as trimmed text; blank and missing both become `None`.
fn scalar_text(name: &str, value: Option<&Value>) -> Result<Option<String>, DecodeError> {
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => (if *b { "1" } else { "0" }).to_string(),
        Some(Value::Array(_)) => {
            return Err(DecodeError::UnsupportedValue {
                field: name.to_string(),
                kind: "array",
            })
        }
        Some(Value::Object(_)) => {
            return Err(DecodeError::UnsupportedValue {
                field: name.to_string(),
                kind: "object",
            })
        }
    };
    Ok((!text.is_empty()).then_some(text))
}

fn parse_date(field: &str, raw: &str) -> Option<NaiveDate> {
    let parsed = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok());
    if parsed.is_none() {
        tracing::warn!(field, value = raw, "unparseable registry date, ignoring");
    }
    parsed
}

/// Registry checkbox semantics: `1`, `yes`, `true` (any case) are set.
fn parse_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "yes" | "true")
        }
        _ => false,
    }
}

/// Upstream risk classification attached to a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RiskLabel {
    Risky,
    NotRisky,
    #[default]
    Unlabeled,
}

impl RiskLabel {
    #[must_use]
    pub const fn is_risky(self) -> bool {
        matches!(self, Self::Risky)
    }

    /// Interpret the categorical label text (`"Risky"` / `"Not Risky"`).
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        if text.trim().eq_ignore_ascii_case("risky") {
            Self::Risky
        } else {
            Self::NotRisky
        }
    }
}

impl From<bool> for RiskLabel {
    fn from(risky: bool) -> Self {
        if risky {
            Self::Risky
        } else {
            Self::NotRisky
        }
    }
}

impl<'de> Deserialize<'de> for RiskLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => Self::from(b),
            Value::String(s) => Self::from_text(&s),
            _ => Self::Unlabeled,
        })
    }
}

impl Serialize for RiskLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Risky => serializer.serialize_str("Risky"),
            Self::NotRisky => serializer.serialize_str("Not Risky"),
            Self::Unlabeled => serializer.serialize_none(),
        }
    }
}

/// A conversation document from the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    #[serde(alias = "firebase_convo_id")]
    pub id: String,
    #[serde(alias = "userID")]
    pub account_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Unknown when the grouping event was never observed.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A message document from the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(alias = "firebase_message_id")]
    pub id: String,
    #[serde(alias = "convoID")]
    pub conversation_id: String,
    #[serde(alias = "userID")]
    pub account_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "riskScore")]
    pub risk_label: RiskLabel,
}

/// The auth-provider profile behind an event-store account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AuthRecord {
    /// The label staff recognise: email, then phone number, then display name.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        [&self.email, &self.phone_number, &self.display_name]
            .into_iter()
            .filter_map(|value| value.as_deref().map(str::trim))
            .find(|value| !value.is_empty())
    }
}
