//! Output formatting for the theradash CLI.
//!
//! Text output is one line per record, `key:value` pairs separated by two
//! spaces. JSON output is pretty-printed and lists are wrapped in an
//! envelope with a count.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON format - machine-readable output
    Json,
    /// Plain text format - one line per record
    #[default]
    Text,
}

/// Keys rendered first, without a label, when present.
const LEADING_KEYS: &[&str] = &["run_seq", "status", "project_id"];

#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render `data` in the configured format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn format<T: Serialize>(&self, data: &T) -> Result<String> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
            OutputFormat::Text => Ok(render_text(&serde_json::to_value(data)?)),
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn print<T: Serialize>(&self, data: &T) -> Result<()> {
        let output = self.format(data)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{output}")?;
        Ok(())
    }

    /// Print a list, or `empty_message` in text mode when there is nothing.
    ///
    /// JSON output wraps the items as `{collection_name: [...], count: N}`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn print_list<T: Serialize>(
        &self,
        data: &[T],
        empty_message: &str,
        collection_name: &str,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let mut envelope = serde_json::Map::new();
                envelope.insert(collection_name.to_string(), serde_json::to_value(data)?);
                envelope.insert("count".to_string(), serde_json::json!(data.len()));
                self.print(&Value::Object(envelope))
            }
            OutputFormat::Text if data.is_empty() => {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{empty_message}")?;
                Ok(())
            }
            OutputFormat::Text => self.print(&data),
        }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputFormat::default())
    }
}

fn render_text(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut parts = Vec::new();
            for key in LEADING_KEYS {
                if let Some(val) = map.get(*key).filter(|v| !v.is_null()) {
                    parts.push(render_field_value(val));
                }
            }
            for (key, val) in map {
                if LEADING_KEYS.contains(&key.as_str()) || is_blank(val) {
                    continue;
                }
                parts.push(format!("{key}:{}", render_field_value(val)));
            }
            parts.join("  ")
        }
        Value::Array(items) => items.iter().map(render_text).collect::<Vec<_>>().join("\n"),
        _ => render_field_value(value),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn render_field_value(value: &Value) -> String {
    match value {
        Value::String(s) if s.contains(char::is_whitespace) => {
            format!("\"{}\"", s.replace('\n', "\\n"))
        }
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(render_field_value).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| format!("{k}:{}", render_field_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
        assert_eq!(Formatter::default().format, OutputFormat::Text);
    }

    #[test]
    fn test_json_output_is_valid() {
        let formatter = Formatter::new(OutputFormat::Json);
        let output = formatter
            .format(&json!({"run_seq": 3, "success": true}))
            .unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["run_seq"], 3);
        assert_eq!(parsed["success"], true);
    }

    #[test]
    fn test_text_puts_leading_keys_first_and_skips_blanks() {
        let formatter = Formatter::new(OutputFormat::Text);
        let output = formatter
            .format(&json!({
                "alerts_sent": 2,
                "error": null,
                "failures": [],
                "run_seq": 7,
                "status": "completed",
            }))
            .unwrap();
        assert_eq!(output, "7  completed  alerts_sent:2");
    }

    #[test]
    fn test_text_quotes_strings_with_spaces() {
        let output = Formatter::default()
            .format(&json!({"error": "project p1: timed out\nagain"}))
            .unwrap();
        assert_eq!(output, "error:\"project p1: timed out\\nagain\"");
    }

    #[test]
    fn test_text_nested_object_is_inline() {
        let output = Formatter::default()
            .format(&json!({"watermark": {"value": "2025-01-01", "advanced_by_run": null}}))
            .unwrap();
        assert_eq!(output, "watermark:{value:2025-01-01}");
    }

    #[test]
    fn test_text_list_is_one_line_per_item() {
        let output = Formatter::default()
            .format(&vec![json!({"run_seq": 2}), json!({"run_seq": 1})])
            .unwrap();
        assert_eq!(output, "2\n1");
    }
}
