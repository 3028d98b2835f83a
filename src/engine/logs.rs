//! Structured engine log parsing and classification.
//!
//! The engine writes one JSON object per line. Most lines are routine log
//! records; some carry a panic sentinel or a structured fatal error, and
//! anything that fails to parse is opaque diagnostic text kept around for
//! crash messages.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a structured engine log line.
///
/// The wire carries uppercase names, including the abbreviated `ERRO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "TRACE")]
    Trace,
    #[serde(alias = "DEBUG")]
    Debug,
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN")]
    Warn,
    #[serde(alias = "ERROR", alias = "ERRO")]
    Error,
    #[serde(alias = "QUERY")]
    Query,
}

/// One structured log line from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub level: LogLevel,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// The `message` field, when present and textual.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }

    /// The `query` field carried by query-shaped records.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.fields.get("query").and_then(Value::as_str)
    }

    /// The `duration_ms` field carried by query-shaped records.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.fields.get("duration_ms").and_then(Value::as_u64)
    }

    /// A record produced by the supervisor itself, e.g. for exit notices.
    pub(crate) fn synthesized(level: LogLevel, target: &str, message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".to_string(), Value::String(message.into()));
        Self {
            timestamp: Some(Utc::now().to_rfc3339()),
            level,
            target: Some(target.to_string()),
            fields,
        }
    }
}

/// Context captured from a panic notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicDetails {
    pub reason: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub column: Option<u64>,
    #[serde(default)]
    pub backtrace: Option<String>,
}

impl fmt::Display for PanicDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " at {file}:{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        Ok(())
    }
}

/// Outcome of classifying one engine output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Routine structured log record.
    Log(LogRecord),
    /// Panic sentinel; fatal for the whole session.
    Panic(PanicDetails),
    /// Structured fatal error outside the log format (`is_panic: false`
    /// payloads and backtrace-carrying objects).
    Fatal {
        message: String,
        backtrace: Option<String>,
    },
    /// Not JSON; opaque diagnostic text.
    Opaque(String),
}

/// Classify one line of engine output.
///
/// Handles the three JSON shapes the engine emits: error payloads flagged
/// with `is_panic`, structured log records (where a `PANIC` message marks a
/// panic and a `query` field reclassifies the level), and bare
/// backtrace-carrying objects. Everything else is opaque.
#[must_use]
pub fn classify_line(line: &str) -> Classified {
    let trimmed = line.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Classified::Opaque(line.to_string());
    };
    let Some(object) = value.as_object() else {
        return Classified::Opaque(line.to_string());
    };

    if let Some(is_panic) = object.get("is_panic").and_then(Value::as_bool) {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("engine reported a fatal error")
            .to_string();
        let backtrace = object
            .get("backtrace")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        if is_panic {
            return Classified::Panic(PanicDetails {
                reason: message,
                file: None,
                line: None,
                column: None,
                backtrace,
            });
        }
        return Classified::Fatal { message, backtrace };
    }

    if let Ok(mut record) = serde_json::from_value::<LogRecord>(value.clone()) {
        if record.message() == Some("PANIC") {
            return Classified::Panic(panic_from_fields(&record.fields, trimmed));
        }
        if record.fields.contains_key("query") {
            record.level = LogLevel::Query;
        }
        return Classified::Log(record);
    }

    if object.contains_key("backtrace") {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(trimmed)
            .to_string();
        let backtrace = object
            .get("backtrace")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        return Classified::Fatal { message, backtrace };
    }

    Classified::Opaque(line.to_string())
}

fn panic_from_fields(fields: &Map<String, Value>, raw: &str) -> PanicDetails {
    let reason = fields
        .get("reason")
        .and_then(Value::as_str)
        .map_or_else(|| raw.to_string(), ToString::to_string);
    PanicDetails {
        reason,
        file: fields
            .get("file")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        line: fields.get("line").and_then(Value::as_u64),
        column: fields.get("column").and_then(Value::as_u64),
        backtrace: fields
            .get("backtrace")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    }
}

/// Stderr chatter that must not pollute the accumulated diagnostics buffer.
#[must_use]
pub fn is_stderr_noise(line: &str) -> bool {
    line.contains("Printing to stderr") || line.contains("Listening on ")
}
