//! Append-only audit log.
//!
//! Internal detail (stack traces, raw errors) goes here and never back to the
//! message sender.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{errors::Error, Result};

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<f64>,
}

impl AuditEvent {
    fn base(event: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            actor: None,
            command: None,
            content: None,
            reason: None,
            error: None,
            retry_after_secs: None,
        }
    }

    pub fn message(actor: &str, content: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            content: Some(content.to_string()),
            ..Self::base("message")
        }
    }

    pub fn rejection(actor: &str, command: &str, reason: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            command: Some(command.to_string()),
            reason: Some(reason.to_string()),
            ..Self::base("rejection")
        }
    }

    pub fn rate_limit(actor: &str, command: &str, retry_after_secs: f64) -> Self {
        Self {
            actor: Some(actor.to_string()),
            command: Some(command.to_string()),
            retry_after_secs: Some(retry_after_secs),
            ..Self::base("rate_limit")
        }
    }

    pub fn error(actor: &str, command: &str, error: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            command: Some(command.to_string()),
            error: Some(error.to_string()),
            ..Self::base("error")
        }
    }

    pub fn transport(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::base("transport")
        }
    }

    pub fn sync(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::base("sync")
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        // Truncate potentially large payloads.
        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.error {
            event.error = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}
