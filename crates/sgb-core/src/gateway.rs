//! Secure gateway for handler-originated persistence writes.
//!
//! Defense in depth: handlers already sit behind the validator, but every
//! usage/audit write is re-checked and re-sanitized here so a handler bug
//! cannot smuggle unvalidated data into the log.

use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
};

use serde::Serialize;

use crate::{
    audit::iso_timestamp_utc,
    errors::Error,
    security::{is_member_identifier, sanitize_text},
    Result,
};

const MAX_COMMAND_LEN: usize = 64;
const MAX_ACTOR_LEN: usize = 64;
const MAX_ERROR_CLASS_LEN: usize = 64;
const MAX_DETAIL_LEN: usize = 500;

/// Hard ceiling on one serialized record. Oversize records are rejected,
/// never truncated silently.
const MAX_RECORD_BYTES: usize = 4096;

/// One append-only usage record.
#[derive(Clone, Debug, Serialize)]
pub struct UsageRecord {
    pub timestamp: String,
    pub command: String,
    pub actor: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UsageRecord {
    pub fn new(command: &str, actor: &str, success: bool, latency_ms: u64) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            command: command.to_string(),
            actor: actor.to_string(),
            success,
            latency_ms,
            error_class: None,
            detail: None,
        }
    }

    pub fn with_error(mut self, class: &str) -> Self {
        self.error_class = Some(class.to_string());
        self
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

pub struct SecureGateway {
    usage_path: PathBuf,
    known_commands: Vec<String>,
}

impl SecureGateway {
    /// `known_commands` is the registry's command-name set; records claiming
    /// any other origin are rejected.
    pub fn new(usage_path: impl Into<PathBuf>, known_commands: Vec<String>) -> Self {
        Self {
            usage_path: usage_path.into(),
            known_commands,
        }
    }

    /// Validate, sanitize and append one usage record.
    pub fn record_usage(&self, record: UsageRecord) -> Result<()> {
        let record = self.check(record)?;

        let line = serde_json::to_string(&record)?;
        if line.len() > MAX_RECORD_BYTES {
            return Err(Error::Security(format!(
                "usage record exceeds {MAX_RECORD_BYTES} bytes"
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.usage_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn check(&self, mut record: UsageRecord) -> Result<UsageRecord> {
        // Authorization re-check, independent of the upstream validator: the
        // actor must be a well-formed member identifier and the command must
        // come from the static registry.
        if !is_member_identifier(&record.actor) {
            return Err(Error::Security(format!(
                "usage record with malformed actor: {}",
                sanitize_text(&record.actor)
            )));
        }
        if !self.known_commands.iter().any(|c| c == &record.command) {
            return Err(Error::Security(format!(
                "usage record for unregistered command: {}",
                sanitize_text(&record.command)
            )));
        }

        check_field_len("command", &record.command, MAX_COMMAND_LEN)?;
        check_field_len("actor", &record.actor, MAX_ACTOR_LEN)?;
        if let Some(class) = &record.error_class {
            check_field_len("error_class", class, MAX_ERROR_CLASS_LEN)?;
            record.error_class = Some(sanitize_text(class));
        }
        if let Some(detail) = &record.detail {
            check_field_len("detail", detail, MAX_DETAIL_LEN)?;
            record.detail = Some(sanitize_text(detail));
        }

        Ok(record)
    }
}

fn check_field_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::Security(format!(
            "usage record field {field} exceeds {max} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.log"))
    }

    fn gateway(prefix: &str) -> SecureGateway {
        SecureGateway::new(
            tmp_file(prefix),
            vec!["add".to_string(), "groups".to_string()],
        )
    }

    #[test]
    fn valid_record_is_appended_as_jsonl() {
        let g = gateway("sgb-gw-ok");
        g.record_usage(UsageRecord::new("add", "+491700000001", true, 120))
            .unwrap();
        g.record_usage(
            UsageRecord::new("groups", "+491700000001", false, 40).with_error("timeout"),
        )
        .unwrap();

        let written = std::fs::read_to_string(&g.usage_path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains("\"error_class\":\"timeout\""));
    }

    #[test]
    fn malformed_actor_is_rejected() {
        let g = gateway("sgb-gw-actor");
        let err = g
            .record_usage(UsageRecord::new("add", "eve; drop table", true, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn unregistered_command_is_rejected() {
        let g = gateway("sgb-gw-cmd");
        let err = g
            .record_usage(UsageRecord::new("selfdestruct", "+491700000001", true, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn oversize_detail_is_rejected_not_truncated() {
        let g = gateway("sgb-gw-size");
        let record = UsageRecord::new("add", "+491700000001", true, 1)
            .with_detail(&"d".repeat(MAX_DETAIL_LEN + 1));
        let err = g.record_usage(record).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(std::fs::read_to_string(&g.usage_path).is_err());
    }

    #[test]
    fn detail_is_sanitized_before_write() {
        let g = gateway("sgb-gw-sanitize");
        g.record_usage(
            UsageRecord::new("add", "+491700000001", false, 1)
                .with_detail("boom `rm -rf`; $(x)"),
        )
        .unwrap();
        let written = std::fs::read_to_string(&g.usage_path).unwrap();
        assert!(!written.contains('`'));
        assert!(!written.contains('$'));
    }
}
