//! systemd journal backed event source.
//!
//! Runs `journalctl --output=json` restricted to the configured syslog
//! identifiers and parses one JSON object per output line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{EventSource, LogEntry, SourceError};

/// Raw journal JSON structures for parsing.
mod journal_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct JournalRecord {
        #[serde(rename = "__REALTIME_TIMESTAMP")]
        pub realtime_timestamp: Option<String>,
        /// A string, or an array of bytes when the message is not valid UTF-8
        #[serde(rename = "MESSAGE")]
        pub message: Option<serde_json::Value>,
        #[serde(rename = "SYSLOG_IDENTIFIER")]
        pub syslog_identifier: Option<String>,
        #[serde(rename = "_COMM")]
        pub comm: Option<String>,
    }
}

/// Event source reading the local systemd journal.
#[derive(Debug, Clone)]
pub struct JournalSource {
    identifiers: Vec<String>,
    timeout: Duration,
}

impl JournalSource {
    /// `identifiers` restricts the query to these syslog identifiers (`-t`).
    pub fn new(identifiers: Vec<String>, timeout: Duration) -> Self {
        Self {
            identifiers,
            timeout,
        }
    }

    /// Arguments handed to `journalctl` for a query starting at `since`.
    ///
    /// The journal only accepts whole seconds here, so the caller filters the
    /// sub-second remainder.
    pub fn build_args(&self, since: DateTime<Utc>) -> Vec<String> {
        let mut args = vec![
            "--output=json".to_string(),
            "--no-pager".to_string(),
            format!("--since=@{}", since.timestamp()),
        ];
        for id in &self.identifiers {
            args.push("-t".to_string());
            args.push(id.clone());
        }
        args
    }
}

/// Parse one line of `journalctl --output=json`.
///
/// Returns `None` for anything that is not a usable entry.
pub fn parse_journal_line(line: &str) -> Option<LogEntry> {
    let record: journal_json::JournalRecord = serde_json::from_str(line.trim()).ok()?;

    let micros: i64 = record.realtime_timestamp?.parse().ok()?;
    let timestamp = DateTime::<Utc>::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1000) as u32,
    )?;

    let message = match record.message? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(bytes) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64())
                .map(|b| b as u8)
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => return None,
    };

    let subsystem = record.syslog_identifier.or(record.comm)?;

    Some(LogEntry {
        subsystem,
        message,
        timestamp,
    })
}

/// Parse full `journalctl` output, keeping entries at or after `since`.
pub fn parse_journal_output(output: &str, since: DateTime<Utc>) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_journal_line)
        .filter(|entry| entry.timestamp >= since)
        .collect();
    // Stable sort keeps the journal's order for equal timestamps
    entries.sort_by_key(|e| e.timestamp);
    entries
}

#[async_trait]
impl EventSource for JournalSource {
    async fn query(&self, since: DateTime<Utc>) -> Result<Vec<LogEntry>, SourceError> {
        let mut cmd = Command::new("journalctl");
        cmd.args(self.build_args(since)).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SourceError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SourceError::SourceUnavailable("journalctl not found in PATH".to_string())
                } else {
                    SourceError::Io(e)
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Some journalctl versions exit non-zero when nothing matches
            if stdout.trim().is_empty() && stderr.contains("No entries") {
                return Ok(Vec::new());
            }
            return Err(SourceError::SourceUnavailable(format!(
                "journalctl exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let entries = parse_journal_output(&stdout, since);
        debug!(count = entries.len(), since = %since, "journal query");
        Ok(entries)
    }
}
