//! Chronological event/log sources scanned by the quality session.

pub mod journal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

pub use journal::JournalSource;

/// Error type for event source queries
#[derive(Debug, Error)]
pub enum SourceError {
    /// The log store could not be reached
    #[error("Event source unavailable: {0}")]
    SourceUnavailable(String),

    /// The log store answered with something unreadable
    #[error("Failed to parse event source output: {0}")]
    Parse(String),

    /// The query did not finish in time
    #[error("Event source query timed out")]
    Timeout,

    /// IO error while talking to the log store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One free-text log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Identifier of the emitting subsystem
    pub subsystem: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        subsystem: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// A chronological log the session can query incrementally.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Entries with `timestamp >= since`, oldest first.
    ///
    /// Timestamps are roughly monotonic; small jitter is tolerated by the caller.
    async fn query(&self, since: DateTime<Utc>) -> Result<Vec<LogEntry>, SourceError>;
}

#[derive(Debug, Default)]
struct MemoryLog {
    entries: Vec<LogEntry>,
    unavailable: bool,
}

/// In-process event source, for replaying captured logs and for tests.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    log: Mutex<MemoryLog>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        let source = Self::new();
        source.extend(entries);
        source
    }

    pub fn push(&self, entry: LogEntry) {
        self.lock().entries.push(entry);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = LogEntry>) {
        self.lock().entries.extend(entries);
    }

    /// Drop every stored entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Make subsequent queries fail with `SourceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn query(&self, since: DateTime<Utc>) -> Result<Vec<LogEntry>, SourceError> {
        let log = self.lock();
        if log.unavailable {
            return Err(SourceError::SourceUnavailable(
                "memory source marked unavailable".to_string(),
            ));
        }

        let mut entries: Vec<LogEntry> = log
            .entries
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}
