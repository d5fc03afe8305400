//! Process logging: `env_logger` initialisation plus an in-memory recent
//! activity buffer used for diagnostics, independent of the `log` crate's
//! own sink.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Initialise `env_logger` from `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    builder.init();
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded ring buffer of recent log entries, exposed read-only via
/// `GET /api/diagnostics/logs`. Trims oldest entries once `max_entries`
/// is exceeded.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        LogBuffer {
            entries: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_to_capacity() {
        let buf = LogBuffer::new(2);
        buf.push(LogLevel::Info, "a");
        buf.push(LogLevel::Info, "b");
        buf.push(LogLevel::Info, "c");
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].message, "b");
        assert_eq!(snap[1].message, "c");
    }
}
