use crate::storage::ensure_parent_dir;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// `[2024-05-01T10:00:00.000Z] [SUCCESS] Saved Thermal camera frame`
    pub fn export_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level.as_str().to_uppercase(),
            self.message
        )
    }
}

pub type SharedActivityLog = Arc<ActivityLog>;

/// User-facing event log shared by every part of the console. Entries live in
/// memory only; the oldest are dropped past the capacity.
#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedActivityLog {
        Arc::new(Self::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.push_at(level, message, Utc::now());
    }

    pub fn push_at(&self, level: LogLevel, message: impl Into<String>, timestamp: DateTime<Utc>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => info!(target: "activity", %level, "{message}"),
            LogLevel::Warning => warn!(target: "activity", "{message}"),
            LogLevel::Error => error!(target: "activity", "{message}"),
        }

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            message,
            level,
            timestamp,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(LogLevel::Success, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn export_text(&self) -> String {
        self.entries
            .lock()
            .iter()
            .map(LogEntry::export_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Writes the log to `dir/rescue-console-logs-YYYY-MM-DD.txt`.
    pub fn export_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!(
            "rescue-console-logs-{}.txt",
            Utc::now().format("%Y-%m-%d")
        ));
        ensure_parent_dir(&path)?;
        fs::write(&path, self.export_text())
            .with_context(|| format!("failed writing activity log to {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::{ActivityLog, LogLevel};
    use chrono::{TimeZone, Utc};

    #[test]
    fn export_uses_iso_timestamps_and_upper_levels() {
        let log = ActivityLog::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        log.push_at(LogLevel::Info, "System initialized", at);
        log.push_at(LogLevel::Success, "Saved Thermal camera frame", at);

        assert_eq!(
            log.export_text(),
            "[2024-05-01T10:00:00.000Z] [INFO] System initialized\n\
             [2024-05-01T10:00:00.000Z] [SUCCESS] Saved Thermal camera frame"
        );
    }

    #[test]
    fn capacity_drops_oldest_entries() {
        let log = ActivityLog::with_capacity(2);
        log.info("one");
        log.warning("two");
        log.error("three");
        let messages = log
            .entries()
            .into_iter()
            .map(|entry| entry.message)
            .collect::<Vec<_>>();
        assert_eq!(messages, ["two", "three"]);
    }

    #[test]
    fn clear_empties_the_log() {
        let log = ActivityLog::new();
        log.success("connected");
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
        assert!(log.export_text().is_empty());
    }

    #[test]
    fn export_writes_a_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new();
        log.info("hello");
        let path = log.export_to(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rescue-console-logs-"));
        assert!(std::fs::read_to_string(path).unwrap().ends_with("[INFO] hello"));
    }
}
