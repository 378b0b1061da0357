//! Event log - appends notifications to a file
//!
//! One JSON object per line, each stamped with an RFC 3339 UTC time.

use crate::domain::types::Notification;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info};

pub struct EventLog {
    file_path: String,
}

impl EventLog {
    /// Writer for the configured path, `None` when the path is empty
    pub fn from_config(file_path: &str) -> Option<Self> {
        if file_path.trim().is_empty() {
            info!("event_log_disabled");
            return None;
        }
        Some(Self::new(file_path))
    }

    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "event_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Build the JSON line for a notification
    pub fn to_line(notification: &Notification) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(notification)?;
        let ts = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("ts".to_string(), serde_json::Value::String(ts));
        }
        serde_json::to_string(&value)
    }

    /// Write a notification to the log file
    /// Returns true if successful, false otherwise
    pub fn write(&self, notification: &Notification) -> bool {
        let line = match Self::to_line(notification) {
            Ok(line) => line,
            Err(e) => {
                error!(event = %notification.name(), error = %e, "event_log_serialize_failed");
                return false;
            }
        };

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(file = %self.file_path, error = %e, "event_log_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "event_log_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ValidationOutcome;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_write_appends_json_lines() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("logs").join("scans.jsonl");
        let log = EventLog::new(file_path.to_str().unwrap());

        assert!(log.write(&Notification::Ingested {
            port: "COM1".to_string(),
            value: "A1".to_string(),
            index: 0,
        }));
        assert!(log.write(&Notification::Scan {
            port: "COM2".to_string(),
            value: "B2".to_string(),
            outcome: ValidationOutcome::OutOfOrder,
            expected: Some("A1".to_string()),
            debounced: false,
        }));

        let content = fs::read_to_string(&file_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "ingested");
        assert_eq!(first["value"], "A1");
        assert!(first["ts"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"]["kind"], "out_of_order");
        assert_eq!(second["expected"], "A1");
    }

    #[test]
    fn test_empty_path_disables_the_log() {
        assert!(EventLog::from_config("").is_none());
        assert!(EventLog::from_config("  ").is_none());

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("scans.jsonl");
        let log = EventLog::from_config(file_path.to_str().unwrap()).unwrap();
        assert!(log.write(&Notification::SequenceComplete));
        assert!(file_path.exists());
    }

    #[test]
    fn test_write_to_unwritable_path_returns_false() {
        let dir = tempdir().unwrap();
        // a directory cannot be opened for append
        let log = EventLog::new(dir.path().to_str().unwrap());
        assert!(!log.write(&Notification::SequenceComplete));
    }
}
