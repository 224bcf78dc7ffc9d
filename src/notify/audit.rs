use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::DeliveryOutcome;
use crate::clock::iso8601;

/// Append-only text log of every alert the notifier renders.
#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_message(&self, at: DateTime<Utc>, subject: &str, body: &str) -> Result<()> {
        self.append(&format!("[{}] {}\n{}\n", iso8601(&at), subject, body))
    }

    pub fn record_outcome(&self, at: DateTime<Utc>, outcome: &DeliveryOutcome) -> Result<()> {
        self.append(&format!("[{}] delivery {}\n\n", iso8601(&at), outcome))
    }

    fn append(&self, entry: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create audit log directory {}", parent.display())
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("failed to write audit log {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn appends_message_then_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("nested/notifications.log"));
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        log.record_message(at, "Traffic Update", "body line").unwrap();
        log.record_outcome(at, &DeliveryOutcome::Delivered).unwrap();
        log.record_message(at, "Heavy Traffic Alert", "second").unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            text,
            "[2023-11-14T22:13:20Z] Traffic Update\nbody line\n\
             [2023-11-14T22:13:20Z] delivery delivered\n\n\
             [2023-11-14T22:13:20Z] Heavy Traffic Alert\nsecond\n"
        );
    }
}
