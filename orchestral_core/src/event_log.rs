//! Append-only `events.log` writer.
//!
//! One text line per routed event:
//! `ISO-8601 [LEVEL] event.name key=value …`. The log is an external
//! interface; dashboards tail it, so lines are never rewritten.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::errors::Result;

/// Severity of a logged event line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLevel {
    /// Routine pipeline progress
    Info,
    /// Degraded but recoverable condition
    Warn,
    /// Failure recorded against the run
    Error,
}

impl EventLevel {
    fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// Writer for one run's `events.log`.
#[derive(Clone, Debug)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Log bound to the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one event line, creating the file if needed.
    ///
    /// Values containing whitespace are quoted; embedded newlines are
    /// escaped so one event is always exactly one line.
    pub async fn append(
        &self,
        level: EventLevel,
        event: &str,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let mut line = format!(
            "{} [{}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level.as_str(),
            event
        );
        for (key, value) in fields {
            let escaped = value.replace('\n', "\\n");
            if escaped.contains(' ') {
                line.push_str(&format!(" {key}={escaped:?}"));
            } else {
                line.push_str(&format!(" {key}={escaped}"));
            }
        }
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Shorthand for an `INFO` line.
    pub async fn info(&self, event: &str, fields: &[(&str, String)]) -> Result<()> {
        self.append(EventLevel::Info, event, fields).await
    }

    /// Shorthand for an `ERROR` line.
    pub async fn error(&self, event: &str, fields: &[(&str, String)]) -> Result<()> {
        self.append(EventLevel::Error, event, fields).await
    }
}
