use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Line prefix of a record in the flat log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
    Media,
    Error,
}

impl RecordKind {
    fn prefix(self) -> &'static str {
        match self {
            RecordKind::Message => "MESSAGE: ",
            RecordKind::Media => "MEDIA: ",
            RecordKind::Error => "ERROR: ",
        }
    }
}

/// Append-only text log.
///
/// The file is reopened for every record, so a truncation by the
/// housekeeper takes effect on the very next write.
#[derive(Debug, Clone)]
pub struct RecordLog {
    path: PathBuf,
}

impl RecordLog {
    /// Open (creating if needed) the log at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            super::ensure_folder(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `value` as indented JSON
    pub fn record<T: Serialize>(&self, kind: RecordKind, value: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
        self.append_line(kind, &body)
    }

    /// Append an error line stamped with the local date and time
    pub fn error(&self, message: &str) -> Result<()> {
        let stamped = format!("{} {}", Local::now().format("%Y/%m/%d %H:%M:%S"), message);
        self.append_line(RecordKind::Error, &stamped)
    }

    fn append_line(&self, kind: RecordKind, body: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;

        let mut line = String::with_capacity(kind.prefix().len() + body.len() + 1);
        line.push_str(kind.prefix());
        line.push_str(body);
        if !line.ends_with('\n') {
            line.push('\n');
        }

        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write to log file: {}", self.path.display()))
    }
}
