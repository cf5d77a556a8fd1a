use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::{AgeReference, FilterConfig, StorageConfig};
use crate::platform::{InboundEvent, MessageEvent, Payload, WhatsAppClient};
use crate::storage::{
    file_extension_from_mime_type, Housekeeper, MediaStore, RecordKind, RecordLog,
};

/// Decides which messages are too old to keep
#[derive(Debug, Clone)]
pub struct AgeCutoff {
    max_age: chrono::Duration,
    reference: AgeReference,
    started_at: DateTime<Utc>,
}

impl AgeCutoff {
    pub fn new(max_age_secs: u64, reference: AgeReference, started_at: DateTime<Utc>) -> Self {
        let secs = i64::try_from(max_age_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        let max_age = chrono::Duration::seconds(secs);
        Self {
            max_age,
            reference,
            started_at,
        }
    }

    pub fn from_config(filter: &FilterConfig, started_at: DateTime<Utc>) -> Self {
        Self::new(filter.max_message_age_secs, filter.reference, started_at)
    }

    pub fn is_too_old(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let reference = match self.reference {
            AgeReference::Startup => self.started_at,
            AgeReference::Now => now,
        };
        reference.signed_duration_since(timestamp) > self.max_age
    }
}

/// What happened to one inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not a message
    Ignored,
    TooOld,
    /// Logged as a plain message record
    Logged,
    /// Media written to disk (path is `None` if the write failed)
    Stored(Option<PathBuf>),
}

#[derive(Serialize)]
struct MediaRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    bytes: usize,
    #[serde(flatten)]
    event: &'a MessageEvent,
}

/// The event callback: filters, classifies and persists inbound messages
pub struct MessageHandler {
    client: Arc<dyn WhatsAppClient>,
    media: MediaStore,
    message_log: RecordLog,
    media_log: RecordLog,
    error_log: RecordLog,
    housekeeper: Housekeeper,
    cutoff: AgeCutoff,
}

impl MessageHandler {
    /// Open the log files; the media folder must already exist
    pub fn new(
        client: Arc<dyn WhatsAppClient>,
        storage: &StorageConfig,
        cutoff: AgeCutoff,
    ) -> Result<Self> {
        let message_log = RecordLog::open(&storage.message_log)?;
        let media_log = RecordLog::open(storage.media_log_path())?;
        let error_log = RecordLog::open(storage.error_log_path())?;

        let housekeeper = Housekeeper::new(
            &storage.media_dir,
            &[
                storage.message_log.as_path(),
                storage.media_log_path(),
                storage.error_log_path(),
            ],
            storage.max_media_bytes(),
            storage.max_log_bytes(),
        );

        Ok(Self {
            client,
            media: MediaStore::new(&storage.media_dir),
            message_log,
            media_log,
            error_log,
            housekeeper,
            cutoff,
        })
    }

    /// Handle one event. Never fails: every error ends up in the error log.
    pub async fn handle(&self, event: &InboundEvent) -> Outcome {
        self.housekeeping().await;

        let message = match event {
            InboundEvent::Message(message) => message,
            InboundEvent::Other { name } => {
                debug!("Ignoring {} event", name);
                return Outcome::Ignored;
            }
            InboundEvent::QrCode(_) | InboundEvent::Connection(_) => return Outcome::Ignored,
        };

        if self.cutoff.is_too_old(message.info.timestamp, Utc::now()) {
            debug!(
                "Dropping message {} from {} sent at {}",
                message.info.id, message.info.sender, message.info.timestamp
            );
            return Outcome::TooOld;
        }

        let content = match self.client.download_any(message).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_error(&format!(
                    "Could not download media of message {}: {:#}",
                    message.info.id, e
                ));
                Vec::new()
            }
        };

        if content.is_empty() {
            if let Err(e) = self.message_log.record(RecordKind::Message, message) {
                self.report_error(&format!("{:#}", e));
            }
            return Outcome::Logged;
        }

        let file_name = media_file_name(&message.payload, Local::now());
        let stored = match self.media.store(&file_name, &content) {
            Ok(path) => {
                info!(
                    "Stored {} from {} ({} bytes)",
                    path.display(),
                    message.info.sender,
                    content.len()
                );
                Some(path)
            }
            Err(e) => {
                self.report_error(&format!("{:#}", e));
                None
            }
        };

        let record = MediaRecord {
            file: stored
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            bytes: content.len(),
            event: message,
        };
        if let Err(e) = self.media_log.record(RecordKind::Media, &record) {
            self.report_error(&format!("{:#}", e));
        }

        Outcome::Stored(stored)
    }

    async fn housekeeping(&self) {
        let keeper = self.housekeeper.clone();
        match tokio::task::spawn_blocking(move || keeper.reset_storage_if_too_big()).await {
            Ok(report) => {
                if report.media_reset {
                    info!("Media folder exceeded its limit and was emptied");
                }
                for log in &report.logs_truncated {
                    info!("Log {} exceeded its limit and was truncated", log.display());
                }
                for e in &report.errors {
                    self.write_error_log(e);
                }
            }
            Err(e) => self.report_error(&format!("Housekeeping task failed: {}", e)),
        }
    }

    fn report_error(&self, message: &str) {
        error!("{}", message);
        self.write_error_log(message);
    }

    fn write_error_log(&self, message: &str) {
        if let Err(e) = self.error_log.error(message) {
            error!("Failed to write error log: {:#}", e);
        }
    }
}

/// `"{Kind}_{YYYY-MM-DD HH:MM:SS}{ext}"`, e.g. `Image_2024-03-08 15:53:00.jpeg`
pub fn media_file_name(payload: &Payload, now: DateTime<Local>) -> String {
    let ext = match payload {
        Payload::Other(_) | Payload::Text(_) => ".unknown".to_string(),
        _ => payload
            .media()
            .map(|media| file_extension_from_mime_type(&media.mimetype))
            .unwrap_or_else(|| ".unknown".to_string()),
    };
    format!(
        "{}_{}{}",
        payload.kind(),
        now.format("%Y-%m-%d %H:%M:%S"),
        ext
    )
}
