use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const GIB: f64 = (1u64 << 30) as f64;

/// Which instant the message age cutoff is measured from.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgeReference {
    /// Fixed window: anything sent before `startup - max_age` is dropped.
    #[default]
    Startup,
    /// Sliding window measured against the clock when the message is handled.
    Now,
}

impl std::fmt::Display for AgeReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgeReference::Startup => write!(f, "startup"),
            AgeReference::Now => write!(f, "now"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WhatsAppConfig {
    /// Base URL of the Evolution API bridge
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Global API key of the bridge
    pub api_key: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Local address the webhook listener binds to
    #[serde(default = "default_webhook_bind")]
    pub webhook_bind: String,
    /// URL the bridge should post events to (must reach `webhook_bind`)
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    /// Where the pairing QR code PNG is written, if the bridge sends one
    #[serde(default = "default_qr_path")]
    pub qr_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_message_log")]
    pub message_log: PathBuf,
    /// Defaults to `message_log` when unset
    #[serde(default)]
    pub media_log: Option<PathBuf>,
    /// Defaults to `message_log` when unset
    #[serde(default)]
    pub error_log: Option<PathBuf>,
    #[serde(default = "default_session_db")]
    pub session_db: PathBuf,
    #[serde(default = "default_max_gb")]
    pub max_media_gb: f64,
    #[serde(default = "default_max_gb")]
    pub max_log_gb: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
    #[serde(default)]
    pub reference: AgeReference,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_instance_name() -> String {
    "walog".to_string()
}

fn default_webhook_bind() -> String {
    "127.0.0.1:8086".to_string()
}

fn default_webhook_url() -> String {
    "http://host.docker.internal:8086/webhook/whatsapp".to_string()
}

fn default_qr_path() -> PathBuf {
    PathBuf::from("qr.png")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_message_log() -> PathBuf {
    PathBuf::from("message_log.txt")
}

fn default_session_db() -> PathBuf {
    PathBuf::from("storage.db")
}

fn default_max_gb() -> f64 {
    10.0
}

fn default_max_message_age_secs() -> u64 {
    3600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_dir: default_media_dir(),
            message_log: default_message_log(),
            media_log: None,
            error_log: None,
            session_db: default_session_db(),
            max_media_gb: default_max_gb(),
            max_log_gb: default_max_gb(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_message_age_secs: default_max_message_age_secs(),
            reference: AgeReference::default(),
        }
    }
}

impl StorageConfig {
    pub fn media_log_path(&self) -> &Path {
        self.media_log.as_deref().unwrap_or(&self.message_log)
    }

    pub fn error_log_path(&self) -> &Path {
        self.error_log.as_deref().unwrap_or(&self.message_log)
    }

    pub fn max_media_bytes(&self) -> u64 {
        gb_to_bytes(self.max_media_gb)
    }

    pub fn max_log_bytes(&self) -> u64 {
        gb_to_bytes(self.max_log_gb)
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * GIB) as u64
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.whatsapp.api_key.trim().is_empty() {
            anyhow::bail!("[whatsapp] api_key must not be empty");
        }
        if config.whatsapp.instance_name.trim().is_empty() {
            anyhow::bail!("[whatsapp] instance_name must not be empty");
        }

        Ok(config)
    }
}
