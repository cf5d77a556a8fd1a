pub mod evolution;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An event delivered by the WhatsApp client
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(MessageEvent),
    /// A fresh pairing code while the account is not linked yet
    QrCode(QrCode),
    Connection(ConnectionUpdate),
    Other { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEvent {
    pub info: MessageInfo,
    pub payload: Payload,
    /// The message body exactly as the client delivered it
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageInfo {
    pub id: String,
    /// Chat JID (user or group)
    pub chat: String,
    /// Sender JID; differs from `chat` in groups
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    pub is_from_me: bool,
    pub is_group: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Audio(MediaInfo),
    Image(MediaInfo),
    Video(MediaInfo),
    Document(MediaInfo),
    /// Anything else, such as a sticker. Carries the media descriptor when
    /// the message has a downloadable attachment.
    Other(Option<MediaInfo>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub mimetype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Payload {
    /// Label used as the stored file's prefix
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Audio(_) => "Audio",
            Payload::Image(_) => "Image",
            Payload::Video(_) => "Video",
            Payload::Document(_) => "Document",
            Payload::Text(_) | Payload::Other(_) => "Other",
        }
    }

    pub fn media(&self) -> Option<&MediaInfo> {
        match self {
            Payload::Audio(m) | Payload::Image(m) | Payload::Video(m) | Payload::Document(m) => {
                Some(m)
            }
            Payload::Other(m) => m.as_ref(),
            Payload::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QrCode {
    /// Raw pairing string (the thing encoded in the QR)
    pub code: String,
    /// `data:image/png;base64,...` rendering, when the bridge provides one
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    /// JID of the linked account once the connection is open
    pub jid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Connecting,
    Closed,
}

impl ConnectionState {
    pub fn parse(state: &str) -> Self {
        match state {
            "open" | "connected" => ConnectionState::Open,
            "connecting" => ConnectionState::Connecting,
            _ => ConnectionState::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// The WhatsApp client this bot sits on. Pairing, sessions, reconnection and
/// media transport all live behind it.
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    async fn connection_state(&self) -> Result<ConnectionState>;

    /// Start event delivery. Returns a QR code when the account still has to
    /// be paired.
    async fn connect(&self) -> Result<Option<QrCode>>;

    /// Stop event delivery, keeping the paired session.
    async fn disconnect(&self) -> Result<()>;

    /// Fetch the binary attached to a message. Empty when there is none.
    async fn download_any(&self, message: &MessageEvent) -> Result<Vec<u8>>;
}
