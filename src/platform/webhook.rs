//! Receives Evolution API webhooks and turns them into [`InboundEvent`]s.
//!
//! The listener only decodes and forwards. Every event goes into one mpsc
//! channel, and a single consumer in `bot::run` handles them in arrival order.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    ConnectionState, ConnectionUpdate, InboundEvent, MediaInfo, MessageEvent, MessageInfo,
    Payload, QrCode,
};

/// Build the webhook router. Both the single-URL and the per-event URL
/// layouts of the bridge are accepted.
pub fn router(tx: mpsc::Sender<InboundEvent>) -> Router {
    Router::new()
        .route("/webhook/whatsapp", post(receive))
        .route("/webhook/whatsapp/{event}", post(receive))
        .with_state(tx)
}

async fn receive(State(tx): State<mpsc::Sender<InboundEvent>>, body: Bytes) -> StatusCode {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Rejecting malformed webhook body: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in decode_event(&payload) {
        if tx.send(event).await.is_err() {
            warn!("Event consumer is gone, dropping webhook");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }

    StatusCode::OK
}

/// Decode one webhook body. A `messages.upsert` body may carry several
/// messages; every other event yields exactly one item.
pub fn decode_event(payload: &Value) -> Vec<InboundEvent> {
    let name = normalize_event_name(payload["event"].as_str().unwrap_or(""));
    let data = &payload["data"];

    match name.as_str() {
        "messages.upsert" => {
            let entries = match data.as_array() {
                Some(arr) => arr.iter().collect::<Vec<_>>(),
                None => vec![data],
            };
            entries
                .into_iter()
                .filter_map(|entry| decode_message(entry, payload["sender"].as_str()))
                .map(InboundEvent::Message)
                .collect()
        }
        "qrcode.updated" => {
            let qr = &data["qrcode"];
            let code = qr["code"].as_str().unwrap_or("").to_string();
            let image = qr["base64"]
                .as_str()
                .or_else(|| qr.as_str().filter(|s| s.starts_with("data:")))
                .map(str::to_string);
            vec![InboundEvent::QrCode(QrCode { code, image })]
        }
        "connection.update" => {
            let state = ConnectionState::parse(data["state"].as_str().unwrap_or(""));
            let jid = data["wuid"]
                .as_str()
                .or_else(|| data["owner"].as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            vec![InboundEvent::Connection(ConnectionUpdate { state, jid })]
        }
        _ => vec![InboundEvent::Other { name }],
    }
}

/// `MESSAGES_UPSERT` and `messages-upsert` both mean `messages.upsert`.
fn normalize_event_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '-'], ".")
}

fn decode_message(entry: &Value, own_jid: Option<&str>) -> Option<MessageEvent> {
    let key = &entry["key"];
    let chat = key["remoteJid"].as_str()?.to_string();
    let id = key["id"].as_str().unwrap_or_default().to_string();
    let is_from_me = key["fromMe"].as_bool().unwrap_or(false);

    let sender = match key["participant"].as_str().filter(|p| !p.is_empty()) {
        Some(participant) => participant.to_string(),
        None if is_from_me => own_jid.unwrap_or(chat.as_str()).to_string(),
        None => chat.clone(),
    };

    let timestamp = parse_timestamp(&entry["messageTimestamp"]).unwrap_or_else(|| {
        warn!("Message {} has no usable timestamp, treating it as sent now", id);
        Utc::now()
    });

    let message = &entry["message"];

    Some(MessageEvent {
        info: MessageInfo {
            id,
            is_group: chat.ends_with("@g.us"),
            chat,
            sender,
            push_name: entry["pushName"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            is_from_me,
            timestamp,
        },
        payload: classify_payload(message),
        raw: entry.clone(),
    })
}

/// Pick the payload kind from whichever sub-message is present.
pub fn classify_payload(message: &Value) -> Payload {
    let media = |field: &Value| {
        field.is_object().then(|| MediaInfo {
            mimetype: field["mimetype"].as_str().unwrap_or("").to_string(),
            file_name: field["fileName"].as_str().map(str::to_string),
        })
    };

    if let Some(m) = media(&message["audioMessage"]) {
        return Payload::Audio(m);
    }
    if let Some(m) = media(&message["imageMessage"]) {
        return Payload::Image(m);
    }
    if let Some(m) = media(&message["videoMessage"]) {
        return Payload::Video(m);
    }
    if let Some(m) = media(&message["documentMessage"])
        .or_else(|| media(&message["documentWithCaptionMessage"]["message"]["documentMessage"]))
    {
        return Payload::Document(m);
    }

    if let Some(m) = media(&message["stickerMessage"]) {
        return Payload::Other(Some(m));
    }

    let text = message["conversation"]
        .as_str()
        .or_else(|| message["extendedTextMessage"]["text"].as_str());
    if let Some(t) = text {
        return Payload::Text(t.to_string());
    }

    // Any other sub-message the bridge can still fetch media for
    let attachment = message.as_object().and_then(|fields| {
        fields
            .iter()
            .filter(|(name, _)| name.ends_with("Message"))
            .map(|(_, field)| field)
            .find(|field| field.get("mediaKey").is_some() || field.get("url").is_some())
    });
    Payload::Other(attachment.and_then(media))
}

/// Unix seconds, delivered as a number, a numeric string or a protobuf
/// `Long` object.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let secs = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .or_else(|| value["low"].as_i64())?;
    Utc.timestamp_opt(secs, 0).single()
}
