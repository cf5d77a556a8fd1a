//! [`WhatsAppClient`] backed by an Evolution API bridge.
//!
//! The bridge owns the WhatsApp Web session: pairing, encryption, reconnects
//! and media transport. This client only drives its REST surface and points
//! its webhook at our listener.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ConnectionState, MessageEvent, QrCode, WhatsAppClient};
use crate::config::WhatsAppConfig;

const WEBHOOK_EVENTS: [&str; 3] = ["MESSAGES_UPSERT", "QRCODE_UPDATED", "CONNECTION_UPDATE"];

pub struct EvolutionClient {
    http: reqwest::Client,
    config: WhatsAppConfig,
    /// Per-instance token kept in the session store
    token: String,
}

impl EvolutionClient {
    pub fn new(config: WhatsAppConfig, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            path,
            self.config.instance_name
        )
    }

    /// State of our instance, or `None` if the bridge does not know it
    async fn fetch_state(&self) -> Result<Option<ConnectionState>> {
        let response = self
            .http
            .get(self.url("instance/connectionState"))
            .header("apikey", &self.config.api_key)
            .send()
            .await
            .context("Failed to query connection state")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = check(response, "connectionState").await?;
        let state = body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .unwrap_or("");
        Ok(Some(ConnectionState::parse(state)))
    }

    /// Create the instance on the bridge unless it already exists.
    /// Returns the instance's current state.
    pub async fn ensure_instance(&self) -> Result<ConnectionState> {
        if let Some(state) = self.fetch_state().await? {
            debug!("Instance '{}' exists ({})", self.config.instance_name, state);
            return Ok(state);
        }

        info!("Creating bridge instance '{}'", self.config.instance_name);
        let body = json!({
            "instanceName": self.config.instance_name,
            "token": self.token,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });

        let response = self
            .http
            .post(format!(
                "{}/instance/create",
                self.config.api_url.trim_end_matches('/')
            ))
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to create instance")?;
        check(response, "instance/create").await?;

        Ok(ConnectionState::Connecting)
    }

    async fn set_webhook(&self, enabled: bool) -> Result<()> {
        let body = json!({
            "webhook": {
                "enabled": enabled,
                "url": self.config.webhook_url,
                "byEvents": false,
                "base64": false,
                "events": WEBHOOK_EVENTS,
            }
        });

        let response = self
            .http
            .post(self.url("webhook/set"))
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to set webhook")?;
        check(response, "webhook/set").await?;
        Ok(())
    }

    async fn request_qr(&self) -> Result<Option<QrCode>> {
        let response = self
            .http
            .get(self.url("instance/connect"))
            .header("apikey", &self.config.api_key)
            .send()
            .await
            .context("Failed to request pairing code")?;
        let body = check(response, "instance/connect").await?;
        Ok(extract_qr(&body))
    }
}

#[async_trait]
impl WhatsAppClient for EvolutionClient {
    async fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.fetch_state().await?.unwrap_or(ConnectionState::Closed))
    }

    async fn connect(&self) -> Result<Option<QrCode>> {
        let state = self.ensure_instance().await?;
        self.set_webhook(true).await?;
        info!(
            "Webhook for '{}' points at {}",
            self.config.instance_name, self.config.webhook_url
        );

        if state == ConnectionState::Open {
            return Ok(None);
        }
        self.request_qr().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_webhook(false).await?;
        info!("Event delivery for '{}' stopped", self.config.instance_name);
        Ok(())
    }

    async fn download_any(&self, message: &MessageEvent) -> Result<Vec<u8>> {
        if message.payload.media().is_none() {
            return Ok(Vec::new());
        }

        let body = json!({
            "message": {
                "key": {
                    "id": message.info.id,
                    "remoteJid": message.info.chat,
                    "fromMe": message.info.is_from_me,
                }
            },
            "convertToMp4": false,
        });

        let response = self
            .http
            .post(self.url("chat/getBase64FromMediaMessage"))
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to request media")?;
        let body = check(response, "getBase64FromMediaMessage").await?;

        let encoded = body["base64"].as_str().unwrap_or("");
        decode_base64(encoded).context("Media payload is not valid base64")
    }
}

/// Fail on non-2xx, otherwise parse the body as JSON (empty bodies become null)
async fn check(response: reqwest::Response, what: &str) -> Result<Value> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("Evolution API {} failed ({}): {}", what, status, text);
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON from {}", what))
}

/// Pull the pairing code out of a connect/create response
pub fn extract_qr(body: &Value) -> Option<QrCode> {
    let code = body["code"]
        .as_str()
        .or_else(|| body["qrcode"]["code"].as_str())
        .filter(|c| !c.is_empty())?;
    let image = body["base64"]
        .as_str()
        .or_else(|| body["qrcode"]["base64"].as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(QrCode {
        code: code.to_string(),
        image,
    })
}

/// Decode plain base64 or a `data:<mime>;base64,<data>` URL
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let data = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MediaInfo, MessageInfo, Payload};
    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Fake {
        exists: bool,
        open: bool,
        calls: Arc<Mutex<Vec<String>>>,
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    impl Fake {
        fn log(&self, call: &str, headers: &HeaderMap) {
            assert_eq!(headers.get("apikey").unwrap(), "global-key");
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    async fn serve(fake: Fake) -> String {
        let app = Router::new()
            .route(
                "/instance/connectionState/{name}",
                get(|State(f): State<Fake>, h: HeaderMap| async move {
                    f.log("state", &h);
                    if !f.exists {
                        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})));
                    }
                    let state = if f.open { "open" } else { "close" };
                    (
                        StatusCode::OK,
                        Json(json!({"instance": {"instanceName": "walog", "state": state}})),
                    )
                }),
            )
            .route(
                "/instance/create",
                post(|State(f): State<Fake>, h: HeaderMap, Json(body): Json<Value>| async move {
                    f.log("create", &h);
                    f.bodies.lock().unwrap().push(body);
                    (StatusCode::CREATED, Json(json!({"instance": {"instanceName": "walog"}})))
                }),
            )
            .route(
                "/webhook/set/{name}",
                post(|State(f): State<Fake>, h: HeaderMap, Json(body): Json<Value>| async move {
                    f.log("webhook", &h);
                    f.bodies.lock().unwrap().push(body);
                    Json(json!({}))
                }),
            )
            .route(
                "/instance/connect/{name}",
                get(|State(f): State<Fake>, h: HeaderMap| async move {
                    f.log("connect", &h);
                    Json(json!({"code": "2@pair", "base64": "data:image/png;base64,iVBO"}))
                }),
            )
            .route(
                "/chat/getBase64FromMediaMessage/{name}",
                post(|State(f): State<Fake>, h: HeaderMap, Json(body): Json<Value>| async move {
                    f.log("media", &h);
                    f.bodies.lock().unwrap().push(body);
                    Json(json!({"mimetype": "image/jpeg", "base64": "aGVsbG8="}))
                }),
            )
            .with_state(fake);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(api_url: String) -> EvolutionClient {
        EvolutionClient::new(
            WhatsAppConfig {
                api_url,
                api_key: "global-key".to_string(),
                instance_name: "walog".to_string(),
                webhook_bind: "127.0.0.1:0".to_string(),
                webhook_url: "http://host:8086/webhook/whatsapp".to_string(),
                qr_path: "qr.png".into(),
            },
            "walog-token".to_string(),
        )
    }

    fn message(payload: Payload) -> MessageEvent {
        MessageEvent {
            info: MessageInfo {
                id: "MSG1".to_string(),
                chat: "49@s.whatsapp.net".to_string(),
                sender: "49@s.whatsapp.net".to_string(),
                push_name: None,
                is_from_me: false,
                is_group: false,
                timestamp: Utc::now(),
            },
            payload,
            raw: json!({}),
        }
    }

    #[tokio::test]
    async fn test_connect_new_instance_returns_qr() {
        let fake = Fake::default();
        let client = client(serve(fake.clone()).await);

        let qr = client.connect().await.unwrap().unwrap();
        assert_eq!(qr.code, "2@pair");
        assert_eq!(qr.image.as_deref(), Some("data:image/png;base64,iVBO"));

        let calls = fake.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["state", "create", "webhook", "connect"]);

        let bodies = fake.bodies.lock().unwrap().clone();
        assert_eq!(bodies[0]["token"], "walog-token");
        assert_eq!(bodies[1]["webhook"]["enabled"], true);
        assert_eq!(bodies[1]["webhook"]["events"][0], "MESSAGES_UPSERT");
    }

    #[tokio::test]
    async fn test_connect_paired_instance_skips_qr() {
        let fake = Fake {
            exists: true,
            open: true,
            ..Fake::default()
        };
        let client = client(serve(fake.clone()).await);

        assert!(client.connect().await.unwrap().is_none());
        assert_eq!(client.connection_state().await.unwrap(), ConnectionState::Open);
        assert_eq!(
            fake.calls.lock().unwrap().clone(),
            vec!["state", "webhook", "state"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_disables_webhook() {
        let fake = Fake {
            exists: true,
            ..Fake::default()
        };
        let client = client(serve(fake.clone()).await);

        client.disconnect().await.unwrap();
        let bodies = fake.bodies.lock().unwrap().clone();
        assert_eq!(bodies[0]["webhook"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_download_media_and_skip_text() {
        let fake = Fake::default();
        let client = client(serve(fake.clone()).await);

        let text = client
            .download_any(&message(Payload::Text("hi".to_string())))
            .await
            .unwrap();
        assert!(text.is_empty());
        assert!(fake.calls.lock().unwrap().is_empty());

        let image = message(Payload::Image(MediaInfo {
            mimetype: "image/jpeg".to_string(),
            file_name: None,
        }));
        let bytes = client.download_any(&image).await.unwrap();
        assert_eq!(bytes, b"hello");

        let bodies = fake.bodies.lock().unwrap().clone();
        assert_eq!(bodies[0]["message"]["key"]["id"], "MSG1");
    }

    #[tokio::test]
    async fn test_download_sticker_attachment() {
        let fake = Fake::default();
        let client = client(serve(fake.clone()).await);

        let bare = client.download_any(&message(Payload::Other(None))).await.unwrap();
        assert!(bare.is_empty());
        assert!(fake.calls.lock().unwrap().is_empty());

        let sticker = message(Payload::Other(Some(MediaInfo {
            mimetype: "image/webp".to_string(),
            file_name: None,
        })));
        assert_eq!(client.download_any(&sticker).await.unwrap(), b"hello");
        assert_eq!(fake.calls.lock().unwrap().clone(), vec!["media"]);
    }

    #[tokio::test]
    async fn test_unreachable_bridge_errors() {
        let client = client("http://127.0.0.1:1".to_string());
        assert!(client.connection_state().await.is_err());
    }

    #[test]
    fn test_decode_base64_variants() {
        assert_eq!(decode_base64("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_base64("data:image/png;base64,aGVsbG8=").unwrap(), b"hello");
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_extract_qr_shapes() {
        assert!(extract_qr(&json!({"count": 0})).is_none());
        let nested = extract_qr(&json!({"qrcode": {"code": "2@x", "base64": "data:image/png;base64,AA"}}))
            .unwrap();
        assert_eq!(nested.code, "2@x");
        assert!(nested.image.is_some());
    }
}
