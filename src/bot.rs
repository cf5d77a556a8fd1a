use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::handler::MessageHandler;
use crate::platform::evolution::decode_base64;
use crate::platform::{webhook, ConnectionState, InboundEvent, QrCode, WhatsAppClient};
use crate::session::SessionStore;

/// Shared application state
pub struct AppState {
    config: Config,
    client: Arc<dyn WhatsAppClient>,
    handler: MessageHandler,
    sessions: SessionStore,
}

impl AppState {
    pub fn new(
        config: Config,
        client: Arc<dyn WhatsAppClient>,
        handler: MessageHandler,
        sessions: SessionStore,
    ) -> Self {
        Self {
            config,
            client,
            handler,
            sessions,
        }
    }
}

/// Connect, consume events until Ctrl+C/SIGTERM, then disconnect
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let bind = state.config.whatsapp.webhook_bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind webhook listener on {}", bind))?;
    info!("Webhook listener started on {}", bind);

    let (event_tx, mut event_rx) = mpsc::channel::<InboundEvent>(256);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        axum::serve(listener, webhook::router(event_tx))
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    login(&state).await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupt received, shutting down");
                break;
            }
            event = event_rx.recv() => match event {
                Some(event) => dispatch(&state, event).await,
                None => {
                    warn!("Webhook listener stopped");
                    break;
                }
            },
        }
    }

    if let Err(e) = state.client.disconnect().await {
        error!("Disconnect failed: {:#}", e);
    }

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Webhook server error: {}", e),
        Err(e) => error!("Webhook server task failed: {}", e),
    }

    info!("Disconnected");
    Ok(())
}

/// Start event delivery. A fresh account (or one the phone has unlinked)
/// gets a QR code to scan; pairing completes through `connection.update`.
async fn login(state: &AppState) -> Result<()> {
    let instance = &state.config.whatsapp.instance_name;
    let device = state.sessions.get_or_create_device(instance).await?;

    let qr = state
        .client
        .connect()
        .await
        .context("Failed to connect to WhatsApp")?;

    match qr {
        Some(qr) => {
            if device.is_paired() {
                warn!("Device '{}' was logged out, pairing again", instance);
                state.sessions.clear_pairing(instance).await?;
            } else {
                info!("No session stored for '{}', new login", instance);
            }
            show_qr(&state.config.whatsapp.qr_path, &qr);
        }
        None => match device.jid.as_deref() {
            Some(jid) => info!("Logged in as {}", jid),
            None => info!("Bridge reports an open session"),
        },
    }

    match state.client.connection_state().await {
        Ok(connection) => info!("Connection state of '{}': {}", instance, connection),
        Err(e) => warn!("Could not query connection state of '{}': {:#}", instance, e),
    }

    Ok(())
}

async fn dispatch(state: &AppState, event: InboundEvent) {
    match &event {
        InboundEvent::QrCode(qr) => show_qr(&state.config.whatsapp.qr_path, qr),
        InboundEvent::Connection(update) => {
            info!("Login event: {}", update.state);
            if update.state == ConnectionState::Open {
                if let Some(jid) = &update.jid {
                    let instance = &state.config.whatsapp.instance_name;
                    if let Err(e) = state.sessions.mark_paired(instance, jid).await {
                        error!("Failed to record pairing: {:#}", e);
                    }
                }
            }
        }
        InboundEvent::Message(_) | InboundEvent::Other { .. } => {}
    }

    state.handler.handle(&event).await;
}

fn show_qr(qr_path: &Path, qr: &QrCode) {
    info!("QR code: {}", qr.code);

    let Some(image) = &qr.image else {
        return;
    };
    match decode_base64(image).and_then(|png| {
        std::fs::write(qr_path, png)
            .with_context(|| format!("Failed to write {}", qr_path.display()))
    }) {
        Ok(()) => info!("Scan the QR code saved at {}", qr_path.display()),
        Err(e) => warn!("Could not save QR image: {:#}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
