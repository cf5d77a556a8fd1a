mod bot;
mod config;
mod handler;
mod platform;
mod session;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::handler::{AgeCutoff, MessageHandler};
use crate::platform::evolution::EvolutionClient;
use crate::platform::WhatsAppClient;
use crate::session::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = chrono::Utc::now();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,walog=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bridge: {} (instance '{}')", config.whatsapp.api_url, config.whatsapp.instance_name);
    info!("  Media: {}", config.storage.media_dir.display());
    info!("  Message log: {}", config.storage.message_log.display());
    info!(
        "  Max message age: {}s (relative to {})",
        config.filter.max_message_age_secs, config.filter.reference
    );

    // Everything below is required; any failure ends the process
    storage::ensure_folder(&config.storage.media_dir)?;

    let sessions = SessionStore::open(&config.storage.session_db)?;
    let device = sessions
        .get_or_create_device(&config.whatsapp.instance_name)
        .await?;

    let client: Arc<dyn WhatsAppClient> =
        Arc::new(EvolutionClient::new(config.whatsapp.clone(), device.token));

    let cutoff = AgeCutoff::from_config(&config.filter, started_at);
    let handler = MessageHandler::new(client.clone(), &config.storage, cutoff)?;

    let state = Arc::new(AppState::new(config, client, handler, sessions));

    info!("Bot is starting...");
    bot::run(state).await?;

    Ok(())
}
