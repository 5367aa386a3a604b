//! Kaiku Voice Presence Server - Main Entry Point

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vc_presence_server::{
    access::HttpAccessControl,
    api,
    auth::JwtVerifier,
    config::{self, PresenceBackend},
    notify::NotificationHub,
    presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore},
    provider::{CallGateway, HttpProviderApi, Presets, ProviderApi},
    voice::{PresenceSettings, Sweeper, SweeperSettings, VoicePresence},
};

/// Create Redis client.
async fn create_redis_client(redis_url: &str) -> Result<fred::clients::Client> {
    use fred::prelude::*;

    let config = Config::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;

    info!("Connected to Redis");
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_presence_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.presence_backend,
        "Starting Kaiku voice presence server"
    );

    let jwt = JwtVerifier::from_base64_pem(&config.jwt_public_key)
        .context("JWT_PUBLIC_KEY is not a valid Ed25519 public key")?;

    // Presence registry and notification fan-out
    let (store, hub): (Arc<dyn PresenceStore>, NotificationHub) = match config.presence_backend {
        PresenceBackend::Redis => {
            let redis = create_redis_client(&config.redis_url).await?;
            let store = RedisPresenceStore::new(redis.clone(), config.presence_key_prefix.clone());
            store.init().await?;
            (Arc::new(store), NotificationHub::with_redis(redis))
        }
        PresenceBackend::Memory => {
            warn!("Using in-memory presence registry; do not run more than one node");
            (Arc::new(MemoryPresenceStore::new()), NotificationHub::local())
        }
    };
    let hub = Arc::new(hub);

    // Call provider
    let (provider_api, presets) = match &config.provider {
        Some(provider) => {
            let client: Arc<dyn ProviderApi> = Arc::new(HttpProviderApi::new(provider)?);
            (Some(client), Presets::from(provider))
        }
        None => {
            warn!("Call provider not configured; every voice join will fail");
            (None, Presets::default())
        }
    };
    let gateway = Arc::new(CallGateway::new(provider_api, presets));

    let access = Arc::new(HttpAccessControl::new(
        config.access_service_url.clone(),
        std::time::Duration::from_secs(config.access_timeout_secs),
    )?);

    let voice = Arc::new(VoicePresence::new(
        store,
        gateway,
        access,
        hub.clone(),
        PresenceSettings::from(&config),
    ));

    // Background tasks
    let cancel = CancellationToken::new();
    let relay = hub.spawn_relay(cancel.clone());
    let sweeper = Sweeper::new(voice.clone(), SweeperSettings::from(&config)).spawn(cancel.clone());

    // Build application state and router
    let state = api::AppState::new(config.clone(), voice, jwt);
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown = cancel.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    if let Some(relay) = relay {
        let _ = relay.await;
    }

    info!("Server shutdown complete");

    Ok(())
}
