//! amelie-gateway: runs the bot.
//!
//! Provides:
//! - Channel plugin framework for messaging platforms
//! - Inbound message loop with one task per message and bounded media concurrency
//! - Settings commands (/short, /long, /caption, /full, /settings)
//! - Optional HTTP health check endpoint
//! - Graceful shutdown on Ctrl-C, cancelling in-flight events

pub mod channel;
pub mod commands;
pub mod router;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use amelie_config::AmelieConfig;
use amelie_media::{DescriptionEngine, EphemeralStore, MediaPipeline, PipelineSettings};
use amelie_storage::AmelieStorage;
use amelie_types::ChannelConfig;
use channel::{ChannelManager, ChannelPlugin};
use router::MessageRouter;

/// Builds a channel plugin from its configuration.
pub type ChannelFactory =
    Box<dyn Fn(String, &ChannelConfig) -> anyhow::Result<Arc<dyn ChannelPlugin>> + Send + Sync>;

/// Shared state of the health endpoint.
pub struct GatewayState {
    pub channel_mgr: Arc<ChannelManager>,
    pub storage: Arc<AmelieStorage>,
    pub started_at: DateTime<Utc>,
}

/// Start the gateway and run until Ctrl-C.
///
/// Opens the settings database, sweeps the spool directory, registers and
/// starts every enabled channel, then processes inbound messages.
pub async fn start_gateway(
    config: AmelieConfig,
    engine: Arc<dyn DescriptionEngine>,
    channel_factories: HashMap<String, ChannelFactory>,
) -> anyhow::Result<()> {
    let db_path = config.db_path()?;
    let storage = Arc::new(
        AmelieStorage::open(&db_path)
            .with_context(|| format!("failed to open settings database {}", db_path.display()))?,
    );

    let spool_dir = config.spool_dir()?;
    let store = EphemeralStore::new(&spool_dir)
        .with_context(|| format!("failed to prepare spool directory {}", spool_dir.display()))?;
    store.sweep().context("failed to sweep spool directory")?;

    let pipeline = MediaPipeline::new(
        storage.clone(),
        store,
        engine,
        PipelineSettings::from_config(&config),
    );
    let router = Arc::new(MessageRouter::new(
        pipeline,
        storage.clone(),
        config.pipeline.max_concurrent,
    ));

    let channel_mgr = Arc::new(ChannelManager::new(config.gateway.inbound_buffer));
    register_channels(&channel_mgr, &config.channels, &channel_factories).await;
    if channel_mgr.start_all().await == 0 {
        bail!("no channel could be started");
    }

    let shutdown = CancellationToken::new();

    let loop_mgr = channel_mgr.clone();
    let loop_shutdown = shutdown.clone();
    let message_loop = tokio::spawn(async move {
        loop_mgr.run_message_loop(router, loop_shutdown).await;
    });

    let health = if config.gateway.health_enabled {
        let state = Arc::new(GatewayState {
            channel_mgr: channel_mgr.clone(),
            storage: storage.clone(),
            started_at: Utc::now(),
        });
        let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
            .parse()
            .context("invalid health endpoint address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health endpoint {addr}"))?;
        info!("  Health:    http://{addr}/health");
        let health_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            let app = health_router(state);
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { health_shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!("Health endpoint stopped: {e}");
            }
        }))
    } else {
        None
    };

    info!(
        channels = channel_mgr.list_channels().await.len(),
        max_concurrent = config.pipeline.max_concurrent,
        model = %config.engine.model,
        "Gateway running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    shutdown.cancel();
    channel_mgr.stop_all().await;
    if let Err(e) = message_loop.await {
        warn!("Message loop ended abnormally: {e}");
    }
    if let Some(health) = health {
        let _ = health.await;
    }

    Ok(())
}

async fn register_channels(
    channel_mgr: &ChannelManager,
    channels: &HashMap<String, ChannelConfig>,
    factories: &HashMap<String, ChannelFactory>,
) {
    for (id, channel_config) in channels {
        if !channel_config.enabled {
            info!(channel_id = %id, "Channel disabled, skipping");
            continue;
        }
        let Some(factory) = factories.get(&channel_config.channel_type) else {
            warn!(
                channel_id = %id,
                channel_type = %channel_config.channel_type,
                "Unknown channel type, skipping"
            );
            continue;
        };
        match factory(id.clone(), channel_config) {
            Ok(channel) => channel_mgr.register(channel).await,
            Err(e) => warn!(channel_id = %id, "Failed to create channel: {e:#}"),
        }
    }
}

fn health_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// GET /health: process and channel status.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let channels = state.channel_mgr.list_channels().await;
    let conversations = state.storage.count_configs().await.ok();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at.to_rfc3339(),
        "channels": channels,
        "configured_conversations": conversations,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MockChannel;

    fn factories() -> HashMap<String, ChannelFactory> {
        let mut factories: HashMap<String, ChannelFactory> = HashMap::new();
        factories.insert(
            "mock".into(),
            Box::new(
                |id: String, _config: &ChannelConfig| -> anyhow::Result<Arc<dyn ChannelPlugin>> {
                    Ok(Arc::new(MockChannel::new(&id)))
                },
            ),
        );
        factories
    }

    fn channel_config(channel_type: &str, enabled: bool) -> ChannelConfig {
        ChannelConfig {
            channel_type: channel_type.into(),
            enabled,
            settings: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_channels_skips_disabled_and_unknown() {
        let mgr = ChannelManager::new(16);
        let mut channels = HashMap::new();
        channels.insert("on".to_string(), channel_config("mock", true));
        channels.insert("off".to_string(), channel_config("mock", false));
        channels.insert("other".to_string(), channel_config("carrier-pigeon", true));

        register_channels(&mgr, &channels, &factories()).await;

        let list = mgr.list_channels().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].channel_id, "on");
    }

    #[tokio::test]
    async fn test_health_handler() {
        let mgr = Arc::new(ChannelManager::new(16));
        mgr.register(Arc::new(MockChannel::new("mock-1"))).await;
        let state = Arc::new(GatewayState {
            channel_mgr: mgr,
            storage: Arc::new(AmelieStorage::open_in_memory().unwrap()),
            started_at: Utc::now(),
        });

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
