//! Channel plugin framework for messaging platforms.
//!
//! # Architecture
//!
//! ```text
//! Messaging platform
//!     ↓ (platform-specific protocol)
//! ChannelPlugin::start() spawns listener
//!     ↓ (InboundMessage via mpsc)
//! ChannelManager::run_message_loop → MessageRouter (one task per message)
//!     ↓ (reply text)
//! ChannelPlugin::send(OutboundMessage) -> DeliveryOutcome
//!     ↓
//! Messaging platform
//! ```
//!
//! # Implementing a Channel
//!
//! ```rust,ignore
//! use amelie_gateway::channel::ChannelPlugin;
//!
//! struct MyChannel { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl ChannelPlugin for MyChannel {
//!     fn channel_type(&self) -> &str { "my-platform" }
//!     fn channel_id(&self) -> &str { &self.id }
//!     async fn start(&self, sender: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> { /* ... */ }
//!     async fn stop(&self) -> anyhow::Result<()> { /* ... */ }
//!     async fn send(&self, message: OutboundMessage) -> DeliveryOutcome { /* ... */ }
//!     fn status(&self) -> ChannelStatus { /* ... */ }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amelie_media::ReplySink;
use amelie_types::{
    ChannelInfo, ChannelStatus, DeliveryOutcome, InboundMessage, OutboundMessage,
};

use crate::router::MessageRouter;

/// Trait for channel plugins that bridge messaging platforms to the gateway.
///
/// Use `&self` for all methods; implementations keep mutable state behind
/// interior mutability (`Mutex`, `RwLock`).
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Returns the channel type identifier (e.g. "telegram").
    fn channel_type(&self) -> &str;

    /// Returns the unique instance identifier for this channel.
    fn channel_id(&self) -> &str;

    /// Start the channel, connecting to the platform.
    ///
    /// Incoming messages are pushed through `sender`. Implementations
    /// typically spawn a background task for the listener.
    async fn start(&self, sender: mpsc::Sender<InboundMessage>) -> anyhow::Result<()>;

    /// Stop the channel, disconnecting from the platform.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver a plain-text message.
    async fn send(&self, message: OutboundMessage) -> DeliveryOutcome;

    /// Returns the current status of this channel.
    fn status(&self) -> ChannelStatus;

    /// Tell the conversation that its media is being processed (e.g. a
    /// "typing" indicator). Reports `Unreachable` when the conversation is
    /// gone, which cancels the event.
    async fn notify_processing(
        &self,
        _conversation_id: &str,
        _metadata: &HashMap<String, serde_json::Value>,
    ) -> DeliveryOutcome {
        DeliveryOutcome::Delivered
    }
}

/// Manages channel plugins and feeds their messages to the router.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn ChannelPlugin>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl ChannelManager {
    /// Create a new channel manager with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            channels: RwLock::new(HashMap::new()),
            inbound_tx: tx,
            inbound_rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Register a channel plugin. Replaces any existing channel with the same ID.
    pub async fn register(&self, channel: Arc<dyn ChannelPlugin>) {
        let id = channel.channel_id().to_string();
        info!(
            channel_type = channel.channel_type(),
            channel_id = %id,
            "Registering channel plugin"
        );
        self.channels.write().await.insert(id, channel);
    }

    /// Unregister a channel plugin by ID. Stops it if running.
    pub async fn unregister(&self, channel_id: &str) -> bool {
        let Some(channel) = self.channels.write().await.remove(channel_id) else {
            return false;
        };
        if channel.status() == ChannelStatus::Running {
            if let Err(e) = channel.stop().await {
                warn!(channel_id, "Failed to stop channel during unregister: {e}");
            }
        }
        true
    }

    /// Start a specific channel by ID.
    pub async fn start_channel(&self, channel_id: &str) -> anyhow::Result<()> {
        let channels = self.channels.read().await;
        let channel = channels
            .get(channel_id)
            .ok_or_else(|| anyhow::anyhow!("Channel not found: {channel_id}"))?;

        channel.start(self.inbound_tx.clone()).await
    }

    /// Stop a specific channel by ID.
    pub async fn stop_channel(&self, channel_id: &str) -> anyhow::Result<()> {
        let channels = self.channels.read().await;
        let channel = channels
            .get(channel_id)
            .ok_or_else(|| anyhow::anyhow!("Channel not found: {channel_id}"))?;

        channel.stop().await
    }

    /// Start all registered channels. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let channels = self.channels.read().await;
        let mut started = 0;
        for (id, channel) in channels.iter() {
            match channel.start(self.inbound_tx.clone()).await {
                Ok(()) => started += 1,
                Err(e) => warn!(channel_id = %id, "Failed to start channel: {e:#}"),
            }
        }
        started
    }

    /// Stop all registered channels.
    pub async fn stop_all(&self) {
        let channels = self.channels.read().await;
        for (id, channel) in channels.iter() {
            if let Err(e) = channel.stop().await {
                warn!(channel_id = %id, "Failed to stop channel: {e}");
            }
        }
    }

    async fn channel(&self, channel_id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// Send a message through the appropriate channel.
    pub async fn send_message(&self, message: OutboundMessage) -> DeliveryOutcome {
        match self.channel(&message.channel_id).await {
            Some(channel) => channel.send(message).await,
            None => DeliveryOutcome::Failed(format!("Channel not found: {}", message.channel_id)),
        }
    }

    /// Show the processing indicator for an inbound message.
    pub async fn notify_processing(&self, inbound: &InboundMessage) -> DeliveryOutcome {
        match self.channel(&inbound.channel_id).await {
            Some(channel) => {
                channel
                    .notify_processing(&inbound.conversation_id, &inbound.metadata)
                    .await
            }
            None => DeliveryOutcome::Failed(format!("Channel not found: {}", inbound.channel_id)),
        }
    }

    /// List all registered channels with their status.
    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let channels = self.channels.read().await;
        channels
            .values()
            .map(|ch| ChannelInfo {
                channel_type: ch.channel_type().to_string(),
                channel_id: ch.channel_id().to_string(),
                status: ch.status(),
            })
            .collect()
    }

    /// Get the status of a specific channel.
    pub async fn channel_status(&self, channel_id: &str) -> Option<ChannelStatus> {
        let channels = self.channels.read().await;
        channels.get(channel_id).map(|ch| ch.status())
    }

    /// Run the inbound message loop until `shutdown` fires or every sender
    /// is gone.
    ///
    /// Each message is handled in its own task with a child token of
    /// `shutdown`, so shutting down cancels all in-flight events.
    pub async fn run_message_loop(
        self: &Arc<Self>,
        router: Arc<MessageRouter>,
        shutdown: CancellationToken,
    ) {
        let mut rx = self.inbound_rx.lock().await;

        info!("Channel message loop started");

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            debug!(
                channel_type = %inbound.channel_type,
                channel_id = %inbound.channel_id,
                conversation_id = %inbound.conversation_id,
                has_media = inbound.media.is_some(),
                "Inbound message"
            );

            let router = router.clone();
            let channel_mgr = self.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                router.handle(inbound, &channel_mgr, cancel).await;
            });
        }

        info!("Channel message loop stopped");
    }
}

/// Delivers pipeline replies back through the channel a message came from.
pub struct ChannelReplySink {
    channel_mgr: Arc<ChannelManager>,
    channel_type: String,
    channel_id: String,
    recipient_id: String,
    metadata: HashMap<String, serde_json::Value>,
}

impl ChannelReplySink {
    /// Reply to the sender of `inbound`.
    pub fn for_inbound(channel_mgr: Arc<ChannelManager>, inbound: &InboundMessage) -> Self {
        Self {
            channel_mgr,
            channel_type: inbound.channel_type.clone(),
            channel_id: inbound.channel_id.clone(),
            recipient_id: inbound.sender_id.clone(),
            metadata: inbound.metadata.clone(),
        }
    }
}

#[async_trait]
impl ReplySink for ChannelReplySink {
    async fn deliver(&self, conversation_id: &str, text: &str) -> DeliveryOutcome {
        self.channel_mgr
            .send_message(OutboundMessage {
                channel_type: self.channel_type.clone(),
                channel_id: self.channel_id.clone(),
                recipient_id: self.recipient_id.clone(),
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
                metadata: self.metadata.clone(),
            })
            .await
    }
}
