//! Telegram Bot channel plugin for amelie.
//!
//! Uses Telegram Bot API with long-polling (no webhook required).
//!
//! # Configuration
//!
//! ```json5
//! channels: {
//!     "telegram": {
//!         channel_type: "telegram",
//!         enabled: true,
//!         settings: {
//!             bot_token: "123456:ABC-DEF...",
//!             // optional, defaults to 20 MiB (the Bot API download cap)
//!             max_download_bytes: 20971520,
//!         },
//!     },
//! }
//! ```

pub mod api;
pub mod polling;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use amelie_gateway::channel::ChannelPlugin;
use amelie_gateway::commands::BotCommand as AmelieCommand;
use amelie_types::{ChannelConfig, ChannelStatus, DeliveryOutcome, InboundMessage, OutboundMessage};

use api::{TelegramApi, is_unreachable};
use types::{
    BotCommand, MenuButton, SendChatActionParams, SendMessageParams, SetChatMenuButtonParams,
    SetMyCommandsParams,
};

/// Telegram refuses messages over 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// The Bot API will not serve files larger than this.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// Telegram channel plugin implementing `ChannelPlugin`.
pub struct TelegramChannel {
    id: String,
    api: Arc<TelegramApi>,
    max_download_bytes: u64,
    state: Mutex<TelegramState>,
}

struct TelegramState {
    status: ChannelStatus,
    cancel: Option<CancellationToken>,
    poll_handle: Option<JoinHandle<()>>,
}

impl TelegramChannel {
    /// Create a new Telegram channel with the given ID and bot token.
    pub fn new(id: String, bot_token: &str, max_download_bytes: u64) -> anyhow::Result<Self> {
        Ok(Self::with_api(
            id,
            TelegramApi::new(bot_token)?,
            max_download_bytes,
        ))
    }

    pub fn with_api(id: String, api: TelegramApi, max_download_bytes: u64) -> Self {
        Self {
            id,
            api: Arc::new(api),
            max_download_bytes,
            state: Mutex::new(TelegramState {
                status: ChannelStatus::Stopped,
                cancel: None,
                poll_handle: None,
            }),
        }
    }

    async fn register_commands(&self) {
        let commands = AmelieCommand::ALL
            .iter()
            .map(|c| BotCommand {
                command: c.name().to_string(),
                description: c.description().to_string(),
            })
            .collect();
        if let Err(e) = self
            .api
            .set_my_commands(&SetMyCommandsParams { commands })
            .await
        {
            warn!(channel_id = self.id, "Failed to register bot commands: {e:#}");
        }
        if let Err(e) = self
            .api
            .set_chat_menu_button(&SetChatMenuButtonParams {
                menu_button: MenuButton::Commands,
            })
            .await
        {
            warn!(channel_id = self.id, "Failed to set menu button: {e:#}");
        }
    }
}

fn chat_id_of(conversation_id: &str, metadata: &HashMap<String, serde_json::Value>) -> Option<i64> {
    metadata
        .get("chat_id")
        .and_then(|v| v.as_i64())
        .or_else(|| conversation_id.parse().ok())
}

#[async_trait::async_trait]
impl ChannelPlugin for TelegramChannel {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn start(&self, sender: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.status == ChannelStatus::Running {
            bail!("Telegram channel {} is already running", self.id);
        }

        state.status = ChannelStatus::Starting;

        // Verify bot token
        match self.api.get_me().await {
            Ok(bot) => {
                info!(
                    channel_id = self.id,
                    bot_username = bot.username.as_deref().unwrap_or("unknown"),
                    "Telegram bot authenticated"
                );
            }
            Err(e) => {
                state.status = ChannelStatus::Error(format!("Auth failed: {e}"));
                bail!("Failed to authenticate Telegram bot: {e}");
            }
        }

        self.register_commands().await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(polling::run_polling_loop(
            self.api.clone(),
            self.id.clone(),
            self.max_download_bytes,
            sender,
            cancel.child_token(),
        ));

        state.cancel = Some(cancel);
        state.poll_handle = Some(handle);
        state.status = ChannelStatus::Running;

        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;

        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }

        if let Some(handle) = state.poll_handle.take() {
            let _ = handle.await;
        }

        state.status = ChannelStatus::Stopped;
        Ok(())
    }

    /// Sends plain text, split into chunks Telegram accepts.
    async fn send(&self, message: OutboundMessage) -> DeliveryOutcome {
        let Some(chat_id) = chat_id_of(&message.conversation_id, &message.metadata) else {
            return DeliveryOutcome::Failed(format!(
                "no Telegram chat id for conversation {}",
                message.conversation_id
            ));
        };

        for chunk in split_message(&message.text, MAX_MESSAGE_CHARS) {
            let sent = self
                .api
                .send_message(&SendMessageParams {
                    chat_id,
                    text: chunk,
                    parse_mode: None,
                })
                .await;
            match sent {
                Ok(_) => {}
                Err(e) if is_unreachable(&e) => {
                    info!(channel_id = self.id, chat_id, "Chat unreachable: {e}");
                    return DeliveryOutcome::Unreachable;
                }
                Err(e) => return DeliveryOutcome::Failed(format!("{e:#}")),
            }
        }
        DeliveryOutcome::Delivered
    }

    fn status(&self) -> ChannelStatus {
        match self.state.try_lock() {
            Ok(state) => state.status.clone(),
            Err(_) => ChannelStatus::Starting,
        }
    }

    async fn notify_processing(
        &self,
        conversation_id: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> DeliveryOutcome {
        let Some(chat_id) = chat_id_of(conversation_id, metadata) else {
            return DeliveryOutcome::Failed(format!(
                "no Telegram chat id for conversation {conversation_id}"
            ));
        };

        match self
            .api
            .send_chat_action(&SendChatActionParams {
                chat_id,
                action: "typing".into(),
            })
            .await
        {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) if is_unreachable(&e) => DeliveryOutcome::Unreachable,
            Err(e) => DeliveryOutcome::Failed(format!("{e:#}")),
        }
    }
}

/// Split `text` into chunks of at most `max_chars` characters, breaking at
/// the last newline (or else space) inside each window.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Factory function: create a `TelegramChannel` from a channel config.
///
/// Expects `config.settings["bot_token"]` to be a string.
pub fn create_telegram_channel(
    id: String,
    config: &ChannelConfig,
) -> anyhow::Result<Arc<dyn ChannelPlugin>> {
    let bot_token = config
        .settings
        .get("bot_token")
        .and_then(|v| v.as_str())
        .context("Telegram channel requires settings.bot_token (string)")?;
    let max_download_bytes = config
        .settings
        .get("max_download_bytes")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES);

    let channel = TelegramChannel::new(id, bot_token, max_download_bytes)?;
    Ok(Arc::new(channel))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use axum::Router;
    use axum::routing::post;

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn test_split_prefers_newlines() {
        let text = "first line\nsecond line\nthird";
        let chunks = split_message(text, 15);
        assert_eq!(chunks, vec!["first line", "second line", "third"]);
    }

    #[test]
    fn test_split_hard_cut_respects_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_create_channel_requires_token() {
        let config = ChannelConfig {
            channel_type: "telegram".into(),
            enabled: true,
            settings: HashMap::new(),
        };
        assert!(create_telegram_channel("tg".into(), &config).is_err());

        let mut settings = HashMap::new();
        settings.insert("bot_token".into(), serde_json::json!("123:abc"));
        let config = ChannelConfig { settings, ..config };
        let channel = create_telegram_channel("tg".into(), &config).unwrap();
        assert_eq!(channel.channel_type(), "telegram");
        assert_eq!(channel.channel_id(), "tg");
        assert_eq!(channel.status(), ChannelStatus::Stopped);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn outbound(text: &str) -> OutboundMessage {
        OutboundMessage {
            channel_type: "telegram".into(),
            channel_id: "tg".into(),
            recipient_id: "42".into(),
            conversation_id: "42".into(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_send_is_plain_text() {
        let bodies: Arc<StdMutex<Vec<serde_json::Value>>> = Arc::default();
        let recorded = bodies.clone();
        let app = Router::new().route(
            "/bottok/sendMessage",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(body);
                    axum::Json(serde_json::json!({
                        "ok": true,
                        "result": {"message_id": 1, "date": 0, "chat": {"id": 42, "type": "private"}}
                    }))
                }
            }),
        );
        let api = TelegramApi::with_api_root("tok", &serve(app).await).unwrap();
        let channel = TelegramChannel::with_api("tg".into(), api, 1024);

        let outcome = channel.send(outbound("Image description: a cat")).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["chat_id"], 42);
        assert_eq!(bodies[0]["text"], "Image description: a cat");
        assert!(bodies[0].get("parse_mode").is_none());
    }

    #[tokio::test]
    async fn test_send_to_blocked_chat_is_unreachable() {
        let app = Router::new()
            .route(
                "/bottok/sendMessage",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "ok": false,
                        "error_code": 403,
                        "description": "Forbidden: bot was blocked by the user"
                    }))
                }),
            )
            .route(
                "/bottok/sendChatAction",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "ok": false,
                        "error_code": 403,
                        "description": "Forbidden: user is deactivated"
                    }))
                }),
            );
        let api = TelegramApi::with_api_root("tok", &serve(app).await).unwrap();
        let channel = TelegramChannel::with_api("tg".into(), api, 1024);

        assert_eq!(
            channel.send(outbound("hi")).await,
            DeliveryOutcome::Unreachable
        );
        assert_eq!(
            channel.notify_processing("42", &HashMap::new()).await,
            DeliveryOutcome::Unreachable
        );
    }

    #[tokio::test]
    async fn test_send_without_chat_id_fails() {
        let api = TelegramApi::with_api_root("tok", "http://127.0.0.1:9").unwrap();
        let channel = TelegramChannel::with_api("tg".into(), api, 1024);
        let mut msg = outbound("hi");
        msg.conversation_id = "not-a-chat".into();
        assert!(matches!(
            channel.send(msg).await,
            DeliveryOutcome::Failed(_)
        ));
    }
}
