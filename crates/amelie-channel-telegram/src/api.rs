//! Telegram Bot API HTTP client.

use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::{
    ApiResponse, BotInfo, GetFileParams, GetUpdatesParams, SendChatActionParams,
    SendMessageParams, SetChatMenuButtonParams, SetMyCommandsParams, TgFile, TgMessage, Update,
};

const DEFAULT_API_ROOT: &str = "https://api.telegram.org";

/// A request the Bot API answered with `ok: false`.
#[derive(Debug, thiserror::Error)]
#[error("{method} failed ({code}): {description}", code = .code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()))]
pub struct ApiRejection {
    pub method: &'static str,
    pub code: Option<i64>,
    pub description: String,
}

impl ApiRejection {
    /// Whether the chat can no longer be written to (bot blocked or kicked,
    /// user deactivated, chat deleted).
    pub fn is_unreachable(&self) -> bool {
        match self.code {
            Some(403) => true,
            Some(400) => self.description.to_lowercase().contains("chat not found"),
            _ => false,
        }
    }
}

/// Whether `err` means the chat is gone for good.
pub fn is_unreachable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiRejection>()
        .is_some_and(ApiRejection::is_unreachable)
}

/// HTTP client for the Telegram Bot API.
pub struct TelegramApi {
    client: Client,
    base_url: String,
    file_url: String,
}

impl TelegramApi {
    /// Create a new API client with the given bot token.
    pub fn new(bot_token: &str) -> anyhow::Result<Self> {
        Self::with_api_root(bot_token, DEFAULT_API_ROOT)
    }

    /// Create a client against another Bot API server (self-hosted, tests).
    pub fn with_api_root(bot_token: &str, api_root: &str) -> anyhow::Result<Self> {
        // Above the 30s long-poll timeout.
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        let root = api_root.trim_end_matches('/');
        Ok(Self {
            client,
            base_url: format!("{root}/bot{bot_token}"),
            file_url: format!("{root}/file/bot{bot_token}"),
        })
    }

    async fn call<P, R>(&self, method: &'static str, params: &P) -> anyhow::Result<Option<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp: ApiResponse<R> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} response parse failed"))?;

        if !resp.ok {
            return Err(ApiRejection {
                method,
                code: resp.error_code,
                description: resp.description.unwrap_or_else(|| "unknown error".into()),
            }
            .into());
        }
        Ok(resp.result)
    }

    /// Verify the bot token by calling `getMe`.
    pub async fn get_me(&self) -> anyhow::Result<BotInfo> {
        self.call("getMe", &serde_json::json!({}))
            .await?
            .context("getMe returned no result")
    }

    /// Long-poll for updates.
    pub async fn get_updates(&self, params: &GetUpdatesParams) -> anyhow::Result<Vec<Update>> {
        Ok(self.call("getUpdates", params).await?.unwrap_or_default())
    }

    /// Send a chat action (e.g. "typing").
    pub async fn send_chat_action(&self, params: &SendChatActionParams) -> anyhow::Result<()> {
        self.call::<_, bool>("sendChatAction", params).await?;
        Ok(())
    }

    /// Set the bot's menu button (shown left of the input field).
    pub async fn set_chat_menu_button(
        &self,
        params: &SetChatMenuButtonParams,
    ) -> anyhow::Result<()> {
        self.call::<_, bool>("setChatMenuButton", params).await?;
        Ok(())
    }

    /// Register bot commands in the menu.
    pub async fn set_my_commands(&self, params: &SetMyCommandsParams) -> anyhow::Result<()> {
        self.call::<_, bool>("setMyCommands", params).await?;
        Ok(())
    }

    /// Send a text message.
    pub async fn send_message(&self, params: &SendMessageParams) -> anyhow::Result<TgMessage> {
        self.call("sendMessage", params)
            .await?
            .context("sendMessage returned no result")
    }

    /// Resolve a file id to a downloadable path.
    pub async fn get_file(&self, file_id: &str) -> anyhow::Result<TgFile> {
        let params = GetFileParams {
            file_id: file_id.to_string(),
        };
        self.call("getFile", &params)
            .await?
            .context("getFile returned no result")
    }

    /// Download a file by the path `getFile` returned, refusing files larger
    /// than `max_bytes`.
    pub async fn download_file(&self, file_path: &str, max_bytes: u64) -> anyhow::Result<Bytes> {
        let resp = self
            .client
            .get(format!("{}/{file_path}", self.file_url))
            .send()
            .await
            .context("file download request failed")?
            .error_for_status()
            .context("file download rejected")?;

        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                bail!("file of {len} bytes exceeds the {max_bytes} byte limit");
            }
        }

        let data = resp.bytes().await.context("file download interrupted")?;
        if data.len() as u64 > max_bytes {
            bail!(
                "file of {} bytes exceeds the {max_bytes} byte limit",
                data.len()
            );
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::routing::{get, post};

    #[test]
    fn test_urls() {
        let api = TelegramApi::new("123:ABC").unwrap();
        assert_eq!(api.base_url, "https://api.telegram.org/bot123:ABC");
        assert_eq!(api.file_url, "https://api.telegram.org/file/bot123:ABC");

        let api = TelegramApi::with_api_root("t", "http://localhost:8081/").unwrap();
        assert_eq!(api.base_url, "http://localhost:8081/bott");
    }

    #[test]
    fn test_unreachable_detection() {
        let blocked: anyhow::Error = ApiRejection {
            method: "sendMessage",
            code: Some(403),
            description: "Forbidden: bot was blocked by the user".into(),
        }
        .into();
        assert!(is_unreachable(&blocked));

        let missing = ApiRejection {
            method: "sendMessage",
            code: Some(400),
            description: "Bad Request: chat not found".into(),
        };
        assert!(missing.is_unreachable());

        let too_long = ApiRejection {
            method: "sendMessage",
            code: Some(400),
            description: "Bad Request: message is too long".into(),
        };
        assert!(!too_long.is_unreachable());

        assert!(!is_unreachable(&anyhow::anyhow!("connection reset")));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_get_file_and_download() {
        let app = Router::new()
            .route(
                "/bottok/getFile",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "ok": true,
                        "result": {"file_id": "f1", "file_size": 5, "file_path": "photos/f1.jpg"}
                    }))
                }),
            )
            .route("/file/bottok/photos/f1.jpg", get(|| async { "jpeg!" }));
        let root = serve(app).await;
        let api = TelegramApi::with_api_root("tok", &root).unwrap();

        let file = api.get_file("f1").await.unwrap();
        let path = file.file_path.unwrap();
        assert_eq!(path, "photos/f1.jpg");

        let data = api.download_file(&path, 1024).await.unwrap();
        assert_eq!(&data[..], b"jpeg!");

        assert!(api.download_file(&path, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_rejection_carries_error_code() {
        let app = Router::new().route(
            "/bottok/sendMessage",
            post(|| async {
                axum::Json(serde_json::json!({
                    "ok": false,
                    "error_code": 403,
                    "description": "Forbidden: bot was blocked by the user"
                }))
            }),
        );
        let root = serve(app).await;
        let api = TelegramApi::with_api_root("tok", &root).unwrap();

        let err = api
            .send_message(&SendMessageParams {
                chat_id: 1,
                text: "hi".into(),
                parse_mode: None,
            })
            .await
            .unwrap_err();
        assert!(is_unreachable(&err));
    }
}
