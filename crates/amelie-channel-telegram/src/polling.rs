//! Telegram long-polling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amelie_types::{InboundMessage, MediaPayload};

use crate::api::TelegramApi;
use crate::types::{GetUpdatesParams, TgMessage};

/// A file attached to a Telegram message, before download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    /// Size Telegram declared, 0 when unknown.
    pub file_size: u64,
}

fn attachment(
    file_id: &str,
    mime_type: Option<&str>,
    default_mime: Option<&str>,
    file_name: Option<&str>,
    file_size: Option<u64>,
) -> Attachment {
    Attachment {
        file_id: file_id.to_string(),
        mime_type: mime_type.or(default_mime).map(str::to_string),
        file_name: file_name.map(str::to_string),
        file_size: file_size.unwrap_or(0),
    }
}

/// Pick the media a message carries, if any.
///
/// Photos use the largest size Telegram offers. Types Telegram re-encodes
/// itself get a MIME default when none is declared.
pub fn extract_attachment(msg: &TgMessage) -> Option<Attachment> {
    if let Some(photo) = msg.photo.iter().max_by_key(|p| p.width * p.height) {
        return Some(attachment(
            &photo.file_id,
            None,
            Some("image/jpeg"),
            None,
            photo.file_size,
        ));
    }
    if let Some(v) = &msg.video {
        return Some(attachment(
            &v.file_id,
            v.mime_type.as_deref(),
            Some("video/mp4"),
            v.file_name.as_deref(),
            v.file_size,
        ));
    }
    if let Some(v) = &msg.video_note {
        return Some(attachment(
            &v.file_id,
            None,
            Some("video/mp4"),
            None,
            v.file_size,
        ));
    }
    if let Some(a) = &msg.animation {
        return Some(attachment(
            &a.file_id,
            a.mime_type.as_deref(),
            Some("video/mp4"),
            a.file_name.as_deref(),
            a.file_size,
        ));
    }
    if let Some(v) = &msg.voice {
        return Some(attachment(
            &v.file_id,
            v.mime_type.as_deref(),
            Some("audio/ogg"),
            None,
            v.file_size,
        ));
    }
    if let Some(a) = &msg.audio {
        return Some(attachment(
            &a.file_id,
            a.mime_type.as_deref(),
            Some("audio/mpeg"),
            a.file_name.as_deref(),
            a.file_size,
        ));
    }
    msg.document.as_ref().map(|d| {
        attachment(
            &d.file_id,
            d.mime_type.as_deref(),
            None,
            d.file_name.as_deref(),
            d.file_size,
        )
    })
}

/// Command name of a message starting with a bot command entity
/// ("/long@amelie_bot" → "long").
pub fn extract_command(msg: &TgMessage) -> Option<String> {
    let text = msg.text.as_deref()?;
    let is_command = msg
        .entities
        .iter()
        .any(|e| e.entity_type == "bot_command" && e.offset == 0);
    if !is_command {
        return None;
    }
    let cmd = text
        .split_whitespace()
        .next()?
        .trim_start_matches('/')
        .split('@')
        .next()?;
    (!cmd.is_empty()).then(|| cmd.to_string())
}

/// Convert a Telegram message to an `InboundMessage` without media bytes.
pub fn to_inbound(msg: &TgMessage, channel_id: &str) -> InboundMessage {
    let sender_id = msg
        .from
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| msg.chat.id.to_string());

    let mut metadata = HashMap::new();
    metadata.insert(
        "chat_id".into(),
        serde_json::Value::Number(msg.chat.id.into()),
    );
    metadata.insert(
        "message_id".into(),
        serde_json::Value::Number(msg.message_id.into()),
    );
    if let Some(cmd) = extract_command(msg) {
        metadata.insert("command".into(), serde_json::Value::String(cmd));
    }

    InboundMessage {
        channel_type: "telegram".into(),
        channel_id: channel_id.to_string(),
        sender_id,
        sender_name: msg.from.as_ref().map(|u| u.display_name()),
        conversation_id: msg.chat.id.to_string(),
        text: msg
            .text
            .clone()
            .or_else(|| msg.caption.clone())
            .unwrap_or_default(),
        media: None,
        metadata,
        timestamp: msg.date * 1000,
    }
}

/// Fetch an attachment's bytes.
///
/// Files declared larger than `max_bytes` are not downloaded; the payload
/// keeps the declared size so the pipeline rejects it as oversized. A failed
/// download yields a payload without data.
pub async fn fetch_media(api: &TelegramApi, att: &Attachment, max_bytes: u64) -> MediaPayload {
    let mut payload = MediaPayload {
        mime_type: att.mime_type.clone(),
        file_name: att.file_name.clone(),
        size_bytes: att.file_size,
        data: None,
    };
    if att.file_size > max_bytes {
        debug!(
            file_size = att.file_size,
            max_bytes, "Attachment over download limit, not fetching"
        );
        return payload;
    }

    let file = match api.get_file(&att.file_id).await {
        Ok(file) => file,
        Err(e) => {
            warn!("getFile failed: {e:#}");
            return payload;
        }
    };
    if let Some(size) = file.file_size {
        payload.size_bytes = payload.size_bytes.max(size);
    }
    let Some(path) = file.file_path else {
        warn!("getFile returned no downloadable path");
        return payload;
    };

    match api.download_file(&path, max_bytes).await {
        Ok(data) => {
            payload.size_bytes = data.len() as u64;
            payload.data = Some(data);
        }
        Err(e) => warn!("File download failed: {e:#}"),
    }
    payload
}

/// Run the long-polling loop, converting Telegram updates to `InboundMessage`.
///
/// Media downloads run in their own tasks so a large file does not hold up
/// other conversations. Exits when `cancel` is cancelled or the `sender` is
/// closed.
pub async fn run_polling_loop(
    api: Arc<TelegramApi>,
    channel_id: String,
    max_download_bytes: u64,
    sender: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    info!(channel_id, "Telegram polling loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let params = GetUpdatesParams {
            offset,
            timeout: Some(30),
            allowed_updates: Some(vec!["message".into()]),
        };

        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = api.get_updates(&params) => result,
        };

        match updates {
            Ok(updates) => {
                backoff = Duration::from_secs(1);

                for update in updates {
                    offset = Some(update.update_id + 1);

                    let Some(msg) = update.message else {
                        continue;
                    };

                    let mut inbound = to_inbound(&msg, &channel_id);

                    debug!(
                        channel_id,
                        update_id = update.update_id,
                        "Forwarding Telegram message"
                    );

                    match extract_attachment(&msg) {
                        Some(att) => {
                            let api = api.clone();
                            let sender = sender.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                let media = tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    media = fetch_media(&api, &att, max_download_bytes) => media,
                                };
                                inbound.media = Some(media);
                                let _ = sender.send(inbound).await;
                            });
                        }
                        None if inbound.text.is_empty() => continue,
                        None => {
                            if sender.send(inbound).await.is_err() {
                                info!(channel_id, "Inbound channel closed, stopping polling");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    channel_id,
                    backoff_secs = backoff.as_secs(),
                    "getUpdates error: {e:#}"
                );

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {},
                }

                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    info!(channel_id, "Telegram polling loop stopped");
}
