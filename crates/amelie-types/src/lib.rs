use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ──────────────────── Media Types ────────────────────

/// Semantic kind assigned to an inbound media payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media attached to an inbound message, as handed over by the transport.
///
/// `data` is `None` when the transport did not (or could not) fetch the
/// payload, e.g. because the declared size exceeds the download limit.
/// Payload bytes are never serialized.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Declared MIME type, if the platform reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Original file name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Declared size in bytes (0 when unknown).
    #[serde(default)]
    pub size_bytes: u64,
    /// Raw payload bytes.
    #[serde(skip)]
    pub data: Option<Bytes>,
}

impl MediaPayload {
    /// Build a payload from bytes already in memory.
    pub fn from_bytes(data: impl Into<Bytes>, mime_type: Option<String>) -> Self {
        let data = data.into();
        Self {
            mime_type,
            file_name: None,
            size_bytes: data.len() as u64,
            data: Some(data),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Effective size: the larger of the declared size and the bytes held.
    pub fn effective_size(&self) -> u64 {
        let held = self.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        self.size_bytes.max(held)
    }
}

impl fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPayload")
            .field("mime_type", &self.mime_type)
            .field("file_name", &self.file_name)
            .field("size_bytes", &self.size_bytes)
            .field("held_bytes", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

// ──────────────────── Conversation Settings ────────────────────

/// Verbosity of image descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    #[default]
    Short,
    Long,
}

/// Granularity of video descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    #[default]
    CaptionOnly,
    Full,
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Short => "short",
            DetailLevel::Long => "long",
        }
    }
}

impl VideoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoMode::CaptionOnly => "caption_only",
            VideoMode::Full => "full",
        }
    }
}

/// Error returned when a stored setting value is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSetting(pub String);

impl fmt::Display for UnknownSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown setting value: {}", self.0)
    }
}

impl std::error::Error for UnknownSetting {}

impl FromStr for DetailLevel {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Ok(DetailLevel::Short),
            "long" => Ok(DetailLevel::Long),
            other => Err(UnknownSetting(other.to_string())),
        }
    }
}

impl FromStr for VideoMode {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "caption_only" | "caption" => Ok(VideoMode::CaptionOnly),
            "full" => Ok(VideoMode::Full),
            other => Err(UnknownSetting(other.to_string())),
        }
    }
}

/// Per-conversation preferences. Settings only, never content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub conversation_id: String,
    #[serde(default)]
    pub detail_level: DetailLevel,
    #[serde(default)]
    pub video_mode: VideoMode,
}

impl ConversationConfig {
    /// Default settings for a conversation that never changed them.
    pub fn defaults_for(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            detail_level: DetailLevel::default(),
            video_mode: VideoMode::default(),
        }
    }
}

// ──────────────────── Channel Types ────────────────────

/// Message from an external channel to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel type (e.g. "telegram").
    pub channel_type: String,
    /// Unique channel instance ID.
    pub channel_id: String,
    /// External user/sender identifier.
    pub sender_id: String,
    /// Display name of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Conversation the message belongs to (e.g. a Telegram chat id).
    pub conversation_id: String,
    /// Message text or media caption.
    #[serde(default)]
    pub text: String,
    /// Attached media, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
    /// Platform-specific metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Message timestamp (unix millis).
    pub timestamp: i64,
}

impl InboundMessage {
    /// Bot command name carried in metadata, if the message is a command.
    pub fn command(&self) -> Option<&str> {
        self.metadata.get("command").and_then(|v| v.as_str())
    }
}

/// Message from the gateway to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Channel type (e.g. "telegram").
    pub channel_type: String,
    /// Unique channel instance ID.
    pub channel_id: String,
    /// Recipient identifier on the external platform.
    pub recipient_id: String,
    /// Conversation to deliver into.
    pub conversation_id: String,
    /// Plain text to deliver.
    pub text: String,
    /// Platform-specific metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Result of handing a message to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The transport accepted the message.
    Delivered,
    /// The conversation can no longer be reached (e.g. the bot was blocked).
    Unreachable,
    /// Delivery failed for another reason.
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Status of a channel plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Channel is not running.
    Stopped,
    /// Channel is initializing.
    Starting,
    /// Channel is running and accepting messages.
    Running,
    /// Channel encountered an error.
    Error(String),
}

/// Summary information about a registered channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_type: String,
    pub channel_id: String,
    pub status: ChannelStatus,
}

/// Configuration for a channel instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel type (e.g. "telegram").
    pub channel_type: String,
    /// Whether this channel is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Channel-specific settings (e.g. bot token).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}
