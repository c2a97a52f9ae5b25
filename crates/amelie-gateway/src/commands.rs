//! Bot commands: usage help and per-conversation settings.

use amelie_storage::AmelieStorage;
use amelie_types::{ConversationConfig, DetailLevel, VideoMode};

/// Reply to plain text that carries no media.
pub const TEXT_HINT: &str = "I describe media for you. Send me a photo, video, audio \
    message or document (PDF or text) and I will reply with a description. Type /help \
    to see the available commands.";

/// Commands understood by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Short,
    Long,
    Caption,
    Full,
    Settings,
}

impl BotCommand {
    /// Every command, in menu order.
    pub const ALL: [BotCommand; 7] = [
        BotCommand::Start,
        BotCommand::Help,
        BotCommand::Short,
        BotCommand::Long,
        BotCommand::Caption,
        BotCommand::Full,
        BotCommand::Settings,
    ];

    /// Parse a command name without the leading `/`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BotCommand::Start => "start",
            BotCommand::Help => "help",
            BotCommand::Short => "short",
            BotCommand::Long => "long",
            BotCommand::Caption => "caption",
            BotCommand::Full => "full",
            BotCommand::Settings => "settings",
        }
    }

    /// One-line description shown in the platform's command menu.
    pub fn description(&self) -> &'static str {
        match self {
            BotCommand::Start => "Start using the bot",
            BotCommand::Help => "How to use the bot",
            BotCommand::Short => "Short image descriptions",
            BotCommand::Long => "Detailed image descriptions",
            BotCommand::Caption => "Videos: one summary caption",
            BotCommand::Full => "Videos: scene by scene description",
            BotCommand::Settings => "Show your current settings",
        }
    }
}

fn usage() -> String {
    let mut text = String::from(
        "Send me a photo, video, audio message or document and I will describe it \
         in plain text.\n\nCommands:",
    );
    for command in BotCommand::ALL {
        text.push_str(&format!("\n/{} {}", command.name(), command.description()));
    }
    text
}

fn describe_settings(config: &ConversationConfig) -> String {
    let detail = match config.detail_level {
        DetailLevel::Short => "short",
        DetailLevel::Long => "detailed",
    };
    let video = match config.video_mode {
        VideoMode::CaptionOnly => "one summary caption",
        VideoMode::Full => "scene by scene",
    };
    format!("Current settings:\nImage descriptions: {detail}.\nVideos: {video}.")
}

/// Run `command` for `conversation_id` and return the reply text.
///
/// Settings changes take effect for the next media the conversation sends.
pub async fn execute(
    storage: &AmelieStorage,
    conversation_id: &str,
    command: BotCommand,
) -> anyhow::Result<String> {
    let reply = match command {
        BotCommand::Start => format!("Welcome! {}", usage()),
        BotCommand::Help => usage(),
        BotCommand::Short => {
            storage
                .set_detail_level(conversation_id, DetailLevel::Short)
                .await?;
            "Done. Images will now get a short description.".to_string()
        }
        BotCommand::Long => {
            storage
                .set_detail_level(conversation_id, DetailLevel::Long)
                .await?;
            "Done. Images will now get a detailed description.".to_string()
        }
        BotCommand::Caption => {
            storage
                .set_video_mode(conversation_id, VideoMode::CaptionOnly)
                .await?;
            "Done. Videos will now get a single summary caption.".to_string()
        }
        BotCommand::Full => {
            storage
                .set_video_mode(conversation_id, VideoMode::Full)
                .await?;
            "Done. Videos will now be described scene by scene.".to_string()
        }
        BotCommand::Settings => describe_settings(&storage.get_config(conversation_id).await?),
    };
    Ok(reply)
}

/// Reply for a command the bot does not know.
pub fn unknown_command(name: &str) -> String {
    format!("I do not know the command /{name}. {}", usage())
}
