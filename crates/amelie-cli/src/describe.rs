use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use amelie_config::AmelieConfig;
use amelie_media::{
    ConfigSource, EphemeralStore, GeminiEngine, MediaPipeline, PipelineSettings,
    RawInboundMessage, ReplySink,
};
use amelie_types::{ConversationConfig, DeliveryOutcome, DetailLevel, MediaPayload, VideoMode};

const CONVERSATION_ID: &str = "cli";

/// Settings given on the command line instead of the database.
struct FixedConfig(ConversationConfig);

#[async_trait]
impl ConfigSource for FixedConfig {
    async fn get_config(&self, _conversation_id: &str) -> anyhow::Result<ConversationConfig> {
        Ok(self.0.clone())
    }
}

/// Prints replies to stdout.
struct StdoutSink {
    quiet: bool,
}

#[async_trait]
impl ReplySink for StdoutSink {
    async fn deliver(&self, _conversation_id: &str, text: &str) -> DeliveryOutcome {
        if !self.quiet {
            println!("{text}");
        }
        DeliveryOutcome::Delivered
    }
}

/// Describe a local file through the same pipeline the bot uses.
pub async fn run_describe(
    config: AmelieConfig,
    file: &Path,
    mime: Option<String>,
    detail: DetailLevel,
    video: VideoMode,
    caption: Option<String>,
    json: bool,
) -> Result<()> {
    let api_key = config
        .engine
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .context("engine.api_key / GEMINI_API_KEY is not set")?;

    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut media = MediaPayload::from_bytes(data, mime);
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        media = media.with_file_name(name);
    }

    let spool_dir = config.spool_dir()?;
    let store = EphemeralStore::new(&spool_dir)
        .with_context(|| format!("failed to prepare spool directory {}", spool_dir.display()))?;

    let engine = GeminiEngine::new(
        api_key,
        config.engine.model.clone(),
        config.engine.language.clone(),
    );
    let settings = ConversationConfig {
        conversation_id: CONVERSATION_ID.into(),
        detail_level: detail,
        video_mode: video,
    };
    let pipeline = MediaPipeline::new(
        Arc::new(FixedConfig(settings)),
        store,
        Arc::new(engine),
        PipelineSettings::from_config(&config),
    );

    let raw = RawInboundMessage {
        conversation_id: CONVERSATION_ID.into(),
        media,
        caption,
    };
    let sink = StdoutSink { quiet: json };
    let outcome = pipeline
        .process(raw, &sink, &CancellationToken::new())
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    if let Some(error) = outcome.error() {
        bail!("description failed: {error:?}");
    }
    Ok(())
}
