//! The media description pipeline.
//!
//! One inbound media event walks a fixed sequence of stages:
//!
//! ```text
//! Received -> Classified -> ModeResolved -> StorageAcquired -> Invoked
//!          -> Sanitized -> Delivered
//! ```
//!
//! Any stage may end the run in `Failed`. The payload handle acquired in
//! `StorageAcquired` is released exactly once before the run terminates, on
//! every path. Runs share nothing but the settings store, so concurrent events
//! never see each other's payloads or results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amelie_config::AmelieConfig;
use amelie_storage::AmelieStorage;
use amelie_types::{ConversationConfig, DeliveryOutcome, MediaKind};

use crate::classify::{ClassifierLimits, RawInboundMessage, classify};
use crate::engine::DescriptionEngine;
use crate::ephemeral::EphemeralStore;
use crate::error::{ErrorKind, PipelineError};
use crate::invoker::{
    DescriptionInvoker, DescriptionRequest, DescriptionResult, InvokerPolicy,
};
use crate::mode::{self, DescriptionMode};
use crate::sanitize::sanitize;

/// Notice sent when the engine answered with nothing readable.
const EMPTY_DESCRIPTION_NOTICE: &str =
    "I could not produce a description for this file. Please try sending it again.";

/// Where per-conversation settings come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get_config(&self, conversation_id: &str) -> anyhow::Result<ConversationConfig>;
}

#[async_trait]
impl ConfigSource for AmelieStorage {
    async fn get_config(&self, conversation_id: &str) -> anyhow::Result<ConversationConfig> {
        Ok(AmelieStorage::get_config(self, conversation_id).await?)
    }
}

/// Where replies and notices go.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, conversation_id: &str, text: &str) -> DeliveryOutcome;
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Classified,
    ModeResolved,
    StorageAcquired,
    Invoked,
    Sanitized,
    Delivered,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Terminal {
    Delivered,
    /// `stage` is the last stage reached before the failure.
    Failed { stage: Stage, error: ErrorKind },
}

/// Record of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub conversation_id: String,
    /// Stages reached, in order.
    pub trail: Vec<Stage>,
    pub terminal: Terminal,
    /// Engine calls made (0, 1 or 2).
    pub attempts: u32,
    pub kind: Option<MediaKind>,
    pub mode: Option<DescriptionMode>,
}

impl PipelineOutcome {
    pub fn is_delivered(&self) -> bool {
        self.terminal == Terminal::Delivered
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self.terminal {
            Terminal::Failed { error, .. } => Some(error),
            Terminal::Delivered => None,
        }
    }
}

/// Pipeline tuning, usually derived from [`AmelieConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSettings {
    pub limits: ClassifierLimits,
    pub invoker: InvokerPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AmelieConfig) -> Self {
        Self {
            limits: ClassifierLimits {
                max_payload_bytes: config.pipeline.max_payload_bytes,
            },
            invoker: InvokerPolicy {
                timeout: Duration::from_secs(config.engine.timeout_secs),
                retry_delay: Duration::from_millis(config.engine.retry_delay_ms),
            },
        }
    }
}

/// Reply heading announcing what kind of output follows.
fn reply_heading(kind: MediaKind, mime_type: &str) -> &'static str {
    match kind {
        MediaKind::Image => "Image description",
        MediaKind::Video => "Video description",
        MediaKind::Audio => "Audio transcription",
        MediaKind::Document if mime_type == "application/pdf" => "PDF analysis",
        MediaKind::Document => "Document analysis",
    }
}

/// Mutable bookkeeping of a single run.
struct Run {
    trail: Vec<Stage>,
    attempts: u32,
    kind: Option<MediaKind>,
    mode: Option<DescriptionMode>,
}

impl Run {
    fn reach(&mut self, stage: Stage) {
        self.trail.push(stage);
    }

    fn last_stage(&self) -> Stage {
        self.trail.last().copied().unwrap_or(Stage::Received)
    }
}

/// Processes media events end to end.
#[derive(Clone)]
pub struct MediaPipeline {
    config_source: Arc<dyn ConfigSource>,
    store: EphemeralStore,
    invoker: DescriptionInvoker,
    limits: ClassifierLimits,
}

impl MediaPipeline {
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        store: EphemeralStore,
        engine: Arc<dyn DescriptionEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            config_source,
            store,
            invoker: DescriptionInvoker::new(engine, settings.invoker),
            limits: settings.limits,
        }
    }

    pub fn store(&self) -> &EphemeralStore {
        &self.store
    }

    /// Run one media event through the pipeline and deliver the result.
    ///
    /// Failures are answered with a plain-language notice unless the
    /// conversation is gone (`cancel` fired or the sink reports it
    /// unreachable). Never panics on engine or transport errors.
    pub async fn process(
        &self,
        raw: RawInboundMessage,
        sink: &dyn ReplySink,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let conversation_id = raw.conversation_id.clone();
        let mut run = Run {
            trail: vec![Stage::Received],
            attempts: 0,
            kind: None,
            mode: None,
        };

        let result = self.drive(raw, sink, cancel, &mut run).await;

        let terminal = match result {
            Ok(()) => {
                run.reach(Stage::Delivered);
                Terminal::Delivered
            }
            Err(err) => {
                let stage = run.last_stage();
                let error = err.kind();
                match &err {
                    PipelineError::Cancelled => {
                        info!(conversation_id = %conversation_id, ?stage, "Run cancelled");
                    }
                    PipelineError::DeliveryFailed(detail) => {
                        warn!(conversation_id = %conversation_id, "Reply not delivered: {detail}");
                    }
                    _ => {
                        warn!(conversation_id = %conversation_id, ?stage, ?error, "Run failed: {err}");
                        if let Some(notice) = err.user_notice() {
                            let outcome = sink.deliver(&conversation_id, &notice).await;
                            if !outcome.is_delivered() {
                                warn!(
                                    conversation_id = %conversation_id,
                                    ?outcome,
                                    "Failure notice not delivered"
                                );
                            }
                        }
                    }
                }
                Terminal::Failed { stage, error }
            }
        };

        info!(
            conversation_id = %conversation_id,
            kind = ?run.kind,
            mode = ?run.mode,
            attempts = run.attempts,
            ?terminal,
            "Media event processed"
        );

        PipelineOutcome {
            conversation_id,
            trail: run.trail,
            terminal,
            attempts: run.attempts,
            kind: run.kind,
            mode: run.mode,
        }
    }

    async fn drive(
        &self,
        mut raw: RawInboundMessage,
        sink: &dyn ReplySink,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), PipelineError> {
        let event = classify(&raw, &self.limits)?;
        // The event owns the payload from here on.
        raw.media.data = None;
        run.kind = Some(event.kind);
        run.reach(Stage::Classified);
        debug!(
            conversation_id = %event.conversation_id,
            kind = %event.kind,
            mime = %event.mime_type,
            size = event.size_bytes,
            "Classified media event"
        );
        ensure_live(cancel)?;

        // Read fresh for every event so a settings change applies to the
        // next media sent.
        let config = match self.config_source.get_config(&event.conversation_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    conversation_id = %event.conversation_id,
                    "Failed to read settings, using defaults: {e:#}"
                );
                ConversationConfig::defaults_for(&event.conversation_id)
            }
        };
        let mode = mode::resolve(&config, event.kind);
        run.mode = Some(mode);
        run.reach(Stage::ModeResolved);
        ensure_live(cancel)?;

        let handle = self.store.acquire(event.payload).await?;
        run.reach(Stage::StorageAcquired);
        ensure_live(cancel)?;

        let request = DescriptionRequest {
            kind: event.kind,
            mode,
            mime_type: &event.mime_type,
            caption: raw.caption.as_deref(),
            payload: &handle,
        };
        let invocation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            invocation = self.invoker.invoke(&request) => invocation?,
        };
        run.attempts = invocation.attempts;
        handle.release();

        let raw_text = match invocation.result {
            DescriptionResult::Success { raw_text } => raw_text,
            DescriptionResult::Failure { error } => return Err(error.into()),
        };
        run.reach(Stage::Invoked);

        let sanitized = sanitize(&raw_text);
        run.reach(Stage::Sanitized);
        ensure_live(cancel)?;

        let reply = if sanitized.is_empty() {
            EMPTY_DESCRIPTION_NOTICE.to_string()
        } else {
            format!(
                "{}: {}",
                reply_heading(event.kind, &event.mime_type),
                sanitized.plain_text
            )
        };

        match sink.deliver(&event.conversation_id, &reply).await {
            DeliveryOutcome::Delivered => Ok(()),
            DeliveryOutcome::Unreachable => Err(PipelineError::Cancelled),
            DeliveryOutcome::Failed(detail) => Err(PipelineError::DeliveryFailed(detail)),
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}
