//! Routes inbound messages: commands, media, or plain text.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use amelie_media::{MediaPipeline, PipelineOutcome, RawInboundMessage, ReplySink};
use amelie_storage::AmelieStorage;
use amelie_types::{DeliveryOutcome, InboundMessage};

use crate::channel::{ChannelManager, ChannelReplySink};
use crate::commands::{self, BotCommand, TEXT_HINT};

/// How often the processing indicator is refreshed while a pipeline runs.
const PROCESSING_REFRESH: Duration = Duration::from_secs(4);

const SETTINGS_ERROR: &str =
    "Sorry, I could not update your settings right now. Please try again.";

/// What the router did with one inbound message.
#[derive(Debug)]
pub enum RouteOutcome {
    Command {
        command: Option<BotCommand>,
        delivery: DeliveryOutcome,
    },
    Media(PipelineOutcome),
    Hint(DeliveryOutcome),
    /// Shut down before the message could be processed.
    Dropped,
}

/// Dispatches inbound messages to commands or the media pipeline.
pub struct MessageRouter {
    pipeline: MediaPipeline,
    storage: Arc<AmelieStorage>,
    limiter: Arc<Semaphore>,
}

impl MessageRouter {
    /// `max_concurrent` bounds how many media events run at once.
    pub fn new(pipeline: MediaPipeline, storage: Arc<AmelieStorage>, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            storage,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Handle one inbound message and reply through its channel.
    pub async fn handle(
        &self,
        mut inbound: InboundMessage,
        channel_mgr: &Arc<ChannelManager>,
        cancel: CancellationToken,
    ) -> RouteOutcome {
        let sink = ChannelReplySink::for_inbound(channel_mgr.clone(), &inbound);

        if let Some(name) = inbound.command().map(str::to_string) {
            return self.handle_command(&inbound, &name, &sink).await;
        }

        match inbound.media.take() {
            Some(media) => {
                let raw = RawInboundMessage {
                    conversation_id: inbound.conversation_id.clone(),
                    media,
                    caption: Some(inbound.text.trim().to_string()).filter(|t| !t.is_empty()),
                };
                self.handle_media(raw, &inbound, channel_mgr, &sink, cancel)
                    .await
            }
            None => RouteOutcome::Hint(sink.deliver(&inbound.conversation_id, TEXT_HINT).await),
        }
    }

    async fn handle_command(
        &self,
        inbound: &InboundMessage,
        name: &str,
        sink: &ChannelReplySink,
    ) -> RouteOutcome {
        let command = BotCommand::parse(name);
        let reply = match command {
            Some(command) => {
                match commands::execute(&self.storage, &inbound.conversation_id, command).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(
                            conversation_id = %inbound.conversation_id,
                            command = command.name(),
                            "Command failed: {e:#}"
                        );
                        SETTINGS_ERROR.to_string()
                    }
                }
            }
            None => commands::unknown_command(name),
        };

        info!(
            conversation_id = %inbound.conversation_id,
            command = name,
            "Handled command"
        );

        RouteOutcome::Command {
            command,
            delivery: sink.deliver(&inbound.conversation_id, &reply).await,
        }
    }

    async fn handle_media(
        &self,
        raw: RawInboundMessage,
        inbound: &InboundMessage,
        channel_mgr: &Arc<ChannelManager>,
        sink: &ChannelReplySink,
        cancel: CancellationToken,
    ) -> RouteOutcome {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RouteOutcome::Dropped,
            permit = self.limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return RouteOutcome::Dropped,
            },
        };

        if channel_mgr.notify_processing(inbound).await == DeliveryOutcome::Unreachable {
            info!(
                conversation_id = %inbound.conversation_id,
                "Conversation unreachable, cancelling event"
            );
            cancel.cancel();
        }

        // Keeps the indicator alive during long engine calls; stops when
        // this function returns.
        let done = CancellationToken::new();
        let _done_guard = done.clone().drop_guard();
        tokio::spawn(refresh_processing(
            channel_mgr.clone(),
            inbound.clone(),
            cancel.clone(),
            done,
        ));

        let outcome = self.pipeline.process(raw, sink, &cancel).await;
        drop(permit);
        RouteOutcome::Media(outcome)
    }
}

async fn refresh_processing(
    channel_mgr: Arc<ChannelManager>,
    inbound: InboundMessage,
    event: CancellationToken,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = event.cancelled() => return,
            _ = tokio::time::sleep(PROCESSING_REFRESH) => {}
        }
        if channel_mgr.notify_processing(&inbound).await == DeliveryOutcome::Unreachable {
            info!(
                conversation_id = %inbound.conversation_id,
                "Conversation became unreachable, cancelling event"
            );
            event.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use amelie_media::{
        DescribeRequest, DescriptionEngine, EphemeralStore, ErrorKind, InvocationError,
        PipelineSettings, Terminal,
    };
    use amelie_types::{DetailLevel, MediaPayload};

    use crate::channel::tests::MockChannel;

    /// Engine that answers after a short delay and tracks concurrency.
    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl DescriptionEngine for CountingEngine {
        fn id(&self) -> &str {
            "counting"
        }

        async fn describe(&self, req: DescribeRequest<'_>) -> Result<String, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("**{}** seen", req.mode))
        }
    }

    struct Fixture {
        router: MessageRouter,
        channel_mgr: Arc<ChannelManager>,
        channel: Arc<MockChannel>,
        engine: Arc<CountingEngine>,
        storage: Arc<AmelieStorage>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(channel: MockChannel, max_concurrent: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(AmelieStorage::open_in_memory().unwrap());
        let engine = Arc::new(CountingEngine::default());
        let pipeline = MediaPipeline::new(
            storage.clone(),
            EphemeralStore::new(dir.path()).unwrap(),
            engine.clone(),
            PipelineSettings::default(),
        );
        let channel_mgr = Arc::new(ChannelManager::new(16));
        let channel = Arc::new(channel);
        channel_mgr.register(channel.clone()).await;
        Fixture {
            router: MessageRouter::new(pipeline, storage.clone(), max_concurrent),
            channel_mgr,
            channel,
            engine,
            storage,
            _dir: dir,
        }
    }

    fn inbound(text: &str, media: Option<MediaPayload>) -> InboundMessage {
        let mut metadata = HashMap::new();
        if let Some(command) = text.strip_prefix('/') {
            metadata.insert("command".to_string(), serde_json::json!(command));
        }
        InboundMessage {
            channel_type: "mock".into(),
            channel_id: "mock-1".into(),
            sender_id: "user-1".into(),
            sender_name: None,
            conversation_id: "chat-1".into(),
            text: text.into(),
            media,
            metadata,
            timestamp: 0,
        }
    }

    fn photo() -> Option<MediaPayload> {
        Some(MediaPayload::from_bytes(
            Bytes::from_static(b"\xFF\xD8\xFF\xE0jpeg"),
            Some("image/jpeg".into()),
        ))
    }

    #[tokio::test]
    async fn test_command_updates_settings() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;

        let outcome = f
            .router
            .handle(inbound("/long", None), &f.channel_mgr, CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            RouteOutcome::Command {
                command: Some(BotCommand::Long),
                delivery: DeliveryOutcome::Delivered
            }
        ));
        let config = f.storage.get_config("chat-1").await.unwrap();
        assert_eq!(config.detail_level, DetailLevel::Long);
        assert_eq!(f.channel.texts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;
        let outcome = f
            .router
            .handle(inbound("/new", None), &f.channel_mgr, CancellationToken::new())
            .await;
        assert!(matches!(outcome, RouteOutcome::Command { command: None, .. }));
        assert!(f.channel.texts().await[0].contains("/new"));
    }

    #[tokio::test]
    async fn test_plain_text_gets_hint() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;
        let outcome = f
            .router
            .handle(inbound("what is this?", None), &f.channel_mgr, CancellationToken::new())
            .await;
        assert!(matches!(outcome, RouteOutcome::Hint(DeliveryOutcome::Delivered)));
        assert_eq!(f.channel.texts().await, vec![TEXT_HINT.to_string()]);
        assert_eq!(f.engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_media_is_described() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;
        let outcome = f
            .router
            .handle(inbound("", photo()), &f.channel_mgr, CancellationToken::new())
            .await;

        let RouteOutcome::Media(outcome) = outcome else {
            panic!("expected a media outcome");
        };
        assert_eq!(outcome.terminal, Terminal::Delivered);
        assert_eq!(
            f.channel.texts().await,
            vec!["Image description: concise image seen".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unreachable_conversation_cancels_event() {
        let f = fixture(MockChannel::unreachable("mock-1"), 4).await;
        let outcome = f
            .router
            .handle(inbound("", photo()), &f.channel_mgr, CancellationToken::new())
            .await;

        let RouteOutcome::Media(outcome) = outcome else {
            panic!("expected a media outcome");
        };
        assert_eq!(outcome.error(), Some(ErrorKind::Cancelled));
        assert_eq!(f.engine.calls.load(Ordering::SeqCst), 0);
        assert!(f.channel.texts().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_media() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f.router.handle(inbound("", photo()), &f.channel_mgr, cancel).await;
        assert!(matches!(outcome, RouteOutcome::Dropped));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let f = Arc::new(fixture(MockChannel::new("mock-1"), 2).await);

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.router
                    .handle(inbound("", photo()), &f.channel_mgr, CancellationToken::new())
                    .await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await.unwrap(), RouteOutcome::Media(_)));
        }

        assert_eq!(f.engine.calls.load(Ordering::SeqCst), 6);
        assert!(f.engine.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(f.channel.texts().await.len(), 6);
    }

    #[tokio::test]
    async fn test_message_loop_end_to_end() {
        let f = fixture(MockChannel::new("mock-1"), 4).await;
        let router = Arc::new(f.router);
        let shutdown = CancellationToken::new();

        f.channel_mgr.start_channel("mock-1").await.unwrap();
        let sender = f.channel.sender.lock().await.clone().unwrap();

        let loop_mgr = f.channel_mgr.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop_mgr.run_message_loop(router, loop_shutdown).await;
        });

        sender.send(inbound("", photo())).await.unwrap();
        sender.send(inbound("hello", None)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.channel.texts().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
        let texts = f.channel.texts().await;
        assert!(texts.contains(&TEXT_HINT.to_string()));
        assert!(texts.iter().any(|t| t.starts_with("Image description: ")));
    }
}
