//! Drives one assistant generation from prompt to terminal message state.
//!
//! The controller owns the cancellation side-table: a cancel signal per
//! in-flight message id, set by [`GenerationController::cancel`] and selected
//! against the chunk stream, so cancellation is observed even while the
//! provider is silent. Messages themselves stay plain data.
//!
//! Every generation ends in exactly one terminal write: `generating` cleared,
//! parts finalized, and either a finish reason of `Stop`/`Length`/`ToolUse`,
//! `Aborted` for local cancellation (no error attached), or `Error` with the
//! failure recorded on the message. Stream failures are surfaced on the
//! message, not returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::models::message::{ContentPart, FinishReason, Message, MessageRole, TokenUsage};
use crate::models::session::Session;
use crate::models::sessions_store::SessionStore;
use crate::services::llm_service::{ChatContext, ChatModel, StreamChunk};
use crate::services::storage_service::BlobStorage;
use crate::services::stream_assembler::StreamAssembler;
use crate::settings::Settings;

/// Minimum interval between store writes while streaming. Chunks arriving
/// faster than this are coalesced into the next write.
const WRITE_COALESCE_INTERVAL: Duration = Duration::from_millis(100);

/// Cancellation handle for one in-flight generation. The flag records the
/// request; the notify wakes the chunk loop, so a stalled stream cannot mask
/// it.
#[derive(Default)]
struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called. The flag is
    /// re-checked after registering with the notify to close the race with a
    /// trigger landing in between.
    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub struct GenerationController {
    store: SessionStore,
    storage: Arc<dyn BlobStorage>,
    settings: RwLock<Settings>,
    /// Cancel signals for in-flight generations, keyed by message id.
    cancel_signals: Mutex<HashMap<String, Arc<CancelSignal>>>,
}

impl GenerationController {
    pub fn new(store: SessionStore, storage: Arc<dyn BlobStorage>, settings: Settings) -> Self {
        Self {
            store,
            storage,
            settings: RwLock::new(settings),
            cancel_signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    /// Request cancellation of the generation targeting `message_id`.
    /// Idempotent; a no-op when no generation is in flight for that id.
    pub fn cancel(&self, message_id: &str) {
        if let Some(signal) = self.cancel_signals.lock().get(message_id) {
            signal.trigger();
        }
    }

    /// Register a fresh cancel signal for `message_id`. A signal already
    /// present belongs to an earlier run against the same message; cancel it.
    fn register_cancel_signal(&self, message_id: &str) -> Arc<CancelSignal> {
        let signal = Arc::new(CancelSignal::default());
        if let Some(previous) = self
            .cancel_signals
            .lock()
            .insert(message_id.to_string(), signal.clone())
        {
            previous.trigger();
        }
        signal
    }

    /// Run one generation into the message `message_id` of `session_id`.
    ///
    /// Returns `Err` only for setup problems (unknown session or message,
    /// persistence failure). Provider and stream errors are recorded on the
    /// message and yield `Ok`.
    pub async fn generate(
        &self,
        model: Arc<dyn ChatModel>,
        session_id: &str,
        message_id: &str,
    ) -> anyhow::Result<()> {
        let session = self
            .store
            .get(session_id)
            .with_context(|| format!("Unknown session {session_id}"))?;
        session
            .find_message(message_id)
            .with_context(|| format!("Unknown message {message_id}"))?;

        let settings = self.settings.read().merged(session.settings.as_ref());
        let context = self
            .build_context(&session, message_id, model.as_ref(), &settings)
            .await?;

        // Reset the target message into a clean generating state.
        let model_name = model.name().to_string();
        self.store
            .update(session_id, |s| {
                if let Some(message) = s.find_message_mut(message_id) {
                    message.content_parts.clear();
                    message.generating = true;
                    message.error = None;
                    message.error_code = None;
                    message.error_extra = None;
                    message.status = None;
                    message.usage = None;
                    message.finish_reason = None;
                    message.first_token_latency_ms = None;
                    message.model = Some(model_name);
                }
            })
            .await?;

        let cancel = self.register_cancel_signal(message_id);
        let started = Instant::now();

        let mut assembler = StreamAssembler::new(self.storage.clone(), session_id);
        let mut usage: Option<TokenUsage> = None;
        let mut finish_reason: Option<FinishReason> = None;
        let mut first_token_latency: Option<i64> = None;
        let mut failure: Option<GenerationError> = None;

        let chat = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = model.chat(context) => Some(result),
        };
        match chat {
            None => {}
            Some(Err(e)) => failure = Some(e),
            Some(Ok(mut stream)) => {
                let mut last_write = Instant::now();
                loop {
                    // Select against the cancel signal so cancellation lands
                    // even when the provider stalls; dropping the stream on
                    // that branch tears down the in-flight request.
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = stream.next() => item,
                    };
                    let Some(item) = item else { break };
                    match item {
                        Ok(chunk) => {
                            if first_token_latency.is_none() {
                                first_token_latency = Some(started.elapsed().as_millis() as i64);
                            }
                            match &chunk {
                                StreamChunk::TokenUsage {
                                    input_tokens,
                                    output_tokens,
                                } => {
                                    usage = Some(TokenUsage {
                                        input_tokens: *input_tokens,
                                        output_tokens: *output_tokens,
                                    });
                                }
                                StreamChunk::Done(reason) => finish_reason = Some(*reason),
                                _ => {}
                            }
                            if let Err(e) = assembler.apply(chunk).await {
                                failure = Some(GenerationError::unknown(format!(
                                    "Failed to store attachment: {e}"
                                )));
                                break;
                            }
                            if last_write.elapsed() >= WRITE_COALESCE_INTERVAL {
                                let parts = assembler.parts().to_vec();
                                if let Err(e) = self.write_parts(session_id, message_id, parts).await
                                {
                                    warn!(error = %e, "Dropping interim stream write");
                                }
                                last_write = Instant::now();
                            }
                        }
                        Err(e) => {
                            if !e.is_cancelled() {
                                failure = Some(e);
                            }
                            break;
                        }
                    }
                }
            }
        }

        assembler.finish();
        {
            // A newer run may have replaced this entry; only remove our own
            // signal, or its cancel() would silently stop working.
            let mut signals = self.cancel_signals.lock();
            if let Some(entry) = signals.get(message_id)
                && Arc::ptr_eq(entry, &cancel)
            {
                signals.remove(message_id);
            }
        }

        let cancelled = cancel.is_cancelled();
        let final_reason = if cancelled {
            FinishReason::Aborted
        } else if failure.is_some() {
            FinishReason::Error
        } else {
            finish_reason.unwrap_or(FinishReason::Stop)
        };
        debug!(message_id, ?final_reason, "Generation finished");

        let parts = assembler.into_parts();
        self.store
            .update(session_id, |s| {
                if let Some(message) = s.find_message_mut(message_id) {
                    message.content_parts = parts;
                    message.generating = false;
                    message.usage = usage;
                    message.first_token_latency_ms = first_token_latency;
                    message.finish_reason = Some(final_reason);
                    if !cancelled && let Some(e) = &failure {
                        message.error = Some(e.to_string());
                        message.error_code = e.code();
                        message.error_extra = error_extra(e);
                    }
                }
            })
            .await?;

        Ok(())
    }

    /// Assemble the prompt for `message_id`: the leading system message (as
    /// is, or downgraded to a user message for models without system-message
    /// support), then preceding non-system messages filtered of failed and
    /// in-flight ones, capped at the configured context length. Image parts
    /// are stripped for models without vision, otherwise their blobs are
    /// inlined.
    async fn build_context(
        &self,
        session: &Session,
        message_id: &str,
        model: &dyn ChatModel,
        settings: &Settings,
    ) -> anyhow::Result<ChatContext> {
        let location = session
            .locate_message(message_id)
            .with_context(|| format!("Unknown message {message_id}"))?;
        let array = session.array_at(location);
        let position = array
            .iter()
            .position(|m| m.id == message_id)
            .with_context(|| format!("Unknown message {message_id}"))?;

        let system = array
            .first()
            .filter(|m| m.role == MessageRole::System)
            .cloned();

        let mut history: Vec<Message> = array[..position]
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .filter(|m| !m.has_error() && !m.generating)
            .cloned()
            .collect();
        if history.len() > settings.max_context_message_count {
            let excess = history.len() - settings.max_context_message_count;
            history.drain(..excess);
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(mut system) = system {
            if !model.supports_system_message() {
                system.role = MessageRole::User;
            }
            messages.push(system);
        }
        messages.extend(history);

        let mut blobs = HashMap::new();
        for message in &mut messages {
            if !model.supports_vision() {
                message
                    .content_parts
                    .retain(|p| !matches!(p, ContentPart::Image { .. }));
                continue;
            }
            for part in &message.content_parts {
                if let ContentPart::Image { storage_key, .. } = part
                    && let Some(bytes) = self.storage.get_blob(storage_key).await?
                {
                    blobs.insert(storage_key.clone(), bytes);
                }
            }
        }

        Ok(ChatContext {
            messages,
            blobs,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    async fn write_parts(
        &self,
        session_id: &str,
        message_id: &str,
        parts: Vec<ContentPart>,
    ) -> anyhow::Result<()> {
        self.store
            .update(session_id, |s| {
                if let Some(message) = s.find_message_mut(message_id) {
                    message.content_parts = parts;
                }
            })
            .await?;
        Ok(())
    }
}

/// Structured detail carried alongside an error, e.g. the HTTP status of an
/// API failure.
fn error_extra(error: &GenerationError) -> Option<serde_json::Value> {
    match error {
        GenerationError::Api {
            status: Some(status),
            ..
        } => Some(json!({ "status": status })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::repositories::in_memory_repository::InMemorySessionRepository;
    use crate::services::llm_service::ChunkStream;
    use crate::services::storage_service::InMemoryBlobStorage;
    use async_trait::async_trait;

    struct ScriptedModel {
        chunks: Vec<Result<StreamChunk, GenerationError>>,
        supports_system: bool,
        supports_vision: bool,
        seen_context: Mutex<Option<ChatContext>>,
    }

    impl ScriptedModel {
        fn new(chunks: Vec<Result<StreamChunk, GenerationError>>) -> Self {
            Self {
                chunks,
                supports_system: true,
                supports_vision: false,
                seen_context: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_system_message(&self) -> bool {
            self.supports_system
        }

        fn supports_vision(&self) -> bool {
            self.supports_vision
        }

        async fn chat(&self, context: ChatContext) -> Result<ChunkStream, GenerationError> {
            *self.seen_context.lock() = Some(context);
            Ok(futures::stream::iter(self.chunks.clone()).boxed())
        }
    }

    /// Streams one chunk forever; only cancellation ends it.
    struct EndlessModel;

    #[async_trait]
    impl ChatModel for EndlessModel {
        fn name(&self) -> &str {
            "endless"
        }

        async fn chat(&self, _context: ChatContext) -> Result<ChunkStream, GenerationError> {
            Ok(async_stream::stream! {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    yield Ok(StreamChunk::TextDelta("x".into()));
                }
            }
            .boxed())
        }
    }

    async fn setup() -> (Arc<GenerationController>, String, String) {
        let store = SessionStore::new(Arc::new(InMemorySessionRepository::new()));
        let session = store.create("test").await.unwrap();
        let pending = Message::assistant_pending();
        let target_id = pending.id.clone();
        store
            .update(&session.id, |s| {
                s.messages.push(Message::user("question"));
                s.messages.push(pending);
            })
            .await
            .unwrap();

        let controller = Arc::new(GenerationController::new(
            store,
            Arc::new(InMemoryBlobStorage::new()),
            Settings::default(),
        ));
        (controller, session.id, target_id)
    }

    #[tokio::test]
    async fn successful_generation_writes_terminal_state() {
        let (controller, session_id, message_id) = setup().await;
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(StreamChunk::TextDelta("hello".into())),
            Ok(StreamChunk::TokenUsage {
                input_tokens: 12,
                output_tokens: 3,
            }),
            Ok(StreamChunk::Done(FinishReason::Stop)),
        ]));

        controller
            .generate(model, &session_id, &message_id)
            .await
            .unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        assert_eq!(message.text(), "hello");
        assert_eq!(message.finish_reason, Some(FinishReason::Stop));
        assert_eq!(message.usage.unwrap().output_tokens, 3);
        assert_eq!(message.model.as_deref(), Some("scripted"));
        assert!(message.first_token_latency_ms.is_some());
        assert!(!message.has_error());
    }

    #[tokio::test]
    async fn stream_error_lands_on_message_not_caller() {
        let (controller, session_id, message_id) = setup().await;
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(StreamChunk::TextDelta("part".into())),
            Err(GenerationError::Api {
                status: Some(429),
                message: "rate limited".into(),
            }),
        ]));

        controller
            .generate(model, &session_id, &message_id)
            .await
            .unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        // Partial output is kept alongside the error.
        assert_eq!(message.text(), "part");
        assert_eq!(message.finish_reason, Some(FinishReason::Error));
        assert_eq!(message.error_code, Some(ErrorCode::ApiError));
        assert_eq!(message.error_extra.as_ref().unwrap()["status"], 429);
    }

    #[tokio::test]
    async fn setup_failure_before_streaming_is_recorded() {
        let (controller, session_id, message_id) = setup().await;

        struct FailingModel;
        #[async_trait]
        impl ChatModel for FailingModel {
            fn name(&self) -> &str {
                "failing"
            }
            async fn chat(&self, _c: ChatContext) -> Result<ChunkStream, GenerationError> {
                Err(GenerationError::transport("connection refused"))
            }
        }

        controller
            .generate(Arc::new(FailingModel), &session_id, &message_id)
            .await
            .unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        assert_eq!(message.error_code, Some(ErrorCode::NetworkError));
        assert_eq!(message.finish_reason, Some(FinishReason::Error));
    }

    #[tokio::test]
    async fn cancellation_aborts_without_error() {
        let (controller, session_id, message_id) = setup().await;

        let task = {
            let controller = controller.clone();
            let session_id = session_id.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move {
                controller
                    .generate(Arc::new(EndlessModel), &session_id, &message_id)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.cancel(&message_id);
        task.await.unwrap().unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        assert_eq!(message.finish_reason, Some(FinishReason::Aborted));
        assert!(!message.has_error());
        // Content streamed before the cancel survives.
        assert!(!message.content_parts.is_empty());
        // Cancelled runs are removed from the side-table.
        assert!(controller.cancel_signals.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_settles_generation_even_when_the_stream_is_silent() {
        let (controller, session_id, message_id) = setup().await;

        struct StalledModel;
        #[async_trait]
        impl ChatModel for StalledModel {
            fn name(&self) -> &str {
                "stalled"
            }
            async fn chat(&self, _c: ChatContext) -> Result<ChunkStream, GenerationError> {
                Ok(futures::stream::pending().boxed())
            }
        }

        let task = {
            let controller = controller.clone();
            let session_id = session_id.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move {
                controller
                    .generate(Arc::new(StalledModel), &session_id, &message_id)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.cancel(&message_id);
        // Must settle without a single chunk ever arriving.
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("generation did not settle after cancel")
            .unwrap()
            .unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        assert_eq!(message.finish_reason, Some(FinishReason::Aborted));
    }

    #[tokio::test]
    async fn regeneration_keeps_the_new_runs_cancel_signal() {
        let (controller, session_id, message_id) = setup().await;

        let spawn_endless = |controller: Arc<GenerationController>| {
            let session_id = session_id.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move {
                controller
                    .generate(Arc::new(EndlessModel), &session_id, &message_id)
                    .await
            })
        };

        let run_a = spawn_endless(controller.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Re-targeting the same message cancels run A and installs run B's
        // signal.
        let run_b = spawn_endless(controller.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        run_a.await.unwrap().unwrap();

        // Run A's cleanup must not have taken run B's entry with it.
        assert!(controller.cancel_signals.lock().contains_key(&message_id));

        controller.cancel(&message_id);
        tokio::time::timeout(Duration::from_millis(500), run_b)
            .await
            .expect("run B did not settle after cancel")
            .unwrap()
            .unwrap();

        let session = controller.store.get(&session_id).unwrap();
        let message = session.find_message(&message_id).unwrap();
        assert!(!message.generating);
        assert_eq!(message.finish_reason, Some(FinishReason::Aborted));
    }

    #[tokio::test]
    async fn cancel_for_unknown_message_is_a_noop() {
        let (controller, _, _) = setup().await;
        controller.cancel("nobody-home");
    }

    #[tokio::test]
    async fn context_excludes_failed_and_generating_messages() {
        let (controller, session_id, message_id) = setup().await;
        controller
            .store
            .update(&session_id, |s| {
                let mut failed = Message::assistant("broken");
                failed.error = Some("boom".into());
                // Insert before the pending target.
                let at = s.messages.len() - 1;
                s.messages.insert(at, failed);
            })
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new(vec![Ok(StreamChunk::Done(
            FinishReason::Stop,
        ))]));
        controller
            .generate(model.clone(), &session_id, &message_id)
            .await
            .unwrap();

        let context = model.seen_context.lock().clone().unwrap();
        // System + user question; the failed assistant reply is filtered out.
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].role, MessageRole::System);
        assert_eq!(context.messages[1].text(), "question");
    }

    #[tokio::test]
    async fn system_message_downgraded_when_unsupported() {
        let (controller, session_id, message_id) = setup().await;
        let mut model = ScriptedModel::new(vec![Ok(StreamChunk::Done(FinishReason::Stop))]);
        model.supports_system = false;
        let model = Arc::new(model);

        controller
            .generate(model.clone(), &session_id, &message_id)
            .await
            .unwrap();

        let context = model.seen_context.lock().clone().unwrap();
        assert_eq!(context.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn image_parts_stripped_without_vision_and_inlined_with_it() {
        let (controller, session_id, message_id) = setup().await;
        controller
            .storage
            .set_blob("s/img", b"pixels".to_vec())
            .await
            .unwrap();
        controller
            .store
            .update(&session_id, |s| {
                let at = s.messages.len() - 1;
                s.messages[at - 1]
                    .content_parts
                    .push(ContentPart::Image {
                        storage_key: "s/img".into(),
                        ocr_result: None,
                    });
            })
            .await
            .unwrap();

        let blind = Arc::new(ScriptedModel::new(vec![Ok(StreamChunk::Done(
            FinishReason::Stop,
        ))]));
        controller
            .generate(blind.clone(), &session_id, &message_id)
            .await
            .unwrap();
        let context = blind.seen_context.lock().clone().unwrap();
        assert!(
            context.messages[1]
                .content_parts
                .iter()
                .all(|p| !matches!(p, ContentPart::Image { .. }))
        );
        assert!(context.blobs.is_empty());

        let mut sighted = ScriptedModel::new(vec![Ok(StreamChunk::Done(FinishReason::Stop))]);
        sighted.supports_vision = true;
        let sighted = Arc::new(sighted);
        controller
            .generate(sighted.clone(), &session_id, &message_id)
            .await
            .unwrap();
        let context = sighted.seen_context.lock().clone().unwrap();
        assert_eq!(context.blobs["s/img"], b"pixels");
    }

    #[tokio::test]
    async fn context_length_is_capped() {
        let (controller, session_id, message_id) = setup().await;
        let mut settings = Settings::default();
        settings.max_context_message_count = 2;
        controller.set_settings(settings);

        controller
            .store
            .update(&session_id, |s| {
                let at = s.messages.len() - 1;
                for i in 0..5 {
                    s.messages.insert(at + i, Message::user(format!("m{i}")));
                }
            })
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new(vec![Ok(StreamChunk::Done(
            FinishReason::Stop,
        ))]));
        controller
            .generate(model.clone(), &session_id, &message_id)
            .await
            .unwrap();

        let context = model.seen_context.lock().clone().unwrap();
        // System message plus the two most recent history entries.
        assert_eq!(context.messages.len(), 3);
        assert_eq!(context.messages[2].text(), "m4");
    }

    #[tokio::test]
    async fn generate_fails_fast_for_unknown_targets() {
        let (controller, session_id, _) = setup().await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        assert!(
            controller
                .generate(model.clone(), "missing", "missing")
                .await
                .is_err()
        );
        assert!(
            controller
                .generate(model, &session_id, "missing")
                .await
                .is_err()
        );
    }
}
