// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The chat session: serialized turns against one content generator.
//!
//! Two retry policies compose here.  The transport/quota policy wraps every
//! provider call (exponential backoff on 429/5xx, fallback-model switch on
//! persistent quota errors).  The empty-stream policy wraps a whole streamed
//! attempt: an attempt that yields no chunks, or an invalid chunk, is
//! retried up to three times with a linear delay before the user content is
//! rolled back and the error surfaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use runa_config::{AuthKind, CancelToken, ModelConfig};
use runa_model::{
    retry::RetryConfig, Content, ContentGenerator, GenerateRequest, GenerateResponse,
    GenerationConfig, ModelError, Part, ResponseStream, Role,
};

use crate::history::History;

const EMPTY_STREAM_MAX_ATTEMPTS: u32 = 3;

/// Session-wide model selection state.  Mutable only through the fallback
/// hook under the session's serialized turn.
#[derive(Debug)]
pub struct ModelSessionState {
    model: StdMutex<String>,
    fallback_model: String,
    auth_kind: AuthKind,
    fallback_mode: AtomicBool,
    quota_error_occurred: AtomicBool,
}

impl ModelSessionState {
    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            model: StdMutex::new(cfg.name.clone()),
            fallback_model: cfg.fallback_model.clone(),
            auth_kind: cfg.auth_kind,
            fallback_mode: AtomicBool::new(false),
            quota_error_occurred: AtomicBool::new(false),
        }
    }

    pub fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    pub fn fallback_model(&self) -> &str {
        &self.fallback_model
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.lock().unwrap() = model.into();
    }

    pub fn enter_fallback_mode(&self) {
        self.fallback_mode.store(true, Ordering::SeqCst);
    }

    pub fn in_fallback_mode(&self) -> bool {
        self.fallback_mode.load(Ordering::SeqCst)
    }

    pub fn quota_error_occurred(&self) -> bool {
        self.quota_error_occurred.load(Ordering::SeqCst)
    }
}

/// Decides whether to switch to the fallback model after persistent quota
/// errors.  Hosts typically prompt the user here.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn on_persistent_quota(&self, current_model: &str, fallback_model: &str) -> bool;
}

enum Attempt {
    Oneshot(GenerateResponse),
    Stream(ResponseStream),
}

/// Conversation session over one generator.  Turns are strictly serialized:
/// a second `send` waits for the first to finish recording history.
#[derive(Clone)]
pub struct ChatSession {
    generator: Arc<dyn ContentGenerator>,
    state: Arc<ModelSessionState>,
    generation_config: GenerationConfig,
    history: Arc<StdMutex<History>>,
    send_lock: Arc<AsyncMutex<()>>,
    retry: RetryConfig,
    empty_stream_delay: Duration,
    fallback: Option<Arc<dyn FallbackHandler>>,
}

impl ChatSession {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        model_cfg: &ModelConfig,
        generation_config: GenerationConfig,
    ) -> Self {
        Self {
            generator,
            state: Arc::new(ModelSessionState::from_config(model_cfg)),
            generation_config,
            history: Arc::new(StdMutex::new(History::new())),
            send_lock: Arc::new(AsyncMutex::new(())),
            retry: RetryConfig::default(),
            empty_stream_delay: Duration::from_millis(500),
            fallback: None,
        }
    }

    pub fn with_fallback_handler(mut self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Shrink the empty-stream retry delay.  Test hook.
    pub fn with_empty_stream_delay(mut self, delay: Duration) -> Self {
        self.empty_stream_delay = delay;
        self
    }

    pub fn model_state(&self) -> &Arc<ModelSessionState> {
        &self.state
    }

    /// Deep copy of the history; curated view when `curated` is set.
    pub fn history(&self, curated: bool) -> Vec<Content> {
        self.history.lock().unwrap().get(curated)
    }

    /// Record a user content entry without running a turn.  The driver uses
    /// this to fold an unsent message into history on cancellation.
    pub fn record_user_content(&self, content: Content) {
        self.history.lock().unwrap().push_user(content);
    }

    /// One-shot send: blocks until the previous turn finished, runs the
    /// provider call under the retry policy, records history, and returns
    /// the final response.
    pub async fn send(
        &self,
        message: Content,
        prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError> {
        let _turn = self.send_lock.lock().await;

        let known_len = self.history.lock().unwrap().len();
        let mut contents = self.history.lock().unwrap().curated();
        contents.push(message.clone());

        // The lock guard drops on every early return, so a failed turn never
        // deadlocks the next send.
        let resp = match self.open_with_retry(false, contents, prompt_id).await? {
            Attempt::Oneshot(r) => r,
            Attempt::Stream(_) => unreachable!("one-shot attempt returned a stream"),
        };

        let outputs: Vec<Content> = resp
            .candidates
            .first()
            .map(|c| vec![c.content.clone()])
            .unwrap_or_default();

        let mut history = self.history.lock().unwrap();
        if let Some(afc) = &resp.automatic_function_calling_history {
            // The provider ran the turn itself; its tail replaces the user
            // turn's contribution.
            let start = known_len.min(afc.len());
            history.splice_tail(known_len, afc[start..].to_vec());
        } else {
            history.push_user(message);
        }
        history.record_model_output(outputs);
        Ok(resp)
    }

    /// Streaming send.  The user content is pushed to raw history before the
    /// first attempt; if every attempt fails it is rolled back (when still
    /// the exact tail) and the error is delivered through the stream.
    /// History records model output only once the stream completes.
    pub async fn send_stream(
        &self,
        message: Content,
        prompt_id: &str,
        cancel: CancelToken,
    ) -> ResponseStream {
        let turn_guard = Arc::clone(&self.send_lock).lock_owned().await;
        self.history.lock().unwrap().push_user(message.clone());

        let (tx, rx) = mpsc::channel::<Result<GenerateResponse, ModelError>>(32);
        let session = self.clone();
        let prompt_id = prompt_id.to_string();
        tokio::spawn(async move {
            // Held until history is recorded: turns stay serialized for the
            // whole streamed lifetime, not just the open.
            let _turn = turn_guard;
            session.drive_stream(message, &prompt_id, cancel, tx).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn drive_stream(
        &self,
        message: Content,
        prompt_id: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<Result<GenerateResponse, ModelError>>,
    ) {
        let mut attempt: u32 = 1;
        loop {
            let contents = self.history.lock().unwrap().curated();
            let mut stream = match self.open_with_retry(true, contents, prompt_id).await {
                Ok(Attempt::Stream(s)) => s,
                Ok(Attempt::Oneshot(_)) => unreachable!("stream attempt returned one-shot"),
                Err(e) => {
                    self.fail_stream(&message, e, &tx).await;
                    return;
                }
            };

            let mut collected: Vec<Part> = Vec::new();
            let mut chunk_count = 0u32;
            let mut saw_invalid = false;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Cancelled mid-stream: the user content stays in
                        // history and no partial model output is appended.
                        return;
                    }
                    next = stream.next() => match next {
                        None => break,
                        Some(Ok(chunk)) => {
                            chunk_count += 1;
                            if chunk.is_valid_chunk() {
                                collected.extend(chunk.parts().iter().cloned());
                            } else {
                                saw_invalid = true;
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Consumer dropped the stream: treat like
                                // cancellation, keep the user content.
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            self.fail_stream(&message, e, &tx).await;
                            return;
                        }
                    }
                }
            }

            if chunk_count == 0 || saw_invalid {
                if attempt >= EMPTY_STREAM_MAX_ATTEMPTS {
                    self.fail_stream(
                        &message,
                        ModelError::EmptyStream { attempts: attempt },
                        &tx,
                    )
                    .await;
                    return;
                }
                debug!(attempt, "empty or invalid stream attempt; retrying");
                sleep(self.empty_stream_delay * attempt).await;
                attempt += 1;
                continue;
            }

            let parts: Vec<Part> = collected.into_iter().filter(|p| !p.is_thought()).collect();
            self.history
                .lock()
                .unwrap()
                .record_model_output(vec![Content { role: Role::Model, parts }]);
            return;
        }
    }

    async fn fail_stream(
        &self,
        message: &Content,
        error: ModelError,
        tx: &mpsc::Sender<Result<GenerateResponse, ModelError>>,
    ) {
        let rolled_back = self.history.lock().unwrap().rollback_tail(message);
        if !rolled_back {
            // Someone mutated history mid-turn; popping blindly would drop
            // their entry instead of ours.
            warn!("stream failed but user content was no longer the history tail");
        }
        let _ = tx.send(Err(error)).await;
    }

    /// Open one attempt under the transport/quota retry policy, switching to
    /// the fallback model when the handler accepts after persistent 429s.
    async fn open_with_retry(
        &self,
        streaming: bool,
        contents: Vec<Content>,
        prompt_id: &str,
    ) -> Result<Attempt, ModelError> {
        let mut attempt = 0u32;
        let mut consecutive_quota = 0u32;
        loop {
            let model = self.state.model();
            let req = GenerateRequest {
                model: model.clone(),
                contents: contents.clone(),
                config: self.generation_config.clone(),
            };
            let result = if streaming {
                self.generator
                    .generate_stream(req, prompt_id)
                    .await
                    .map(Attempt::Stream)
            } else {
                self.generator.generate(req, prompt_id).await.map(Attempt::Oneshot)
            };

            let error = match result {
                Ok(a) => return Ok(a),
                Err(e) => e,
            };

            if error.is_quota() {
                consecutive_quota += 1;
                self.state.quota_error_occurred.store(true, Ordering::SeqCst);
                if consecutive_quota >= 2
                    && self.state.auth_kind == AuthKind::Personal
                    && model != self.state.fallback_model
                {
                    if let Some(handler) = &self.fallback {
                        if handler
                            .on_persistent_quota(&model, &self.state.fallback_model)
                            .await
                        {
                            let fallback = self.state.fallback_model.clone();
                            warn!(from = %model, to = %fallback, "switching to fallback model");
                            self.state.set_model(fallback);
                            self.state.enter_fallback_mode();
                            consecutive_quota = 0;
                            // Retry immediately on the cheaper model.
                            continue;
                        }
                    }
                }
            } else {
                consecutive_quota = 0;
            }

            if error.is_retryable() && attempt + 1 < self.retry.max_attempts {
                sleep(self.retry.delay_for(attempt)).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
