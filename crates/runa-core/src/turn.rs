// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The turn driver: the outer model ↔ tool loop for one user prompt.
//!
//! One cancellation token governs the whole turn; the driver observes it at
//! defined checkpoints (loop top, per streamed chunk), the chat session and
//! the scheduler observe the same token internally.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use runa_config::{AgentConfig, CancelToken};
use runa_model::{Content, ModelError, Part};
use runa_tools::ToolRegistry;

use crate::chat::ChatSession;
use crate::events::{StopReason, TurnEvent};
use crate::prompt::PromptResolver;
use crate::scheduler::{ToolCallRequest, ToolScheduler};

pub struct TurnDriver {
    chat: ChatSession,
    scheduler: Arc<ToolScheduler>,
    registry: Arc<ToolRegistry>,
    resolver: PromptResolver,
    max_turns: Option<u32>,
}

impl TurnDriver {
    pub fn new(
        chat: ChatSession,
        scheduler: Arc<ToolScheduler>,
        registry: Arc<ToolRegistry>,
        agent_cfg: &AgentConfig,
        workspace_root: PathBuf,
    ) -> Self {
        let resolver = PromptResolver::new(
            Arc::clone(&registry),
            workspace_root,
            agent_cfg.respect_git_ignore,
            agent_cfg.recursive_file_search,
        );
        Self {
            chat,
            scheduler,
            registry,
            resolver,
            max_turns: agent_cfg.max_turns,
        }
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    /// Run one full turn: resolve the prompt, then loop model → tools until
    /// the model stops, the cap is hit, or the token trips.
    pub async fn run(
        &self,
        prompt: &str,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancelToken,
    ) -> anyhow::Result<()> {
        let prompt_id = Uuid::new_v4().to_string();
        let parts = self.resolver.resolve(prompt, &prompt_id, &tx, &cancel).await;
        let mut next_message = Some(Content::user_parts(parts));
        let mut turns = 0u32;

        while let Some(message) = next_message.take() {
            if cancel.is_cancelled() {
                // The triggering content still belongs in history; no model
                // output is appended for it.
                self.chat.record_user_content(message);
                let _ = tx.send(TurnEvent::Finished(StopReason::Cancelled)).await;
                return Ok(());
            }

            turns += 1;
            if let Some(cap) = self.max_turns {
                if turns > cap {
                    warn!(cap, "session turn cap exceeded");
                    let _ = tx
                        .send(TurnEvent::Error(format!(
                            "stopping: turn cap of {cap} iterations reached for this prompt"
                        )))
                        .await;
                    let _ = tx.send(TurnEvent::Finished(StopReason::MaxTurns)).await;
                    return Ok(());
                }
            }

            let mut stream = self
                .chat
                .send_stream(message, &prompt_id, cancel.clone())
                .await;

            let mut function_calls: Vec<(String, serde_json::Value)> = Vec::new();
            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    let _ = tx.send(TurnEvent::Finished(StopReason::Cancelled)).await;
                    return Ok(());
                }
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let e = self.annotate(e);
                        let _ = tx.send(TurnEvent::Error(e.to_string())).await;
                        return Err(e.into());
                    }
                };
                for part in chunk.parts() {
                    match part {
                        Part::Text { text } if !text.is_empty() => {
                            let _ = tx.send(TurnEvent::Content(text.clone())).await;
                        }
                        Part::Thought { text } => {
                            let _ = tx
                                .send(TurnEvent::Thought(text.clone().unwrap_or_default()))
                                .await;
                        }
                        Part::FunctionCall { name, args } => {
                            function_calls.push((name.clone(), args.clone()));
                        }
                        _ => {}
                    }
                }
            }

            if function_calls.is_empty() {
                let _ = tx.send(TurnEvent::Finished(StopReason::EndTurn)).await;
                return Ok(());
            }

            let requests: Vec<ToolCallRequest> = function_calls
                .into_iter()
                .map(|(name, args)| ToolCallRequest {
                    call_id: format!("{name}-{}", Uuid::new_v4()),
                    name,
                    args,
                    prompt_id: prompt_id.clone(),
                    is_client_initiated: false,
                })
                .collect();
            debug!(count = requests.len(), "dispatching tool-call batch");
            let _ = tx.send(TurnEvent::ToolCallsRequested(requests.clone())).await;

            let completed = self.scheduler.schedule(requests, cancel.clone()).await;
            let _ = tx
                .send(TurnEvent::ToolCallsCompleted(
                    completed
                        .iter()
                        .map(|c| crate::scheduler::ToolCallSnapshot {
                            status: c.status,
                            request: c.request.clone(),
                            description: None,
                            confirmation: None,
                            outcome: c.outcome,
                            response: Some(c.response.clone()),
                            duration_ms: c.duration_ms,
                        })
                        .collect(),
                ))
                .await;

            // Function responses, in request order, become the next user turn.
            let parts: Vec<Part> = completed
                .into_iter()
                .flat_map(|c| c.response.parts)
                .collect();
            next_message = Some(Content::user_parts(parts));
        }

        Ok(())
    }

    /// Attach the cyclic-schema tool list to schema/argument errors before
    /// they surface.  Detection never blocks a request; it only explains one
    /// that the provider rejected.
    fn annotate(&self, error: ModelError) -> ModelError {
        match &error {
            ModelError::SchemaDepth { .. } | ModelError::InvalidArgument { .. } => {
                error.with_cyclic_tools(self.registry.cyclic_schema_tools())
            }
            _ => error,
        }
    }
}
