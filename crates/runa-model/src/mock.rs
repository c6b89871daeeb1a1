// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::ResponseStream, Content, ContentGenerator, GenerateRequest, GenerateResponse,
    ModelError, Part,
};

/// Deterministic mock generator for tests.  Echoes the last user message.
#[derive(Default)]
pub struct MockGenerator;

#[async_trait]
impl ContentGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        req: GenerateRequest,
        _prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError> {
        let reply = req
            .contents
            .iter()
            .rev()
            .find(|c| matches!(c.role, crate::Role::User))
            .map(Content::text)
            .unwrap_or_else(|| "[no input]".into());
        Ok(GenerateResponse::from_parts(vec![Part::text(format!("MOCK: {reply}"))]))
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream, ModelError> {
        let resp = self.generate(req, prompt_id).await?;
        Ok(Box::pin(stream::iter(vec![Ok(resp)])))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
    }
}

/// One scripted attempt: either the stream fails to open, or it yields the
/// given chunk sequence.
pub enum Script {
    Fail(ModelError),
    Chunks(Vec<GenerateResponse>),
}

/// Pre-scripted generator.  Each `generate`/`generate_stream` call pops the
/// next script from the front of the queue, so tests can specify exact
/// chunk sequences, including tool calls, empty streams and quota errors,
/// without network access.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    /// Every request seen, in call order.  Tests inspect models and contents.
    pub requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Generator that always returns a single text chunk.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::Chunks(vec![GenerateResponse::from_parts(vec![
            Part::text(reply.into()),
        ])])])
    }

    /// Round 1 emits a tool call, round 2 a text reply.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Script::Chunks(vec![GenerateResponse::from_parts(vec![Part::function_call(
                tool_name.into(),
                args,
            )])]),
            Script::Chunks(vec![GenerateResponse::from_parts(vec![Part::text(
                final_text.into(),
            )])]),
        ])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Model names requested, in call order.
    pub fn models_seen(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.model.clone()).collect()
    }

    fn next_script(&self, req: &GenerateRequest) -> Script {
        self.requests.lock().unwrap().push(req.clone());
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Script::Chunks(vec![GenerateResponse::from_parts(vec![Part::text(
                    "[no more scripts]",
                )])])
            })
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn generate(
        &self,
        req: GenerateRequest,
        _prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError> {
        match self.next_script(&req) {
            Script::Fail(e) => Err(e),
            Script::Chunks(chunks) => {
                // Merge the scripted chunks into one response.
                let parts: Vec<Part> = chunks
                    .into_iter()
                    .flat_map(|c| c.parts().to_vec())
                    .collect();
                Ok(GenerateResponse::from_parts(parts))
            }
        }
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        _prompt_id: &str,
    ) -> Result<ResponseStream, ModelError> {
        match self.next_script(&req) {
            Script::Fail(e) => Err(e),
            Script::Chunks(chunks) => {
                let items: Vec<Result<GenerateResponse, ModelError>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
