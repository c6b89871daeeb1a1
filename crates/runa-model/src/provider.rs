// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{approx_token_count, Content, GenerateRequest, GenerateResponse, ModelError, TokenCount};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<GenerateResponse, ModelError>> + Send>>;

/// Provider adapter: one-shot and streaming generation over the normalized
/// request/response shapes, plus token counting and embeddings.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Driver name for status display.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError>;

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream, ModelError>;

    /// Advisory token count.  Drivers without a native counting endpoint
    /// inherit the chars/4 approximation.
    async fn count_tokens(&self, contents: &[Content]) -> Result<TokenCount, ModelError> {
        Ok(approx_token_count(contents))
    }

    /// One embedding vector per input text.  No batching contract.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Model names available from this driver, when discoverable.
    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        Ok(Vec::new())
    }
}
