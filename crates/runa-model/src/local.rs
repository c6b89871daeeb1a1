// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local-server driver speaking the `/api/chat` wire format.
//!
//! Local models may or may not support native function calling, so the
//! driver plays both sides: tools are declared in the request *and* a
//! text-embedded `<tool_call>` protocol is injected into the system message.
//! Whatever the model emits, native `tool_calls` or tagged text, is
//! normalized into `FunctionCall` parts.
//!
//! Streaming responses are newline-delimited JSON objects.  Raw frames are
//! forwarded as chunks while the text accumulates; when the stream closes
//! the accumulated text is post-processed and, if extraction changed it,
//! exactly one terminal synthesized chunk is yielded.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    extract::{extract_json_body, extract_tool_call_parts, tool_instruction_block, JSON_ONLY_INSTRUCTION},
    provider::ResponseStream,
    Content, ContentGenerator, GenerateRequest, GenerateResponse, ModelError, Part, Role,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalGenerator {
    base_url: String,
    embedding_model: String,
    client: reqwest::Client,
}

impl LocalGenerator {
    pub fn new(base_url: Option<String>, embedding_model: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            embedding_model: embedding_model.unwrap_or_else(|| "nomic-embed-text".into()),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// `GET /api/tags` with a 5-second deadline.  2xx means healthy.
    pub async fn health_check(&self) -> Result<(), ModelError> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ModelError::from_http(
                resp.status().as_u16(),
                resp.text().await.unwrap_or_default(),
            ))
        }
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let resp = self.client.post(self.url("/api/chat")).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_http(status.as_u16(), body));
        }
        Ok(resp)
    }

    fn request_body(&self, req: &GenerateRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": build_messages(req),
            "stream": stream,
        });

        let cfg = &req.config;
        if !cfg.tools.is_empty() {
            let tools: Vec<Value> = cfg
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        let mut options = serde_json::Map::new();
        if let Some(t) = cfg.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = cfg.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(k) = cfg.top_k {
            options.insert("top_k".into(), json!(k));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

#[async_trait]
impl ContentGenerator for LocalGenerator {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError> {
        let body = self.request_body(&req, false);
        debug!(model = %req.model, prompt_id, "sending local chat request");
        let resp = self.post_chat(&body).await?;
        let v: Value = resp.json().await?;

        let json_mode = wants_json(&req);
        let content = v["message"]["content"].as_str().unwrap_or_default();
        let mut parts = postprocess_text(content, json_mode);
        parts.extend(native_tool_call_parts(&v["message"]["tool_calls"]));
        Ok(GenerateResponse::from_parts(parts))
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream, ModelError> {
        let body = self.request_body(&req, true);
        debug!(model = %req.model, prompt_id, "opening local chat stream");
        let resp = self.post_chat(&body).await?;
        let json_mode = wants_json(&req);

        let (tx, rx) = mpsc::channel::<Result<GenerateResponse, ModelError>>(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut line_buf = String::new();
            let mut accumulated = String::new();

            'outer: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Transport(e.to_string()))).await;
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(nl) = line_buf.find('\n') {
                    let line = line_buf[..nl].trim_end_matches('\r').to_string();
                    line_buf = line_buf[nl + 1..].to_string();
                    if line.trim().is_empty() {
                        continue;
                    }
                    let v: Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "skipping unparseable stream line");
                            continue;
                        }
                    };

                    let mut parts = Vec::new();
                    if let Some(text) = v["message"]["content"].as_str() {
                        if !text.is_empty() {
                            accumulated.push_str(text);
                            parts.push(Part::text(text));
                        }
                    }
                    // The bare-generate framing carries text under "response".
                    if let Some(text) = v["response"].as_str() {
                        if !text.is_empty() {
                            accumulated.push_str(text);
                            parts.push(Part::text(text));
                        }
                    }
                    parts.extend(native_tool_call_parts(&v["message"]["tool_calls"]));

                    if !parts.is_empty()
                        && tx.send(Ok(GenerateResponse::from_parts(parts))).await.is_err()
                    {
                        return;
                    }
                    if v["done"].as_bool() == Some(true) {
                        break 'outer;
                    }
                }
            }

            // Post-process the accumulated text once the stream closes.  A
            // terminal synthesized chunk is yielded only when extraction
            // actually changed something, so plain-text turns never see
            // duplicated content.
            if let Some(parts) = terminal_parts(&accumulated, json_mode) {
                let _ = tx.send(Ok(GenerateResponse::from_parts(parts))).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let body = json!({ "model": self.embedding_model, "prompt": text });
            let resp = self
                .client
                .post(self.url("/api/embeddings"))
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(ModelError::from_http(
                    status.as_u16(),
                    resp.text().await.unwrap_or_default(),
                ));
            }
            let v: Value = resp.json().await?;
            let values = v["embedding"]
                .as_array()
                .map(|a| a.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
                .unwrap_or_default();
            out.push(values);
        }
        Ok(out)
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ModelError::from_http(
                status.as_u16(),
                resp.text().await.unwrap_or_default(),
            ));
        }
        let v: Value = resp.json().await?;
        let names = v["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

fn wants_json(req: &GenerateRequest) -> bool {
    req.config.response_mime_type.as_deref() == Some("application/json")
        || req.config.response_json_schema.is_some()
}

/// Run the accumulated text through tag/JSON extraction.  `None` when
/// nothing changed.
fn terminal_parts(accumulated: &str, json_mode: bool) -> Option<Vec<Part>> {
    if accumulated.is_empty() {
        return None;
    }
    if json_mode {
        return extract_json_body(accumulated).map(|body| vec![Part::text(body)]);
    }
    extract_tool_call_parts(accumulated)
}

/// Normalize non-streaming response text: tag extraction, or JSON recovery
/// in JSON mode.  Falls back to the raw text when nothing extracts.
fn postprocess_text(text: &str, json_mode: bool) -> Vec<Part> {
    if text.is_empty() {
        return Vec::new();
    }
    if json_mode {
        return match extract_json_body(text) {
            Some(body) => vec![Part::text(body)],
            None => vec![Part::text(text)],
        };
    }
    match extract_tool_call_parts(text) {
        Some(parts) => parts,
        None => vec![Part::text(text)],
    }
}

/// Convert a `tool_calls` array into `FunctionCall` parts.  Arguments may
/// arrive as an object or as a JSON-encoded string.
fn native_tool_call_parts(tool_calls: &Value) -> Vec<Part> {
    let Some(arr) = tool_calls.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|tc| {
            let f = tc.get("function")?;
            let name = f["name"].as_str()?.to_string();
            let args = match &f["arguments"] {
                Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| {
                    warn!(tool = %name, "tool call arguments were not valid JSON; substituting {{}}");
                    json!({})
                }),
                Value::Object(o) => Value::Object(o.clone()),
                _ => json!({}),
            };
            Some(Part::FunctionCall { name, args })
        })
        .collect()
}

/// Translate internal history into the `/api/chat` `messages` list.
///
/// The system message carries the caller's instruction plus the tool
/// instruction block (when tools are offered) plus the JSON-only
/// instruction (in JSON mode).
fn build_messages(req: &GenerateRequest) -> Vec<Value> {
    let mut messages = Vec::new();

    let mut system = req.config.system_instruction.clone().unwrap_or_default();
    if !req.config.tools.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&tool_instruction_block(&req.config.tools));
    }
    if wants_json(req) {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(JSON_ONLY_INSTRUCTION);
    }
    if !system.is_empty() {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for content in &req.contents {
        messages.extend(content_to_messages(content));
    }
    messages
}

fn content_to_messages(content: &Content) -> Vec<Value> {
    let role = match content.role {
        Role::User => "user",
        Role::Model => "assistant",
    };

    let mut out = Vec::new();
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for part in &content.parts {
        match part {
            Part::Text { text: t } => text.push_str(t),
            // Thoughts never cross the wire.
            Part::Thought { .. } => {}
            Part::FunctionCall { name, args } => {
                tool_calls.push(json!({
                    "function": { "name": name, "arguments": args }
                }));
            }
            Part::FunctionResponse { name, response, error, .. } => {
                let payload = match (response, error) {
                    (Some(r), _) => r.clone(),
                    (None, Some(e)) => json!({ "error": e }),
                    (None, None) => json!({}),
                };
                out.push(json!({
                    "role": "tool",
                    "content": serde_json::to_string(&json!({
                        "name": name,
                        "response": payload,
                    }))
                    .unwrap_or_default(),
                }));
            }
            // Binary payloads have no representation on this wire; note the
            // reference instead of dropping the part silently.
            Part::InlineData { mime_type, .. } => {
                text.push_str(&format!("[binary content: {mime_type}]"));
            }
            Part::FileData { mime_type, file_uri } => {
                text.push_str(&format!("[file {file_uri}: {mime_type}]"));
            }
        }
    }

    let mut main = json!({ "role": role, "content": text });
    if !tool_calls.is_empty() {
        main["tool_calls"] = json!(tool_calls);
    }
    if !text.is_empty() || !tool_calls.is_empty() {
        // Tool-response-only contents produce only the `tool` messages.
        out.insert(0, main);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
