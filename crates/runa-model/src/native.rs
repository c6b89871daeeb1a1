// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Native function-calling protocol driver (Generative Language API).
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints with SSE
//! framing.  Thinking arrives as parts flagged `thought: true`; tool calls
//! as `functionCall` parts.  Token counting and embeddings use the native
//! `:countTokens` / `:embedContent` endpoints.
//!
//! # Auth
//! API key via the `x-goog-api-key` header.  A missing key surfaces as
//! `AuthRequired` at request time and is never retried.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, Candidate, Content, ContentGenerator, GenerateRequest,
    GenerateResponse, ModelError, Part, Role, TokenCount, UsageMetadata,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct NativeGenerator {
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    client: reqwest::Client,
}

impl NativeGenerator {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        embedding_model: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            api_key,
            embedding_model: embedding_model.unwrap_or_else(|| "text-embedding-004".into()),
            client: reqwest::Client::new(),
        }
    }

    fn key(&self) -> Result<&str, ModelError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ModelError::AuthRequired("no API key configured".into()))
    }

    fn endpoint(&self, model: &str, verb: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            model,
            verb
        )
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response, ModelError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", self.key()?)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_http(status.as_u16(), body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ContentGenerator for NativeGenerator {
    fn name(&self) -> &str {
        "native"
    }

    async fn generate(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse, ModelError> {
        let body = build_request_body(&req);
        debug!(model = %req.model, prompt_id, "sending generate request");
        let resp = self.post(&self.endpoint(&req.model, "generateContent"), &body).await?;
        let v: Value = resp.json().await?;
        Ok(parse_response(&v))
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream, ModelError> {
        let body = build_request_body(&req);
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&req.model, "streamGenerateContent")
        );
        debug!(model = %req.model, prompt_id, "opening generate stream");
        let resp = self.post(&url, &body).await?;

        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and only parse complete lines.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let out: Vec<Result<GenerateResponse, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ModelError::Transport(e.to_string()))],
                };
                std::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<TokenCount, ModelError> {
        let body = json!({ "contents": contents_to_wire(contents) });
        // countTokens is model-agnostic for our purposes; the embedding
        // model's tokenizer family is close enough for an advisory figure.
        let url = self.endpoint("gemini-2.5-flash", "countTokens");
        let resp = self.post(&url, &body).await?;
        let v: Value = resp.json().await?;
        Ok(TokenCount {
            total_tokens: v["totalTokens"].as_u64().unwrap_or(0),
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let url = self.endpoint(&self.embedding_model, "embedContent");
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let body = json!({ "content": { "parts": [{ "text": text }] } });
            let resp = self.post(&url, &body).await?;
            let v: Value = resp.json().await?;
            let values = v["embedding"]["values"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|x| x.as_f64().map(|f| f as f32))
                        .collect()
                })
                .unwrap_or_default();
            out.push(values);
        }
        Ok(out)
    }
}

/// Drain complete `\n`-terminated SSE lines, leaving a partial tail in `buf`.
fn drain_sse_lines(buf: &mut String) -> Vec<Result<GenerateResponse, ModelError>> {
    let mut out = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(data) {
            out.push(Ok(parse_response(&v)));
        }
    }
    out
}

// ─── Wire mapping ─────────────────────────────────────────────────────────────

pub(crate) fn build_request_body(req: &GenerateRequest) -> Value {
    let mut body = json!({
        "contents": contents_to_wire(&req.contents),
    });

    let cfg = &req.config;
    let mut generation = serde_json::Map::new();
    if let Some(t) = cfg.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(p) = cfg.top_p {
        generation.insert("topP".into(), json!(p));
    }
    if let Some(k) = cfg.top_k {
        generation.insert("topK".into(), json!(k));
    }
    if let Some(m) = &cfg.response_mime_type {
        generation.insert("responseMimeType".into(), json!(m));
    }
    if let Some(s) = &cfg.response_json_schema {
        generation.insert("responseJsonSchema".into(), s.clone());
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    if let Some(sys) = &cfg.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
    }

    if !cfg.tools.is_empty() {
        let decls: Vec<Value> = cfg
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": decls }]);
    }

    body
}

fn contents_to_wire(contents: &[Content]) -> Vec<Value> {
    contents
        .iter()
        .map(|c| {
            let role = match c.role {
                Role::User => "user",
                Role::Model => "model",
            };
            let parts: Vec<Value> = c.parts.iter().map(part_to_wire).collect();
            json!({ "role": role, "parts": parts })
        })
        .collect()
}

fn part_to_wire(p: &Part) -> Value {
    match p {
        Part::Text { text } => json!({ "text": text }),
        Part::Thought { text } => json!({
            "text": text.clone().unwrap_or_default(),
            "thought": true,
        }),
        Part::FunctionCall { name, args } => json!({
            "functionCall": { "name": name, "args": args }
        }),
        Part::FunctionResponse { name, id, response, error } => {
            let payload = match (response, error) {
                (Some(r), _) => r.clone(),
                (None, Some(e)) => json!({ "error": e }),
                (None, None) => json!({}),
            };
            json!({
                "functionResponse": { "name": name, "id": id, "response": payload }
            })
        }
        Part::InlineData { mime_type, data } => json!({
            "inlineData": { "mimeType": mime_type, "data": data }
        }),
        Part::FileData { mime_type, file_uri } => json!({
            "fileData": { "mimeType": mime_type, "fileUri": file_uri }
        }),
    }
}

fn wire_to_part(v: &Value) -> Option<Part> {
    if let Some(fc) = v.get("functionCall") {
        return Some(Part::FunctionCall {
            name: fc["name"].as_str().unwrap_or_default().to_string(),
            args: fc.get("args").cloned().unwrap_or(json!({})),
        });
    }
    if let Some(fr) = v.get("functionResponse") {
        return Some(Part::FunctionResponse {
            name: fr["name"].as_str().unwrap_or_default().to_string(),
            id: fr["id"].as_str().unwrap_or_default().to_string(),
            response: fr.get("response").cloned(),
            error: None,
        });
    }
    if let Some(inline) = v.get("inlineData") {
        return Some(Part::InlineData {
            mime_type: inline["mimeType"].as_str().unwrap_or_default().to_string(),
            data: inline["data"].as_str().unwrap_or_default().to_string(),
        });
    }
    if let Some(file) = v.get("fileData") {
        return Some(Part::FileData {
            mime_type: file["mimeType"].as_str().unwrap_or_default().to_string(),
            file_uri: file["fileUri"].as_str().unwrap_or_default().to_string(),
        });
    }
    if let Some(text) = v.get("text").and_then(Value::as_str) {
        if v.get("thought").and_then(Value::as_bool) == Some(true) {
            return Some(Part::Thought { text: Some(text.to_string()) });
        }
        return Some(Part::Text { text: text.to_string() });
    }
    None
}

pub(crate) fn parse_response(v: &Value) -> GenerateResponse {
    let candidates = v["candidates"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|c| {
                    let parts = c["content"]["parts"]
                        .as_array()
                        .map(|ps| ps.iter().filter_map(wire_to_part).collect())
                        .unwrap_or_default();
                    Candidate {
                        content: Content { role: Role::Model, parts },
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = v.get("usageMetadata").map(|m| UsageMetadata {
        prompt_tokens: m["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        output_tokens: m["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        total_tokens: m["totalTokenCount"].as_u64().unwrap_or(0) as u32,
    });

    let finish_reason = v["candidates"][0]["finishReason"]
        .as_str()
        .map(str::to_string);

    GenerateResponse {
        candidates,
        usage,
        finish_reason,
        ..GenerateResponse::default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{GenerationConfig, ToolDeclaration};

    fn req_with_tools() -> GenerateRequest {
        GenerateRequest {
            model: "gemini-2.5-pro".into(),
            contents: vec![Content::user_text("hi")],
            config: GenerationConfig {
                temperature: Some(0.2),
                system_instruction: Some("be brief".into()),
                tools: vec![ToolDeclaration {
                    name: "glob".into(),
                    description: "find files".into(),
                    parameters: json!({"type": "object"}),
                }],
                ..GenerationConfig::default()
            },
        }
    }

    #[test]
    fn request_body_carries_contents_and_tools() {
        let body = build_request_body(&req_with_tools());
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "glob"
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["temperature"], json!(0.2));
    }

    #[test]
    fn request_body_omits_empty_sections() {
        let req = GenerateRequest {
            model: "m".into(),
            contents: vec![Content::user_text("x")],
            config: GenerationConfig::default(),
        };
        let body = build_request_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("generationConfig").is_none());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn function_call_part_round_trips_through_wire() {
        let p = Part::function_call("shell", json!({"command": "ls"}));
        let wire = part_to_wire(&p);
        assert_eq!(wire["functionCall"]["name"], "shell");
        let back = wire_to_part(&wire).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn thought_part_round_trips() {
        let p = Part::thought("considering…");
        let wire = part_to_wire(&p);
        assert_eq!(wire["thought"], true);
        let back = wire_to_part(&wire).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn function_response_error_serialized_into_payload() {
        let p = Part::function_error("shell", "c1", "denied");
        let wire = part_to_wire(&p);
        assert_eq!(wire["functionResponse"]["response"]["error"], "denied");
    }

    #[test]
    fn parse_response_extracts_parts_and_usage() {
        let v = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "hello" },
                    { "functionCall": { "name": "glob", "args": { "pattern": "*.rs" } } }
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15 }
        });
        let resp = parse_response(&v);
        assert_eq!(resp.text(), "hello");
        assert_eq!(resp.function_calls().len(), 1);
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
        assert_eq!(resp.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn parse_response_thought_part_flagged() {
        let v = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "mulling", "thought": true }] }
            }]
        });
        let resp = parse_response(&v);
        assert!(resp.parts()[0].is_thought());
    }

    #[test]
    fn drain_sse_lines_keeps_partial_tail() {
        let mut buf = String::from("data: {\"candidates\":[{\"content\":{\"parts\":[{\"te");
        let out = drain_sse_lines(&mut buf);
        assert!(out.is_empty());
        assert!(!buf.is_empty());

        buf.push_str("xt\":\"hi\"}]}}]}\n");
        let out = drain_sse_lines(&mut buf);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().text(), "hi");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_sse_lines_skips_done_sentinel() {
        let mut buf = String::from("data: [DONE]\n");
        assert!(drain_sse_lines(&mut buf).is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_is_auth_required() {
        let gen = NativeGenerator::new(None, None, None);
        let req = GenerateRequest {
            model: "m".into(),
            contents: vec![Content::user_text("x")],
            config: GenerationConfig::default(),
        };
        let err = gen.generate(req, "p-1").await.err().unwrap();
        assert!(matches!(err, ModelError::AuthRequired(_)));
    }
}
