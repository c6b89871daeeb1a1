// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation parts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A single part of a conversation content item.
///
/// `Thought` parts carry chain-of-thought text surfaced to the UI only; they
/// are never resubmitted to the model through curated history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Thought {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    FunctionCall {
        name: String,
        args: Value,
    },
    FunctionResponse {
        name: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Base64-encoded binary payload.
    InlineData {
        mime_type: String,
        data: String,
    },
    /// Remote binary reference.
    FileData {
        mime_type: String,
        file_uri: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought { text: Some(text.into()) }
    }

    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Self::FunctionCall { name: name.into(), args }
    }

    pub fn function_response(name: impl Into<String>, id: impl Into<String>, response: Value) -> Self {
        Self::FunctionResponse {
            name: name.into(),
            id: id.into(),
            response: Some(response),
            error: None,
        }
    }

    pub fn function_error(name: impl Into<String>, id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::FunctionResponse {
            name: name.into(),
            id: id.into(),
            response: None,
            error: Some(error.into()),
        }
    }

    pub fn is_thought(&self) -> bool {
        matches!(self, Self::Thought { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// A text part whose content is empty or whitespace.  Thoughts are never
    /// counted as empty; an empty thought is a valid signal.
    pub fn is_empty_text(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            _ => false,
        }
    }
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: Role::User, parts: vec![Part::text(text)] }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self { role: Role::Model, parts: vec![Part::text(text)] }
    }

    pub fn user_parts(parts: Vec<Part>) -> Self {
        Self { role: Role::User, parts }
    }

    pub fn model_parts(parts: Vec<Part>) -> Self {
        Self { role: Role::Model, parts }
    }

    /// Concatenation of all plain-text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// A model content is valid for resubmission when it has at least one
    /// part and no part is empty text (thoughts excepted).
    pub fn is_valid_model_output(&self) -> bool {
        !self.parts.is_empty() && !self.parts.iter().any(Part::is_empty_text)
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema as presented to the model.  The registry keeps a richer
/// record; this is the model-facing projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// `application/json` switches the local driver into JSON mode.
    pub response_mime_type: Option<String>,
    pub response_json_schema: Option<Value>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub contents: Vec<Content>,
    #[serde(default)]
    pub config: GenerationConfig,
}

// ─── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: Content,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// A parsed function call extracted from a response.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Turns the provider executed on its own (server-side function
    /// calling).  When present, the session records its tail in place of
    /// the submitted user content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_function_calling_history: Option<Vec<Content>>,
}

impl GenerateResponse {
    /// Response containing a single model content.
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            candidates: vec![Candidate { content: Content::model_parts(parts) }],
            ..Self::default()
        }
    }

    pub fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .map(|c| c.content.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Concatenated text of the first candidate, thoughts excluded.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| c.content.text())
            .unwrap_or_default()
    }

    /// Convenience view over all `FunctionCall` parts of the first candidate.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { name, args } => Some(FunctionCall {
                    name: name.clone(),
                    args: args.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// A streamed chunk is valid iff it has a candidate with at least one
    /// part and no part that is empty text without the thought flag.
    pub fn is_valid_chunk(&self) -> bool {
        match self.candidates.first() {
            None => false,
            Some(c) => {
                !c.content.parts.is_empty() && !c.content.parts.iter().any(Part::is_empty_text)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCount {
    pub total_tokens: u64,
}

/// Advisory token estimate: `ceil(total chars / 4)` over all text parts.
pub fn approx_token_count(contents: &[Content]) -> TokenCount {
    let chars: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .map(|p| match p {
            Part::Text { text } => text.len(),
            Part::Thought { text } => text.as_deref().map(str::len).unwrap_or(0),
            Part::FunctionCall { name, args } => name.len() + args.to_string().len(),
            Part::FunctionResponse { response, error, .. } => {
                response.as_ref().map(|v| v.to_string().len()).unwrap_or(0)
                    + error.as_deref().map(str::len).unwrap_or(0)
            }
            Part::InlineData { data, .. } => data.len(),
            Part::FileData { file_uri, .. } => file_uri.len(),
        })
        .sum();
    TokenCount { total_tokens: chars.div_ceil(4) as u64 }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
