// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error kinds surfaced by content generators and the chat session.
///
/// The distinction that matters downstream is retryability: transport
/// failures, 429s and 5xx responses are retried by policy; schema and
/// argument errors are not; auth errors surface immediately.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-2xx response.  The body's status code is surfaced verbatim.
    #[error("provider error {status}: {body}")]
    Http { status: u16, body: String },

    /// HTTP 429.  Retried; may trigger the fallback-model switch.
    #[error("quota exceeded: {body}")]
    Quota { body: String },

    /// Provider rejected the tool schemas as too deeply nested.  Annotated
    /// with the registry tools whose schemas contain reference cycles.
    #[error("schema depth exceeded: {message}{}", format_tools(.tools))]
    SchemaDepth { message: String, tools: Vec<String> },

    #[error("invalid argument: {message}{}", format_tools(.tools))]
    InvalidArgument { message: String, tools: Vec<String> },

    /// A streamed attempt yielded no chunks, or an invalid chunk.
    #[error("model stream was empty after {attempts} attempts")]
    EmptyStream { attempts: u32 },

    #[error("request aborted")]
    Aborted,

    #[error("authentication required: {0}")]
    AuthRequired(String),
}

fn format_tools(tools: &[String]) -> String {
    if tools.is_empty() {
        String::new()
    } else {
        format!(" (tools with cyclic schemas: {})", tools.join(", "))
    }
}

impl ModelError {
    /// Classify an HTTP status + body into the right kind.
    pub fn from_http(status: u16, body: String) -> Self {
        match status {
            429 => Self::Quota { body },
            401 | 403 => Self::AuthRequired(body),
            400 => {
                let lower = body.to_lowercase();
                if lower.contains("maximum depth") || lower.contains("schema depth") {
                    Self::SchemaDepth { message: body, tools: Vec::new() }
                } else if lower.contains("invalid argument")
                    || lower.contains("invalid json payload")
                {
                    Self::InvalidArgument { message: body, tools: Vec::new() }
                } else {
                    Self::Http { status, body }
                }
            }
            _ => Self::Http { status, body },
        }
    }

    /// Transport failures, 429 and any 5xx are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Quota { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota { .. })
    }

    /// Attach the names of tools whose schemas contain cycles.  Only
    /// schema/argument errors carry the annotation; other kinds pass
    /// through unchanged.
    pub fn with_cyclic_tools(self, tools: Vec<String>) -> Self {
        match self {
            Self::SchemaDepth { message, .. } => Self::SchemaDepth { message, tools },
            Self::InvalidArgument { message, .. } => Self::InvalidArgument { message, tools },
            other => other,
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
