// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper that returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// How the API credential was obtained.  The quota fallback path only fires
/// for personal accounts; keyed/billed projects keep their configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Personal (OAuth-style) account with shared quota pools.
    Personal,
    /// Explicit API key tied to a billed project.
    #[default]
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Driver identifier: "native" (hosted function-calling API),
    /// "local" (self-hosted `/api/chat` server), or "mock" (tests).
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Model switched to after persistent quota errors on `name`.
    pub fallback_model: String,
    /// Base URL override.  The correct default is driver-specific.
    pub base_url: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Model used for embedding requests when it differs from `name`.
    pub embedding_model: Option<String>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    #[serde(default)]
    pub auth_kind: AuthKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "native".into(),
            name: "gemini-2.5-pro".into(),
            fallback_model: "gemini-2.5-flash".into(),
            base_url: None,
            api_key_env: None,
            api_key: None,
            embedding_model: None,
            temperature: None,
            top_p: None,
            top_k: None,
            auth_kind: AuthKind::ApiKey,
        }
    }
}

/// When a tool call requires user confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Prompt for every tool that asks for confirmation.
    #[default]
    Default,
    /// Auto-accept edit confirmations; shell and MCP tools still prompt.
    AutoEdit,
    /// Skip confirmation entirely.  Hard policy denials still fail the call.
    Yolo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model↔tool iterations per user prompt.  `None` = unbounded.
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Skip git-ignored paths during `@path` expansion and bulk reads.
    #[serde(default = "default_true")]
    pub respect_git_ignore: bool,
    /// When an `@path` token does not resolve, search the workspace for a
    /// file whose name contains the fragment.
    #[serde(default = "default_true")]
    pub recursive_file_search: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: Some(50),
            approval_mode: ApprovalMode::Default,
            respect_git_ignore: true,
            recursive_file_search: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool names excluded from the registry at startup.
    #[serde(default)]
    pub disabled: Vec<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
