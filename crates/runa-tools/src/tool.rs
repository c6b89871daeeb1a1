// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use runa_config::CancelToken;

use crate::confirmation::ToolConfirmation;

/// Broad classification of what a tool does.  Drives approval defaults and
/// display affordances, never dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
    Fetch,
    Search,
    Think,
    Other,
}

/// Declarative description of a tool: everything the model and the UI need
/// to know before an invocation exists.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Registry name, also the function name presented to the model.
    pub name: String,
    /// Human-readable name for UI display.
    pub display_name: String,
    pub description: String,
    pub kind: ToolKind,
    /// JSON Schema of the parameters object.
    pub parameter_schema: Value,
    /// Whether the tool's output should be rendered as markdown.
    pub is_output_markdown: bool,
    /// Whether the tool streams intermediate output updates while executing.
    pub can_update_output: bool,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: ToolKind,
        parameter_schema: Value,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: description.into(),
            kind,
            parameter_schema,
            is_output_markdown: false,
            can_update_output: false,
        }
    }
}

/// A single content item of a rich tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultPart {
    Text(String),
    /// Base64 payload with its mime type.
    InlineData { mime_type: String, data: String },
    /// Remote binary reference.
    FileData { mime_type: String, file_uri: String },
}

/// What the model receives from a completed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ResultPart>),
}

/// Extra payload for the UI that never reaches the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultDisplay {
    Markdown(String),
    Diff {
        file_name: String,
        file_diff: String,
        original_content: Option<String>,
        new_content: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: ToolResultContent,
    pub display: Option<ToolResultDisplay>,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            display: None,
        }
    }

    pub fn with_parts(parts: Vec<ResultPart>) -> Self {
        Self {
            content: ToolResultContent::Parts(parts),
            display: None,
        }
    }

    pub fn with_display(mut self, display: ToolResultDisplay) -> Self {
        self.display = Some(display);
        self
    }
}

/// A registered tool: a declarative spec plus an invocation factory.
///
/// `build` validates arguments; a failing build is the scheduler's
/// bad-arguments terminal state, not an execution error.
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    fn build(&self, args: Value) -> Result<Box<dyn ToolInvocation>, String>;
}

/// A bound tool with resolved arguments, ready to be approved and executed.
#[async_trait]
pub trait ToolInvocation: Send + Sync {
    /// One-line description of what this invocation will do.
    fn description(&self) -> String;

    /// Confirmation required before execution, if any.
    async fn confirmation(&self) -> Option<ToolConfirmation> {
        None
    }

    /// Policy-level refusal.  Hard denials fail the call in every approval
    /// mode, including yolo.
    fn is_hard_denial(&self) -> bool {
        false
    }

    /// Run the tool.  `output` is present for tools declaring
    /// `can_update_output`; intermediate chunks sent there surface in the UI.
    async fn execute(
        &self,
        cancel: CancelToken,
        output: Option<mpsc::Sender<String>>,
    ) -> Result<ToolResult, String>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn spec_display_name_defaults_to_name() {
        let s = ToolSpec::new("glob", "find files", ToolKind::Read, json!({"type": "object"}));
        assert_eq!(s.display_name, "glob");
        assert!(!s.can_update_output);
    }

    #[test]
    fn text_result_has_no_display() {
        let r = ToolResult::text("ok");
        assert_eq!(r.content, ToolResultContent::Text("ok".into()));
        assert!(r.display.is_none());
    }

    #[test]
    fn with_display_attaches_payload() {
        let r = ToolResult::text("ok").with_display(ToolResultDisplay::Markdown("# ok".into()));
        assert!(matches!(r.display, Some(ToolResultDisplay::Markdown(_))));
    }

    #[test]
    fn parts_result_keeps_part_order() {
        let r = ToolResult::with_parts(vec![
            ResultPart::Text("desc".into()),
            ResultPart::InlineData { mime_type: "image/png".into(), data: "AA==".into() },
        ]);
        match r.content {
            ToolResultContent::Parts(parts) => {
                assert!(matches!(parts[0], ResultPart::Text(_)));
                assert!(matches!(parts[1], ResultPart::InlineData { .. }));
            }
            _ => panic!("expected parts"),
        }
    }
}
