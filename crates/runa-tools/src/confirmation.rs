// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::oneshot;

/// The host's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Run this call only.
    ProceedOnce,
    /// Run this call and auto-accept edit confirmations for the rest of the
    /// process.
    ProceedAlways,
    /// Run this call and auto-accept every tool from this MCP server.
    ProceedAlwaysServer,
    /// Run this call and auto-accept this specific MCP tool.
    ProceedAlwaysTool,
    /// Let the user adjust the proposed change in an editor, then ask again.
    ModifyWithEditor,
    Cancel,
}

/// What the host shows the user before a tool runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolConfirmation {
    Edit {
        title: String,
        file_name: String,
        file_path: String,
        file_diff: String,
        original_content: Option<String>,
        new_content: String,
    },
    Exec {
        title: String,
        command: String,
        root_command: String,
    },
    Mcp {
        server_name: String,
        tool_name: String,
        tool_display_name: String,
    },
    Info {
        title: String,
        prompt: String,
    },
}

impl ToolConfirmation {
    pub fn is_edit(&self) -> bool {
        matches!(self, Self::Edit { .. })
    }

    /// Allow-list keys this confirmation matches: `server` and
    /// `server.tool` for MCP confirmations, nothing otherwise.
    pub fn allow_keys(&self) -> Vec<String> {
        match self {
            Self::Mcp { server_name, tool_name, .. } => {
                vec![server_name.clone(), format!("{server_name}.{tool_name}")]
            }
            _ => Vec::new(),
        }
    }
}

/// One-shot responder for a confirmation prompt.
///
/// Resolving consumes the handle, so answering twice is unrepresentable.
/// Dropping the handle unresolved is observed by the scheduler as `Cancel`.
#[derive(Debug)]
pub struct ConfirmationHandle {
    tx: oneshot::Sender<ConfirmationOutcome>,
}

impl ConfirmationHandle {
    pub fn resolve(self, outcome: ConfirmationOutcome) {
        // A dropped receiver means the batch was cancelled already; the
        // answer is moot either way.
        let _ = self.tx.send(outcome);
    }
}

/// Build a confirmation prompt channel.
pub fn confirmation_channel() -> (ConfirmationHandle, oneshot::Receiver<ConfirmationOutcome>) {
    let (tx, rx) = oneshot::channel();
    (ConfirmationHandle { tx }, rx)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_outcome() {
        let (handle, rx) = confirmation_channel();
        handle.resolve(ConfirmationOutcome::ProceedOnce);
        assert_eq!(rx.await.unwrap(), ConfirmationOutcome::ProceedOnce);
    }

    #[tokio::test]
    async fn dropped_handle_observed_as_closed_channel() {
        let (handle, rx) = confirmation_channel();
        drop(handle);
        assert!(rx.await.is_err());
    }

    #[test]
    fn mcp_confirmation_yields_server_and_tool_keys() {
        let c = ToolConfirmation::Mcp {
            server_name: "files".into(),
            tool_name: "search".into(),
            tool_display_name: "search (files MCP Server)".into(),
        };
        assert_eq!(c.allow_keys(), vec!["files".to_string(), "files.search".to_string()]);
    }

    #[test]
    fn edit_confirmation_has_no_allow_keys() {
        let c = ToolConfirmation::Edit {
            title: "t".into(),
            file_name: "a.rs".into(),
            file_path: "/w/a.rs".into(),
            file_diff: "--- a\n+++ b\n".into(),
            original_content: None,
            new_content: "x".into(),
        };
        assert!(c.is_edit());
        assert!(c.allow_keys().is_empty());
    }
}
