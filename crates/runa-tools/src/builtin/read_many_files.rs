// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use runa_config::CancelToken;

use crate::tool::{Tool, ToolInvocation, ToolKind, ToolResult, ToolSpec};

/// Bulk file reader used by `@path` prompt expansion.
///
/// Reads every path in order and concatenates the contents with per-file
/// headers so the model can tell them apart.  Unreadable paths are noted
/// in place rather than failing the whole call.
pub struct ReadManyFilesTool {
    spec: ToolSpec,
}

impl ReadManyFilesTool {
    pub fn new() -> Self {
        let mut spec = ToolSpec::new(
            "read_many_files",
            "Read several files at once and return their concatenated contents, \
             each prefixed with a '--- <path> ---' header.",
            ToolKind::Read,
            json!({
                "type": "object",
                "properties": {
                    "paths": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "File paths to read, in order"
                    },
                    "respect_git_ignore": {
                        "type": "boolean",
                        "description": "Skip paths inside .git directories (default true)"
                    }
                },
                "required": ["paths"],
                "additionalProperties": false
            }),
        );
        spec.is_output_markdown = true;
        Self { spec }
    }
}

impl Default for ReadManyFilesTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for ReadManyFilesTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn build(&self, args: Value) -> Result<Box<dyn ToolInvocation>, String> {
        let paths: Vec<String> = args
            .get("paths")
            .and_then(Value::as_array)
            .ok_or("missing 'paths'")?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if paths.is_empty() {
            return Err("'paths' must contain at least one path".into());
        }
        let respect_git_ignore = args
            .get("respect_git_ignore")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Ok(Box::new(ReadManyFilesInvocation { paths, respect_git_ignore }))
    }
}

struct ReadManyFilesInvocation {
    paths: Vec<String>,
    respect_git_ignore: bool,
}

#[async_trait]
impl ToolInvocation for ReadManyFilesInvocation {
    fn description(&self) -> String {
        format!("read {} file(s)", self.paths.len())
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _output: Option<mpsc::Sender<String>>,
    ) -> Result<ToolResult, String> {
        debug!(count = self.paths.len(), "read_many_files tool");
        let mut out = String::new();
        for path in &self.paths {
            if cancel.is_cancelled() {
                return Err("read cancelled".into());
            }
            if self.respect_git_ignore && path.split('/').any(|seg| seg == ".git") {
                continue;
            }
            out.push_str(&format!("--- {path} ---\n"));
            match tokio::fs::read_to_string(path).await {
                Ok(text) => {
                    out.push_str(&text);
                    if !text.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Err(e) => out.push_str(&format!("(unreadable: {e})\n")),
            }
        }
        if out.is_empty() {
            out.push_str("(no files read)");
        }
        Ok(ToolResult::text(out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::tool::ToolResultContent;

    async fn run(args: Value) -> String {
        let tool = ReadManyFilesTool::new();
        let inv = tool.build(args).unwrap();
        match inv.execute(CancelToken::new(), None).await.unwrap().content {
            ToolResultContent::Text(t) => t,
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn build_requires_paths() {
        assert!(ReadManyFilesTool::new().build(json!({})).is_err());
        assert!(ReadManyFilesTool::new().build(json!({"paths": []})).is_err());
    }

    #[tokio::test]
    async fn reads_files_with_headers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "beta").unwrap();

        let out = run(json!({ "paths": [a.to_string_lossy(), b.to_string_lossy()] })).await;
        let a_pos = out.find("alpha").unwrap();
        let b_pos = out.find("beta").unwrap();
        assert!(a_pos < b_pos);
        assert!(out.contains(&format!("--- {} ---", a.to_string_lossy())));
    }

    #[tokio::test]
    async fn unreadable_path_noted_in_place() {
        let out = run(json!({ "paths": ["/definitely/not/here.txt"] })).await;
        assert!(out.contains("unreadable"));
    }

    #[tokio::test]
    async fn git_paths_skipped_when_respecting_ignore() {
        let out = run(json!({ "paths": [".git/config"], "respect_git_ignore": true })).await;
        assert_eq!(out, "(no files read)");
    }

    #[tokio::test]
    async fn git_paths_read_when_not_respecting_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir(&git).unwrap();
        let cfg = git.join("config");
        fs::write(&cfg, "core").unwrap();

        let out = run(json!({
            "paths": [cfg.to_string_lossy()],
            "respect_git_ignore": false,
        }))
        .await;
        assert!(out.contains("core"));
    }
}
