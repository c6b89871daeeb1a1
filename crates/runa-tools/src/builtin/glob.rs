// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;
use walkdir::WalkDir;

use runa_config::CancelToken;

use crate::tool::{Tool, ToolInvocation, ToolKind, ToolResult, ToolSpec};

const DEFAULT_MAX_RESULTS: usize = 200;

/// Built-in recursive file search over glob patterns.
pub struct GlobTool {
    spec: ToolSpec,
}

impl GlobTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                "glob",
                "Find files matching a glob pattern. Results are sorted; .git/ and \
                 target/ are excluded automatically. Examples: *.rs | **/*.rs | \
                 src/**/*.toml",
                ToolKind::Search,
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {
                            "type": "string",
                            "description": "Glob pattern, e.g. 'src/**/*.rs'"
                        },
                        "root": {
                            "type": "string",
                            "description": "Root directory to search from (default: current directory)"
                        },
                        "max_results": {
                            "type": "integer",
                            "description": "Maximum number of results (default 200)"
                        }
                    },
                    "required": ["pattern"],
                    "additionalProperties": false
                }),
            ),
        }
    }
}

impl Default for GlobTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for GlobTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn build(&self, args: Value) -> Result<Box<dyn ToolInvocation>, String> {
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or("missing 'pattern'")?
            .to_string();
        if pattern.trim().is_empty() {
            return Err("'pattern' must not be empty".into());
        }
        let regex = glob_to_regex(&pattern)?;
        let root = args
            .get("root")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS as u64) as usize;
        Ok(Box::new(GlobInvocation { pattern, regex, root, max_results }))
    }
}

struct GlobInvocation {
    pattern: String,
    regex: Regex,
    root: String,
    max_results: usize,
}

#[async_trait]
impl ToolInvocation for GlobInvocation {
    fn description(&self) -> String {
        format!("glob '{}' under {}", self.pattern, self.root)
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _output: Option<mpsc::Sender<String>>,
    ) -> Result<ToolResult, String> {
        debug!(pattern = %self.pattern, root = %self.root, "glob tool");
        let mut matches = Vec::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                name != ".git" && name != "target"
            })
            .filter_map(Result::ok)
        {
            if cancel.is_cancelled() {
                return Err("glob cancelled".into());
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if self.regex.is_match(&rel) {
                matches.push(rel.to_string());
                if matches.len() >= self.max_results {
                    break;
                }
            }
        }

        matches.sort();
        if matches.is_empty() {
            Ok(ToolResult::text("(no matches)"))
        } else {
            Ok(ToolResult::text(matches.join("\n")))
        }
    }
}

/// Convert a glob pattern to an anchored [`Regex`] over `/`-separated
/// relative paths.  `**` crosses directory separators, `*` and `?` do not.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so "**/x" also matches "x".
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| format!("invalid glob pattern: {e}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
