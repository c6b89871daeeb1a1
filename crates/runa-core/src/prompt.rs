// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `@path` prompt expansion.
//!
//! Before the first model call, `@`-prefixed tokens in the user prompt are
//! resolved to files: directories become globs, unresolved fragments fall
//! back to a recursive name search, and the surviving paths are read in one
//! bulk call.  Every step is driven through the registry's `glob` and
//! `read_many_files` tools and surfaced as tool events so the user sees the
//! resolution happen.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use runa_config::CancelToken;
use runa_model::Part;
use runa_tools::{glob_to_regex, ToolRegistry, ToolResultContent};

use crate::events::TurnEvent;
use crate::scheduler::ToolCallRequest;

pub struct PromptResolver {
    registry: Arc<ToolRegistry>,
    workspace_root: PathBuf,
    respect_git_ignore: bool,
    recursive_file_search: bool,
}

impl PromptResolver {
    pub fn new(
        registry: Arc<ToolRegistry>,
        workspace_root: PathBuf,
        respect_git_ignore: bool,
        recursive_file_search: bool,
    ) -> Self {
        Self {
            registry,
            workspace_root,
            respect_git_ignore,
            recursive_file_search,
        }
    }

    /// Expand `@path` tokens and return the parts of the first user message.
    ///
    /// The original prompt text is always the first part; resolved file
    /// contents are folded in as a trailing text part.
    pub async fn resolve(
        &self,
        prompt: &str,
        prompt_id: &str,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancelToken,
    ) -> Vec<Part> {
        let tokens: Vec<&str> = prompt
            .split_whitespace()
            .filter(|t| t.len() > 1 && t.starts_with('@'))
            .collect();
        if tokens.is_empty() {
            return vec![Part::text(prompt)];
        }

        let ignore_rules = if self.respect_git_ignore {
            load_git_ignore(&self.workspace_root)
        } else {
            Vec::new()
        };

        let mut specs: Vec<String> = Vec::new();
        for token in tokens {
            if cancel.is_cancelled() {
                break;
            }
            let raw = token.trim_start_matches('@').trim_matches(|c| c == ',' || c == '.');
            if raw.is_empty() {
                continue;
            }
            if self.respect_git_ignore && is_git_ignored(raw, &ignore_rules) {
                debug!(path = raw, "skipping git-ignored @path");
                continue;
            }

            let absolute = self.workspace_root.join(raw);
            if absolute.is_dir() {
                // Directories expand to everything below them.
                let pattern = format!("{}/**", raw.trim_end_matches('/'));
                specs.extend(self.run_glob(&pattern, prompt_id, tx, cancel).await);
            } else if absolute.is_file() {
                specs.push(raw.to_string());
            } else if self.recursive_file_search {
                // Fall back to a workspace-wide name search; first hit wins.
                let pattern = format!("**/*{raw}*");
                if let Some(first) = self.run_glob(&pattern, prompt_id, tx, cancel).await.first() {
                    specs.push(first.clone());
                } else {
                    warn!(path = raw, "@path did not resolve to any file");
                }
            } else {
                warn!(path = raw, "@path does not exist");
            }
        }

        let mut parts = vec![Part::text(prompt)];
        if !specs.is_empty() {
            if let Some(contents) = self.run_bulk_read(&specs, prompt_id, tx, cancel).await {
                parts.push(Part::text(format!(
                    "\n--- Content from referenced files ---\n{contents}"
                )));
            }
        }
        parts
    }

    async fn run_glob(
        &self,
        pattern: &str,
        prompt_id: &str,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancelToken,
    ) -> Vec<String> {
        let output = self
            .run_tool(
                "glob",
                json!({
                    "pattern": pattern,
                    "root": self.workspace_root.to_string_lossy(),
                }),
                prompt_id,
                tx,
                cancel,
            )
            .await;
        match output {
            Some(text) if text != "(no matches)" => {
                text.lines().map(str::to_string).collect()
            }
            _ => Vec::new(),
        }
    }

    async fn run_bulk_read(
        &self,
        specs: &[String],
        prompt_id: &str,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancelToken,
    ) -> Option<String> {
        let paths: Vec<String> = specs
            .iter()
            .map(|s| self.workspace_root.join(s).to_string_lossy().to_string())
            .collect();
        self.run_tool(
            "read_many_files",
            json!({
                "paths": paths,
                "respect_git_ignore": self.respect_git_ignore,
            }),
            prompt_id,
            tx,
            cancel,
        )
        .await
    }

    /// Build and execute one registry tool directly, surfacing request and
    /// completion as turn events.
    async fn run_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        prompt_id: &str,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancelToken,
    ) -> Option<String> {
        let tool = self.registry.get(name)?;
        let request = ToolCallRequest {
            call_id: format!("{name}-{}", Uuid::new_v4()),
            name: name.to_string(),
            args: args.clone(),
            prompt_id: prompt_id.to_string(),
            is_client_initiated: true,
        };
        let _ = tx.send(TurnEvent::ToolCallsRequested(vec![request])).await;

        let invocation = match tool.build(args) {
            Ok(inv) => inv,
            Err(e) => {
                warn!(tool = name, error = %e, "prompt-resolution tool failed to build");
                return None;
            }
        };
        match invocation.execute(cancel.clone(), None).await {
            Ok(result) => match result.content {
                ToolResultContent::Text(text) => Some(text),
                ToolResultContent::Parts(_) => None,
            },
            Err(e) => {
                warn!(tool = name, error = %e, "prompt-resolution tool failed");
                None
            }
        }
    }
}

// ─── Git-ignore filtering ─────────────────────────────────────────────────────

/// Parse the workspace root's `.gitignore` into match rules.  Only the
/// common line forms are honoured (names, globs, directory suffixes);
/// negations are ignored.
fn load_git_ignore(root: &Path) -> Vec<String> {
    let path = root.join(".gitignore");
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn is_git_ignored(path: &str, rules: &[String]) -> bool {
    if path.split('/').any(|seg| seg == ".git") {
        return true;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    for rule in rules {
        let pattern = rule.trim_start_matches('/').trim_end_matches('/');
        if pattern.is_empty() {
            continue;
        }
        if path == pattern || path.starts_with(&format!("{pattern}/")) {
            return true;
        }
        if let Ok(re) = glob_to_regex(pattern) {
            if re.is_match(path) || re.is_match(file_name) {
                return true;
            }
        }
    }
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use runa_tools::{GlobTool, ReadManyFilesTool};

    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
        fs::write(dir.path().join(".gitignore"), "secret.txt\ntarget/\n").unwrap();
        fs::write(dir.path().join("secret.txt"), "hunter2").unwrap();
        dir
    }

    fn resolver(root: &Path) -> PromptResolver {
        let mut reg = ToolRegistry::new();
        reg.register(GlobTool::new());
        reg.register(ReadManyFilesTool::new());
        PromptResolver::new(Arc::new(reg), root.to_path_buf(), true, true)
    }

    async fn resolve(prompt: &str, root: &Path) -> (Vec<Part>, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let parts = resolver(root)
            .resolve(prompt, "p-1", &tx, &CancelToken::new())
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (parts, events)
    }

    #[tokio::test]
    async fn plain_prompt_passes_through() {
        let dir = workspace();
        let (parts, events) = resolve("just a question", dir.path()).await;
        assert_eq!(parts, vec![Part::text("just a question")]);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn file_token_folds_contents_into_prompt() {
        let dir = workspace();
        let (parts, events) = resolve("summarize @notes.txt please", dir.path()).await;
        assert_eq!(parts.len(), 2);
        assert!(parts[0].as_text().unwrap().contains("@notes.txt"));
        assert!(parts[1].as_text().unwrap().contains("remember the milk"));
        // The bulk read surfaced as a tool event.
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolCallsRequested(reqs) if reqs[0].name == "read_many_files")));
    }

    #[tokio::test]
    async fn directory_token_expands_to_glob() {
        let dir = workspace();
        let (parts, events) = resolve("explain @src", dir.path()).await;
        assert_eq!(parts.len(), 2);
        assert!(parts[1].as_text().unwrap().contains("fn main"));
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolCallsRequested(reqs) if reqs[0].name == "glob")));
    }

    #[tokio::test]
    async fn missing_fragment_resolved_by_recursive_search() {
        let dir = workspace();
        let (parts, _) = resolve("show @main.rs", dir.path()).await;
        assert_eq!(parts.len(), 2);
        assert!(parts[1].as_text().unwrap().contains("fn main"));
    }

    #[tokio::test]
    async fn git_ignored_token_is_skipped() {
        let dir = workspace();
        let (parts, _) = resolve("leak @secret.txt", dir.path()).await;
        assert_eq!(parts.len(), 1, "ignored file must not be read");
    }

    #[tokio::test]
    async fn unresolvable_token_leaves_prompt_untouched() {
        let dir = workspace();
        let (parts, _) = resolve("look at @no_such_thing_anywhere", dir.path()).await;
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn ignore_rules_match_names_and_directories() {
        let rules = vec!["secret.txt".to_string(), "target/".to_string(), "*.log".to_string()];
        assert!(is_git_ignored("secret.txt", &rules));
        assert!(is_git_ignored("target/debug/app", &rules));
        assert!(is_git_ignored("logs/app.log", &rules));
        assert!(!is_git_ignored("src/main.rs", &rules));
        assert!(is_git_ignored(".git/config", &[]));
    }
}
