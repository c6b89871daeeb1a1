// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text-embedded tool-call extraction and JSON recovery for the local driver.
//!
//! Models without native function-calling support are instructed to emit
//! `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` blocks in
//! their text.  This module turns such text into interleaved text /
//! function-call parts, and recovers JSON bodies in JSON mode.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::{Part, ToolDeclaration};

fn tool_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").unwrap())
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").unwrap())
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap())
}

/// Instruction block appended to the system message when tools are offered.
///
/// The tag form here is load-bearing: [`extract_tool_call_parts`] scans for
/// exactly this shape.
pub fn tool_instruction_block(tools: &[ToolDeclaration]) -> String {
    let mut out = String::from(
        "You have access to the following tools. \
         To call a tool, output exactly this format:\n\
         <tool_call>{\"name\": \"<tool>\", \"arguments\": { ... }}</tool_call>\n\
         You may emit multiple tool_call blocks. \
         Do not invent tools that are not listed.\n\nTools:\n",
    );
    for t in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters schema: {}\n",
            t.name, t.description, t.parameters
        ));
    }
    out
}

/// Instruction appended when the caller requested a JSON response.
pub const JSON_ONLY_INSTRUCTION: &str =
    "Respond with a single valid JSON value and nothing else. \
     Do not wrap the JSON in prose.";

/// Rewrite `text` into interleaved text / function-call parts.
///
/// Returns `None` when no well-formed `<tool_call>` block is present.
/// Malformed blocks (bodies that do not parse as
/// `{"name": string, "arguments": object}`) stay verbatim in the
/// surrounding text.
pub fn extract_tool_call_parts(text: &str) -> Option<Vec<Part>> {
    let mut parts: Vec<Part> = Vec::new();
    let mut cursor = 0;
    let mut found = false;

    for m in tool_call_re().captures_iter(text) {
        let whole = m.get(0).unwrap();
        let body = m.get(1).unwrap().as_str();

        match parse_call_body(body) {
            Some((name, args)) => {
                let before = &text[cursor..whole.start()];
                if !before.trim().is_empty() {
                    parts.push(Part::text(before.trim()));
                }
                parts.push(Part::function_call(name, args));
                cursor = whole.end();
                found = true;
            }
            None => {
                warn!("malformed tool_call block left as text");
                // Leave the block in place; it will be included in the text
                // preceding the next well-formed call (or the tail).
            }
        }
    }

    if !found {
        return None;
    }
    let tail = &text[cursor..];
    if !tail.trim().is_empty() {
        parts.push(Part::text(tail.trim()));
    }
    Some(parts)
}

fn parse_call_body(body: &str) -> Option<(String, Value)> {
    let v: Value = serde_json::from_str(body).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let args = v.get("arguments")?.clone();
    if !args.is_object() {
        return None;
    }
    Some((name, args))
}

/// JSON-mode recovery pipeline over the accumulated response text.
///
/// 1. Strip `<think>…</think>` blocks.
/// 2. Prefer the body of a fenced ```json block.
/// 3. Otherwise take the first balanced `{…}` substring.
/// 4. Validate by parsing; on failure return `None` and leave the caller's
///    text untouched.
pub fn extract_json_body(text: &str) -> Option<String> {
    let stripped = strip_think_blocks(text);

    let candidate = if let Some(m) = fenced_json_re().captures(&stripped) {
        m.get(1).unwrap().as_str().to_string()
    } else {
        first_balanced_object(&stripped)?
    };

    match serde_json::from_str::<Value>(&candidate) {
        Ok(_) => Some(candidate),
        Err(e) => {
            warn!(error = %e, "extracted JSON candidate failed to parse; leaving text unchanged");
            None
        }
    }
}

pub fn strip_think_blocks(text: &str) -> String {
    think_re().replace_all(text, "").to_string()
}

/// First `{ … }` substring with balanced braces, string-literal aware.
fn first_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ── Tag extraction ────────────────────────────────────────────────────────

    #[test]
    fn single_call_with_surrounding_text() {
        let text = r#"thinking… <tool_call>{"name":"x","arguments":{"a":1}}</tool_call> done"#;
        let parts = extract_tool_call_parts(text).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Part::text("thinking…"));
        assert_eq!(parts[1], Part::function_call("x", json!({"a":1})));
        assert_eq!(parts[2], Part::text("done"));
    }

    #[test]
    fn multiple_blocks_extracted_in_order() {
        let text = concat!(
            r#"<tool_call>{"name":"a","arguments":{}}</tool_call>"#,
            " and ",
            r#"<tool_call>{"name":"b","arguments":{"k":"v"}}</tool_call>"#,
        );
        let parts = extract_tool_call_parts(text).unwrap();
        let names: Vec<&str> = parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn whitespace_inside_tags_tolerated() {
        let text = "<tool_call>\n  {\"name\":\"x\",\"arguments\":{}}\n</tool_call>";
        let parts = extract_tool_call_parts(text).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], Part::FunctionCall { name, .. } if name == "x"));
    }

    #[test]
    fn no_tags_returns_none() {
        assert!(extract_tool_call_parts("plain text").is_none());
    }

    #[test]
    fn malformed_block_preserved_as_text() {
        let text = concat!(
            r#"<tool_call>not json</tool_call>"#,
            r#"<tool_call>{"name":"ok","arguments":{}}</tool_call>"#,
        );
        let parts = extract_tool_call_parts(text).unwrap();
        // The malformed block stays verbatim as text before the valid call.
        assert!(matches!(&parts[0], Part::Text { text } if text.contains("not json")));
        assert!(matches!(&parts[1], Part::FunctionCall { name, .. } if name == "ok"));
    }

    #[test]
    fn arguments_must_be_object() {
        let text = r#"<tool_call>{"name":"x","arguments":[1,2]}</tool_call>"#;
        assert!(extract_tool_call_parts(text).is_none());
    }

    #[test]
    fn only_malformed_blocks_returns_none() {
        let text = r#"<tool_call>oops</tool_call>"#;
        assert!(extract_tool_call_parts(text).is_none());
    }

    // ── JSON extraction ───────────────────────────────────────────────────────

    #[test]
    fn fenced_json_block_preferred() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json_body(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn balanced_object_fallback() {
        let text = "The result is {\"a\": {\"b\": 2}} as requested";
        assert_eq!(extract_json_body(text).unwrap(), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn think_blocks_stripped_before_extraction() {
        let text = "<think>{not json}</think>{\"ok\": true}";
        assert_eq!(extract_json_body(text).unwrap(), "{\"ok\": true}");
    }

    #[test]
    fn braces_inside_strings_do_not_break_balance() {
        let text = r#"{"text": "a } inside"}"#;
        assert_eq!(extract_json_body(text).unwrap(), text);
    }

    #[test]
    fn invalid_candidate_returns_none() {
        assert!(extract_json_body("{not valid json}").is_none());
    }

    #[test]
    fn no_object_returns_none() {
        assert!(extract_json_body("just words").is_none());
    }

    // ── Instruction block ─────────────────────────────────────────────────────

    #[test]
    fn instruction_block_lists_tools_and_tag_form() {
        let tools = vec![ToolDeclaration {
            name: "glob".into(),
            description: "find files".into(),
            parameters: json!({"type": "object"}),
        }];
        let block = tool_instruction_block(&tools);
        assert!(block.contains("<tool_call>"));
        assert!(block.contains("</tool_call>"));
        assert!(block.contains("glob"));
        assert!(block.contains("find files"));
    }
}
