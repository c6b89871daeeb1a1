// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::confirmation::ToolConfirmation;
use crate::tool::{Tool, ToolInvocation, ToolKind, ToolResult, ToolSpec};

/// Model-facing projection of a tool spec.  Mirrors the model crate's
/// declaration type so the tools crate stays independent of it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central directory of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Cached schema-cycle verdicts, keyed by tool name.
    cycle_cache: Mutex<HashMap<String, bool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            cycle_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.cycle_cache.lock().unwrap().remove(&tool.spec().name);
        self.tools.insert(tool.spec().name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tools, sorted by name.
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.spec().name.cmp(&b.spec().name));
        tools
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Model-facing declarations, sorted by name.
    ///
    /// Cycle detection runs (and caches) per tool here, but a cyclic schema
    /// does not exclude the declaration; the verdict is only used to
    /// annotate provider errors after the fact.
    pub fn declarations(&self) -> Vec<ToolSchema> {
        self.all()
            .into_iter()
            .map(|t| {
                let spec = t.spec();
                self.cycle_verdict(spec);
                ToolSchema {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec.parameter_schema.clone(),
                }
            })
            .collect()
    }

    /// Names of registered tools whose parameter schemas contain reference
    /// cycles.  Used to annotate schema-depth errors from the provider.
    pub fn cyclic_schema_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .all()
            .into_iter()
            .filter(|t| self.cycle_verdict(t.spec()))
            .map(|t| t.spec().name.clone())
            .collect();
        names.sort();
        names
    }

    fn cycle_verdict(&self, spec: &ToolSpec) -> bool {
        let mut cache = self.cycle_cache.lock().unwrap();
        if let Some(&v) = cache.get(&spec.name) {
            return v;
        }
        let v = schema_has_cycle(&spec.parameter_schema);
        if v {
            debug!(tool = %spec.name, "parameter schema contains a reference cycle");
        }
        cache.insert(spec.name.clone(), v);
        v
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect reference cycles in a JSON-schema-like object.
///
/// Local `$ref` pointers (`#/...`) are resolved against the schema root;
/// a reference that is re-entered while still on the resolution path is a
/// cycle.  Inline objects and arrays are traversed structurally.
pub fn schema_has_cycle(schema: &Value) -> bool {
    fn resolve<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
        let path = pointer.strip_prefix("#/")?;
        let mut cur = root;
        for seg in path.split('/') {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }

    fn walk(root: &Value, node: &Value, active: &mut Vec<String>) -> bool {
        match node {
            Value::Object(map) => {
                if let Some(r) = map.get("$ref").and_then(Value::as_str) {
                    if active.iter().any(|a| a == r) {
                        return true;
                    }
                    if let Some(target) = resolve(root, r) {
                        active.push(r.to_string());
                        let cyclic = walk(root, target, active);
                        active.pop();
                        if cyclic {
                            return true;
                        }
                    }
                }
                map.iter()
                    .filter(|(k, _)| k.as_str() != "$ref")
                    .any(|(_, v)| walk(root, v, active))
            }
            Value::Array(items) => items.iter().any(|v| walk(root, v, active)),
            _ => false,
        }
    }

    walk(schema, schema, &mut Vec::new())
}

// ─── Discovered (MCP) tools ───────────────────────────────────────────────────

/// Maximum length of a tool name presented to the model.
const MAX_TOOL_NAME_LEN: usize = 63;

/// Rewrite a discovered tool name into the character set and length the
/// model API accepts: invalid characters become `_`, and names longer than
/// 63 characters collapse to `<first 28>___<last 32>`.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut s: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.len() > MAX_TOOL_NAME_LEN {
        // All chars are ASCII after the map above, so byte slicing is safe.
        s = format!("{}___{}", &s[..28], &s[s.len() - 32..]);
    }
    s
}

/// Async transport used to invoke a tool on its MCP server.
pub type McpCallFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A tool discovered on an external MCP server.
///
/// Registered under the sanitized server-tool name; displayed as
/// `"<serverTool> (<server> MCP Server)"`.  Invocations require MCP
/// confirmation unless the server or tool is already on the allow-list.
pub struct DiscoveredMcpTool {
    spec: ToolSpec,
    server_name: String,
    server_tool_name: String,
    call: McpCallFn,
}

impl DiscoveredMcpTool {
    pub fn new(
        server_name: impl Into<String>,
        server_tool_name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
        call: McpCallFn,
    ) -> Self {
        let server_name = server_name.into();
        let server_tool_name = server_tool_name.into();
        let mut spec = ToolSpec::new(
            sanitize_tool_name(&server_tool_name),
            description,
            ToolKind::Other,
            parameter_schema,
        );
        spec.display_name = format!("{server_tool_name} ({server_name} MCP Server)");
        Self {
            spec,
            server_name,
            server_tool_name,
            call,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_tool_name(&self) -> &str {
        &self.server_tool_name
    }
}

impl Tool for DiscoveredMcpTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn build(&self, args: Value) -> Result<Box<dyn ToolInvocation>, String> {
        if !args.is_object() {
            return Err(format!(
                "arguments for {} must be a JSON object",
                self.spec.name
            ));
        }
        Ok(Box::new(McpInvocation {
            server_name: self.server_name.clone(),
            tool_name: self.spec.name.clone(),
            tool_display_name: self.spec.display_name.clone(),
            args,
            call: Arc::clone(&self.call),
        }))
    }
}

struct McpInvocation {
    server_name: String,
    tool_name: String,
    tool_display_name: String,
    args: Value,
    call: McpCallFn,
}

#[async_trait::async_trait]
impl ToolInvocation for McpInvocation {
    fn description(&self) -> String {
        format!("call {} with {}", self.tool_display_name, self.args)
    }

    async fn confirmation(&self) -> Option<ToolConfirmation> {
        Some(ToolConfirmation::Mcp {
            server_name: self.server_name.clone(),
            tool_name: self.tool_name.clone(),
            tool_display_name: self.tool_display_name.clone(),
        })
    }

    async fn execute(
        &self,
        _cancel: runa_config::CancelToken,
        _output: Option<tokio::sync::mpsc::Sender<String>>,
    ) -> Result<ToolResult, String> {
        let value = (self.call)(self.args.clone()).await?;
        let text = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(ToolResult::text(text))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
