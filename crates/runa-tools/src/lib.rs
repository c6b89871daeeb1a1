// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod confirmation;
pub mod registry;
pub mod tool;

pub use builtin::glob::{glob_to_regex, GlobTool};
pub use builtin::read_many_files::ReadManyFilesTool;
pub use confirmation::{
    confirmation_channel, ConfirmationHandle, ConfirmationOutcome, ToolConfirmation,
};
pub use registry::{
    sanitize_tool_name, schema_has_cycle, DiscoveredMcpTool, McpCallFn, ToolRegistry, ToolSchema,
};
pub use tool::{
    ResultPart, Tool, ToolInvocation, ToolKind, ToolResult, ToolResultContent, ToolResultDisplay,
    ToolSpec,
};
