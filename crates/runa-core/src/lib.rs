// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod chat;
mod events;
mod history;
mod prompt;
mod scheduler;
mod turn;

pub use chat::{ChatSession, FallbackHandler, ModelSessionState};
pub use events::{StopReason, TurnEvent};
pub use history::History;
pub use prompt::PromptResolver;
pub use scheduler::{
    ApprovalState, CompletedToolCall, SchedulerEvent, ToolCallRequest, ToolCallResponse,
    ToolCallSnapshot, ToolCallStatus, ToolScheduler,
};
pub use turn::TurnDriver;
