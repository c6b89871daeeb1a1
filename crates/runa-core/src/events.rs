// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::scheduler::{ToolCallRequest, ToolCallSnapshot};

/// Why a turn stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced a response with no tool calls.
    EndTurn,
    /// The turn's cancellation token tripped.
    Cancelled,
    /// The per-prompt iteration cap was reached.
    MaxTurns,
}

/// Events emitted by the turn driver while a prompt runs.
/// Consumers (CLI runner, UI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A text chunk streamed from the model.
    Content(String),
    /// A chain-of-thought chunk.  Surfaced to the UI, never resubmitted.
    Thought(String),
    /// The model requested tool calls; the scheduler takes over.
    ToolCallsRequested(Vec<ToolCallRequest>),
    /// A batch of tool calls reached terminal states.
    ToolCallsCompleted(Vec<ToolCallSnapshot>),
    /// A non-recoverable error; the turn stops after this.
    Error(String),
    Finished(StopReason),
}
