// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool-call scheduler: a per-call state machine advanced in batches.
//!
//! A turn may produce several tool calls at once.  They are validated
//! concurrently, approved sequentially in request order (so one
//! "always approve" answer silently advances the rest), and executed
//! concurrently.  Batches are serialized: a second `schedule` waits until
//! every call of the current batch is terminal.
//!
//! `schedule` never returns an error: tool failures become in-band
//! function-response errors so the model can recover.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Instant;

use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use runa_config::{ApprovalMode, CancelToken};
use runa_model::Part;
use runa_tools::{
    confirmation_channel, ConfirmationHandle, ConfirmationOutcome, ResultPart, ToolConfirmation,
    ToolInvocation, ToolRegistry, ToolResult, ToolResultContent, ToolResultDisplay,
};

const CANCELLED_MESSAGE: &str = "user cancelled the operation";

// ─── Requests and records ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub prompt_id: String,
    /// True when the host queued the call itself rather than the model.
    pub is_client_initiated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// The function-response payload produced for a terminal call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    /// Parts folded into the next user message.
    pub parts: Vec<Part>,
    /// Display payload for the UI (diff, markdown); never sent to the model.
    pub display: Option<ToolResultDisplay>,
    pub error: Option<String>,
}

/// Deep-copied view of one call, published on every status transition.
#[derive(Debug, Clone)]
pub struct ToolCallSnapshot {
    pub status: ToolCallStatus,
    pub request: ToolCallRequest,
    pub description: Option<String>,
    pub confirmation: Option<ToolConfirmation>,
    pub outcome: Option<ConfirmationOutcome>,
    pub response: Option<ToolCallResponse>,
    pub duration_ms: Option<u64>,
}

/// A call that reached a terminal state.
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub request: ToolCallRequest,
    pub status: ToolCallStatus,
    pub response: ToolCallResponse,
    pub outcome: Option<ConfirmationOutcome>,
    pub duration_ms: Option<u64>,
}

/// Events published to the host while a batch advances.
#[derive(Debug)]
pub enum SchedulerEvent {
    CallUpdate(ToolCallSnapshot),
    /// The host must resolve the responder exactly once.
    ApprovalRequest {
        call_id: String,
        confirmation: ToolConfirmation,
        responder: ConfirmationHandle,
    },
    /// Streaming output from a tool that declares `can_update_output`.
    OutputUpdate { call_id: String, chunk: String },
    AllComplete(Vec<ToolCallSnapshot>),
}

// ─── Process-wide approval state ──────────────────────────────────────────────

/// Approval mode plus the MCP allow-list.
///
/// Process-wide by design: `ProceedAlways` raises the mode for the rest of
/// the process, and server/tool allow entries are additive and monotonic.
/// Tests construct standalone instances; the runtime shares one via
/// [`ApprovalState::global`].
#[derive(Debug)]
pub struct ApprovalState {
    mode: StdMutex<ApprovalMode>,
    allow_list: StdMutex<HashSet<String>>,
}

impl ApprovalState {
    pub fn new(mode: ApprovalMode) -> Self {
        Self {
            mode: StdMutex::new(mode),
            allow_list: StdMutex::new(HashSet::new()),
        }
    }

    /// Shared instance, initialized on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ApprovalState>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(ApprovalMode::Default))))
    }

    pub fn mode(&self) -> ApprovalMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// `ProceedAlways` raises Default to AutoEdit; Yolo is never lowered.
    pub fn raise_to_auto_edit(&self) {
        let mut mode = self.mode.lock().unwrap();
        if *mode == ApprovalMode::Default {
            *mode = ApprovalMode::AutoEdit;
        }
    }

    pub fn allow(&self, key: impl Into<String>) {
        self.allow_list.lock().unwrap().insert(key.into());
    }

    pub fn is_allowed(&self, keys: &[String]) -> bool {
        let list = self.allow_list.lock().unwrap();
        keys.iter().any(|k| list.contains(k))
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

struct CallState {
    request: ToolCallRequest,
    status: ToolCallStatus,
    invocation: Option<Box<dyn ToolInvocation>>,
    can_update_output: bool,
    description: Option<String>,
    confirmation: Option<ToolConfirmation>,
    outcome: Option<ConfirmationOutcome>,
    response: Option<ToolCallResponse>,
    started: Instant,
    duration_ms: Option<u64>,
}

impl CallState {
    fn new(request: ToolCallRequest) -> Self {
        Self {
            request,
            status: ToolCallStatus::Validating,
            invocation: None,
            can_update_output: false,
            description: None,
            confirmation: None,
            outcome: None,
            response: None,
            started: Instant::now(),
            duration_ms: None,
        }
    }

    fn snapshot(&self) -> ToolCallSnapshot {
        ToolCallSnapshot {
            status: self.status,
            request: self.request.clone(),
            description: self.description.clone(),
            confirmation: self.confirmation.clone(),
            outcome: self.outcome,
            response: self.response.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    approval: Arc<ApprovalState>,
    events: mpsc::Sender<SchedulerEvent>,
    batch_lock: AsyncMutex<()>,
}

impl ToolScheduler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approval: Arc<ApprovalState>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            registry,
            approval,
            events,
            batch_lock: AsyncMutex::new(()),
        }
    }

    /// Advance a batch of requests to terminal states and return their
    /// responses in request order.  Waits for any in-flight batch first.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: CancelToken,
    ) -> Vec<CompletedToolCall> {
        let _batch = self.batch_lock.lock().await;

        let mut states: Vec<CallState> = requests.into_iter().map(CallState::new).collect();
        for state in &states {
            self.publish(state).await;
        }

        self.validate_batch(&mut states).await;

        if cancel.is_cancelled() {
            self.cancel_remaining(&mut states).await;
        } else {
            self.approve_batch(&mut states, &cancel).await;
            if cancel.is_cancelled() {
                self.cancel_remaining(&mut states).await;
            } else {
                self.execute_batch(&mut states, &cancel).await;
            }
        }

        let snapshots: Vec<ToolCallSnapshot> = states.iter().map(CallState::snapshot).collect();
        let _ = self.events.send(SchedulerEvent::AllComplete(snapshots)).await;

        states
            .into_iter()
            .map(|s| CompletedToolCall {
                request: s.request,
                status: s.status,
                response: s.response.unwrap_or_else(|| ToolCallResponse {
                    parts: Vec::new(),
                    display: None,
                    error: None,
                }),
                outcome: s.outcome,
                duration_ms: s.duration_ms,
            })
            .collect()
    }

    // ── Phase 1: validation (concurrent) ──────────────────────────────────────

    async fn validate_batch(&self, states: &mut [CallState]) {
        type Validated = Result<(Box<dyn ToolInvocation>, Option<ToolConfirmation>, bool), String>;

        let validations = states.iter().map(|state| {
            let registry = Arc::clone(&self.registry);
            let request = state.request.clone();
            async move {
                let Some(tool) = registry.get(&request.name) else {
                    return Err(format!("tool \"{}\" not found in registry", request.name));
                };
                let can_update = tool.spec().can_update_output;
                match tool.build(request.args.clone()) {
                    Ok(invocation) => {
                        let confirmation = invocation.confirmation().await;
                        Ok((invocation, confirmation, can_update))
                    }
                    Err(e) => Err(format!("invalid arguments for {}: {e}", request.name)),
                }
            }
        });
        let results: Vec<Validated> = futures::future::join_all(validations).await;

        for (state, result) in states.iter_mut().zip(results) {
            match result {
                Ok((invocation, confirmation, can_update)) => {
                    state.description = Some(invocation.description());
                    state.invocation = Some(invocation);
                    state.confirmation = confirmation;
                    state.can_update_output = can_update;
                }
                Err(message) => {
                    warn!(call = %state.request.call_id, %message, "tool call failed validation");
                    self.finish_error(state, message).await;
                }
            }
        }
    }

    // ── Phase 2: approval (sequential, request order) ─────────────────────────

    async fn approve_batch(&self, states: &mut [CallState], cancel: &CancelToken) {
        for state in states.iter_mut() {
            if state.status.is_terminal() {
                continue;
            }
            if cancel.is_cancelled() {
                return;
            }

            let hard_denial = state
                .invocation
                .as_ref()
                .map(|i| i.is_hard_denial())
                .unwrap_or(false);
            if hard_denial {
                self.finish_error(state, "blocked by policy".to_string()).await;
                continue;
            }

            let mut confirmation = state.confirmation.clone();
            loop {
                let Some(conf) = confirmation.clone() else {
                    self.set_status(state, ToolCallStatus::Scheduled).await;
                    break;
                };

                // Re-check mode and allow-list on every pass: an earlier
                // call's ProceedAlways/ProceedAlwaysServer answer advances
                // this one without a prompt.
                let mode = self.approval.mode();
                let auto = mode == ApprovalMode::Yolo
                    || (conf.is_edit() && mode == ApprovalMode::AutoEdit)
                    || self.approval.is_allowed(&conf.allow_keys());
                if auto {
                    self.set_status(state, ToolCallStatus::Scheduled).await;
                    break;
                }

                state.status = ToolCallStatus::AwaitingApproval;
                state.confirmation = Some(conf.clone());
                self.publish(state).await;

                let (responder, rx) = confirmation_channel();
                let sent = self
                    .events
                    .send(SchedulerEvent::ApprovalRequest {
                        call_id: state.request.call_id.clone(),
                        confirmation: conf.clone(),
                        responder,
                    })
                    .await;
                if sent.is_err() {
                    // No host listening; nobody can ever approve.
                    self.finish_cancelled(state).await;
                    break;
                }

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ConfirmationOutcome::Cancel,
                    answer = rx => answer.unwrap_or(ConfirmationOutcome::Cancel),
                };
                state.outcome = Some(outcome);

                match outcome {
                    ConfirmationOutcome::ProceedOnce => {
                        self.set_status(state, ToolCallStatus::Scheduled).await;
                        break;
                    }
                    ConfirmationOutcome::ProceedAlways => {
                        self.approval.raise_to_auto_edit();
                        self.set_status(state, ToolCallStatus::Scheduled).await;
                        break;
                    }
                    ConfirmationOutcome::ProceedAlwaysServer
                    | ConfirmationOutcome::ProceedAlwaysTool => {
                        let keys = conf.allow_keys();
                        let key = match outcome {
                            ConfirmationOutcome::ProceedAlwaysServer => keys.first(),
                            _ => keys.get(1),
                        };
                        if let Some(k) = key {
                            self.approval.allow(k.clone());
                        }
                        self.set_status(state, ToolCallStatus::Scheduled).await;
                        break;
                    }
                    ConfirmationOutcome::ModifyWithEditor => {
                        // Stay awaiting: re-query the invocation for the
                        // refreshed payload and prompt again.
                        let refreshed = match &state.invocation {
                            Some(inv) => inv.confirmation().await,
                            None => None,
                        };
                        confirmation = refreshed.or(Some(conf));
                    }
                    ConfirmationOutcome::Cancel => {
                        self.finish_cancelled(state).await;
                        break;
                    }
                }
            }
        }
    }

    // ── Phase 3: execution (concurrent) ───────────────────────────────────────

    async fn execute_batch(&self, states: &mut [CallState], cancel: &CancelToken) {
        let mut handles = Vec::new();
        for (idx, state) in states.iter_mut().enumerate() {
            if state.status != ToolCallStatus::Scheduled {
                continue;
            }
            state.status = ToolCallStatus::Executing;
            state.started = Instant::now();
            self.publish(state).await;

            let Some(invocation) = state.invocation.take() else {
                continue;
            };
            let cancel = cancel.clone();
            let output_tx = if state.can_update_output {
                let (otx, mut orx) = mpsc::channel::<String>(16);
                let events = self.events.clone();
                let call_id = state.request.call_id.clone();
                tokio::spawn(async move {
                    while let Some(chunk) = orx.recv().await {
                        let _ = events
                            .send(SchedulerEvent::OutputUpdate {
                                call_id: call_id.clone(),
                                chunk,
                            })
                            .await;
                    }
                });
                Some(otx)
            } else {
                None
            };

            debug!(call = %state.request.call_id, tool = %state.request.name, "executing tool");
            handles.push((
                idx,
                tokio::spawn(async move { invocation.execute(cancel, output_tx).await }),
            ));
        }

        // Join in request order so function-response parts come out ordered
        // regardless of completion order.
        for (idx, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(format!("tool panicked: {e}")),
            };
            let state = &mut states[idx];
            state.duration_ms = Some(state.started.elapsed().as_millis() as u64);
            match result {
                Ok(tool_result) => self.finish_success(state, tool_result).await,
                Err(message) => {
                    if cancel.is_cancelled() {
                        self.finish_cancelled(state).await;
                    } else {
                        self.finish_error(state, message).await;
                    }
                }
            }
        }
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    async fn publish(&self, state: &CallState) {
        let _ = self
            .events
            .send(SchedulerEvent::CallUpdate(state.snapshot()))
            .await;
    }

    async fn set_status(&self, state: &mut CallState, status: ToolCallStatus) {
        state.status = status;
        self.publish(state).await;
    }

    async fn finish_success(&self, state: &mut CallState, result: ToolResult) {
        state.response = Some(synthesize_success(&state.request, result));
        self.set_status(state, ToolCallStatus::Success).await;
    }

    async fn finish_error(&self, state: &mut CallState, message: String) {
        state.response = Some(synthesize_failure(
            &state.request,
            message,
            display_from_confirmation(state.confirmation.as_ref()),
        ));
        self.set_status(state, ToolCallStatus::Error).await;
    }

    async fn finish_cancelled(&self, state: &mut CallState) {
        state.response = Some(synthesize_failure(
            &state.request,
            CANCELLED_MESSAGE.to_string(),
            display_from_confirmation(state.confirmation.as_ref()),
        ));
        self.set_status(state, ToolCallStatus::Cancelled).await;
    }

    async fn cancel_remaining(&self, states: &mut [CallState]) {
        for state in states.iter_mut() {
            if !state.status.is_terminal() {
                self.finish_cancelled(state).await;
            }
        }
    }
}

// ─── Response synthesis ───────────────────────────────────────────────────────

fn result_part_to_part(p: &ResultPart) -> Part {
    match p {
        ResultPart::Text(t) => Part::text(t.clone()),
        ResultPart::InlineData { mime_type, data } => Part::InlineData {
            mime_type: mime_type.clone(),
            data: data.clone(),
        },
        ResultPart::FileData { mime_type, file_uri } => Part::FileData {
            mime_type: mime_type.clone(),
            file_uri: file_uri.clone(),
        },
    }
}

fn synthesize_success(request: &ToolCallRequest, result: ToolResult) -> ToolCallResponse {
    let fr = |payload: serde_json::Value| {
        Part::function_response(request.name.clone(), request.call_id.clone(), payload)
    };

    let parts = match &result.content {
        ToolResultContent::Text(s) => vec![fr(json!({ "output": s }))],
        ToolResultContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
            ResultPart::Text(s) => vec![fr(json!({ "output": s }))],
            binary => {
                let mime = match binary {
                    ResultPart::InlineData { mime_type, .. } => mime_type,
                    ResultPart::FileData { mime_type, .. } => mime_type,
                    ResultPart::Text(_) => unreachable!(),
                };
                vec![
                    fr(json!({
                        "output": format!("Binary content of type {mime} was processed.")
                    })),
                    result_part_to_part(binary),
                ]
            }
        },
        ToolResultContent::Parts(parts) => {
            let mut out = vec![fr(json!({ "output": "Tool execution succeeded." }))];
            out.extend(parts.iter().map(result_part_to_part));
            out
        }
    };

    ToolCallResponse {
        parts,
        display: result.display,
        error: None,
    }
}

fn synthesize_failure(
    request: &ToolCallRequest,
    message: String,
    display: Option<ToolResultDisplay>,
) -> ToolCallResponse {
    ToolCallResponse {
        parts: vec![Part::function_error(
            request.name.clone(),
            request.call_id.clone(),
            message.clone(),
        )],
        display,
        error: Some(message),
    }
}

/// Preserve the proposed diff for the UI when an edit call dies before
/// executing.
fn display_from_confirmation(conf: Option<&ToolConfirmation>) -> Option<ToolResultDisplay> {
    match conf {
        Some(ToolConfirmation::Edit {
            file_name,
            file_diff,
            original_content,
            new_content,
            ..
        }) => Some(ToolResultDisplay::Diff {
            file_name: file_name.clone(),
            file_diff: file_diff.clone(),
            original_content: original_content.clone(),
            new_content: new_content.clone(),
        }),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use runa_tools::{Tool, ToolKind, ToolSpec};

    use super::*;

    // ── Fixture tools ─────────────────────────────────────────────────────────

    struct PlainTool {
        spec: ToolSpec,
        reply: String,
        delay_ms: u64,
    }

    impl PlainTool {
        fn new(name: &str, reply: &str) -> Self {
            Self {
                spec: ToolSpec::new(name, "plain", ToolKind::Read, json!({"type": "object"})),
                reply: reply.into(),
                delay_ms: 0,
            }
        }

        fn slow(name: &str, reply: &str, delay_ms: u64) -> Self {
            let mut t = Self::new(name, reply);
            t.delay_ms = delay_ms;
            t
        }
    }

    struct PlainInvocation {
        reply: String,
        delay_ms: u64,
    }

    #[async_trait]
    impl runa_tools::ToolInvocation for PlainInvocation {
        fn description(&self) -> String {
            "plain".into()
        }
        async fn execute(
            &self,
            cancel: CancelToken,
            _output: Option<mpsc::Sender<String>>,
        ) -> Result<ToolResult, String> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if cancel.is_cancelled() {
                return Err("cancelled".into());
            }
            Ok(ToolResult::text(self.reply.clone()))
        }
    }

    impl Tool for PlainTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        fn build(&self, args: serde_json::Value) -> Result<Box<dyn runa_tools::ToolInvocation>, String> {
            if args.get("bad").is_some() {
                return Err("unsupported argument 'bad'".into());
            }
            Ok(Box::new(PlainInvocation {
                reply: self.reply.clone(),
                delay_ms: self.delay_ms,
            }))
        }
    }

    struct EditTool {
        spec: ToolSpec,
    }

    impl EditTool {
        fn new(name: &str) -> Self {
            Self {
                spec: ToolSpec::new(name, "edits a file", ToolKind::Edit, json!({"type": "object"})),
            }
        }
    }

    struct EditInvocation {
        file_name: String,
    }

    #[async_trait]
    impl runa_tools::ToolInvocation for EditInvocation {
        fn description(&self) -> String {
            format!("edit {}", self.file_name)
        }
        async fn confirmation(&self) -> Option<ToolConfirmation> {
            Some(ToolConfirmation::Edit {
                title: format!("Edit {}", self.file_name),
                file_name: self.file_name.clone(),
                file_path: format!("/w/{}", self.file_name),
                file_diff: "--- a\n+++ b\n-old\n+new\n".into(),
                original_content: Some("old".into()),
                new_content: "new".into(),
            })
        }
        async fn execute(
            &self,
            _cancel: CancelToken,
            _output: Option<mpsc::Sender<String>>,
        ) -> Result<ToolResult, String> {
            Ok(ToolResult::text("edited"))
        }
    }

    impl Tool for EditTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        fn build(&self, _args: serde_json::Value) -> Result<Box<dyn runa_tools::ToolInvocation>, String> {
            Ok(Box::new(EditInvocation {
                file_name: "a.rs".into(),
            }))
        }
    }

    struct ExecTool {
        spec: ToolSpec,
        hard_denial: bool,
    }

    impl ExecTool {
        fn new(name: &str) -> Self {
            Self {
                spec: ToolSpec::new(name, "runs a command", ToolKind::Execute, json!({"type": "object"})),
                hard_denial: false,
            }
        }

        fn hard_denied(name: &str) -> Self {
            let mut t = Self::new(name);
            t.hard_denial = true;
            t
        }
    }

    struct ExecInvocation {
        hard_denial: bool,
    }

    #[async_trait]
    impl runa_tools::ToolInvocation for ExecInvocation {
        fn description(&self) -> String {
            "run ls".into()
        }
        fn is_hard_denial(&self) -> bool {
            self.hard_denial
        }
        async fn confirmation(&self) -> Option<ToolConfirmation> {
            Some(ToolConfirmation::Exec {
                title: "Run command".into(),
                command: "ls -la".into(),
                root_command: "ls".into(),
            })
        }
        async fn execute(
            &self,
            _cancel: CancelToken,
            _output: Option<mpsc::Sender<String>>,
        ) -> Result<ToolResult, String> {
            Ok(ToolResult::text("ran"))
        }
    }

    impl Tool for ExecTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        fn build(&self, _args: serde_json::Value) -> Result<Box<dyn runa_tools::ToolInvocation>, String> {
            Ok(Box::new(ExecInvocation {
                hard_denial: self.hard_denial,
            }))
        }
    }

    struct BinaryTool {
        spec: ToolSpec,
        parts: Vec<ResultPart>,
    }

    impl BinaryTool {
        fn new(name: &str, parts: Vec<ResultPart>) -> Self {
            Self {
                spec: ToolSpec::new(name, "binary", ToolKind::Read, json!({"type": "object"})),
                parts,
            }
        }
    }

    struct BinaryInvocation {
        parts: Vec<ResultPart>,
    }

    #[async_trait]
    impl runa_tools::ToolInvocation for BinaryInvocation {
        fn description(&self) -> String {
            "binary".into()
        }
        async fn execute(
            &self,
            _cancel: CancelToken,
            _output: Option<mpsc::Sender<String>>,
        ) -> Result<ToolResult, String> {
            Ok(ToolResult::with_parts(self.parts.clone()))
        }
    }

    impl Tool for BinaryTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        fn build(&self, _args: serde_json::Value) -> Result<Box<dyn runa_tools::ToolInvocation>, String> {
            Ok(Box::new(BinaryInvocation {
                parts: self.parts.clone(),
            }))
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    fn request(name: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: format!("{name}-1"),
            name: name.into(),
            args: json!({}),
            prompt_id: "p-1".into(),
            is_client_initiated: false,
        }
    }

    struct Harness {
        scheduler: ToolScheduler,
        events: mpsc::Receiver<SchedulerEvent>,
    }

    fn harness(registry: ToolRegistry, mode: ApprovalMode) -> Harness {
        let (tx, rx) = mpsc::channel(256);
        Harness {
            scheduler: ToolScheduler::new(
                Arc::new(registry),
                Arc::new(ApprovalState::new(mode)),
                tx,
            ),
            events: rx,
        }
    }

    /// Run `schedule` while answering every approval prompt with the next
    /// outcome from `answers`.  Returns (completed, events-seen).
    async fn run_with_answers(
        mut h: Harness,
        requests: Vec<ToolCallRequest>,
        cancel: CancelToken,
        mut answers: Vec<ConfirmationOutcome>,
    ) -> (Vec<CompletedToolCall>, Vec<SchedulerEvent>, usize) {
        answers.reverse();
        let schedule = h.scheduler.schedule(requests, cancel);
        tokio::pin!(schedule);

        let mut seen = Vec::new();
        let mut prompts = 0usize;
        let completed = loop {
            tokio::select! {
                done = &mut schedule => break done,
                ev = h.events.recv() => {
                    if let Some(ev) = ev {
                        if let SchedulerEvent::ApprovalRequest { responder, .. } = ev {
                            prompts += 1;
                            let outcome = answers.pop().unwrap_or(ConfirmationOutcome::Cancel);
                            responder.resolve(outcome);
                        } else {
                            seen.push(ev);
                        }
                    }
                }
            }
        };
        // Drain whatever is left in the channel.
        while let Ok(ev) = h.events.try_recv() {
            seen.push(ev);
        }
        (completed, seen, prompts)
    }

    fn statuses_for<'a>(
        events: &'a [SchedulerEvent],
        call_id: &str,
    ) -> Vec<ToolCallStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::CallUpdate(s) if s.request.call_id == call_id => Some(s.status),
                _ => None,
            })
            .collect()
    }

    // ── Validation failures ───────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_becomes_in_band_error() {
        let h = harness(ToolRegistry::new(), ApprovalMode::Default);
        let (completed, _, _) =
            run_with_answers(h, vec![request("missing")], CancelToken::new(), vec![]).await;
        assert_eq!(completed[0].status, ToolCallStatus::Error);
        let err = completed[0].response.error.as_deref().unwrap();
        assert!(err.contains("not found"));
        assert!(matches!(
            &completed[0].response.parts[0],
            Part::FunctionResponse { error: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn bad_arguments_become_error_state() {
        let mut reg = ToolRegistry::new();
        reg.register(PlainTool::new("echo", "ok"));
        let h = harness(reg, ApprovalMode::Default);
        let mut req = request("echo");
        req.args = json!({"bad": true});
        let (completed, _, _) = run_with_answers(h, vec![req], CancelToken::new(), vec![]).await;
        assert_eq!(completed[0].status, ToolCallStatus::Error);
        assert!(completed[0].response.error.as_deref().unwrap().contains("invalid arguments"));
    }

    // ── Plain execution ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unconfirmed_tool_executes_and_synthesizes_output() {
        let mut reg = ToolRegistry::new();
        reg.register(PlainTool::new("echo", "hello"));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, events, prompts) =
            run_with_answers(h, vec![request("echo")], CancelToken::new(), vec![]).await;

        assert_eq!(prompts, 0);
        assert_eq!(completed[0].status, ToolCallStatus::Success);
        match &completed[0].response.parts[0] {
            Part::FunctionResponse { name, id, response, .. } => {
                assert_eq!(name, "echo");
                assert_eq!(id, "echo-1");
                assert_eq!(response.as_ref().unwrap()["output"], "hello");
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(
            statuses_for(&events, "echo-1"),
            vec![
                ToolCallStatus::Validating,
                ToolCallStatus::Scheduled,
                ToolCallStatus::Executing,
                ToolCallStatus::Success,
            ]
        );
    }

    #[tokio::test]
    async fn responses_come_back_in_request_order() {
        let mut reg = ToolRegistry::new();
        reg.register(PlainTool::slow("slow", "first", 50));
        reg.register(PlainTool::new("fast", "second"));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, _) = run_with_answers(
            h,
            vec![request("slow"), request("fast")],
            CancelToken::new(),
            vec![],
        )
        .await;
        assert_eq!(completed[0].request.name, "slow");
        assert_eq!(completed[1].request.name, "fast");
        assert_eq!(completed[0].status, ToolCallStatus::Success);
        assert_eq!(completed[1].status, ToolCallStatus::Success);
    }

    // ── Approval flows ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exec_confirmation_prompts_then_runs() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::new("shell"));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, events, prompts) = run_with_answers(
            h,
            vec![request("shell")],
            CancelToken::new(),
            vec![ConfirmationOutcome::ProceedOnce],
        )
        .await;
        assert_eq!(prompts, 1);
        assert_eq!(completed[0].status, ToolCallStatus::Success);
        assert!(statuses_for(&events, "shell-1").contains(&ToolCallStatus::AwaitingApproval));
    }

    #[tokio::test]
    async fn cancel_outcome_preserves_diff_display() {
        let mut reg = ToolRegistry::new();
        reg.register(EditTool::new("edit"));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, _) = run_with_answers(
            h,
            vec![request("edit")],
            CancelToken::new(),
            vec![ConfirmationOutcome::Cancel],
        )
        .await;
        assert_eq!(completed[0].status, ToolCallStatus::Cancelled);
        match completed[0].response.display.as_ref().unwrap() {
            ToolResultDisplay::Diff { file_diff, .. } => {
                assert!(file_diff.contains("--- a"));
            }
            other => panic!("expected diff display, got {other:?}"),
        }
        assert_eq!(
            completed[0].response.error.as_deref(),
            Some(CANCELLED_MESSAGE)
        );
    }

    #[tokio::test]
    async fn yolo_mode_never_awaits_approval() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::new("shell"));
        reg.register(EditTool::new("edit"));
        let h = harness(reg, ApprovalMode::Yolo);
        let (completed, events, prompts) = run_with_answers(
            h,
            vec![request("shell"), request("edit")],
            CancelToken::new(),
            vec![],
        )
        .await;
        assert_eq!(prompts, 0);
        assert!(completed.iter().all(|c| c.status == ToolCallStatus::Success));
        assert!(!statuses_for(&events, "shell-1").contains(&ToolCallStatus::AwaitingApproval));
    }

    #[tokio::test]
    async fn hard_denial_fails_even_in_yolo() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::hard_denied("rmrf"));
        let h = harness(reg, ApprovalMode::Yolo);
        let (completed, _, prompts) =
            run_with_answers(h, vec![request("rmrf")], CancelToken::new(), vec![]).await;
        assert_eq!(prompts, 0);
        assert_eq!(completed[0].status, ToolCallStatus::Error);
        assert!(completed[0].response.error.as_deref().unwrap().contains("policy"));
    }

    #[tokio::test]
    async fn auto_edit_skips_edit_prompts_but_not_exec() {
        let mut reg = ToolRegistry::new();
        reg.register(EditTool::new("edit"));
        reg.register(ExecTool::new("shell"));
        let h = harness(reg, ApprovalMode::AutoEdit);
        let (completed, _, prompts) = run_with_answers(
            h,
            vec![request("edit"), request("shell")],
            CancelToken::new(),
            vec![ConfirmationOutcome::ProceedOnce],
        )
        .await;
        assert_eq!(prompts, 1, "only the exec call should prompt");
        assert!(completed.iter().all(|c| c.status == ToolCallStatus::Success));
    }

    #[tokio::test]
    async fn proceed_always_advances_later_edit_calls_without_prompting() {
        let mut reg = ToolRegistry::new();
        reg.register(EditTool::new("edit_a"));
        reg.register(EditTool::new("edit_b"));
        reg.register(EditTool::new("edit_c"));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, prompts) = run_with_answers(
            h,
            vec![request("edit_a"), request("edit_b"), request("edit_c")],
            CancelToken::new(),
            vec![ConfirmationOutcome::ProceedAlways],
        )
        .await;
        assert_eq!(prompts, 1, "one ProceedAlways answer covers the batch");
        assert!(completed.iter().all(|c| c.status == ToolCallStatus::Success));
    }

    #[tokio::test]
    async fn proceed_always_server_covers_other_tools_from_same_server() {
        use runa_tools::DiscoveredMcpTool;
        let call: runa_tools::McpCallFn =
            Arc::new(|_| Box::pin(async { Ok(json!("mcp-ok")) }));
        let mut reg = ToolRegistry::new();
        reg.register(DiscoveredMcpTool::new("files", "search", "d", json!({}), Arc::clone(&call)));
        reg.register(DiscoveredMcpTool::new("files", "fetch", "d", json!({}), call));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, prompts) = run_with_answers(
            h,
            vec![request("search"), request("fetch")],
            CancelToken::new(),
            vec![ConfirmationOutcome::ProceedAlwaysServer],
        )
        .await;
        assert_eq!(prompts, 1);
        assert!(completed.iter().all(|c| c.status == ToolCallStatus::Success));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_before_approval_cancels_whole_batch() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::new("shell"));
        reg.register(PlainTool::new("echo", "ok"));
        let cancel = CancelToken::new();
        cancel.cancel();
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, prompts) = run_with_answers(
            h,
            vec![request("shell"), request("echo")],
            cancel,
            vec![],
        )
        .await;
        assert_eq!(prompts, 0);
        assert!(completed.iter().all(|c| c.status == ToolCallStatus::Cancelled));
        assert!(completed
            .iter()
            .all(|c| c.response.error.as_deref() == Some(CANCELLED_MESSAGE)));
    }

    #[tokio::test]
    async fn abort_while_awaiting_approval_cancels_batch() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::new("shell"));
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = ToolScheduler::new(
            Arc::new(reg),
            Arc::new(ApprovalState::new(ApprovalMode::Default)),
            tx,
        );
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            // Wait for the approval request, then abort instead of answering.
            while let Some(ev) = rx.recv().await {
                if matches!(ev, SchedulerEvent::ApprovalRequest { .. }) {
                    trip.cancel();
                }
            }
        });
        let completed = scheduler.schedule(vec![request("shell")], cancel).await;
        assert_eq!(completed[0].status, ToolCallStatus::Cancelled);
    }

    // ── Batch serialization ───────────────────────────────────────────────────

    #[tokio::test]
    async fn second_batch_waits_for_first() {
        let mut reg = ToolRegistry::new();
        reg.register(PlainTool::slow("slow", "a", 40));
        reg.register(PlainTool::new("fast", "b"));
        let (tx, _rx) = mpsc::channel(1024);
        let scheduler = Arc::new(ToolScheduler::new(
            Arc::new(reg),
            Arc::new(ApprovalState::new(ApprovalMode::Default)),
            tx,
        ));

        let s1 = Arc::clone(&scheduler);
        let first = tokio::spawn(async move {
            s1.schedule(vec![request("slow")], CancelToken::new()).await;
            std::time::Instant::now()
        });
        // Give the first batch a head start so it holds the lock.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let s2 = Arc::clone(&scheduler);
        let second = tokio::spawn(async move {
            let done = s2.schedule(vec![request("fast")], CancelToken::new()).await;
            (std::time::Instant::now(), done)
        });

        let first_done = first.await.unwrap();
        let (second_done, completed) = second.await.unwrap();
        assert!(second_done >= first_done, "batch 2 must finish after batch 1");
        assert_eq!(completed[0].status, ToolCallStatus::Success);
    }

    // ── Response synthesis ────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_binary_part_gets_descriptor_then_part() {
        let mut reg = ToolRegistry::new();
        reg.register(BinaryTool::new(
            "shot",
            vec![ResultPart::InlineData {
                mime_type: "image/png".into(),
                data: "AA==".into(),
            }],
        ));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, _) =
            run_with_answers(h, vec![request("shot")], CancelToken::new(), vec![]).await;
        let parts = &completed[0].response.parts;
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            Part::FunctionResponse { response, .. } => {
                assert_eq!(
                    response.as_ref().unwrap()["output"],
                    "Binary content of type image/png was processed."
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(&parts[1], Part::InlineData { mime_type, .. } if mime_type == "image/png"));
    }

    #[tokio::test]
    async fn multiple_parts_get_summary_then_raw_parts() {
        let mut reg = ToolRegistry::new();
        reg.register(BinaryTool::new(
            "multi",
            vec![
                ResultPart::Text("caption".into()),
                ResultPart::FileData {
                    mime_type: "application/pdf".into(),
                    file_uri: "file:///doc.pdf".into(),
                },
            ],
        ));
        let h = harness(reg, ApprovalMode::Default);
        let (completed, _, _) =
            run_with_answers(h, vec![request("multi")], CancelToken::new(), vec![]).await;
        let parts = &completed[0].response.parts;
        assert_eq!(parts.len(), 3);
        match &parts[0] {
            Part::FunctionResponse { response, .. } => {
                assert_eq!(response.as_ref().unwrap()["output"], "Tool execution succeeded.");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // ── Snapshot monotonicity ─────────────────────────────────────────────────

    #[tokio::test]
    async fn statuses_advance_monotonically() {
        let mut reg = ToolRegistry::new();
        reg.register(ExecTool::new("shell"));
        let h = harness(reg, ApprovalMode::Default);
        let (_, events, _) = run_with_answers(
            h,
            vec![request("shell")],
            CancelToken::new(),
            vec![ConfirmationOutcome::ProceedOnce],
        )
        .await;

        fn rank(s: ToolCallStatus) -> u8 {
            match s {
                ToolCallStatus::Validating => 0,
                ToolCallStatus::AwaitingApproval => 1,
                ToolCallStatus::Scheduled => 2,
                ToolCallStatus::Executing => 3,
                ToolCallStatus::Success | ToolCallStatus::Error | ToolCallStatus::Cancelled => 4,
            }
        }
        let seq = statuses_for(&events, "shell-1");
        for pair in seq.windows(2) {
            assert!(
                rank(pair[1]) >= rank(pair[0]),
                "status went backwards: {seq:?}"
            );
        }
    }

    // ── Approval state ────────────────────────────────────────────────────────

    #[test]
    fn raise_to_auto_edit_never_lowers_yolo() {
        let s = ApprovalState::new(ApprovalMode::Yolo);
        s.raise_to_auto_edit();
        assert_eq!(s.mode(), ApprovalMode::Yolo);
    }

    #[test]
    fn allow_list_is_additive() {
        let s = ApprovalState::new(ApprovalMode::Default);
        assert!(!s.is_allowed(&["files".into()]));
        s.allow("files");
        assert!(s.is_allowed(&["files".into()]));
        s.allow("files.search");
        assert!(s.is_allowed(&["files".into(), "files.search".into()]));
    }
}
