// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use runa_config::{ApprovalMode, CancelToken};
use runa_core::{
    ApprovalState, ChatSession, FallbackHandler, SchedulerEvent, StopReason, ToolScheduler,
    TurnDriver, TurnEvent,
};
use runa_model::GenerationConfig;
use runa_tools::{ConfirmationOutcome, GlobTool, ReadManyFilesTool, ToolConfirmation, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = runa_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListModels => {
                let config = runa_config::load(cli.config.as_deref())?;
                let generator = runa_model::from_config(&config.model)?;
                let models = generator
                    .list_models()
                    .await
                    .map_err(|e| anyhow::anyhow!("listing models failed: {e}"))?;
                if models.is_empty() {
                    println!("(no models reported; provider \"{}\")", config.model.provider);
                } else {
                    for m in models {
                        println!("{m}");
                    }
                }
                return Ok(());
            }
        }
    }

    let prompt = cli.prompt.clone().unwrap_or_default();
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given; run `runa --help` for usage");
    }

    let mut config = runa_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        apply_model_override(&mut config.model, model);
    }
    if cli.yolo {
        config.agent.approval_mode = ApprovalMode::Yolo;
    } else if let Some(mode) = cli.approval_mode {
        config.agent.approval_mode = mode.into();
    }
    if let Some(cap) = cli.max_turns {
        config.agent.max_turns = Some(cap);
    }

    run_prompt(&prompt, config).await
}

/// `--model` accepts `name`, or `provider/name` to switch the driver too.
fn apply_model_override(model_cfg: &mut runa_config::ModelConfig, value: &str) {
    match value.split_once('/') {
        Some((provider, name)) => {
            model_cfg.provider = provider.to_string();
            model_cfg.name = name.to_string();
        }
        None => model_cfg.name = value.to_string(),
    }
}

async fn run_prompt(prompt: &str, config: runa_config::Config) -> anyhow::Result<()> {
    let generator: Arc<dyn runa_model::ContentGenerator> =
        Arc::from(runa_model::from_config(&config.model).context("building model driver")?);

    let mut registry = ToolRegistry::new();
    if !config.tools.disabled.iter().any(|t| t == "glob") {
        registry.register(GlobTool::new());
    }
    if !config.tools.disabled.iter().any(|t| t == "read_many_files") {
        registry.register(ReadManyFilesTool::new());
    }
    let registry = Arc::new(registry);

    let chat = ChatSession::new(
        Arc::clone(&generator),
        &config.model,
        GenerationConfig {
            temperature: config.model.temperature,
            top_p: config.model.top_p,
            top_k: config.model.top_k,
            ..GenerationConfig::default()
        },
    )
    .with_fallback_handler(Arc::new(AnnouncingFallback));

    let approval = ApprovalState::global();
    approval.set_mode(config.agent.approval_mode);
    let (sched_tx, sched_rx) = mpsc::channel::<SchedulerEvent>(256);
    spawn_scheduler_event_loop(sched_rx);
    let scheduler = Arc::new(ToolScheduler::new(Arc::clone(&registry), approval, sched_tx));

    let workspace_root = std::env::current_dir().context("resolving working directory")?;
    let driver = TurnDriver::new(chat, scheduler, registry, &config.agent, workspace_root);

    // One token per turn; Ctrl-C trips it.
    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted; finishing up…");
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel::<TurnEvent>(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Content(text) => {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
                TurnEvent::Thought(text) => {
                    if !text.is_empty() {
                        eprintln!("[thinking] {text}");
                    }
                }
                TurnEvent::ToolCallsRequested(requests) => {
                    for r in &requests {
                        eprintln!("[tool] {} {}", r.name, r.args);
                    }
                }
                TurnEvent::ToolCallsCompleted(calls) => {
                    for c in &calls {
                        eprintln!("[tool] {} → {:?}", c.request.name, c.status);
                    }
                }
                TurnEvent::Error(message) => eprintln!("error: {message}"),
                TurnEvent::Finished(reason) => {
                    let _ = writeln!(stdout);
                    if reason != StopReason::EndTurn {
                        eprintln!("[stopped: {reason:?}]");
                    }
                }
            }
        }
    });

    let result = driver.run(prompt, tx, cancel).await;
    let _ = printer.await;
    result
}

/// Answer scheduler prompts on the terminal; auto-cancel when stdin is not
/// interactive.
fn spawn_scheduler_event_loop(mut rx: mpsc::Receiver<SchedulerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::ApprovalRequest { confirmation, responder, .. } => {
                    responder.resolve(prompt_for_approval(&confirmation).await);
                }
                SchedulerEvent::OutputUpdate { chunk, .. } => eprint!("{chunk}"),
                _ => {}
            }
        }
    });
}

async fn prompt_for_approval(confirmation: &ToolConfirmation) -> ConfirmationOutcome {
    if !std::io::stdin().is_terminal() {
        eprintln!("[approval required but stdin is not a terminal; cancelling]");
        return ConfirmationOutcome::Cancel;
    }

    match confirmation {
        ToolConfirmation::Edit { title, file_diff, .. } => {
            eprintln!("\n{title}\n{file_diff}");
        }
        ToolConfirmation::Exec { title, command, .. } => {
            eprintln!("\n{title}\n  $ {command}");
        }
        ToolConfirmation::Mcp { tool_display_name, .. } => {
            eprintln!("\nRun {tool_display_name}?");
        }
        ToolConfirmation::Info { title, prompt } => {
            eprintln!("\n{title}\n{prompt}");
        }
    }
    eprint!("Proceed? [y]es / [a]lways / [n]o: ");

    // Decode stdin through the keypress machine so pastes, escape sequences
    // and Ctrl-C all resolve to sensible answers.
    let mut keys = Box::pin(runa_term::key_stream(tokio::io::stdin()));
    while let Some(key) = keys.next().await {
        if key.paste {
            continue;
        }
        if key.is_interrupt() || key.name == "escape" || key.name == "n" {
            return ConfirmationOutcome::Cancel;
        }
        match key.name.as_str() {
            "y" => return ConfirmationOutcome::ProceedOnce,
            "a" => return ConfirmationOutcome::ProceedAlways,
            _ => {}
        }
    }
    ConfirmationOutcome::Cancel
}

/// Fallback handler for the one-shot CLI: accept and tell the user.
struct AnnouncingFallback;

#[async_trait::async_trait]
impl FallbackHandler for AnnouncingFallback {
    async fn on_persistent_quota(&self, current: &str, fallback: &str) -> bool {
        eprintln!("[quota exhausted on {current}; continuing with {fallback}]");
        true
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_env("RUNA_LOG").unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_env("RUNA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
