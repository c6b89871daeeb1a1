// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use runa_config::ApprovalMode;

#[derive(Parser, Debug)]
#[command(name = "runa", version, about = "A terminal AI agent runtime")]
pub struct Cli {
    /// The prompt to run.  `@path` tokens are expanded to file contents.
    pub prompt: Option<String>,

    /// Model override, e.g. `gemini-2.5-flash` or `local/qwen2.5`.
    #[arg(long)]
    pub model: Option<String>,

    /// Explicit config file, merged on top of the discovered layers.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// How tool confirmations are handled.
    #[arg(long, value_enum)]
    pub approval_mode: Option<ApprovalModeArg>,

    /// Shorthand for `--approval-mode yolo`.
    #[arg(long)]
    pub yolo: bool,

    /// Cap on model↔tool iterations for this prompt.
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Log to stderr (RUNA_LOG / RUST_LOG filters apply).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List models available from the configured provider.
    ListModels,
    /// Print the merged configuration as YAML.
    ShowConfig,
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalModeArg {
    Default,
    AutoEdit,
    Yolo,
}

impl From<ApprovalModeArg> for ApprovalMode {
    fn from(arg: ApprovalModeArg) -> Self {
        match arg {
            ApprovalModeArg::Default => ApprovalMode::Default,
            ApprovalModeArg::AutoEdit => ApprovalMode::AutoEdit,
            ApprovalModeArg::Yolo => ApprovalMode::Yolo,
        }
    }
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_prompt_parses_as_positional() {
        let cli = Cli::parse_from(["runa", "explain this code"]);
        assert_eq!(cli.prompt.as_deref(), Some("explain this code"));
        assert!(cli.command.is_none());
    }

    #[test]
    fn approval_mode_parses_kebab_case() {
        let cli = Cli::parse_from(["runa", "--approval-mode", "auto-edit", "x"]);
        assert_eq!(cli.approval_mode, Some(ApprovalModeArg::AutoEdit));
    }

    #[test]
    fn yolo_flag_is_independent_of_mode() {
        let cli = Cli::parse_from(["runa", "--yolo", "x"]);
        assert!(cli.yolo);
        assert!(cli.approval_mode.is_none());
    }

    #[test]
    fn subcommand_show_config_parses() {
        let cli = Cli::parse_from(["runa", "show-config"]);
        assert!(matches!(cli.command, Some(Commands::ShowConfig)));
    }
}
