//! Command-line surface. Everything operational is env-driven; the flags here
//! only control the launcher's own behavior.

use clap::{Parser, Subcommand};

use crate::color::ColorMode;

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Run diagnostics: binaries, paths, identity and interception preconditions
    Doctor,
}

#[derive(Parser, Debug)]
#[command(
    name = "meshrun",
    version,
    about = "Launch and supervise a mesh proxy agent (and optionally the application) inside this instance.",
    override_usage = "meshrun [OPTIONS] [-- APP_CMD [APP_ARGS...]]",
    args_conflicts_with_subcommands = true,
    after_long_help = "Examples:\n  meshrun\n  meshrun -- /usr/local/bin/server --port 8080\n  meshrun --dry-run --verbose\n  meshrun doctor\n"
)]
pub struct Cli {
    /// Print detailed execution info
    #[arg(long)]
    pub verbose: bool,

    /// Resolve, decide and print what would run, but do not spawn anything
    #[arg(long)]
    pub dry_run: bool,

    /// Suppress startup banner output
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum)]
    pub color: Option<ColorMode>,

    /// Application command to launch alongside the agent
    #[arg(trailing_var_arg = true)]
    pub app: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Cmd>,
}
