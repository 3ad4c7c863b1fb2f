//! Clap derive structures for the `portward` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use portward_core::FirewallMode;

// ── Top-level CLI ────────────────────────────────────────────────────

/// portward -- keep cloud firewalls in step with declared workload ports
#[derive(Debug, Parser)]
#[command(
    name = "portward",
    version,
    about = "Firewall reconciliation worker",
    long_about = "Watches an orchestrator's model for machines, units, and their\n\
        opened port ranges, and drives the cloud provider's network-security\n\
        layer to match: ports become reachable only while the owning\n\
        application is exposed, and close when workloads depart.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the settings file
    #[arg(long, short = 'c', env = "PORTWARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Subcommands ──────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconciliation worker until stopped
    Run(RunArgs),

    /// Validate configuration and print the effective settings
    CheckConfig,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Override the configured firewall mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// One firewall per cloud instance
    Instance,
    /// One environment-global firewall, reference-counted across machines
    Global,
}

impl From<ModeArg> for FirewallMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Instance => Self::Instance,
            ModeArg::Global => Self::Global,
        }
    }
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}
