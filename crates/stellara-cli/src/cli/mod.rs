//! CLI command definitions for the `stlr` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI follows a
//! noun-verb pattern (e.g., `stlr runs list`, `stlr ledger sweep`).

pub mod config;
pub mod ledger;
pub mod runs;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use stellara_types::workflow::{StepStatus, WorkflowRunStatus};

/// Inspect saga runs and the idempotency ledger.
#[derive(Parser)]
#[command(name = "stlr", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs as newline-delimited JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STELLARA_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect workflow runs and their step records.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Inspect or sweep the idempotency ledger.
    Ledger {
        #[command(subcommand)]
        action: ledger::LedgerCommand,
    },

    /// Show the resolved engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Colored table cell for a run status.
pub(crate) fn run_status_cell(status: WorkflowRunStatus) -> Cell {
    let color = match status {
        WorkflowRunStatus::Completed => Color::Green,
        WorkflowRunStatus::Pending | WorkflowRunStatus::Running => Color::Cyan,
        WorkflowRunStatus::Compensating | WorkflowRunStatus::Compensated => Color::Yellow,
        WorkflowRunStatus::Failed | WorkflowRunStatus::CompensationFailed => Color::Red,
    };
    Cell::new(status).fg(color)
}

/// Colored table cell for a step status.
pub(crate) fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Succeeded => Color::Green,
        StepStatus::Pending | StepStatus::Running => Color::Cyan,
        StepStatus::Compensated => Color::Yellow,
        StepStatus::Failed | StepStatus::CompensationFailed => Color::Red,
    };
    Cell::new(status).fg(color)
}

/// Short local timestamp for tables.
pub(crate) fn format_time(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
