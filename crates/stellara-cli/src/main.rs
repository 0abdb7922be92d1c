//! Stellara operator CLI entry point.
//!
//! Binary name: `stlr`
//!
//! Parses CLI arguments, initializes tracing and the database, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use anyhow::anyhow;
use clap::Parser;
use clap_complete::generate;
use stellara_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stellara=debug",
        _ => "trace",
    };

    init_tracing(TracingOptions {
        otel: cli.otel,
        json: cli.log_json,
        default_filter: Some(filter.to_string()),
    })
    .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stlr", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Runs { action } => cli::runs::handle_runs_command(action, &state, cli.json).await,
        Commands::Ledger { action } => {
            cli::ledger::handle_ledger_command(action, &state, cli.json).await
        }
        Commands::Config => cli::config::show_config(&state, cli.json),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    state.pool.close().await;
    shutdown_tracing();
    result
}
