//! CLI subcommands for the idempotency ledger: show, list, sweep, release.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stellara_core::repository::idempotency::IdempotencyLedger;
use stellara_core::saga::Recovery;
use stellara_types::idempotency::{LedgerEntry, LedgerState};

use super::runs::{abandoned_json, display_abandoned};
use super::{format_time, run_status_cell};
use crate::state::AppState;

/// Ledger subcommands.
#[derive(Subcommand)]
pub enum LedgerCommand {
    /// Show the live entry for an idempotency key.
    Show {
        /// Idempotency key (caller-supplied or derived).
        key: String,
    },

    /// List ledger entries, newest reservation first (expired included).
    #[command(alias = "ls")]
    List {
        /// Maximum number of entries to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Delete entries whose retention window has passed.
    Sweep,

    /// Free a key still held by a run that no process is executing.
    ///
    /// The owning run is marked failed (interrupted) first. Refused while
    /// the run is executing in this process or has checkpointed within
    /// `stale_run_secs`.
    Release {
        /// Idempotency key (caller-supplied or derived).
        key: String,

        /// Skip the idle check.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a ledger subcommand.
pub async fn handle_ledger_command(
    cmd: LedgerCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        LedgerCommand::Show { key } => handle_show(state, &key, json).await,
        LedgerCommand::List { limit } => handle_list(state, limit, json).await,
        LedgerCommand::Sweep => handle_sweep(state, json).await,
        LedgerCommand::Release { key, force } => handle_release(state, &key, force, json).await,
    }
}

async fn handle_show(state: &AppState, key: &str, json: bool) -> Result<()> {
    let entry = state
        .orchestrator
        .ledger()
        .get(key, Utc::now())
        .await
        .context("failed to read ledger")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }

    let Some(entry) = entry else {
        println!();
        println!("  No live ledger entry for '{}'.", style(key).cyan());
        println!("  A new submission with this key would start a fresh run.");
        println!();
        return Ok(());
    };

    display_entry(&entry);
    Ok(())
}

fn display_entry(entry: &LedgerEntry) {
    println!();
    println!(
        "  {} Ledger entry '{}'",
        style("*").bold(),
        style(&entry.idempotency_key).cyan()
    );
    println!("  Run:      {}", entry.workflow_id);
    println!("  Type:     {}", entry.workflow_type);
    println!("  State:    {}", state_label(entry.state));
    println!("  Reserved: {}", format_time(&entry.reserved_at));
    if let Some(expires_at) = &entry.expires_at {
        println!("  Expires:  {}", format_time(expires_at));
    }
    if let Some(outcome) = &entry.outcome {
        println!("  Status:   {}", outcome.status);
        println!("  Outcome:  {:?}", outcome.resolution());
        if let Some(error) = &outcome.error {
            println!("  Error:    {}", style(error).red());
        }
        if let Some(error) = &outcome.compensation_error {
            println!("  Compensation error: {}", style(error).red());
        }
    }
    println!();
}

async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let entries = state
        .orchestrator
        .ledger()
        .list_entries(limit)
        .await
        .context("failed to list ledger entries")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  Ledger is empty.");
        println!();
        return Ok(());
    }

    let now = Utc::now();
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Key").fg(Color::Cyan),
            Cell::new("Run ID"),
            Cell::new("Type"),
            Cell::new("State"),
            Cell::new("Run status"),
            Cell::new("Expires"),
        ]);

    for entry in &entries {
        let expires = match &entry.expires_at {
            Some(at) if entry.is_expired(now) => format!("{} (expired)", format_time(at)),
            Some(at) => format_time(at),
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&entry.idempotency_key),
            Cell::new(entry.workflow_id),
            Cell::new(&entry.workflow_type),
            Cell::new(entry.state.as_str()),
            entry
                .outcome
                .as_ref()
                .map(|o| run_status_cell(o.status))
                .unwrap_or_else(|| Cell::new("-")),
            Cell::new(expires),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_sweep(state: &AppState, json: bool) -> Result<()> {
    let purged = state
        .orchestrator
        .ledger()
        .purge_expired(Utc::now())
        .await
        .context("failed to sweep ledger")?;

    if json {
        println!("{}", serde_json::json!({ "purged": purged }));
    } else {
        println!();
        println!(
            "  {} Purged {} expired ledger entr{}",
            style("*").green().bold(),
            style(purged).bold(),
            if purged == 1 { "y" } else { "ies" }
        );
        println!();
    }
    Ok(())
}

async fn handle_release(state: &AppState, key: &str, force: bool, json: bool) -> Result<()> {
    let recovery = state
        .orchestrator
        .release_reservation(key, force)
        .await
        .with_context(|| format!("failed to release '{key}'"))?;

    match recovery {
        Recovery::Abandoned(abandoned) => {
            if json {
                println!("{}", abandoned_json(&abandoned));
            } else {
                display_abandoned(&abandoned);
            }
        }
        Recovery::OutcomeCached(outcome) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "key": key, "cached": true, "status": outcome.status })
                );
            } else {
                println!();
                println!(
                    "  {} Run {} had already finished as {}; its outcome is now cached under '{}'.",
                    style("*").green().bold(),
                    outcome.workflow_id,
                    outcome.status,
                    style(key).cyan()
                );
                println!();
            }
        }
        Recovery::ReservationReleased { workflow_id } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "key": key, "workflow_id": workflow_id, "released": true })
                );
            } else {
                println!();
                println!(
                    "  {} Released '{}' (run {} was never recorded).",
                    style("*").green().bold(),
                    style(key).cyan(),
                    workflow_id
                );
                println!();
            }
        }
    }
    Ok(())
}

fn state_label(state: LedgerState) -> console::StyledObject<&'static str> {
    match state {
        LedgerState::InProgress => style(state.as_str()).cyan(),
        LedgerState::Completed => style(state.as_str()).green(),
    }
}
