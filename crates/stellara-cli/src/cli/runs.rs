//! CLI subcommands for workflow runs: list, show, interrupted, abandon.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use stellara_core::repository::workflow::WorkflowStore;
use stellara_core::saga::AbandonedRun;
use stellara_types::workflow::{WorkflowFailure, WorkflowRun, WorkflowRunStatus};

use super::{format_time, run_status_cell, step_status_cell};
use crate::state::AppState;

fn parse_status(s: &str) -> Result<WorkflowRunStatus, String> {
    s.parse()
}

/// Run inspection subcommands.
#[derive(Subcommand)]
pub enum RunsCommand {
    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs in this status (e.g. running, compensation_failed).
        #[arg(long, value_parser = parse_status)]
        status: Option<WorkflowRunStatus>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its step records.
    Show {
        /// Workflow run UUID.
        workflow_id: String,
    },

    /// List runs left in a non-terminal status (e.g. after a crash).
    Interrupted,

    /// Mark an interrupted run failed and free its idempotency key.
    Abandon {
        /// Workflow run UUID.
        workflow_id: String,

        /// Skip the check that the run has been idle for `stale_run_secs`.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a runs subcommand.
pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunsCommand::List { status, limit } => handle_list(state, status, limit, json).await,
        RunsCommand::Show { workflow_id } => handle_show(state, &workflow_id, json).await,
        RunsCommand::Interrupted => handle_interrupted(state, json).await,
        RunsCommand::Abandon { workflow_id, force } => {
            handle_abandon(state, &workflow_id, force, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    state: &AppState,
    status: Option<WorkflowRunStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let runs = state
        .orchestrator
        .store()
        .list_runs(status, limit)
        .await
        .context("failed to list runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        match status {
            Some(status) => println!("  No runs with status '{status}'."),
            None => println!("  No runs recorded yet."),
        }
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Updated"),
            Cell::new("Error"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(run.workflow_id),
            Cell::new(&run.workflow_type),
            run_status_cell(run.status),
            Cell::new(format_time(&run.created_at)),
            Cell::new(format_time(&run.updated_at)),
            Cell::new(run.error.as_ref().map(failure_summary).unwrap_or_default()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

fn parse_run_id(target: &str) -> Result<Uuid> {
    target
        .parse()
        .with_context(|| format!("'{target}' is not a valid run ID"))
}

async fn handle_show(state: &AppState, target: &str, json: bool) -> Result<()> {
    let workflow_id = parse_run_id(target)?;

    let Some(run) = state
        .orchestrator
        .get_run(workflow_id)
        .await
        .context("failed to load run")?
    else {
        bail!("Run '{workflow_id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    display_run(&run)
}

fn display_run(run: &WorkflowRun) -> Result<()> {
    println!();
    println!(
        "  {} Run {} ({})",
        style("*").bold(),
        style(run.workflow_id).cyan(),
        run.workflow_type
    );
    println!("  Status:          {}", status_style(run.status));
    println!("  Idempotency key: {}", style(&run.idempotency_key).dim());
    if let Some(user_id) = &run.user_id {
        println!("  User:            {user_id}");
    }
    println!("  Created:         {}", format_time(&run.created_at));
    println!("  Updated:         {}", format_time(&run.updated_at));

    if let Some(error) = &run.error {
        println!("  Error:           {}", style(error).red());
    }
    if let Some(error) = &run.compensation_error {
        println!(
            "  {}  {}",
            style("Compensation failed:").red().bold(),
            style(error).red()
        );
        println!(
            "  {}",
            style("Side effects of the remaining succeeded steps were not undone.").yellow()
        );
    }
    if let Some(result) = &run.result {
        println!("  Result:          {}", serde_json::to_string(result)?);
    }
    println!();

    if run.steps.is_empty() {
        println!("  No step records.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Started"),
            Cell::new("Finished"),
            Cell::new("Last error"),
        ]);

    for record in &run.steps {
        table.add_row(vec![
            Cell::new(record.step_index),
            Cell::new(&record.step_name),
            step_status_cell(record.status),
            Cell::new(record.attempts),
            Cell::new(record.started_at.as_ref().map(format_time).unwrap_or_default()),
            Cell::new(record.finished_at.as_ref().map(format_time).unwrap_or_default()),
            Cell::new(
                record
                    .last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.kind, e.message))
                    .unwrap_or_default(),
            ),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Interrupted
// ---------------------------------------------------------------------------

async fn handle_interrupted(state: &AppState, json: bool) -> Result<()> {
    let runs = state
        .orchestrator
        .interrupted_runs()
        .await
        .context("failed to list interrupted runs")?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|run| {
                let last = run.steps.last();
                serde_json::json!({
                    "workflow_id": run.workflow_id,
                    "workflow_type": run.workflow_type,
                    "status": run.status,
                    "idempotency_key": run.idempotency_key,
                    "last_step_index": last.map(|r| r.step_index),
                    "last_step_name": last.map(|r| r.step_name.as_str()),
                    "last_step_status": last.map(|r| r.status),
                    "updated_at": run.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  {} No interrupted runs.", style("✓").green());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Last step"),
            Cell::new("Step status"),
            Cell::new("Updated"),
        ]);

    for run in &runs {
        let last = run.steps.last();
        table.add_row(vec![
            Cell::new(run.workflow_id),
            Cell::new(&run.workflow_type),
            run_status_cell(run.status),
            Cell::new(
                last.map(|r| format!("{} ({})", r.step_name, r.step_index))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            last.map(|r| step_status_cell(r.status))
                .unwrap_or_else(|| Cell::new("-")),
            Cell::new(format_time(&run.updated_at)),
        ]);
    }

    println!();
    println!(
        "  {} {} run(s) stopped before reaching a terminal status:",
        style("!").yellow().bold(),
        runs.len()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Abandon
// ---------------------------------------------------------------------------

async fn handle_abandon(state: &AppState, target: &str, force: bool, json: bool) -> Result<()> {
    let workflow_id = parse_run_id(target)?;
    let abandoned = state
        .orchestrator
        .abandon_run(workflow_id, force)
        .await
        .with_context(|| format!("failed to abandon run '{workflow_id}'"))?;

    if json {
        println!("{}", abandoned_json(&abandoned));
    } else {
        display_abandoned(&abandoned);
    }
    Ok(())
}

pub(crate) fn abandoned_json(abandoned: &AbandonedRun) -> serde_json::Value {
    serde_json::json!({
        "workflow_id": abandoned.run.workflow_id,
        "idempotency_key": abandoned.run.idempotency_key,
        "status": abandoned.run.status,
        "released": abandoned.released,
    })
}

pub(crate) fn display_abandoned(abandoned: &AbandonedRun) {
    let run = &abandoned.run;
    println!();
    println!(
        "  {} Run {} abandoned as {}",
        style("!").yellow().bold(),
        style(run.workflow_id).cyan(),
        status_style(run.status)
    );
    if abandoned.released {
        println!(
            "  Key '{}' is free for a new submission.",
            style(&run.idempotency_key).cyan()
        );
    } else {
        println!(
            "  Key '{}' was not held by this run.",
            style(&run.idempotency_key).dim()
        );
    }
    println!(
        "  {}",
        style("Effects of its steps are unknown and may need manual reconciliation.").yellow()
    );
    println!();
}

fn failure_summary(failure: &WorkflowFailure) -> String {
    match &failure.step_name {
        Some(step) => format!("{} at '{step}'", failure.kind),
        None => failure.kind.to_string(),
    }
}

fn status_style(status: WorkflowRunStatus) -> console::StyledObject<WorkflowRunStatus> {
    match status {
        WorkflowRunStatus::Completed => style(status).green(),
        WorkflowRunStatus::Failed | WorkflowRunStatus::CompensationFailed => style(status).red(),
        WorkflowRunStatus::Compensating | WorkflowRunStatus::Compensated => style(status).yellow(),
        WorkflowRunStatus::Pending | WorkflowRunStatus::Running => style(status).cyan(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellara_types::error::ErrorKind;

    #[test]
    fn test_failure_summary_names_step() {
        let failure = WorkflowFailure {
            kind: ErrorKind::Timeout,
            message: "attempt timed out after 20 ms".to_string(),
            step_index: Some(1),
            step_name: Some("charge".to_string()),
        };
        assert_eq!(failure_summary(&failure), "timeout at 'charge'");

        let failure = WorkflowFailure {
            step_index: None,
            step_name: None,
            ..failure
        };
        assert_eq!(failure_summary(&failure), "timeout");
    }

    #[test]
    fn test_status_parser_accepts_snake_case_names() {
        assert_eq!(
            parse_status("compensation_failed").unwrap(),
            WorkflowRunStatus::CompensationFailed
        );
        assert!(parse_status("Completed").is_err());
    }

    #[test]
    fn test_rejects_malformed_run_id() {
        let err = parse_run_id("order-42").unwrap_err();
        assert!(err.to_string().contains("not a valid run ID"));
        assert!(parse_run_id(&Uuid::now_v7().to_string()).is_ok());
    }
}
