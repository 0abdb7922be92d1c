//! Durable checkpoint manager for saga execution state.
//!
//! Wraps a `WorkflowStore` and is called after every run or step state
//! transition, so a restarted process can report the last known state of
//! each run.

use stellara_types::error::RepositoryError;
use stellara_types::workflow::{StepExecutionRecord, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run and step checkpoints.
///
/// Generic over `S: WorkflowStore` so it works with any storage backend
/// (SQLite, in-memory, etc.). Every transition is written before the
/// orchestrator moves forward.
pub struct CheckpointManager<S: WorkflowStore> {
    store: S,
}

impl<S: WorkflowStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a newly accepted run.
    pub async fn checkpoint_run_created(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.store.create_run(run).await?;
        tracing::debug!(
            workflow_id = %run.workflow_id,
            workflow_type = run.workflow_type.as_str(),
            "checkpointed run created"
        );
        Ok(())
    }

    /// Record the run's current status, context, result and errors.
    pub async fn checkpoint_run(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.store.update_run(run).await?;
        tracing::debug!(
            workflow_id = %run.workflow_id,
            status = %run.status,
            "checkpointed run"
        );
        Ok(())
    }

    /// Record one step's execution record.
    pub async fn checkpoint_step(
        &self,
        workflow_id: Uuid,
        record: &StepExecutionRecord,
    ) -> Result<(), CheckpointError> {
        self.store.upsert_step(&workflow_id, record).await?;
        tracing::debug!(
            workflow_id = %workflow_id,
            step_index = record.step_index,
            step = record.step_name.as_str(),
            status = %record.status,
            attempts = record.attempts,
            "checkpointed step"
        );
        Ok(())
    }

    /// Load a run with its step records.
    pub async fn load_run(&self, workflow_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.store
            .get_run(&workflow_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(workflow_id))
    }

    /// Runs left in a non-terminal status by a previous process.
    pub async fn interrupted_runs(&self) -> Result<Vec<WorkflowRun>, CheckpointError> {
        let runs = self.store.list_unfinished_runs().await?;
        let runs: Vec<WorkflowRun> = runs
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        if !runs.is_empty() {
            let running = runs
                .iter()
                .filter(|r| r.status == WorkflowRunStatus::Running)
                .count();
            tracing::info!(
                count = runs.len(),
                running,
                "found interrupted workflow runs"
            );
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}
