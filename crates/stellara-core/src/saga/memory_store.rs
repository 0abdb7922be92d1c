//! In-memory `WorkflowStore` for tests and embedded use.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stellara_types::error::RepositoryError;
use stellara_types::workflow::{StepExecutionRecord, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

/// `WorkflowStore` backed by a `DashMap`. Not durable.
///
/// Each call holds the shard lock for its run, so writes are atomic per
/// `workflow_id`.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    runs: DashMap<Uuid, WorkflowRun>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

fn terminal_conflict(run: &WorkflowRun) -> RepositoryError {
    RepositoryError::Conflict(format!(
        "run {} is terminal ({})",
        run.workflow_id, run.status
    ))
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        match self.runs.entry(run.workflow_id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.workflow_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut stored = self
            .runs
            .get_mut(&run.workflow_id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Err(terminal_conflict(&stored));
        }
        stored.status = run.status;
        stored.context = run.context.clone();
        stored.result = run.result.clone();
        stored.error = run.error.clone();
        stored.compensation_error = run.compensation_error.clone();
        stored.updated_at = run.updated_at;
        Ok(())
    }

    async fn get_run(&self, workflow_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(workflow_id).map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(|r| {
                let mut run = r.value().clone();
                run.steps.clear();
                run
            })
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.workflow_id.cmp(&a.workflow_id))
        });
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        Ok(runs)
    }

    async fn upsert_step(
        &self,
        workflow_id: &Uuid,
        record: &StepExecutionRecord,
    ) -> Result<(), RepositoryError> {
        let mut stored = self
            .runs
            .get_mut(workflow_id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Err(terminal_conflict(&stored));
        }
        match stored
            .steps
            .iter_mut()
            .find(|r| r.step_index == record.step_index)
        {
            Some(existing) => *existing = record.clone(),
            None => {
                stored.steps.push(record.clone());
                stored.steps.sort_by_key(|r| r.step_index);
            }
        }
        Ok(())
    }
}
