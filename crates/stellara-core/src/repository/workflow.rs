//! Workflow store trait definition.
//!
//! Durable record of workflow runs and their step execution records, written
//! after every state transition so a restarted process can report the last
//! known state of every run. The infrastructure layer (stellara-infra)
//! implements this trait with SQLite persistence.

use stellara_types::error::RepositoryError;
use stellara_types::workflow::{StepExecutionRecord, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

/// Repository trait for workflow run persistence.
///
/// Implementations must make each call atomic per `workflow_id` and must
/// refuse to modify a run (or its step records) once the stored run is
/// terminal, returning `RepositoryError::Conflict`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record. Fails with `Conflict` if the ID exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite a run's status, context snapshot, result and errors.
    ///
    /// Step records are written separately through `upsert_step`.
    fn update_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run with its step records ordered by step index.
    fn get_run(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by status.
    ///
    /// Step records are not loaded; use `get_run` for the full record.
    fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// List runs left in a non-terminal status (crash reporting), oldest first.
    fn list_unfinished_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace the record at `(workflow_id, record.step_index)`.
    fn upsert_step(
        &self,
        workflow_id: &Uuid,
        record: &StepExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
