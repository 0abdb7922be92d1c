//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `stellara-core` using sqlx with split
//! read/write pools. Runs live in `workflow_runs`; step execution records in
//! `workflow_steps`, keyed by `(workflow_id, step_index)`. Context, output
//! and failure values are stored as JSON text.

use stellara_core::repository::workflow::WorkflowStore;
use stellara_types::error::RepositoryError;
use stellara_types::workflow::{
    StepExecutionRecord, StepFailure, WorkflowFailure, WorkflowRun, WorkflowRunStatus,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, parse_datetime, parse_uuid, query_error, to_json};

/// `status NOT IN (...)` guard shared by every mutating statement.
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'compensated', 'compensation_failed')";

const RUN_COLUMNS: &str = "workflow_id, workflow_type, idempotency_key, user_id, status, \
     context, result, error, compensation_error, created_at, updated_at";

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, workflow_id: &str) -> Result<Vec<StepExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT step_index, step_name, status, attempts, output, started_at, finished_at, last_error \
             FROM workflow_steps WHERE workflow_id = ? ORDER BY step_index ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(query_error)?.into_record())
            .collect()
    }

    /// Distinguish a missing run from a frozen one after a guarded write matched nothing.
    async fn explain_noop(&self, workflow_id: &Uuid) -> RepositoryError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE workflow_id = ?")
                .bind(workflow_id.to_string())
                .fetch_optional(&self.pool.writer)
                .await;
        match status {
            Ok(Some(status)) => {
                RepositoryError::Conflict(format!("run {workflow_id} is terminal ({status})"))
            }
            Ok(None) => RepositoryError::NotFound,
            Err(e) => query_error(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    workflow_id: String,
    workflow_type: String,
    idempotency_key: String,
    user_id: Option<String>,
    status: String,
    context: String,
    result: Option<String>,
    error: Option<String>,
    compensation_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            workflow_type: row.try_get("workflow_type")?,
            idempotency_key: row.try_get("idempotency_key")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            compensation_error: row.try_get("compensation_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self, steps: Vec<StepExecutionRecord>) -> Result<WorkflowRun, RepositoryError> {
        let status: WorkflowRunStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(WorkflowRun {
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_type: self.workflow_type,
            idempotency_key: self.idempotency_key,
            user_id: self.user_id,
            status,
            steps,
            context: from_json(&self.context, "context")?,
            result: self
                .result
                .as_deref()
                .map(|s| from_json(s, "result"))
                .transpose()?,
            error: self
                .error
                .as_deref()
                .map(|s| from_json::<WorkflowFailure>(s, "error"))
                .transpose()?,
            compensation_error: self
                .compensation_error
                .as_deref()
                .map(|s| from_json::<WorkflowFailure>(s, "compensation_error"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    step_index: i64,
    step_name: String,
    status: String,
    attempts: i64,
    output: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_index: row.try_get("step_index")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    fn into_record(self) -> Result<StepExecutionRecord, RepositoryError> {
        let step_index = u32::try_from(self.step_index)
            .map_err(|_| RepositoryError::Query(format!("invalid step_index: {}", self.step_index)))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| RepositoryError::Query(format!("invalid attempts: {}", self.attempts)))?;

        Ok(StepExecutionRecord {
            step_index,
            step_name: self.step_name,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            attempts,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "output"))
                .transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            last_error: self
                .last_error
                .as_deref()
                .map(|s| from_json::<StepFailure>(s, "last_error"))
                .transpose()?,
        })
    }
}

fn optional_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

async fn write_step<'e, E>(
    executor: E,
    workflow_id: &str,
    record: &StepExecutionRecord,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"INSERT INTO workflow_steps
           (workflow_id, step_index, step_name, status, attempts, output, started_at, finished_at, last_error)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(workflow_id, step_index) DO UPDATE SET
             step_name = excluded.step_name,
             status = excluded.status,
             attempts = excluded.attempts,
             output = excluded.output,
             started_at = excluded.started_at,
             finished_at = excluded.finished_at,
             last_error = excluded.last_error"#,
    )
    .bind(workflow_id)
    .bind(i64::from(record.step_index))
    .bind(&record.step_name)
    .bind(record.status.as_str())
    .bind(i64::from(record.attempts))
    .bind(optional_json(record.output.as_ref())?)
    .bind(record.started_at.as_ref().map(format_datetime))
    .bind(record.finished_at.as_ref().map(format_datetime))
    .bind(optional_json(record.last_error.as_ref())?)
    .execute(executor)
    .await
    .map_err(query_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowStore implementation
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let workflow_id = run.workflow_id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (workflow_id, workflow_type, idempotency_key, user_id, status, context,
                result, error, compensation_error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&workflow_id)
        .bind(&run.workflow_type)
        .bind(&run.idempotency_key)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(to_json(&run.context)?)
        .bind(optional_json(run.result.as_ref())?)
        .bind(optional_json(run.error.as_ref())?)
        .bind(optional_json(run.compensation_error.as_ref())?)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return Err(RepositoryError::Conflict(format!(
                        "run {workflow_id} already exists"
                    )));
                }
            }
            return Err(query_error(e));
        }

        for record in &run.steps {
            write_step(&mut *tx, &workflow_id, record).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let sql = format!(
            "UPDATE workflow_runs SET status = ?, context = ?, result = ?, error = ?, \
             compensation_error = ?, updated_at = ? \
             WHERE workflow_id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(run.status.as_str())
            .bind(to_json(&run.context)?)
            .bind(optional_json(run.result.as_ref())?)
            .bind(optional_json(run.error.as_ref())?)
            .bind(optional_json(run.compensation_error.as_ref())?)
            .bind(format_datetime(&run.updated_at))
            .bind(run.workflow_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.explain_noop(&run.workflow_id).await);
        }
        Ok(())
    }

    async fn get_run(&self, workflow_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let id = workflow_id.to_string();
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ?"
        ))
        .bind(&id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let run_row = RunRow::from_row(&row).map_err(query_error)?;
                let steps = self.load_steps(&id).await?;
                Ok(Some(run_row.into_run(steps)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = ? \
                     ORDER BY created_at DESC, workflow_id DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs \
                     ORDER BY created_at DESC, workflow_id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run(Vec::new()))
            .collect()
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status NOT IN {TERMINAL_STATUSES} \
             ORDER BY created_at ASC, workflow_id ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let run_row = RunRow::from_row(row).map_err(query_error)?;
            let steps = self.load_steps(&run_row.workflow_id).await?;
            runs.push(run_row.into_run(steps)?);
        }
        Ok(runs)
    }

    async fn upsert_step(
        &self,
        workflow_id: &Uuid,
        record: &StepExecutionRecord,
    ) -> Result<(), RepositoryError> {
        let id = workflow_id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE workflow_id = ?")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        let status: WorkflowRunStatus = status
            .ok_or(RepositoryError::NotFound)?
            .parse()
            .map_err(RepositoryError::Query)?;
        if status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {workflow_id} is terminal ({status})"
            )));
        }

        write_step(&mut *tx, &id, record).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }
}
