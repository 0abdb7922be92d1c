//! Saga workflow domain types.
//!
//! Execution tracking types (`WorkflowRun`, `StepExecutionRecord`), the
//! run/step lifecycle state machines, and the request/outcome shapes that
//! cross the engine boundary. Step bodies and definitions live in
//! `stellara-core` because they carry behaviour, not just data.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorKind, InvalidTransition};

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
///
/// ```text
/// Pending -> Running -> Completed
///                    -> Failed                      (nothing to compensate)
///                    -> Compensating -> Compensated
///                                    -> CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl WorkflowRunStatus {
    pub const ALL: [WorkflowRunStatus; 7] = [
        WorkflowRunStatus::Pending,
        WorkflowRunStatus::Running,
        WorkflowRunStatus::Completed,
        WorkflowRunStatus::Failed,
        WorkflowRunStatus::Compensating,
        WorkflowRunStatus::Compensated,
        WorkflowRunStatus::CompensationFailed,
    ];

    /// Terminal runs are retained for idempotency lookups and audit and
    /// are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Completed
                | WorkflowRunStatus::Failed
                | WorkflowRunStatus::Compensated
                | WorkflowRunStatus::CompensationFailed
        )
    }

    pub fn can_transition_to(&self, next: WorkflowRunStatus) -> bool {
        use WorkflowRunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Compensating => "compensating",
            WorkflowRunStatus::Compensated => "compensated",
            WorkflowRunStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowRunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid run status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

/// Status of an individual step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Succeeded,
        StepStatus::Failed,
        StepStatus::Compensated,
        StepStatus::CompensationFailed,
    ];

    /// Only `Succeeded` records are eligible for compensation, and a
    /// compensated record can never be re-entered.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Compensated)
                | (Succeeded, CompensationFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid step status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// The last error observed on a step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A run-level failure, identifying the step it originated from (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.step_name, self.step_index) {
            (Some(name), Some(index)) => {
                write!(f, "{} at step {index} '{name}': {}", self.kind, self.message)
            }
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Step execution record
// ---------------------------------------------------------------------------

/// Execution record for a single step within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Position of the step in its definition (0-based).
    pub step_index: u32,
    pub step_name: String,
    pub status: StepStatus,
    /// Number of execute attempts made (1-based once running).
    pub attempts: u32,
    /// Output of the successful attempt; handed to compensate on rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
}

impl StepExecutionRecord {
    /// A fresh `Pending` record.
    pub fn pending(step_index: u32, step_name: impl Into<String>) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Move the record to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                entity: "step",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workflow run
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: WorkflowRunStatus,
    /// Step records ordered by step index.
    #[serde(default)]
    pub steps: Vec<StepExecutionRecord>,
    /// Snapshot of the execution context (engine fields plus metadata).
    pub context: Value,
    /// Output of the last step, set once the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The failure that stopped forward progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowFailure>,
    /// The compensation failure that left the run inconsistent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<WorkflowFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: Uuid,
        workflow_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            workflow_type: workflow_type.into(),
            idempotency_key: idempotency_key.into(),
            user_id,
            status: WorkflowRunStatus::Pending,
            steps: Vec::new(),
            context: Value::Null,
            result: None,
            error: None,
            compensation_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the run to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: WorkflowRunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                entity: "run",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn step(&self, step_index: u32) -> Option<&StepExecutionRecord> {
        self.steps.iter().find(|r| r.step_index == step_index)
    }

    /// Number of records that reached `Succeeded` (including those later
    /// compensated).
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    StepStatus::Succeeded | StepStatus::Compensated | StepStatus::CompensationFailed
                )
            })
            .count()
    }

    /// Build the caller-facing outcome of a terminal run.
    pub fn to_outcome(&self) -> WorkflowOutcome {
        WorkflowOutcome {
            workflow_id: self.workflow_id,
            workflow_type: self.workflow_type.clone(),
            idempotency_key: self.idempotency_key.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            compensation_error: self.compensation_error.clone(),
            finished_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// A submission to the engine from the job intake collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow_type: String,
    #[serde(default)]
    pub input: Value,
    /// Caller-supplied key; derived from type and input when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl WorkflowRequest {
    pub fn new(workflow_type: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            input,
            idempotency_key: None,
            user_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// How a terminal outcome should be read by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Every step succeeded.
    Succeeded,
    /// Forward progress stopped and every side effect was undone (or none
    /// had happened yet).
    RolledBack,
    /// A compensation failed; state is inconsistent until an operator acts.
    RequiresIntervention,
}

/// Terminal outcome of a workflow run, cached by the idempotency ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub idempotency_key: String,
    pub status: WorkflowRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<WorkflowFailure>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowOutcome {
    pub fn resolution(&self) -> Resolution {
        let interrupted = self
            .error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::Interrupted);
        match self.status {
            WorkflowRunStatus::Completed => Resolution::Succeeded,
            WorkflowRunStatus::CompensationFailed => Resolution::RequiresIntervention,
            _ if interrupted => Resolution::RequiresIntervention,
            _ => Resolution::RolledBack,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_status_happy_path_transitions() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-1", None);
        run.transition(WorkflowRunStatus::Running).unwrap();
        run.transition(WorkflowRunStatus::Completed).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn test_run_status_compensation_path() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-1", None);
        run.transition(WorkflowRunStatus::Running).unwrap();
        run.transition(WorkflowRunStatus::Compensating).unwrap();
        assert!(!run.status.is_terminal());
        run.transition(WorkflowRunStatus::CompensationFailed).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn test_terminal_runs_reject_transitions() {
        for terminal in WorkflowRunStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in WorkflowRunStatus::ALL {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not move to {next}"
                );
            }
        }
    }

    #[test]
    fn test_run_cannot_skip_running() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-1", None);
        let err = run.transition(WorkflowRunStatus::Completed).unwrap_err();
        assert_eq!(err.from, "pending");
        assert_eq!(err.to, "completed");
        assert_eq!(run.status, WorkflowRunStatus::Pending);
    }

    #[test]
    fn test_step_compensated_is_never_reentered() {
        let mut record = StepExecutionRecord::pending(0, "debit");
        record.transition(StepStatus::Running).unwrap();
        record.transition(StepStatus::Succeeded).unwrap();
        record.transition(StepStatus::Compensated).unwrap();
        for next in StepStatus::ALL {
            assert!(record.transition(next).is_err());
        }
    }

    #[test]
    fn test_failed_step_cannot_be_compensated() {
        let mut record = StepExecutionRecord::pending(1, "credit");
        record.transition(StepStatus::Running).unwrap();
        record.transition(StepStatus::Failed).unwrap();
        assert!(record.transition(StepStatus::Compensated).is_err());
    }

    #[test]
    fn test_status_from_str_roundtrip() {
        for status in WorkflowRunStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkflowRunStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        for status in StepStatus::ALL {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("done".parse::<WorkflowRunStatus>().is_err());
    }

    #[test]
    fn test_outcome_resolution_is_three_way() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-1", None);
        run.status = WorkflowRunStatus::Completed;
        assert_eq!(run.to_outcome().resolution(), Resolution::Succeeded);
        run.status = WorkflowRunStatus::Compensated;
        assert_eq!(run.to_outcome().resolution(), Resolution::RolledBack);
        run.status = WorkflowRunStatus::Failed;
        assert_eq!(run.to_outcome().resolution(), Resolution::RolledBack);
        run.status = WorkflowRunStatus::CompensationFailed;
        assert_eq!(run.to_outcome().resolution(), Resolution::RequiresIntervention);
    }

    #[test]
    fn test_abandoned_failed_run_requires_intervention() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-2", None);
        run.status = WorkflowRunStatus::Failed;
        run.error = Some(WorkflowFailure {
            kind: ErrorKind::Interrupted,
            message: "process stopped".to_string(),
            step_index: Some(1),
            step_name: Some("credit".to_string()),
        });
        assert_eq!(run.to_outcome().resolution(), Resolution::RequiresIntervention);
    }

    #[test]
    fn test_workflow_failure_display_names_step() {
        let failure = WorkflowFailure {
            kind: ErrorKind::Permanent,
            message: "card declined".to_string(),
            step_index: Some(2),
            step_name: Some("charge".to_string()),
        };
        assert_eq!(failure.to_string(), "permanent at step 2 'charge': card declined");
    }

    #[test]
    fn test_request_deserialize_with_defaults() {
        let req: WorkflowRequest =
            serde_json::from_value(json!({"workflow_type": "tts"})).unwrap();
        assert_eq!(req.workflow_type, "tts");
        assert!(req.input.is_null());
        assert!(req.idempotency_key.is_none());
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn test_run_json_roundtrip_keeps_records() {
        let mut run = WorkflowRun::new(Uuid::now_v7(), "transfer", "key-1", Some("u-1".into()));
        let mut record = StepExecutionRecord::pending(0, "debit");
        record.output = Some(json!({"ledger_entry": 7}));
        run.steps.push(record);
        let parsed: WorkflowRun = serde_json::from_str(&serde_json::to_string(&run).unwrap()).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].output, Some(json!({"ledger_entry": 7})));
        assert_eq!(parsed.user_id.as_deref(), Some("u-1"));
    }
}
