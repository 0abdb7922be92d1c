//! Event types for the saga engine event bus.
//!
//! `SagaEvent` is the unified event type broadcast while runs execute.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::workflow::WorkflowRunStatus;

/// Coarse progress checkpoints reported while a step is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Dequeued,
    Validating,
    Executing,
    Finalizing,
    Done,
}

/// Events emitted during saga execution.
///
/// Observability only: no engine decision depends on a subscriber
/// receiving them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaEvent {
    /// A run was accepted past idempotency dedup and has started.
    RunStarted {
        workflow_id: Uuid,
        workflow_type: String,
        idempotency_key: String,
    },

    /// A submission hit an existing reservation or cached outcome.
    DuplicateSubmission {
        idempotency_key: String,
        workflow_id: Uuid,
        cached: bool,
    },

    /// A step began its first attempt.
    StepStarted {
        workflow_id: Uuid,
        step_index: u32,
        step_name: String,
    },

    /// A progress checkpoint within a step.
    StepProgress {
        workflow_id: Uuid,
        step_index: u32,
        phase: ProgressPhase,
        attempt: u32,
    },

    /// A single attempt failed.
    AttemptFailed {
        workflow_id: Uuid,
        step_index: u32,
        attempt: u32,
        kind: ErrorKind,
        error: String,
        will_retry: bool,
    },

    /// A step reached `Succeeded`.
    StepSucceeded {
        workflow_id: Uuid,
        step_index: u32,
        step_name: String,
        attempts: u32,
        duration_ms: u64,
    },

    /// A step reached terminal `Failed`.
    StepFailed {
        workflow_id: Uuid,
        step_index: u32,
        step_name: String,
        kind: ErrorKind,
        error: String,
    },

    /// Forward progress stopped and rollback began.
    CompensationStarted {
        workflow_id: Uuid,
        steps_to_compensate: u32,
    },

    /// A succeeded step was undone (or had nothing to undo).
    StepCompensated {
        workflow_id: Uuid,
        step_index: u32,
        step_name: String,
    },

    /// A compensate call failed; rollback stopped.
    CompensationFailed {
        workflow_id: Uuid,
        step_index: u32,
        step_name: String,
        error: String,
    },

    /// A run reached a terminal status.
    RunFinished {
        workflow_id: Uuid,
        workflow_type: String,
        status: WorkflowRunStatus,
        duration_ms: u64,
    },
}

impl SagaEvent {
    /// The run this event belongs to.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            SagaEvent::RunStarted { workflow_id, .. }
            | SagaEvent::DuplicateSubmission { workflow_id, .. }
            | SagaEvent::StepStarted { workflow_id, .. }
            | SagaEvent::StepProgress { workflow_id, .. }
            | SagaEvent::AttemptFailed { workflow_id, .. }
            | SagaEvent::StepSucceeded { workflow_id, .. }
            | SagaEvent::StepFailed { workflow_id, .. }
            | SagaEvent::CompensationStarted { workflow_id, .. }
            | SagaEvent::StepCompensated { workflow_id, .. }
            | SagaEvent::CompensationFailed { workflow_id, .. }
            | SagaEvent::RunFinished { workflow_id, .. } => *workflow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = SagaEvent::StepProgress {
            workflow_id: Uuid::nil(),
            step_index: 1,
            phase: ProgressPhase::Finalizing,
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_progress\""));
        assert!(json.contains("\"phase\":\"finalizing\""));
        let parsed: SagaEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, SagaEvent::StepProgress { attempt: 2, .. }));
    }

    #[test]
    fn test_run_finished_carries_status() {
        let event = SagaEvent::RunFinished {
            workflow_id: Uuid::nil(),
            workflow_type: "transfer".to_string(),
            status: WorkflowRunStatus::CompensationFailed,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"compensation_failed\""));
    }

    #[test]
    fn test_workflow_id_accessor() {
        let id = Uuid::now_v7();
        let event = SagaEvent::CompensationStarted {
            workflow_id: id,
            steps_to_compensate: 2,
        };
        assert_eq!(event.workflow_id(), id);
    }
}
