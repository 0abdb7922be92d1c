use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure the saga engine can observe.
///
/// Persisted alongside failed step records and terminal outcomes, so the
/// serialized names are part of the storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input to a step. Never retried.
    Validation,
    /// An attempt exceeded its deadline. Retried up to policy.
    Timeout,
    /// The step signalled a retryable failure.
    Transient,
    /// The step signalled a non-retryable failure.
    Permanent,
    /// A compensate call failed. Terminal, requires an operator.
    Compensation,
    /// No definition is registered for the requested workflow type.
    UnknownWorkflowType,
    /// The run was cancelled at a step boundary.
    Cancelled,
    /// The run was left non-terminal by a stopped process and abandoned
    /// by an operator. Side effects of its steps are unknown.
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Compensation => "compensation",
            ErrorKind::UnknownWorkflowType => "unknown_workflow_type",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a step's execute or compensate body.
///
/// Step authors pick the variant that describes how the engine should
/// react: `Transient` is retried, `Validation` and `Permanent` are not.
/// `Timeout` is produced by the engine itself when an attempt overruns.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("invalid step input: {0}")]
    Validation(String),

    #[error("transient step failure: {0}")]
    Transient(String),

    #[error("permanent step failure: {0}")]
    Permanent(String),

    #[error("attempt timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
}

impl StepError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StepError::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StepError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StepError::Permanent(msg.into())
    }

    /// The persisted classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Transient(_) => ErrorKind::Transient,
            StepError::Permanent(_) => ErrorKind::Permanent,
            StepError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether another attempt may be made (subject to the retry budget).
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_) | StepError::Timeout { .. })
    }
}

/// Errors from repository operations (store and ledger ports in stellara-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A state-machine transition that the run or step lifecycle forbids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}
