//! Saga engine core: step contract, retry/timeout control, and orchestration.
//!
//! - `step` -- Step trait (`SagaStep`) and its type-erased wrapper
//! - `context` -- Per-run context with engine-owned identity and shared metadata
//! - `definition` -- Step/workflow definitions, validation, and the type registry
//! - `retry` -- Backoff policy and per-step attempt state machine
//! - `executor` -- Runs one step with deadlines and retries; invokes compensation
//! - `checkpoint` -- Persists every run/step transition through the store
//! - `ledger` -- In-memory idempotency ledger and key derivation
//! - `memory_store` -- In-memory workflow store
//! - `orchestrator` -- Submission, forward execution, and reverse compensation

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod ledger;
pub mod memory_store;
pub mod orchestrator;
pub mod retry;
pub mod step;

pub use context::WorkflowContext;
pub use definition::{StepDefinition, WorkflowDefinition, WorkflowError, WorkflowRegistry};
pub use ledger::{InMemoryLedger, derive_idempotency_key};
pub use memory_store::InMemoryWorkflowStore;
pub use orchestrator::{
    AbandonedRun, Accepted, OrchestratorError, Recovery, RunHandle, SagaOrchestrator, Submission,
};
pub use step::{BoxSagaStep, SagaStep};
