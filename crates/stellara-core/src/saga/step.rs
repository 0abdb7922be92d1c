//! Step contract: the interface every saga step implements.
//!
//! Follows the same blanket-impl pattern as the storage ports:
//! 1. `SagaStep` uses RPITIT for `execute` and `compensate`
//! 2. An object-safe `SagaStepDyn` with boxed futures is blanket-implemented
//!    for every `T: SagaStep`
//! 3. `BoxSagaStep` wraps `Arc<dyn SagaStepDyn>` so one definition can hold
//!    heterogeneous steps and hand them to detached attempt tasks

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use stellara_types::error::StepError;

use super::context::WorkflowContext;

/// A single saga step with a forward action and an optional undo action.
///
/// `execute` receives the workflow input and the run context and returns
/// the step's output. That output is recorded and handed back to
/// `compensate` if a later step fails terminally.
///
/// Steps whose side effects are not naturally idempotent should forward
/// [`WorkflowContext::step_idempotency_key`] to whatever they call, since
/// the engine may start a new attempt while an abandoned one is still
/// running.
pub trait SagaStep: Send + Sync + 'static {
    /// Forward action.
    fn execute(
        &self,
        input: &Value,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Undo the forward action, given the output it produced.
    ///
    /// Only called when `has_compensation` returns `true`.
    fn compensate(
        &self,
        input: &Value,
        output: &Value,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        let _ = (input, output, ctx);
        async { Ok(()) }
    }

    /// Reject input this step can never accept, before any attempt runs.
    ///
    /// An error fails the step without calling `execute` and is never
    /// retried; return [`StepError::Validation`] for malformed input. Runs
    /// inline on the orchestrator task, so it must not block.
    fn validate(&self, input: &Value, ctx: &WorkflowContext) -> Result<(), StepError> {
        let _ = (input, ctx);
        Ok(())
    }

    /// Whether this step defines an undo action.
    fn has_compensation(&self) -> bool {
        false
    }
}

/// Boxed, sendable future returned by [`SagaStepDyn`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`SagaStep`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn SagaStepDyn`).
/// A blanket implementation is provided for all types implementing `SagaStep`.
pub trait SagaStepDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, StepError>>;

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a Value,
        output: &'a Value,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<(), StepError>>;

    fn validate(&self, input: &Value, ctx: &WorkflowContext) -> Result<(), StepError>;

    fn has_compensation(&self) -> bool;
}

impl<T: SagaStep> SagaStepDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(SagaStep::execute(self, input, ctx))
    }

    fn compensate_boxed<'a>(
        &'a self,
        input: &'a Value,
        output: &'a Value,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(SagaStep::compensate(self, input, output, ctx))
    }

    fn validate(&self, input: &Value, ctx: &WorkflowContext) -> Result<(), StepError> {
        SagaStep::validate(self, input, ctx)
    }

    fn has_compensation(&self) -> bool {
        SagaStep::has_compensation(self)
    }
}

/// Type-erased, cheaply clonable saga step.
#[derive(Clone)]
pub struct BoxSagaStep {
    inner: Arc<dyn SagaStepDyn>,
}

impl BoxSagaStep {
    pub fn new<T: SagaStep>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn execute(&self, input: &Value, ctx: &WorkflowContext) -> Result<Value, StepError> {
        self.inner.execute_boxed(input, ctx).await
    }

    pub async fn compensate(
        &self,
        input: &Value,
        output: &Value,
        ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        self.inner.compensate_boxed(input, output, ctx).await
    }

    pub fn validate(&self, input: &Value, ctx: &WorkflowContext) -> Result<(), StepError> {
        self.inner.validate(input, ctx)
    }

    pub fn has_compensation(&self) -> bool {
        self.inner.has_compensation()
    }
}

impl std::fmt::Debug for BoxSagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxSagaStep")
            .field("has_compensation", &self.has_compensation())
            .finish()
    }
}
