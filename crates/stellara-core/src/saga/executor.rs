//! Step executor: runs one step to a terminal status.
//!
//! Every attempt is spawned as its own tokio task and awaited under the
//! step's deadline. When the deadline passes the executor stops waiting and
//! moves on to retry bookkeeping; the abandoned task is left to finish on
//! its own because step bodies are not assumed to be cancel-safe. A step
//! body that panics fails its attempt permanently.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use stellara_types::error::StepError;
use stellara_types::event::{ProgressPhase, SagaEvent};
use stellara_types::workflow::{StepExecutionRecord, StepFailure, StepStatus};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::definition::StepDefinition;
use super::retry::{BackoffPolicy, RetryController, saturating_millis};
use crate::event::EventBus;

/// Terminal result of running one step.
#[derive(Debug, Clone)]
pub enum StepRun {
    /// The step succeeded with this output.
    Succeeded(Value),
    /// The step failed terminally with its last error.
    Failed(StepError),
    /// Cancellation was observed between attempts.
    Cancelled,
}

/// Engine-wide defaults for steps that do not declare their own policy.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            default_max_retries: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Runs steps with bounded attempts, backoff, and per-attempt deadlines.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    policy: StepPolicy,
    event_bus: EventBus,
}

impl StepExecutor {
    pub fn new(policy: StepPolicy, event_bus: EventBus) -> Self {
        Self { policy, event_bus }
    }

    pub fn policy(&self) -> &StepPolicy {
        &self.policy
    }

    fn timeout_for(&self, step: &StepDefinition) -> Duration {
        step.declared_timeout().unwrap_or(self.policy.default_timeout)
    }

    fn max_retries_for(&self, step: &StepDefinition) -> u32 {
        step.declared_max_retries()
            .unwrap_or(self.policy.default_max_retries)
    }

    /// Drive `step` from `Running` to `Succeeded` or `Failed`.
    ///
    /// A `Pending` record is moved to `Running` first. On return the record
    /// holds the attempt count, the output or last error, and the finish
    /// time. `ctx` has its retry count advanced before every retry.
    pub async fn run(
        &self,
        step: &StepDefinition,
        input: &Value,
        ctx: &mut WorkflowContext,
        record: &mut StepExecutionRecord,
        cancel: &CancellationToken,
    ) -> StepRun {
        let workflow_id = ctx.workflow_id();
        let step_index = record.step_index;
        let timeout = self.timeout_for(step);
        let mut controller = RetryController::new(self.max_retries_for(step), self.policy.backoff);
        let started = Instant::now();

        if record.status == StepStatus::Pending {
            finish_transition(record, StepStatus::Running);
            record.started_at = Some(Utc::now());
        }
        self.progress(workflow_id, step_index, ProgressPhase::Dequeued, 0);

        self.progress(workflow_id, step_index, ProgressPhase::Validating, 0);
        if let Err(error) = step.step().validate(input, ctx) {
            record.last_error = Some(StepFailure::new(error.kind(), error.to_string()));
            tracing::warn!(
                workflow_id = %workflow_id,
                step_index,
                step = step.name(),
                error = %error,
                "step input rejected before first attempt"
            );
            return self.fail(workflow_id, step, record, error);
        }

        loop {
            let attempt = controller.begin_attempt();
            record.attempts = attempt;

            self.progress(workflow_id, step_index, ProgressPhase::Executing, attempt);

            let body = step.step().clone();
            let attempt_input = input.clone();
            let attempt_ctx = ctx.clone();
            let result = run_detached(timeout, async move {
                body.execute(&attempt_input, &attempt_ctx).await
            })
            .await;

            let error = match result {
                Ok(output) => {
                    self.progress(workflow_id, step_index, ProgressPhase::Finalizing, attempt);
                    finish(record, StepStatus::Succeeded);
                    record.output = Some(output.clone());
                    record.last_error = None;

                    let duration_ms = saturating_millis(started.elapsed());
                    tracing::info!(
                        workflow_id = %workflow_id,
                        step_index,
                        step = step.name(),
                        attempts = attempt,
                        duration_ms,
                        "step succeeded"
                    );
                    self.event_bus.publish(SagaEvent::StepSucceeded {
                        workflow_id,
                        step_index,
                        step_name: step.name().to_string(),
                        attempts: attempt,
                        duration_ms,
                    });
                    self.progress(workflow_id, step_index, ProgressPhase::Done, attempt);
                    return StepRun::Succeeded(output);
                }
                Err(error) => error,
            };

            record.last_error = Some(StepFailure::new(error.kind(), error.to_string()));
            let will_retry = controller.should_retry(&error);

            tracing::warn!(
                workflow_id = %workflow_id,
                step_index,
                step = step.name(),
                attempt,
                kind = %error.kind(),
                error = %error,
                will_retry,
                "step attempt failed"
            );
            self.event_bus.publish(SagaEvent::AttemptFailed {
                workflow_id,
                step_index,
                attempt,
                kind: error.kind(),
                error: error.to_string(),
                will_retry,
            });

            if !will_retry {
                return self.fail(workflow_id, step, record, error);
            }

            if matches!(error, StepError::Timeout { .. }) && !step.is_idempotent() {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    step = step.name(),
                    "retrying non-idempotent step while its timed-out attempt may still be running"
                );
            }

            let delay = controller.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(step, record),
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                return self.cancelled(step, record);
            }
            ctx.record_retry();
        }
    }

    /// Invoke the step's compensate action under the step's deadline.
    ///
    /// Compensation is attempted exactly once.
    pub async fn compensate(
        &self,
        step: &StepDefinition,
        input: &Value,
        output: &Value,
        ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        let body = step.step().clone();
        let input = input.clone();
        let output = output.clone();
        let ctx = ctx.clone();
        run_detached(self.timeout_for(step), async move {
            body.compensate(&input, &output, &ctx).await
        })
        .await
    }

    fn fail(
        &self,
        workflow_id: Uuid,
        step: &StepDefinition,
        record: &mut StepExecutionRecord,
        error: StepError,
    ) -> StepRun {
        finish(record, StepStatus::Failed);
        self.event_bus.publish(SagaEvent::StepFailed {
            workflow_id,
            step_index: record.step_index,
            step_name: step.name().to_string(),
            kind: error.kind(),
            error: error.to_string(),
        });
        StepRun::Failed(error)
    }

    fn cancelled(&self, step: &StepDefinition, record: &mut StepExecutionRecord) -> StepRun {
        finish(record, StepStatus::Failed);
        tracing::info!(
            step_index = record.step_index,
            step = step.name(),
            "step abandoned between attempts: run cancelled"
        );
        StepRun::Cancelled
    }

    fn progress(&self, workflow_id: Uuid, step_index: u32, phase: ProgressPhase, attempt: u32) {
        self.event_bus.publish(SagaEvent::StepProgress {
            workflow_id,
            step_index,
            phase,
            attempt,
        });
    }
}

fn finish(record: &mut StepExecutionRecord, status: StepStatus) {
    finish_transition(record, status);
    record.finished_at = Some(Utc::now());
}

fn finish_transition(record: &mut StepExecutionRecord, status: StepStatus) {
    if let Err(e) = record.transition(status) {
        tracing::error!(error = %e, step_index = record.step_index, "step record out of sync");
    }
}

/// Run `fut` on its own task and wait at most `timeout` for it.
async fn run_detached<T, F>(timeout: Duration, fut: F) -> Result<T, StepError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StepError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StepError::permanent(format!("step body panicked: {join_err}"))),
        Err(_) => Err(StepError::Timeout {
            after_ms: saturating_millis(timeout),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::step::SagaStep;
    use serde_json::{json, Map};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stellara_types::error::ErrorKind;

    /// Fails transiently until `succeed_on` attempts have been made.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    impl SagaStep for Flaky {
        async fn execute(&self, _input: &Value, ctx: &WorkflowContext) -> Result<Value, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(json!({ "call": call, "retry_count": ctx.retry_count() }))
            } else {
                Err(StepError::transient("upstream unavailable"))
            }
        }
    }

    struct Slow(Duration);

    impl SagaStep for Slow {
        async fn execute(&self, _input: &Value, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }

        async fn compensate(
            &self,
            _input: &Value,
            _output: &Value,
            _ctx: &WorkflowContext,
        ) -> Result<(), StepError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn has_compensation(&self) -> bool {
            true
        }
    }

    /// Only accepts a positive `amount`.
    struct Picky {
        calls: Arc<AtomicU32>,
    }

    impl SagaStep for Picky {
        async fn execute(&self, input: &Value, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(input["amount"].clone())
        }

        fn validate(&self, input: &Value, _ctx: &WorkflowContext) -> Result<(), StepError> {
            match input["amount"].as_i64() {
                Some(amount) if amount > 0 => Ok(()),
                _ => Err(StepError::validation("amount must be positive")),
            }
        }
    }

    struct Panics;

    impl SagaStep for Panics {
        async fn execute(&self, _input: &Value, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            panic!("step body bug");
        }
    }

    fn executor(backoff: BackoffPolicy) -> StepExecutor {
        StepExecutor::new(
            StepPolicy {
                default_timeout: Duration::from_secs(5),
                default_max_retries: 0,
                backoff,
            },
            EventBus::new(64),
        )
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(uuid::Uuid::now_v7(), "key", "test", None, Map::new())
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = StepDefinition::new(
            "flaky",
            Flaky {
                calls: Arc::clone(&calls),
                succeed_on: 3,
            },
        )
        .max_retries(2);
        let mut ctx = ctx();
        let mut record = StepExecutionRecord::pending(0, "flaky");

        let run = executor(BackoffPolicy::none())
            .run(&step, &Value::Null, &mut ctx, &mut record, &CancellationToken::new())
            .await;

        match run {
            StepRun::Succeeded(output) => assert_eq!(output["retry_count"], 2),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(record.status, StepStatus::Succeeded);
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.is_none());
        assert!(record.finished_at.is_some());
        assert_eq!(ctx.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = StepDefinition::new(
            "flaky",
            Flaky {
                calls: Arc::clone(&calls),
                succeed_on: u32::MAX,
            },
        )
        .max_retries(3);
        let mut record = StepExecutionRecord::pending(0, "flaky");

        let run = executor(BackoffPolicy::fixed(Duration::from_millis(1)))
            .run(&step, &Value::Null, &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        assert!(matches!(run, StepRun::Failed(StepError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(record.attempts, 4);
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_attempt_past_deadline_is_a_timeout() {
        let step = StepDefinition::new("slow", Slow(Duration::from_millis(500)))
            .timeout(Duration::from_millis(20));
        let mut record = StepExecutionRecord::pending(0, "slow");

        let run = executor(BackoffPolicy::none())
            .run(&step, &Value::Null, &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        assert!(matches!(run, StepRun::Failed(StepError::Timeout { after_ms: 20 })));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_panicking_step_fails_permanently_without_retry() {
        let step = StepDefinition::new("panics", Panics).max_retries(5);
        let mut record = StepExecutionRecord::pending(0, "panics");

        let run = executor(BackoffPolicy::none())
            .run(&step, &Value::Null, &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        assert!(matches!(run, StepRun::Failed(StepError::Permanent(_))));
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_observed_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = StepDefinition::new(
            "flaky",
            Flaky {
                calls: Arc::clone(&calls),
                succeed_on: u32::MAX,
            },
        )
        .max_retries(10);
        let mut record = StepExecutionRecord::pending(0, "flaky");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = executor(BackoffPolicy::fixed(Duration::from_secs(10)))
            .run(&step, &Value::Null, &mut ctx(), &mut record, &cancel)
            .await;

        assert!(matches!(run, StepRun::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_events_report_progress_and_failed_attempts() {
        let exec = executor(BackoffPolicy::none());
        let mut events = exec.event_bus.subscribe();
        let step = StepDefinition::new(
            "flaky",
            Flaky {
                calls: Arc::new(AtomicU32::new(0)),
                succeed_on: 2,
            },
        )
        .max_retries(1);
        let mut record = StepExecutionRecord::pending(4, "flaky");

        exec.run(&step, &Value::Null, &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        let mut phases = Vec::new();
        let mut failed_attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SagaEvent::StepProgress { phase, .. } => phases.push(phase),
                SagaEvent::AttemptFailed { attempt, will_retry, .. } => {
                    failed_attempts.push((attempt, will_retry))
                }
                _ => {}
            }
        }
        assert_eq!(
            phases,
            vec![
                ProgressPhase::Dequeued,
                ProgressPhase::Validating,
                ProgressPhase::Executing,
                ProgressPhase::Executing,
                ProgressPhase::Finalizing,
                ProgressPhase::Done,
            ]
        );
        assert_eq!(failed_attempts, vec![(1, true)]);
    }

    #[tokio::test]
    async fn test_rejected_input_fails_before_any_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = StepDefinition::new(
            "picky",
            Picky {
                calls: Arc::clone(&calls),
            },
        )
        .max_retries(5);
        let exec = executor(BackoffPolicy::none());
        let mut events = exec.event_bus.subscribe();
        let mut record = StepExecutionRecord::pending(0, "picky");

        let run = exec
            .run(&step, &json!({"amount": -3}), &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        assert!(matches!(run, StepRun::Failed(StepError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Validation);

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SagaEvent::StepProgress { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(phases, vec![ProgressPhase::Dequeued, ProgressPhase::Validating]);
    }

    #[tokio::test]
    async fn test_accepted_input_runs_normally() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = StepDefinition::new(
            "picky",
            Picky {
                calls: Arc::clone(&calls),
            },
        );
        let mut record = StepExecutionRecord::pending(0, "picky");

        let run = executor(BackoffPolicy::none())
            .run(&step, &json!({"amount": 7}), &mut ctx(), &mut record, &CancellationToken::new())
            .await;

        assert!(matches!(run, StepRun::Succeeded(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_compensation_past_deadline_times_out() {
        let step = StepDefinition::new("slow", Slow(Duration::from_millis(500)))
            .timeout(Duration::from_millis(20));
        let err = executor(BackoffPolicy::none())
            .compensate(&step, &Value::Null, &Value::Null, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
