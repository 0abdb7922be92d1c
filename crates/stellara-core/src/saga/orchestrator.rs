//! Saga orchestrator: drives a workflow definition through its steps.
//!
//! A submission is first deduplicated against the idempotency ledger. A
//! reserved submission becomes a `WorkflowRun` whose steps execute strictly
//! in definition order. If a step fails terminally, or the run is cancelled
//! at a step boundary, every step that already succeeded is compensated in
//! reverse order. The terminal outcome is cached in the ledger under the
//! idempotency key for the configured retention window.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use stellara_types::config::EngineConfig;
use stellara_types::error::{ErrorKind, InvalidTransition, RepositoryError};
use stellara_types::event::SagaEvent;
use stellara_types::idempotency::{LedgerState, Reservation};
use stellara_types::workflow::{
    StepExecutionRecord, StepFailure, StepStatus, WorkflowFailure, WorkflowOutcome,
    WorkflowRequest, WorkflowRun, WorkflowRunStatus,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::WorkflowContext;
use super::definition::{WorkflowDefinition, WorkflowError, WorkflowRegistry};
use super::executor::{StepExecutor, StepPolicy, StepRun};
use super::ledger::derive_idempotency_key;
use super::retry::{BackoffPolicy, saturating_millis};
use crate::event::EventBus;
use crate::repository::idempotency::IdempotencyLedger;
use crate::repository::workflow::WorkflowStore;

/// Upper bound on the idempotency retention window (100 years).
const MAX_RETENTION_DAYS: i64 = 36_500;

// ---------------------------------------------------------------------------
// Submission results
// ---------------------------------------------------------------------------

/// Result of a blocking [`SagaOrchestrator::submit`].
#[derive(Debug, Clone)]
pub enum Submission {
    /// This call executed the run to a terminal status.
    Finished(WorkflowOutcome),
    /// Another run holds the idempotency key and has not finished.
    InProgress { workflow_id: Uuid },
    /// A run with this key already finished; its cached outcome.
    Cached(WorkflowOutcome),
}

impl Submission {
    /// The terminal outcome, if one is available.
    pub fn outcome(&self) -> Option<&WorkflowOutcome> {
        match self {
            Submission::Finished(outcome) | Submission::Cached(outcome) => Some(outcome),
            Submission::InProgress { .. } => None,
        }
    }

    /// The run that owns this submission's idempotency key.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            Submission::Finished(outcome) | Submission::Cached(outcome) => outcome.workflow_id,
            Submission::InProgress { workflow_id } => *workflow_id,
        }
    }
}

/// Result of a non-blocking [`SagaOrchestrator::spawn`].
#[derive(Debug)]
pub enum Accepted {
    /// A new run was started on its own task.
    Started(RunHandle),
    /// Another run holds the idempotency key and has not finished.
    InProgress { workflow_id: Uuid },
    /// A run with this key already finished; its cached outcome.
    Cached(WorkflowOutcome),
}

/// Handle to a run executing on its own task.
#[derive(Debug)]
pub struct RunHandle {
    workflow_id: Uuid,
    idempotency_key: String,
    handle: JoinHandle<Result<WorkflowOutcome, OrchestratorError>>,
}

impl RunHandle {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<WorkflowOutcome, OrchestratorError> {
        self.handle
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))?
    }
}

/// A non-terminal run that an operator closed out.
#[derive(Debug, Clone)]
pub struct AbandonedRun {
    /// The run as persisted after abandonment.
    pub run: WorkflowRun,
    /// Whether the run's in-progress reservation was removed from the ledger.
    pub released: bool,
}

/// What [`SagaOrchestrator::release_reservation`] did to free a key.
#[derive(Debug, Clone)]
pub enum Recovery {
    /// The owning run was abandoned.
    Abandoned(AbandonedRun),
    /// The owning run had already finished; its outcome is now cached.
    OutcomeCached(WorkflowOutcome),
    /// The key was reserved but no run record was ever written.
    ReservationReleased { workflow_id: Uuid },
}

/// A reserved run, ready to execute.
struct PreparedRun {
    definition: Arc<WorkflowDefinition>,
    run: WorkflowRun,
    ctx: WorkflowContext,
    input: Value,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

enum Prepared {
    Ready(Box<PreparedRun>),
    InProgress { workflow_id: Uuid },
    Cached(WorkflowOutcome),
}

// ---------------------------------------------------------------------------
// SagaOrchestrator
// ---------------------------------------------------------------------------

/// Executes saga workflows against a workflow store and idempotency ledger.
///
/// Generic over the storage ports so the same engine runs on the in-memory
/// adapters in tests and on SQLite in production.
pub struct SagaOrchestrator<S: WorkflowStore, L: IdempotencyLedger> {
    registry: WorkflowRegistry,
    checkpoints: CheckpointManager<S>,
    ledger: L,
    executor: StepExecutor,
    event_bus: EventBus,
    retention: chrono::Duration,
    /// Idle time after which a non-terminal run may be abandoned unforced.
    stale_after: chrono::Duration,
    /// Per-type concurrency limits, keyed by workflow type.
    limits: DashMap<String, Arc<Semaphore>>,
    /// Cancellation tokens of runs executing in this process.
    active: DashMap<Uuid, CancellationToken>,
}

impl<S: WorkflowStore, L: IdempotencyLedger> SagaOrchestrator<S, L> {
    pub fn new(store: S, ledger: L, config: &EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let policy = StepPolicy {
            default_timeout: std::time::Duration::from_secs(config.default_step_timeout_secs),
            default_max_retries: config.default_max_retries,
            backoff: BackoffPolicy::from(&config.backoff),
        };
        let retention = i64::try_from(config.idempotency_retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(MAX_RETENTION_DAYS))
            .min(chrono::Duration::days(MAX_RETENTION_DAYS));
        let stale_after = i64::try_from(config.stale_run_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(MAX_RETENTION_DAYS));

        Self {
            registry: WorkflowRegistry::new(),
            checkpoints: CheckpointManager::new(store),
            ledger,
            executor: StepExecutor::new(policy, event_bus.clone()),
            event_bus,
            retention,
            stale_after,
            limits: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Register a workflow definition. Each type can be registered once.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), OrchestratorError> {
        let workflow_type = definition.workflow_type().to_string();
        let limit = definition.concurrency_limit();
        self.registry.register(definition)?;
        if let Some(limit) = limit {
            self.limits
                .insert(workflow_type, Arc::new(Semaphore::new(limit as usize)));
        }
        Ok(())
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &S {
        self.checkpoints.store()
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Submit a request and wait for its terminal outcome.
    ///
    /// Duplicate submissions return the owning run's state instead of
    /// starting a second execution.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<Submission, OrchestratorError> {
        match self.prepare(request).await? {
            Prepared::Ready(prepared) => Ok(Submission::Finished(self.drive(*prepared).await?)),
            Prepared::InProgress { workflow_id } => Ok(Submission::InProgress { workflow_id }),
            Prepared::Cached(outcome) => Ok(Submission::Cached(outcome)),
        }
    }

    /// Request cancellation of a run executing in this process.
    ///
    /// Honoured at the next step or attempt boundary; a step attempt in
    /// flight is never interrupted. Returns `false` if the run is not
    /// active here.
    pub fn cancel(&self, workflow_id: Uuid) -> bool {
        match self.active.get(&workflow_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(workflow_id = %workflow_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether a run is executing in this process.
    pub fn is_active(&self, workflow_id: Uuid) -> bool {
        self.active.contains_key(&workflow_id)
    }

    /// Read a run and its step records from the store.
    pub async fn get_run(&self, workflow_id: Uuid) -> Result<Option<WorkflowRun>, OrchestratorError> {
        match self.checkpoints.load_run(workflow_id).await {
            Ok(run) => Ok(Some(run)),
            Err(CheckpointError::RunNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs left non-terminal in the store that are not executing here,
    /// e.g. after a crash. They are reported, not resumed.
    pub async fn interrupted_runs(&self) -> Result<Vec<WorkflowRun>, OrchestratorError> {
        let runs = self.checkpoints.interrupted_runs().await?;
        Ok(runs
            .into_iter()
            .filter(|run| !self.active.contains_key(&run.workflow_id))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Close out a run that a stopped process left non-terminal and free
    /// its idempotency key.
    ///
    /// Any step caught mid-attempt is marked `Failed`. A run that was
    /// compensating ends `CompensationFailed`, any other ends `Failed`; both
    /// carry an `Interrupted` failure and resolve to requiring intervention,
    /// since nothing is known about the side effects of the step in flight.
    ///
    /// Refused while the run executes in this process, and, unless `force`
    /// is set, while its last checkpoint is more recent than the configured
    /// stale-run window (another process may still be driving it).
    pub async fn abandon_run(
        &self,
        workflow_id: Uuid,
        force: bool,
    ) -> Result<AbandonedRun, OrchestratorError> {
        if self.active.contains_key(&workflow_id) {
            return Err(OrchestratorError::RunActive(workflow_id));
        }
        let mut run = self
            .get_run(workflow_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(workflow_id))?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::RunAlreadyTerminal {
                workflow_id,
                status: run.status,
            });
        }
        self.ensure_stale(workflow_id, run.updated_at, force)?;

        let message = "run interrupted before reaching a terminal status; abandoned by operator";
        let in_flight: Vec<StepExecutionRecord> = run
            .steps
            .iter()
            .filter(|r| r.status == StepStatus::Running)
            .cloned()
            .collect();
        for mut record in in_flight {
            record.transition(StepStatus::Failed)?;
            record.last_error = Some(StepFailure::new(ErrorKind::Interrupted, message));
            record.finished_at = Some(Utc::now());
            self.save_step(&mut run, &record).await?;
        }

        let last_step = run.steps.iter().max_by_key(|r| r.step_index);
        let failure = WorkflowFailure {
            kind: ErrorKind::Interrupted,
            message: message.to_string(),
            step_index: last_step.map(|r| r.step_index),
            step_name: last_step.map(|r| r.step_name.clone()),
        };
        if run.status == WorkflowRunStatus::Compensating {
            run.compensation_error = Some(failure);
            run.transition(WorkflowRunStatus::CompensationFailed)?;
        } else {
            run.error = Some(failure);
            run.transition(WorkflowRunStatus::Failed)?;
        }
        self.checkpoints.checkpoint_run(&run).await?;

        let released = self
            .ledger
            .release(&run.idempotency_key, workflow_id)
            .await
            .map_err(OrchestratorError::Ledger)?;

        tracing::warn!(
            workflow_id = %workflow_id,
            idempotency_key = run.idempotency_key.as_str(),
            status = %run.status,
            released,
            forced = force,
            "abandoned interrupted workflow run"
        );
        self.event_bus.publish(SagaEvent::RunFinished {
            workflow_id,
            workflow_type: run.workflow_type.clone(),
            status: run.status,
            duration_ms: u64::try_from((run.updated_at - run.created_at).num_milliseconds())
                .unwrap_or(0),
        });
        Ok(AbandonedRun { run, released })
    }

    /// Free an idempotency key held by an in-progress reservation whose
    /// owner is gone.
    ///
    /// The owning run is abandoned if it is still non-terminal. If it had
    /// already finished (the process stopped between its final checkpoint
    /// and caching the outcome) the outcome is cached now. A reservation
    /// with no run record is released outright. The same staleness rule as
    /// [`abandon_run`](Self::abandon_run) applies, measured from the
    /// reservation time when there is no run.
    pub async fn release_reservation(
        &self,
        key: &str,
        force: bool,
    ) -> Result<Recovery, OrchestratorError> {
        let entry = self
            .ledger
            .get(key, Utc::now())
            .await
            .map_err(OrchestratorError::Ledger)?
            .filter(|entry| entry.state == LedgerState::InProgress)
            .ok_or_else(|| OrchestratorError::NotReserved(key.to_string()))?;
        let owner = entry.workflow_id;

        match self.get_run(owner).await? {
            Some(run) if run.status.is_terminal() => {
                let outcome = run.to_outcome();
                self.ledger
                    .complete(key, &outcome, run.updated_at + self.retention)
                    .await
                    .map_err(OrchestratorError::Ledger)?;
                tracing::info!(
                    idempotency_key = key,
                    workflow_id = %owner,
                    status = %run.status,
                    "cached outcome of finished run holding a stale reservation"
                );
                Ok(Recovery::OutcomeCached(outcome))
            }
            Some(_) => Ok(Recovery::Abandoned(self.abandon_run(owner, force).await?)),
            None => {
                if self.active.contains_key(&owner) {
                    return Err(OrchestratorError::RunActive(owner));
                }
                self.ensure_stale(owner, entry.reserved_at, force)?;
                self.ledger
                    .release(key, owner)
                    .await
                    .map_err(OrchestratorError::Ledger)?;
                tracing::warn!(
                    idempotency_key = key,
                    workflow_id = %owner,
                    "released reservation without a run record"
                );
                Ok(Recovery::ReservationReleased { workflow_id: owner })
            }
        }
    }

    fn ensure_stale(
        &self,
        workflow_id: Uuid,
        last_change: DateTime<Utc>,
        force: bool,
    ) -> Result<(), OrchestratorError> {
        let idle = Utc::now() - last_change;
        if force || idle >= self.stale_after {
            return Ok(());
        }
        Err(OrchestratorError::RunRecentlyUpdated {
            workflow_id,
            idle_secs: idle.num_seconds().max(0),
            stale_after_secs: self.stale_after.num_seconds(),
        })
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    async fn prepare(&self, request: WorkflowRequest) -> Result<Prepared, OrchestratorError> {
        let WorkflowRequest {
            workflow_type,
            input,
            idempotency_key,
            user_id,
            metadata,
        } = request;

        let definition = self
            .registry
            .get(&workflow_type)
            .ok_or_else(|| OrchestratorError::UnknownWorkflowType(workflow_type.clone()))?;

        let key = idempotency_key.unwrap_or_else(|| derive_idempotency_key(&workflow_type, &input));
        let workflow_id = Uuid::now_v7();

        let reservation = self
            .ledger
            .reserve_or_fetch(&key, workflow_id, &workflow_type, Utc::now())
            .await
            .map_err(OrchestratorError::Ledger)?;

        match reservation {
            Reservation::Reserved => {}
            Reservation::InProgress { workflow_id: owner } => {
                self.duplicate(&key, owner, false);
                return Ok(Prepared::InProgress { workflow_id: owner });
            }
            Reservation::Cached(outcome) => {
                self.duplicate(&key, outcome.workflow_id, true);
                return Ok(Prepared::Cached(outcome));
            }
        }

        let semaphore = self
            .limits
            .get(&workflow_type)
            .map(|s| Arc::clone(s.value()));
        let permit = match semaphore {
            Some(semaphore) => match semaphore.try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let limit = definition.concurrency_limit().unwrap_or_default();
                    self.release(&key, workflow_id).await;
                    tracing::warn!(
                        workflow_type = workflow_type.as_str(),
                        limit,
                        "workflow submission rejected: concurrency limit reached"
                    );
                    return Err(OrchestratorError::ConcurrencyLimitReached {
                        workflow_type,
                        limit,
                    });
                }
            },
            None => None,
        };

        let ctx = WorkflowContext::new(
            workflow_id,
            key.clone(),
            workflow_type.clone(),
            user_id.clone(),
            metadata,
        );
        let mut run = WorkflowRun::new(workflow_id, workflow_type, key.clone(), user_id);
        run.context = ctx.to_json();

        if let Err(e) = self.checkpoints.checkpoint_run_created(&run).await {
            self.release(&key, workflow_id).await;
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        self.active.insert(workflow_id, cancel.clone());

        Ok(Prepared::Ready(Box::new(PreparedRun {
            definition,
            run,
            ctx,
            input,
            cancel,
            _permit: permit,
        })))
    }

    fn duplicate(&self, key: &str, owner: Uuid, cached: bool) {
        tracing::info!(
            idempotency_key = key,
            workflow_id = %owner,
            cached,
            "duplicate workflow submission"
        );
        self.event_bus.publish(SagaEvent::DuplicateSubmission {
            idempotency_key: key.to_string(),
            workflow_id: owner,
            cached,
        });
    }

    /// Drop a reservation for a run that never started.
    async fn release(&self, key: &str, workflow_id: Uuid) {
        if let Err(e) = self.ledger.release(key, workflow_id).await {
            tracing::error!(
                idempotency_key = key,
                workflow_id = %workflow_id,
                error = %e,
                "failed to release idempotency reservation"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn drive(&self, prepared: PreparedRun) -> Result<WorkflowOutcome, OrchestratorError> {
        let PreparedRun {
            definition,
            mut run,
            mut ctx,
            input,
            cancel,
            _permit,
        } = prepared;
        let started = Instant::now();
        let workflow_id = run.workflow_id;

        let result = self
            .execute_saga(&definition, &mut run, &mut ctx, &input, &cancel)
            .await;
        self.active.remove(&workflow_id);

        if let Err(e) = result {
            // The reservation stays in progress until an operator abandons
            // the run: steps may have side effects to reconcile first.
            tracing::error!(
                workflow_id = %workflow_id,
                status = %run.status,
                error = %e,
                "workflow run aborted by an engine error"
            );
            return Err(e);
        }

        let outcome = run.to_outcome();
        self.ledger
            .complete(&run.idempotency_key, &outcome, Utc::now() + self.retention)
            .await
            .map_err(OrchestratorError::Ledger)?;

        let duration_ms = saturating_millis(started.elapsed());
        tracing::info!(
            workflow_id = %workflow_id,
            workflow_type = run.workflow_type.as_str(),
            status = %run.status,
            duration_ms,
            "workflow run finished"
        );
        self.event_bus.publish(SagaEvent::RunFinished {
            workflow_id,
            workflow_type: run.workflow_type.clone(),
            status: run.status,
            duration_ms,
        });
        Ok(outcome)
    }

    async fn execute_saga(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        ctx: &mut WorkflowContext,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let workflow_id = run.workflow_id;
        run.transition(WorkflowRunStatus::Running)?;
        self.checkpoints.checkpoint_run(run).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            workflow_type = run.workflow_type.as_str(),
            idempotency_key = run.idempotency_key.as_str(),
            steps = definition.steps().len(),
            "workflow run started"
        );
        self.event_bus.publish(SagaEvent::RunStarted {
            workflow_id,
            workflow_type: run.workflow_type.clone(),
            idempotency_key: run.idempotency_key.clone(),
        });

        let mut last_output = None;
        let mut failure = None;

        for (index, step) in definition.steps().iter().enumerate() {
            let step_index = index as u32;
            if cancel.is_cancelled() {
                failure = Some(cancelled_failure(step_index, step.name()));
                break;
            }

            ctx.enter_step(step_index);
            let mut record = StepExecutionRecord::pending(step_index, step.name());
            self.save_step(run, &record).await?;

            record.transition(StepStatus::Running)?;
            record.started_at = Some(Utc::now());
            self.save_step(run, &record).await?;
            self.event_bus.publish(SagaEvent::StepStarted {
                workflow_id,
                step_index,
                step_name: step.name().to_string(),
            });

            let step_run = self.executor.run(step, input, ctx, &mut record, cancel).await;
            self.save_step(run, &record).await?;

            match step_run {
                StepRun::Succeeded(output) => last_output = Some(output),
                StepRun::Failed(error) => {
                    failure = Some(WorkflowFailure {
                        kind: error.kind(),
                        message: error.to_string(),
                        step_index: Some(step_index),
                        step_name: Some(step.name().to_string()),
                    });
                    break;
                }
                StepRun::Cancelled => {
                    failure = Some(cancelled_failure(step_index, step.name()));
                    break;
                }
            }
        }

        run.context = ctx.to_json();
        match failure {
            None => {
                run.result = last_output;
                run.transition(WorkflowRunStatus::Completed)?;
                self.checkpoints.checkpoint_run(run).await?;
            }
            Some(failure) => {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    failure = %failure,
                    "workflow forward progress stopped"
                );
                run.error = Some(failure);
                if run.steps.iter().any(|r| r.status == StepStatus::Succeeded) {
                    run.transition(WorkflowRunStatus::Compensating)?;
                    self.checkpoints.checkpoint_run(run).await?;
                    self.compensate(definition, run, ctx, input).await?;
                } else {
                    run.transition(WorkflowRunStatus::Failed)?;
                }
                run.context = ctx.to_json();
                self.checkpoints.checkpoint_run(run).await?;
            }
        }
        Ok(())
    }

    /// Undo succeeded steps in strictly descending step order, stopping at
    /// the first compensation failure.
    async fn compensate(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        ctx: &mut WorkflowContext,
        input: &Value,
    ) -> Result<(), OrchestratorError> {
        let workflow_id = run.workflow_id;
        let mut targets: Vec<u32> = run
            .steps
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| r.step_index)
            .collect();
        targets.sort_unstable_by(|a, b| b.cmp(a));

        tracing::info!(
            workflow_id = %workflow_id,
            steps = targets.len(),
            "compensating workflow run"
        );
        self.event_bus.publish(SagaEvent::CompensationStarted {
            workflow_id,
            steps_to_compensate: targets.len() as u32,
        });

        for step_index in targets {
            let step = definition
                .steps()
                .get(step_index as usize)
                .ok_or(OrchestratorError::StepMissing(step_index))?;
            ctx.enter_step(step_index);

            let mut record = run
                .step(step_index)
                .cloned()
                .ok_or(OrchestratorError::StepMissing(step_index))?;
            let output = record.output.clone().unwrap_or(Value::Null);

            let result = if step.has_compensation() {
                self.executor.compensate(step, input, &output, ctx).await
            } else {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    step = step.name(),
                    "step has no compensate action"
                );
                Ok(())
            };

            match result {
                Ok(()) => {
                    record.transition(StepStatus::Compensated)?;
                    self.save_step(run, &record).await?;
                    self.event_bus.publish(SagaEvent::StepCompensated {
                        workflow_id,
                        step_index,
                        step_name: step.name().to_string(),
                    });
                }
                Err(error) => {
                    let message = error.to_string();
                    record.transition(StepStatus::CompensationFailed)?;
                    record.last_error = Some(StepFailure::new(ErrorKind::Compensation, &message));
                    self.save_step(run, &record).await?;

                    tracing::error!(
                        workflow_id = %workflow_id,
                        step_index,
                        step = step.name(),
                        error = %message,
                        "compensation failed: run requires operator intervention"
                    );
                    self.event_bus.publish(SagaEvent::CompensationFailed {
                        workflow_id,
                        step_index,
                        step_name: step.name().to_string(),
                        error: message.clone(),
                    });

                    run.compensation_error = Some(WorkflowFailure {
                        kind: ErrorKind::Compensation,
                        message,
                        step_index: Some(step_index),
                        step_name: Some(step.name().to_string()),
                    });
                    run.transition(WorkflowRunStatus::CompensationFailed)?;
                    return Ok(());
                }
            }
        }

        run.transition(WorkflowRunStatus::Compensated)?;
        Ok(())
    }

    /// Persist a step record and mirror it into the in-memory run.
    async fn save_step(
        &self,
        run: &mut WorkflowRun,
        record: &StepExecutionRecord,
    ) -> Result<(), OrchestratorError> {
        self.checkpoints
            .checkpoint_step(run.workflow_id, record)
            .await?;
        match run
            .steps
            .iter_mut()
            .find(|r| r.step_index == record.step_index)
        {
            Some(existing) => *existing = record.clone(),
            None => run.steps.push(record.clone()),
        }
        Ok(())
    }
}

impl<S, L> SagaOrchestrator<S, L>
where
    S: WorkflowStore + 'static,
    L: IdempotencyLedger + 'static,
{
    /// Admit a request and execute it on its own task.
    ///
    /// Deduplication and admission happen before this returns, so a
    /// duplicate submitted right after observes this run's reservation.
    pub async fn spawn(
        self: &Arc<Self>,
        request: WorkflowRequest,
    ) -> Result<Accepted, OrchestratorError> {
        match self.prepare(request).await? {
            Prepared::Ready(prepared) => {
                let workflow_id = prepared.run.workflow_id;
                let idempotency_key = prepared.run.idempotency_key.clone();
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.drive(*prepared).await });
                Ok(Accepted::Started(RunHandle {
                    workflow_id,
                    idempotency_key,
                    handle,
                }))
            }
            Prepared::InProgress { workflow_id } => Ok(Accepted::InProgress { workflow_id }),
            Prepared::Cached(outcome) => Ok(Accepted::Cached(outcome)),
        }
    }
}

fn cancelled_failure(step_index: u32, step_name: &str) -> WorkflowFailure {
    WorkflowFailure {
        kind: ErrorKind::Cancelled,
        message: "workflow run cancelled".to_string(),
        step_index: Some(step_index),
        step_name: Some(step_name.to_string()),
    }
}

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Errors that prevent the engine from producing a terminal outcome.
///
/// Step failures are not errors at this level: they end in a terminal
/// `WorkflowOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No definition is registered for the requested type.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// The type already has its maximum number of runs executing.
    #[error("workflow type '{workflow_type}' is at its concurrency limit of {limit}")]
    ConcurrencyLimitReached { workflow_type: String, limit: u32 },

    /// Definition validation or registration error.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Workflow store persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Idempotency ledger error.
    #[error("idempotency ledger error: {0}")]
    Ledger(RepositoryError),

    /// A run or step record was driven through a forbidden transition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A step record referenced a step the definition does not have.
    #[error("step {0} missing from workflow run")]
    StepMissing(u32),

    /// The task executing a spawned run panicked or was aborted.
    #[error("run task failed: {0}")]
    Join(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// The run is executing in this process.
    #[error("workflow run {0} is executing in this process")]
    RunActive(Uuid),

    #[error("workflow run {workflow_id} already finished with status {status}")]
    RunAlreadyTerminal {
        workflow_id: Uuid,
        status: WorkflowRunStatus,
    },

    /// The run checkpointed too recently to be presumed dead.
    #[error(
        "workflow run {workflow_id} was updated {idle_secs}s ago and may still be running \
         elsewhere (stale after {stale_after_secs}s)"
    )]
    RunRecentlyUpdated {
        workflow_id: Uuid,
        idle_secs: i64,
        stale_after_secs: i64,
    },

    /// The key has no live in-progress reservation.
    #[error("idempotency key '{0}' is not held by an in-progress run")]
    NotReserved(String),
}

impl OrchestratorError {
    /// Persisted error classification, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestratorError::UnknownWorkflowType(_) => Some(ErrorKind::UnknownWorkflowType),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
