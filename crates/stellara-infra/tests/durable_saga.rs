//! Saga runs against the SQLite store and ledger, including a simulated
//! process restart on the same database file.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use stellara_core::repository::idempotency::IdempotencyLedger;
use stellara_core::repository::workflow::WorkflowStore;
use stellara_core::saga::{
    OrchestratorError, Recovery, SagaOrchestrator, SagaStep, StepDefinition, Submission,
    WorkflowContext, WorkflowDefinition,
};
use stellara_infra::sqlite::idempotency::SqliteLedger;
use stellara_infra::sqlite::pool::DatabasePool;
use stellara_infra::sqlite::workflow::SqliteWorkflowStore;
use stellara_types::config::EngineConfig;
use stellara_types::error::{ErrorKind, StepError};
use stellara_types::idempotency::Reservation;
use stellara_types::workflow::{
    Resolution, StepExecutionRecord, StepStatus, WorkflowRequest, WorkflowRun, WorkflowRunStatus,
};
use uuid::Uuid;

type Orchestrator = SagaOrchestrator<SqliteWorkflowStore, SqliteLedger>;

async fn open(path: &Path) -> Orchestrator {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = DatabasePool::new(&url).await.unwrap();
    let mut config = EngineConfig::default();
    config.backoff.base_delay_ms = 1;
    SagaOrchestrator::new(
        SqliteWorkflowStore::new(pool.clone()),
        SqliteLedger::new(pool),
        &config,
    )
}

struct Reserve {
    executions: Arc<AtomicU32>,
    compensations: Arc<AtomicU32>,
}

impl SagaStep for Reserve {
    async fn execute(&self, input: &Value, ctx: &WorkflowContext) -> Result<Value, StepError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let seats = input["seats"].as_u64().ok_or_else(|| StepError::validation("seats"))?;
        ctx.set_metadata("reservation", json!(format!("r-{seats}")));
        Ok(json!({ "reservation": format!("r-{seats}") }))
    }

    async fn compensate(
        &self,
        _input: &Value,
        _output: &Value,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Charge {
    decline: bool,
}

impl SagaStep for Charge {
    async fn execute(&self, _input: &Value, _ctx: &WorkflowContext) -> Result<Value, StepError> {
        if self.decline {
            return Err(StepError::permanent("card declined"));
        }
        Ok(json!({ "charge": "ch-1" }))
    }
}

fn definition(decline: bool, executions: &Arc<AtomicU32>, compensations: &Arc<AtomicU32>) -> WorkflowDefinition {
    WorkflowDefinition::new("checkout")
        .step(StepDefinition::new(
            "reserve",
            Reserve {
                executions: Arc::clone(executions),
                compensations: Arc::clone(compensations),
            },
        ))
        .step(StepDefinition::new("charge", Charge { decline }))
}

#[tokio::test]
async fn test_completed_run_is_persisted_and_cached_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("stellara.db");
    let executions = Arc::new(AtomicU32::new(0));
    let compensations = Arc::new(AtomicU32::new(0));

    let first = open(&db).await;
    first
        .register(definition(false, &executions, &compensations))
        .unwrap();
    let request = WorkflowRequest::new("checkout", json!({"seats": 2})).with_idempotency_key("order-9");
    let Submission::Finished(outcome) = first.submit(request.clone()).await.unwrap() else {
        panic!("expected a fresh execution");
    };
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(outcome.result, Some(json!({"charge": "ch-1"})));
    drop(first);

    let second = open(&db).await;
    second
        .register(definition(false, &executions, &compensations))
        .unwrap();
    let Submission::Cached(cached) = second.submit(request).await.unwrap() else {
        panic!("expected the cached outcome");
    };
    assert_eq!(cached.workflow_id, outcome.workflow_id);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let run = second.get_run(outcome.workflow_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(run.steps.len(), 2);
    assert!(run.steps.iter().all(|r| r.status == StepStatus::Succeeded));
    assert_eq!(run.context["metadata"]["reservation"], "r-2");
}

#[tokio::test]
async fn test_declined_charge_is_rolled_back_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let executions = Arc::new(AtomicU32::new(0));
    let compensations = Arc::new(AtomicU32::new(0));

    let orch = open(&dir.path().join("stellara.db")).await;
    orch.register(definition(true, &executions, &compensations))
        .unwrap();
    let outcome = orch
        .submit(WorkflowRequest::new("checkout", json!({"seats": 1})))
        .await
        .unwrap()
        .outcome()
        .cloned()
        .unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Compensated);
    assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Permanent);
    assert_eq!(compensations.load(Ordering::SeqCst), 1);

    let run = orch.get_run(outcome.workflow_id).await.unwrap().unwrap();
    let statuses: Vec<StepStatus> = run.steps.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![StepStatus::Compensated, StepStatus::Failed]);
    assert_eq!(
        run.steps[1].last_error.as_ref().unwrap().message,
        "permanent step failure: card declined"
    );
}

#[tokio::test]
async fn test_unfinished_runs_are_reported_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("stellara.db");

    let crashed = {
        let orch = open(&db).await;
        let mut run = WorkflowRun::new(Uuid::now_v7(), "checkout", "order-crash", None);
        orch.store().create_run(&run).await.unwrap();
        run.transition(WorkflowRunStatus::Running).unwrap();
        orch.store().update_run(&run).await.unwrap();
        run.workflow_id
    };

    let orch = open(&db).await;
    let interrupted = orch.interrupted_runs().await.unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].workflow_id, crashed);
    assert_eq!(interrupted[0].status, WorkflowRunStatus::Running);
}

#[tokio::test]
async fn test_crashed_run_frees_its_key_only_through_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("stellara.db");
    let executions = Arc::new(AtomicU32::new(0));
    let compensations = Arc::new(AtomicU32::new(0));

    let crashed = {
        let orch = open(&db).await;
        let mut run = WorkflowRun::new(Uuid::now_v7(), "checkout", "order-crash", None);
        let reservation = orch
            .ledger()
            .reserve_or_fetch("order-crash", run.workflow_id, "checkout", Utc::now())
            .await
            .unwrap();
        assert!(matches!(reservation, Reservation::Reserved));
        orch.store().create_run(&run).await.unwrap();

        let mut reserve = StepExecutionRecord::pending(0, "reserve");
        reserve.transition(StepStatus::Running).unwrap();
        orch.store().upsert_step(&run.workflow_id, &reserve).await.unwrap();
        run.transition(WorkflowRunStatus::Running).unwrap();
        orch.store().update_run(&run).await.unwrap();
        run.workflow_id
    };

    let orch = open(&db).await;
    orch.register(definition(false, &executions, &compensations))
        .unwrap();
    let request =
        WorkflowRequest::new("checkout", json!({"seats": 3})).with_idempotency_key("order-crash");

    let purged = orch
        .ledger()
        .purge_expired(Utc::now() + Duration::days(3650))
        .await
        .unwrap();
    assert_eq!(purged, 0);
    let blocked = orch.submit(request.clone()).await.unwrap();
    assert!(matches!(blocked, Submission::InProgress { workflow_id } if workflow_id == crashed));

    let err = orch.release_reservation("order-crash", false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunRecentlyUpdated { .. }));

    let Recovery::Abandoned(abandoned) = orch.release_reservation("order-crash", true).await.unwrap()
    else {
        panic!("the crashed run must be abandoned");
    };
    assert!(abandoned.released);
    assert_eq!(abandoned.run.to_outcome().resolution(), Resolution::RequiresIntervention);

    let stored = orch.get_run(crashed).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowRunStatus::Failed);
    assert_eq!(stored.error.as_ref().unwrap().kind, ErrorKind::Interrupted);
    assert_eq!(stored.steps[0].status, StepStatus::Failed);
    assert!(orch.interrupted_runs().await.unwrap().is_empty());

    let Submission::Finished(outcome) = orch.submit(request).await.unwrap() else {
        panic!("the freed key must start a fresh run");
    };
    assert_ne!(outcome.workflow_id, crashed);
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reservation_without_run_record_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let orch = open(&dir.path().join("stellara.db")).await;
    let orphan = Uuid::now_v7();
    orch.ledger()
        .reserve_or_fetch("order-orphan", orphan, "checkout", Utc::now() - Duration::hours(2))
        .await
        .unwrap();

    let recovery = orch.release_reservation("order-orphan", false).await.unwrap();

    assert!(matches!(recovery, Recovery::ReservationReleased { workflow_id } if workflow_id == orphan));
    assert!(orch.ledger().get("order-orphan", Utc::now()).await.unwrap().is_none());
    let err = orch.release_reservation("order-orphan", false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotReserved(_)));
}
