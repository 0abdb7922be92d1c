//! Forwards saga events from the broadcast bus into `tracing`, all under
//! the `stellara::events` target.

use stellara_core::event::EventBus;
use stellara_types::event::SagaEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Log target used for every forwarded event.
pub const EVENT_TARGET: &str = "stellara::events";

/// Emit one tracing event for a saga event.
pub fn log_event(event: &SagaEvent) {
    match event {
        SagaEvent::RunStarted {
            workflow_id,
            workflow_type,
            idempotency_key,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, %workflow_type, %idempotency_key,
            "run started"
        ),
        SagaEvent::DuplicateSubmission {
            idempotency_key,
            workflow_id,
            cached,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, %idempotency_key, cached,
            "duplicate submission"
        ),
        SagaEvent::StepStarted {
            workflow_id,
            step_index,
            step_name,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, step_index, %step_name,
            "step started"
        ),
        SagaEvent::StepProgress {
            workflow_id,
            step_index,
            phase,
            attempt,
        } => tracing::debug!(
            target: EVENT_TARGET,
            %workflow_id, step_index, ?phase, attempt,
            "step progress"
        ),
        SagaEvent::AttemptFailed {
            workflow_id,
            step_index,
            attempt,
            kind,
            error,
            will_retry,
        } => tracing::warn!(
            target: EVENT_TARGET,
            %workflow_id, step_index, attempt, %kind, %error, will_retry,
            "attempt failed"
        ),
        SagaEvent::StepSucceeded {
            workflow_id,
            step_index,
            step_name,
            attempts,
            duration_ms,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, step_index, %step_name, attempts, duration_ms,
            "step succeeded"
        ),
        SagaEvent::StepFailed {
            workflow_id,
            step_index,
            step_name,
            kind,
            error,
        } => tracing::warn!(
            target: EVENT_TARGET,
            %workflow_id, step_index, %step_name, %kind, %error,
            "step failed"
        ),
        SagaEvent::CompensationStarted {
            workflow_id,
            steps_to_compensate,
        } => tracing::warn!(
            target: EVENT_TARGET,
            %workflow_id, steps_to_compensate,
            "compensation started"
        ),
        SagaEvent::StepCompensated {
            workflow_id,
            step_index,
            step_name,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, step_index, %step_name,
            "step compensated"
        ),
        SagaEvent::CompensationFailed {
            workflow_id,
            step_index,
            step_name,
            error,
        } => tracing::error!(
            target: EVENT_TARGET,
            %workflow_id, step_index, %step_name, %error,
            "compensation failed"
        ),
        SagaEvent::RunFinished {
            workflow_id,
            workflow_type,
            status,
            duration_ms,
        } => tracing::info!(
            target: EVENT_TARGET,
            %workflow_id, %workflow_type, %status, duration_ms,
            "run finished"
        ),
    }
}

/// Spawn a task that logs every event published on `bus`.
///
/// The task ends when the bus is dropped. Lagged receivers log how many
/// events were skipped and keep going.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<u64> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: EVENT_TARGET, skipped, "event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        logged
    })
}
