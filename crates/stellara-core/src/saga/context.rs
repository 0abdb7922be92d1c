//! Per-run execution context threaded through every step invocation.
//!
//! `WorkflowContext` carries the orchestrator-owned identity of a run
//! (workflow ID, idempotency key, position, retry count) plus an open
//! key/value metadata map that steps use to pass data forward, e.g. an
//! identifier created by step 1 that step 3 needs.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Execution context for one workflow run.
///
/// Identity and position fields are private and only the engine can move
/// them; steps receive `&WorkflowContext` and can only touch metadata.
/// Clones share the same metadata map, so a write made by a step attempt
/// running on its own task is visible to the orchestrator.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    workflow_id: Uuid,
    idempotency_key: String,
    workflow_type: String,
    user_id: Option<String>,
    step_index: u32,
    retry_count: u32,
    metadata: Arc<DashMap<String, Value>>,
}

impl WorkflowContext {
    /// Create the context for a new run, seeded with caller metadata.
    pub fn new(
        workflow_id: Uuid,
        idempotency_key: impl Into<String>,
        workflow_type: impl Into<String>,
        user_id: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            workflow_id,
            idempotency_key: idempotency_key.into(),
            workflow_type: workflow_type.into(),
            user_id,
            step_index: 0,
            retry_count: 0,
            metadata: Arc::new(metadata.into_iter().collect()),
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Index of the step currently executing or being compensated.
    pub fn step_index(&self) -> u32 {
        self.step_index
    }

    /// Retries consumed so far by the current step (0 on the first attempt).
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Key a step should forward to remote collaborators to deduplicate its
    /// own side effects. Stable across attempts of the same step.
    pub fn step_idempotency_key(&self) -> String {
        format!("{}:{}", self.idempotency_key, self.step_index)
    }

    pub(crate) fn enter_step(&mut self, step_index: u32) {
        self.step_index = step_index;
        self.retry_count = 0;
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.remove(key).map(|(_, v)| v)
    }

    /// Point-in-time copy of the metadata map.
    pub fn metadata_snapshot(&self) -> Map<String, Value> {
        self.metadata
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Serialize the context for the run record.
    pub fn to_json(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id,
            "idempotency_key": self.idempotency_key,
            "workflow_type": self.workflow_type,
            "user_id": self.user_id,
            "step_index": self.step_index,
            "retry_count": self.retry_count,
            "metadata": Value::Object(self.metadata_snapshot()),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
