//! Workflow and step definitions, validation, and the type registry.
//!
//! A `WorkflowDefinition` is an ordered list of `StepDefinition`s identified
//! by a workflow type name. Sequence order is both the execution order and
//! (reversed) the compensation order. Definitions are immutable once
//! registered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};

use super::step::{BoxSagaStep, SagaStep};

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    name: String,
    step: BoxSagaStep,
    idempotent: bool,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
    config: Map<String, Value>,
}

impl StepDefinition {
    /// Define a step. Defaults: not idempotent, engine-wide retry and
    /// timeout policy, empty config.
    pub fn new<T: SagaStep>(name: impl Into<String>, step: T) -> Self {
        Self {
            name: name.into(),
            step: BoxSagaStep::new(step),
            idempotent: false,
            max_retries: None,
            timeout: None,
            config: Map::new(),
        }
    }

    /// Mark the step body as safe to re-run without duplicating side effects.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Retries beyond the initial attempt (`n` retries = at most `n + 1` attempts).
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Per-attempt deadline for execute and compensate.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> &BoxSagaStep {
        &self.step
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn declared_max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn declared_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn config_map(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn has_compensation(&self) -> bool {
        self.step.has_compensation()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A named, ordered sequence of steps.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    workflow_type: String,
    steps: Vec<StepDefinition>,
    max_concurrent_runs: Option<u32>,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            steps: Vec::new(),
            max_concurrent_runs: None,
        }
    }

    /// Append a step; it runs after every step added before it.
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Cap the number of runs of this type executing at once.
    pub fn max_concurrent_runs(mut self, max: u32) -> Self {
        self.max_concurrent_runs = Some(max);
        self
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn concurrency_limit(&self) -> Option<u32> {
        self.max_concurrent_runs
    }

    /// Structural validation performed at registration.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.workflow_type.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "workflow type must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "workflow '{}' has no steps",
                self.workflow_type
            )));
        }
        if self.max_concurrent_runs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "workflow '{}' allows zero concurrent runs",
                self.workflow_type
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "workflow '{}' has a step with an empty name",
                    self.workflow_type
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
            if step.timeout == Some(Duration::ZERO) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has a zero timeout",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkflowRegistry
// ---------------------------------------------------------------------------

/// Registered workflow definitions keyed by workflow type.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition. A type can be registered once.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        definition.validate()?;
        match self.definitions.entry(definition.workflow_type.clone()) {
            Entry::Occupied(_) => Err(WorkflowError::AlreadyRegistered(
                definition.workflow_type,
            )),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    workflow_type = definition.workflow_type.as_str(),
                    steps = definition.steps.len(),
                    "registered workflow definition"
                );
                slot.insert(Arc::new(definition));
                Ok(())
            }
        }
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).map(|d| Arc::clone(d.value()))
    }

    pub fn workflow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or registering workflow definitions.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps share a name.
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// The workflow type is already registered.
    #[error("workflow type already registered: {0}")]
    AlreadyRegistered(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::context::WorkflowContext;
    use serde_json::json;
    use stellara_types::error::StepError;

    struct Noop;

    impl SagaStep for Noop {
        async fn execute(&self, _input: &Value, _ctx: &WorkflowContext) -> Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    fn two_step(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name)
            .step(StepDefinition::new("reserve", Noop))
            .step(StepDefinition::new("charge", Noop).max_retries(3))
    }

    #[test]
    fn test_step_builder_defaults() {
        let step = StepDefinition::new("reserve", Noop);
        assert_eq!(step.name(), "reserve");
        assert!(!step.is_idempotent());
        assert!(step.declared_max_retries().is_none());
        assert!(step.declared_timeout().is_none());
        assert!(step.config_map().is_empty());
        assert!(!step.has_compensation());
    }

    #[test]
    fn test_step_builder_overrides() {
        let step = StepDefinition::new("synthesize", Noop)
            .idempotent(true)
            .max_retries(4)
            .timeout(Duration::from_secs(9))
            .config("voice", json!("alto"));
        assert!(step.is_idempotent());
        assert_eq!(step.declared_max_retries(), Some(4));
        assert_eq!(step.declared_timeout(), Some(Duration::from_secs(9)));
        assert_eq!(step.config_map()["voice"], "alto");
    }

    #[test]
    fn test_validate_accepts_well_formed_definition() {
        assert!(two_step("booking").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_definition() {
        let err = WorkflowDefinition::new("empty").validate().unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn test_validate_rejects_duplicate_step_names() {
        let def = WorkflowDefinition::new("dup")
            .step(StepDefinition::new("a", Noop))
            .step(StepDefinition::new("a", Noop));
        assert!(matches!(def.validate(), Err(WorkflowError::DuplicateStep(name)) if name == "a"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_concurrency() {
        let def = WorkflowDefinition::new("z")
            .step(StepDefinition::new("a", Noop).timeout(Duration::ZERO));
        assert!(def.validate().is_err());

        let def = two_step("c").max_concurrent_runs(0);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_registry_rejects_second_registration() {
        let registry = WorkflowRegistry::new();
        registry.register(two_step("booking")).unwrap();
        let err = registry.register(two_step("booking")).unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyRegistered(_)));
        assert_eq!(registry.get("booking").unwrap().steps().len(), 2);
    }

    #[test]
    fn test_registry_lookup_and_listing() {
        let registry = WorkflowRegistry::new();
        registry.register(two_step("refund")).unwrap();
        registry.register(two_step("booking")).unwrap();
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.workflow_types(), vec!["booking", "refund"]);
    }
}
