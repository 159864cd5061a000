//! ABOUTME: Execution context handed to custom steps and tool invocations
//! ABOUTME: Carries an immutable state snapshot, cancellation, and coordination handles

use aishell_core::CoordinationBackend;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context threaded through one step execution.
///
/// The state map is an immutable snapshot taken when the step became
/// ready; only the orchestrator mutates run state, on step completion.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub step_id: String,
    /// Identity used for rate limiting and audit records
    pub caller: String,
    /// Snapshot of step outputs keyed by step id
    pub state: BTreeMap<String, Value>,
    /// Parameters from the step definition (custom steps)
    pub parameters: Value,
    /// Cancellation propagated from the run scope
    pub cancellation: CancellationToken,
    /// Coordination handle for steps that need locks, queues, or sync
    pub backend: Option<Arc<dyn CoordinationBackend>>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            caller: format!("run:{run_id}"),
            run_id,
            step_id: step_id.into(),
            state: BTreeMap::new(),
            parameters: Value::Null,
            cancellation: CancellationToken::new(),
            backend: None,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: BTreeMap<String, Value>) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn CoordinationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Result of a completed step, when present in the snapshot
    #[must_use]
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.state.get(step_id)
    }
}
