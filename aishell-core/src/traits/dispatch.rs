//! ABOUTME: Agent dispatch contract used by the orchestrator for agent-type steps
//! ABOUTME: Inverts the dependency so workflow execution never links against concrete agents

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Context threaded through an agent dispatch
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Workflow run issuing the dispatch, when there is one
    pub run_id: Option<String>,
    /// Identity of the dispatching component
    pub caller: String,
    /// Cancellation propagated from the enclosing scope
    pub cancellation: CancellationToken,
}

impl DispatchContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            run_id: None,
            caller: caller.into(),
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Dispatches a task to a specialist agent by kind and waits for its
/// terminal result. Implemented by the agent registry.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Run the named agent kind against the task payload to a terminal
    /// status, returning its aggregate output
    async fn dispatch(&self, kind: &str, task: Value, ctx: &DispatchContext) -> Result<Value>;

    /// Agent kinds this dispatcher can serve
    fn known_kinds(&self) -> Vec<String>;
}
