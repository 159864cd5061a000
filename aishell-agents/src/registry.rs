//! ABOUTME: Agent registry: factories by kind, dispatching through the runner
//! ABOUTME: Implements the orchestrator's AgentDispatcher seam

use crate::agent::{AgentContext, AgentTask, SpecialistAgent};
use crate::runner::AgentRunner;
use aishell_core::{AgentDispatcher, AiShellError, DispatchContext, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Produces a fresh agent instance per dispatch
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn SpecialistAgent> + Send + Sync>;

/// Named registry of specialist agent factories.
///
/// Dispatch instantiates the agent, derives a per-run agent id, and drives
/// it through the runner so checkpoints land under (run, agent) keys.
pub struct AgentRegistry {
    factories: DashMap<String, AgentFactory>,
    runner: Arc<AgentRunner>,
}

impl AgentRegistry {
    pub fn new(runner: Arc<AgentRunner>) -> Self {
        Self {
            factories: DashMap::new(),
            runner,
        }
    }

    /// Register a factory under the agent kind it produces
    pub fn register(&self, kind: impl Into<String>, factory: AgentFactory) {
        let kind = kind.into();
        info!(kind = %kind, "agent kind registered");
        self.factories.insert(kind, factory);
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

#[async_trait]
impl AgentDispatcher for AgentRegistry {
    async fn dispatch(&self, kind: &str, task: Value, ctx: &DispatchContext) -> Result<Value> {
        let Some(factory) = self.factories.get(kind).map(|f| Arc::clone(f.value())) else {
            return Err(AiShellError::SchemaViolation {
                message: format!("unknown agent kind '{kind}'"),
            });
        };
        let agent = factory();
        let run_id = ctx.run_id.clone().unwrap_or_else(|| "adhoc".to_string());

        // A stable id per (run, kind) keeps checkpoints addressable across
        // resume; tasks may pin their own id to run the same kind twice
        let agent_id = task
            .get("agent_id")
            .and_then(Value::as_str)
            .map_or_else(|| kind.to_string(), ToString::to_string);

        let agent_task = AgentTask::from_value(task);
        let agent_ctx = AgentContext::new(run_id, ctx.caller.clone())
            .with_cancellation(ctx.cancellation.clone());
        self.runner
            .run(agent.as_ref(), &agent_id, &agent_task, &agent_ctx)
            .await
    }

    fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|f| f.key().clone()).collect();
        kinds.sort();
        kinds
    }
}
