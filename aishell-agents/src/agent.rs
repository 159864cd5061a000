//! ABOUTME: Specialist agent contract: a plan, execute, validate state machine
//! ABOUTME: Agents checkpoint on every phase transition and can resume from another process

use aishell_core::{ComponentMetadata, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Work handed to a specialist agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub description: String,
    #[serde(default)]
    pub payload: Value,
}

impl AgentTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Interpret an arbitrary dispatch payload as a task. An object with a
    /// `description` field maps directly; anything else becomes the
    /// payload of an unnamed task.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(task) if !task.description.is_empty() => task,
            _ => Self {
                description: "unnamed task".to_string(),
                payload: value,
            },
        }
    }
}

/// One step of an agent's plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl PlanStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Value::Null,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// An agent's plan: an ordered list of steps
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    #[must_use]
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

/// Outcome of an agent's validation phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Validation {
    #[must_use]
    pub fn passed() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Context threaded through an agent's phases
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Workflow run this dispatch belongs to; `adhoc` outside a run
    pub run_id: String,
    /// Identity used for rate limiting and audit
    pub caller: String,
    pub cancellation: CancellationToken,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            caller: caller.into(),
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// A typed specialist worker.
///
/// The runner drives `plan` then `execute_step` per plan step then
/// `validate`, checkpointing each transition. Each `execute_step` must be
/// idempotent by construction or route its side effects through the
/// safety controller with an idempotency key.
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    /// Stable agent kind used for registration and dispatch
    fn kind(&self) -> &str;

    fn metadata(&self) -> &ComponentMetadata;

    /// Produce a plan for the task (pure reasoning; may consult the LLM)
    async fn plan(&self, task: &AgentTask, ctx: &AgentContext) -> Result<Plan>;

    /// Execute one plan step
    async fn execute_step(&self, step: &PlanStep, ctx: &AgentContext) -> Result<Value>;

    /// Judge the collected results against the plan
    async fn validate(&self, plan: &Plan, results: &[Value], ctx: &AgentContext)
        -> Result<Validation>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_from_structured_value() {
        let task = AgentTask::from_value(json!({
            "description": "optimize the orders table",
            "payload": {"table": "orders"}
        }));
        assert_eq!(task.description, "optimize the orders table");
        assert_eq!(task.payload["table"], "orders");
    }

    #[test]
    fn test_task_from_bare_value() {
        let task = AgentTask::from_value(json!(["stmt1", "stmt2"]));
        assert_eq!(task.description, "unnamed task");
        assert!(task.payload.is_array());
    }

    #[test]
    fn test_plan_serde_round_trip() {
        let plan = Plan::new(vec![
            PlanStep::new("collect").with_params(json!({"limit": 10})),
            PlanStep::new("analyze"),
        ]);
        let value = serde_json::to_value(&plan).unwrap();
        let back: Plan = serde_json::from_value(value).unwrap();
        assert_eq!(back, plan);
    }
}
