//! ABOUTME: Migration agent: applies schema statements through the safety controller
//! ABOUTME: Every statement rides the sql_execute tool, so risk gating and audit apply

use crate::agent::{AgentContext, AgentTask, Plan, PlanStep, SpecialistAgent, Validation};
use aishell_core::{
    AiShellError, ComponentMetadata, Result, ToolContext, ToolInvocation,
};
use aishell_tools::SafetyController;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub const MIGRATION_KIND: &str = "migration";

/// Applies an ordered list of migration statements.
///
/// Statements come from the task payload (`statements: [..]`). Each one
/// is invoked as the `sql_execute` tool through the safety controller
/// with an idempotency key, so an approval gate sits in front of every
/// DDL change and crash-resumed runs do not re-apply work.
pub struct MigrationAgent {
    metadata: ComponentMetadata,
    safety: Arc<SafetyController>,
}

impl MigrationAgent {
    pub fn new(safety: Arc<SafetyController>) -> Self {
        Self {
            metadata: ComponentMetadata::new(MIGRATION_KIND, "Applies schema migrations"),
            safety,
        }
    }

    fn statements(task: &AgentTask) -> Vec<String> {
        task.payload
            .get("statements")
            .and_then(Value::as_array)
            .map(|stmts| {
                stmts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SpecialistAgent for MigrationAgent {
    fn kind(&self) -> &str {
        MIGRATION_KIND
    }

    fn metadata(&self) -> &ComponentMetadata {
        &self.metadata
    }

    async fn plan(&self, task: &AgentTask, _ctx: &AgentContext) -> Result<Plan> {
        let statements = Self::statements(task);
        if statements.is_empty() {
            return Err(AiShellError::PlanningFailed {
                message: "migration task has no statements".to_string(),
            });
        }
        let steps = statements
            .into_iter()
            .enumerate()
            .map(|(i, statement)| {
                PlanStep::new(format!("apply_{i}")).with_params(json!({"statement": statement}))
            })
            .collect();
        Ok(Plan::new(steps))
    }

    async fn execute_step(&self, step: &PlanStep, ctx: &AgentContext) -> Result<Value> {
        let statement = step
            .params
            .get("statement")
            .and_then(Value::as_str)
            .ok_or_else(|| AiShellError::internal("migration step lost its statement"))?;

        let invocation = ToolInvocation::new("sql_execute", json!({"statement": statement}))
            .with_idempotency_key(format!("{}:{}:{}", ctx.run_id, MIGRATION_KIND, step.name));
        let tool_ctx = ToolContext::new(ctx.caller.clone())
            .with_run(ctx.run_id.clone(), step.name.clone())
            .with_cancellation(ctx.cancellation.clone());
        self.safety.invoke(invocation, &tool_ctx).await
    }

    async fn validate(
        &self,
        plan: &Plan,
        results: &[Value],
        _ctx: &AgentContext,
    ) -> Result<Validation> {
        if results.len() == plan.steps.len() {
            Ok(Validation::passed())
        } else {
            Ok(Validation::failed(format!(
                "applied {} of {} statements",
                results.len(),
                plan.steps.len()
            )))
        }
    }
}
