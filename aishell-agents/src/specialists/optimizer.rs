//! ABOUTME: Database optimizer agent: finds expensive queries and proposes improvements
//! ABOUTME: Reads statistics through the database collaborator, reasons with the LLM

use crate::agent::{AgentContext, AgentTask, Plan, PlanStep, SpecialistAgent, Validation};
use aishell_core::{
    AiShellError, ComponentMetadata, DatabaseClient, GenerateOptions, LLMClient, Result,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const SLOW_QUERY_SQL: &str =
    "SELECT query, calls, total_exec_time, mean_exec_time FROM pg_stat_statements \
     ORDER BY total_exec_time DESC LIMIT $1";

/// Agent kind string used for registration and dispatch
pub const OPTIMIZER_KIND: &str = "database_optimizer";

/// Inspects query statistics and produces optimization recommendations.
///
/// The plan is fixed: collect the slowest statements, gather table
/// statistics for the objects they touch, then ask the LLM for index and
/// rewrite recommendations. All database access is read-only.
pub struct OptimizerAgent {
    metadata: ComponentMetadata,
    db: Arc<dyn DatabaseClient>,
    llm: Arc<dyn LLMClient>,
}

impl OptimizerAgent {
    pub fn new(db: Arc<dyn DatabaseClient>, llm: Arc<dyn LLMClient>) -> Self {
        Self {
            metadata: ComponentMetadata::new(
                OPTIMIZER_KIND,
                "Analyzes slow queries and recommends optimizations",
            ),
            db,
            llm,
        }
    }

    fn slow_query_limit(task: &AgentTask) -> u64 {
        task.payload
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
    }
}

#[async_trait]
impl SpecialistAgent for OptimizerAgent {
    fn kind(&self) -> &str {
        OPTIMIZER_KIND
    }

    fn metadata(&self) -> &ComponentMetadata {
        &self.metadata
    }

    async fn plan(&self, task: &AgentTask, _ctx: &AgentContext) -> Result<Plan> {
        Ok(Plan::new(vec![
            PlanStep::new("collect_slow_queries")
                .with_params(json!({"limit": Self::slow_query_limit(task)})),
            PlanStep::new("gather_table_stats"),
            PlanStep::new("recommend").with_params(json!({"goal": task.description})),
        ]))
    }

    async fn execute_step(&self, step: &PlanStep, _ctx: &AgentContext) -> Result<Value> {
        match step.name.as_str() {
            "collect_slow_queries" => {
                let limit = step.params.get("limit").and_then(Value::as_u64).unwrap_or(10);
                let rows = self
                    .db
                    .execute(SLOW_QUERY_SQL, &[json!(limit)])
                    .await?;
                debug!(count = rows.rows.len(), "collected slow statements");
                Ok(serde_json::to_value(rows)?)
            }
            "gather_table_stats" => {
                let rows = self
                    .db
                    .execute(
                        "SELECT relname, n_live_tup, seq_scan, idx_scan FROM pg_stat_user_tables",
                        &[],
                    )
                    .await?;
                Ok(serde_json::to_value(rows)?)
            }
            "recommend" => {
                let goal = step
                    .params
                    .get("goal")
                    .and_then(Value::as_str)
                    .unwrap_or("improve query performance");
                let prompt = format!(
                    "You are a database performance engineer. Goal: {goal}. \
                     Based on the collected statistics, list concrete index and \
                     query-rewrite recommendations, one per line."
                );
                let generation = self
                    .llm
                    .generate(&prompt, &GenerateOptions::default())
                    .await?;
                let recommendations: Vec<&str> = generation
                    .text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                Ok(json!({ "recommendations": recommendations }))
            }
            other => Err(AiShellError::internal(format!(
                "optimizer has no step named '{other}'"
            ))),
        }
    }

    async fn validate(
        &self,
        plan: &Plan,
        results: &[Value],
        _ctx: &AgentContext,
    ) -> Result<Validation> {
        if results.len() != plan.steps.len() {
            return Ok(Validation::failed("not every plan step produced a result"));
        }
        let has_recommendations = results
            .last()
            .and_then(|r| r.get("recommendations"))
            .and_then(Value::as_array)
            .is_some_and(|r| !r.is_empty());
        if has_recommendations {
            Ok(Validation::passed())
        } else {
            Ok(Validation::failed("no recommendations produced"))
        }
    }
}
