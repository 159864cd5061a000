//! ABOUTME: Coordinator agent: decomposes a task into a DAG of specialist subtasks
//! ABOUTME: LLM plans are schema-validated and re-prompted a bounded number of times

use aishell_core::{
    AgentDispatcher, AiShellError, DispatchContext, GenerateOptions, LLMClient, Result,
};
use aishell_state::StepStatus;
use aishell_workflows::{
    ExecuteOptions, OnFailure, StepType, WorkflowDefinition, WorkflowOrchestrator, WorkflowStep,
};
use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How subtask outcomes combine into the coordination verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Fail if any subtask fails; a failure cancels the rest
    All,
    /// Return partial results with a failure summary
    BestEffort,
    /// Succeed when at least `n` subtasks succeed
    Quorum(usize),
}

/// Per-subtask record in the coordination result
#[derive(Debug, Clone)]
pub struct SubtaskRecord {
    pub name: String,
    pub agent_kind: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Aggregate outcome of a coordination
#[derive(Debug, Clone)]
pub struct CoordinationResult {
    pub success: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub subtasks: Vec<SubtaskRecord>,
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Planner invocations allowed before `PlanningFailed`
    pub max_planner_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_planner_attempts: 3,
        }
    }
}

/// A planned subtask as emitted by the LLM planner
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlannedSubtask {
    name: String,
    agent_kind: String,
    payload: Value,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn plan_schema() -> Value {
    json!({
        "type": "array",
        "minItems": 1,
        "items": {
            "type": "object",
            "required": ["name", "agent_kind", "payload"],
            "additionalProperties": false,
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "agent_kind": {"type": "string", "minLength": 1},
                "payload": {},
                "dependencies": {"type": "array", "items": {"type": "string"}}
            }
        }
    })
}

/// Decomposes high-level tasks into specialist dispatches.
///
/// The planner is an untrusted collaborator: its raw output is validated
/// against the plan schema and the set of registered agent kinds, and the
/// resulting DAG goes through full workflow validation before anything
/// runs. Dispatch reuses the orchestrator, so parallelism follows the
/// dependency graph and each subtask checkpoints like any agent step.
pub struct CoordinatorAgent {
    llm: Arc<dyn LLMClient>,
    orchestrator: Arc<WorkflowOrchestrator>,
    dispatcher: Arc<dyn AgentDispatcher>,
    schema: JSONSchema,
    config: CoordinatorConfig,
}

impl CoordinatorAgent {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        orchestrator: Arc<WorkflowOrchestrator>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let schema_doc = plan_schema();
        let schema =
            JSONSchema::compile(&schema_doc).map_err(|err| AiShellError::Internal {
                message: format!("plan schema failed to compile: {err}"),
            })?;
        Ok(Self {
            llm,
            orchestrator,
            dispatcher,
            schema,
            config,
        })
    }

    /// Decompose, dispatch, and aggregate a high-level task
    pub async fn coordinate(
        &self,
        task: &str,
        policy: AggregationPolicy,
        ctx: &DispatchContext,
    ) -> Result<CoordinationResult> {
        let subtasks = self.plan(task, ctx).await?;
        info!(subtasks = subtasks.len(), "coordination plan accepted");

        let workflow_id = format!("coordination-{}", Uuid::new_v4());
        let on_failure = match policy {
            AggregationPolicy::All => OnFailure::FailWorkflow,
            AggregationPolicy::BestEffort | AggregationPolicy::Quorum(_) => OnFailure::Continue,
        };
        let mut def = WorkflowDefinition::new(workflow_id.clone(), format!("coordination: {task}"));
        for subtask in &subtasks {
            let mut step = WorkflowStep::new(
                subtask.name.clone(),
                StepType::Agent {
                    agent_kind: subtask.agent_kind.clone(),
                    task: json!({
                        "description": task,
                        "payload": subtask.payload,
                        "agent_id": subtask.name,
                    }),
                },
            )
            .with_on_failure(on_failure);
            for dep in &subtask.dependencies {
                step = step.with_dependency(dep.clone());
            }
            def = def.add_step(step);
        }
        self.orchestrator.register_workflow(def)?;

        let result = Arc::clone(&self.orchestrator)
            .execute_workflow(
                &workflow_id,
                ExecuteOptions {
                    caller: ctx.caller.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let records: Vec<SubtaskRecord> = subtasks
            .iter()
            .map(|subtask| {
                let step = result.step(&subtask.name);
                SubtaskRecord {
                    name: subtask.name.clone(),
                    agent_kind: subtask.agent_kind.clone(),
                    status: step.map_or(StepStatus::Pending, |s| s.status),
                    result: step.and_then(|s| s.result.clone()),
                    error: step.and_then(|s| s.error_message.clone()),
                }
            })
            .collect();
        let succeeded = records
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .count();
        let failed = records.len() - succeeded;
        let success = match policy {
            AggregationPolicy::All => failed == 0,
            AggregationPolicy::BestEffort => succeeded > 0,
            AggregationPolicy::Quorum(n) => succeeded >= n,
        };

        Ok(CoordinationResult {
            success,
            succeeded,
            failed,
            subtasks: records,
        })
    }

    /// LLM-assisted planning with bounded re-prompting
    async fn plan(&self, task: &str, ctx: &DispatchContext) -> Result<Vec<PlannedSubtask>> {
        let kinds = self.dispatcher.known_kinds();
        let mut last_problem = String::new();

        for attempt in 1..=self.config.max_planner_attempts {
            if ctx.cancellation.is_cancelled() {
                return Err(AiShellError::Cancelled);
            }
            let prompt = self.planning_prompt(task, &kinds, &last_problem);
            let generation = match self.llm.generate(&prompt, &GenerateOptions::default()).await {
                Ok(generation) => generation,
                Err(err) if err.is_retryable() => {
                    warn!(attempt, error = %err, "planner call failed, retrying");
                    last_problem = err.to_string();
                    continue;
                }
                Err(err) => {
                    return Err(AiShellError::PlanningFailed {
                        message: err.to_string(),
                    })
                }
            };

            match self.parse_plan(&generation.text, &kinds) {
                Ok(plan) => return Ok(plan),
                Err(problem) => {
                    debug!(attempt, problem = %problem, "rejected planner output");
                    last_problem = problem;
                }
            }
        }

        Err(AiShellError::PlanningFailed {
            message: format!(
                "planner produced no valid plan in {} attempts: {last_problem}",
                self.config.max_planner_attempts
            ),
        })
    }

    fn planning_prompt(&self, task: &str, kinds: &[String], last_problem: &str) -> String {
        let mut prompt = format!(
            "Decompose the following task into subtasks for the available \
             specialist agents.\n\nTask: {task}\n\nAvailable agent kinds: {}.\n\n\
             Respond with a JSON array only. Each element: {{\"name\": string, \
             \"agent_kind\": string, \"payload\": object, \"dependencies\": \
             [names]}}. Dependencies must reference earlier subtask names.",
            kinds.join(", ")
        );
        if !last_problem.is_empty() {
            prompt.push_str(&format!(
                "\n\nYour previous answer was rejected: {last_problem}. Fix it."
            ));
        }
        prompt
    }

    /// Structural validation of raw planner output. Never trust the LLM:
    /// schema first, then agent kinds, then full DAG validation.
    fn parse_plan(
        &self,
        raw: &str,
        kinds: &[String],
    ) -> std::result::Result<Vec<PlannedSubtask>, String> {
        let json_slice = extract_json_array(raw).ok_or("no JSON array in planner output")?;
        let value: Value =
            serde_json::from_str(json_slice).map_err(|e| format!("invalid JSON: {e}"))?;

        if let Err(errors) = self.schema.validate(&value) {
            let details: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(format!("plan schema violation: {}", details.join("; ")));
        }
        let subtasks: Vec<PlannedSubtask> =
            serde_json::from_value(value).map_err(|e| e.to_string())?;

        for subtask in &subtasks {
            if !kinds.contains(&subtask.agent_kind) {
                return Err(format!("unknown agent kind '{}'", subtask.agent_kind));
            }
        }

        // Reuse workflow validation for id uniqueness, dependency closure,
        // and acyclicity
        let mut probe = WorkflowDefinition::new("probe", "plan probe");
        for subtask in &subtasks {
            let mut step = WorkflowStep::new(
                subtask.name.clone(),
                StepType::Agent {
                    agent_kind: subtask.agent_kind.clone(),
                    task: Value::Null,
                },
            );
            for dep in &subtask.dependencies {
                step = step.with_dependency(dep.clone());
            }
            probe = probe.add_step(step);
        }
        probe.validate().map_err(|e| e.to_string())?;

        Ok(subtasks)
    }
}

fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_array() {
        assert_eq!(extract_json_array("[1, 2]"), Some("[1, 2]"));
        assert_eq!(
            extract_json_array("Here is the plan:\n```json\n[{\"a\":1}]\n```"),
            Some("[{\"a\":1}]")
        );
        assert_eq!(extract_json_array("no json here"), None);
    }

    #[test]
    fn test_plan_schema_accepts_valid_plan() {
        let schema_doc = plan_schema();
        let schema = JSONSchema::compile(&schema_doc).unwrap();
        let valid = json!([
            {"name": "collect", "agent_kind": "backup", "payload": {}},
            {"name": "apply", "agent_kind": "migration", "payload": {"x": 1},
             "dependencies": ["collect"]}
        ]);
        assert!(schema.is_valid(&valid));

        let missing_kind = json!([{"name": "collect", "payload": {}}]);
        assert!(!schema.is_valid(&missing_kind));

        let extra_field = json!([
            {"name": "collect", "agent_kind": "backup", "payload": {}, "surprise": 1}
        ]);
        assert!(!schema.is_valid(&extra_field));
    }
}
