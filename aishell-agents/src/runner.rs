//! ABOUTME: Drives an agent's plan/execute/validate loop with checkpoints on every transition
//! ABOUTME: Supports resume from the latest checkpoint and bounded replanning after failed validation

use crate::agent::{AgentContext, AgentTask, Plan, SpecialistAgent};
use aishell_core::{AiShellError, Result};
use aishell_state::{AgentCheckpoint, AgentPhase, CheckpointStore, StateStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct AgentRunnerConfig {
    /// Replanning rounds allowed after a failed validation
    pub max_replans: u32,
}

impl Default for AgentRunnerConfig {
    fn default() -> Self {
        Self { max_replans: 2 }
    }
}

/// Drives specialist agents to a terminal phase.
///
/// A checkpoint is written on every phase transition and after every
/// executed step, so another process can pick the agent up from the
/// latest checkpoint after a crash.
pub struct AgentRunner {
    checkpoints: Arc<CheckpointStore>,
    /// When present, checkpoint markers are appended to the run's event log
    run_log: Option<Arc<StateStore>>,
    config: AgentRunnerConfig,
}

impl AgentRunner {
    pub fn new(checkpoints: Arc<CheckpointStore>, config: AgentRunnerConfig) -> Self {
        Self {
            checkpoints,
            run_log: None,
            config,
        }
    }

    #[must_use]
    pub fn with_run_log(mut self, store: Arc<StateStore>) -> Self {
        self.run_log = Some(store);
        self
    }

    /// Run the agent to a terminal phase, resuming from the latest
    /// checkpoint when one exists.
    pub async fn run(
        &self,
        agent: &dyn SpecialistAgent,
        agent_id: &str,
        task: &AgentTask,
        ctx: &AgentContext,
    ) -> Result<Value> {
        let mut checkpoint = match self.checkpoints.load_latest(agent_id, &ctx.run_id).await? {
            Some(existing) => {
                info!(
                    agent_id,
                    run_id = %ctx.run_id,
                    phase = %existing.phase,
                    step_index = existing.step_index,
                    "resuming agent from checkpoint"
                );
                existing
            }
            None => AgentCheckpoint::new(agent_id, ctx.run_id.clone()),
        };

        match checkpoint.phase {
            AgentPhase::Completed => {
                return checkpoint
                    .last_result
                    .ok_or_else(|| AiShellError::internal("completed checkpoint has no result"));
            }
            AgentPhase::Failed => {
                return Err(AiShellError::ValidationFailed {
                    message: format!("agent '{agent_id}' previously failed"),
                });
            }
            _ => {}
        }

        let mut replans = 0u32;
        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(AiShellError::Cancelled);
            }
            match checkpoint.phase {
                AgentPhase::Planning => {
                    let plan = tokio::select! {
                        plan = agent.plan(task, ctx) => plan,
                        () = ctx.cancellation.cancelled() => Err(AiShellError::Cancelled),
                    };
                    match plan {
                        Ok(plan) => {
                            checkpoint.plan = serde_json::to_value(&plan)?;
                            checkpoint.step_index = 0;
                            checkpoint.last_result = Some(json!([]));
                            self.transition(&mut checkpoint, AgentPhase::Executing)
                                .await?;
                        }
                        Err(err) => {
                            self.transition(&mut checkpoint, AgentPhase::Failed).await?;
                            return Err(AiShellError::PlanningFailed {
                                message: err.to_string(),
                            });
                        }
                    }
                }
                AgentPhase::Executing => {
                    let plan: Plan = serde_json::from_value(checkpoint.plan.clone())?;
                    if checkpoint.step_index >= plan.steps.len() {
                        self.transition(&mut checkpoint, AgentPhase::Validating)
                            .await?;
                        continue;
                    }
                    let step = &plan.steps[checkpoint.step_index];
                    debug!(agent_id, step = %step.name, index = checkpoint.step_index, "executing plan step");
                    let outcome = tokio::select! {
                        outcome = agent.execute_step(step, ctx) => outcome,
                        () = ctx.cancellation.cancelled() => Err(AiShellError::Cancelled),
                    };
                    match outcome {
                        Ok(result) => {
                            let mut results = Self::results_of(&checkpoint);
                            results.push(result);
                            checkpoint.last_result = Some(Value::Array(results));
                            checkpoint.step_index += 1;
                            // Executing -> Executing keeps the loop resumable
                            // at step granularity
                            self.transition(&mut checkpoint, AgentPhase::Executing)
                                .await?;
                        }
                        Err(err) if err.kind() == aishell_core::ErrorKind::Cancelled => {
                            return Err(err);
                        }
                        Err(err) => {
                            self.transition(&mut checkpoint, AgentPhase::Failed).await?;
                            return Err(err);
                        }
                    }
                }
                AgentPhase::Validating => {
                    let plan: Plan = serde_json::from_value(checkpoint.plan.clone())?;
                    let results = Self::results_of(&checkpoint);
                    let validation = tokio::select! {
                        validation = agent.validate(&plan, &results, ctx) => validation?,
                        () = ctx.cancellation.cancelled() => return Err(AiShellError::Cancelled),
                    };
                    if validation.ok {
                        self.transition(&mut checkpoint, AgentPhase::Completed)
                            .await?;
                        return Ok(json!({
                            "agent_id": checkpoint.agent_id,
                            "results": results,
                        }));
                    }
                    let reason = validation
                        .reason
                        .unwrap_or_else(|| "validation rejected results".to_string());
                    if replans < self.config.max_replans {
                        replans += 1;
                        warn!(agent_id, replans, reason = %reason, "validation failed, replanning");
                        self.transition(&mut checkpoint, AgentPhase::Planning).await?;
                    } else {
                        self.transition(&mut checkpoint, AgentPhase::Failed).await?;
                        return Err(AiShellError::ValidationFailed { message: reason });
                    }
                }
                AgentPhase::Completed | AgentPhase::Failed => {
                    return Err(AiShellError::internal("terminal phase re-entered"));
                }
            }
        }
    }

    fn results_of(checkpoint: &AgentCheckpoint) -> Vec<Value> {
        checkpoint
            .last_result
            .as_ref()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    async fn transition(&self, checkpoint: &mut AgentCheckpoint, next: AgentPhase) -> Result<()> {
        if checkpoint.phase != next && !checkpoint.phase.can_transition_to(next) {
            return Err(AiShellError::internal(format!(
                "illegal agent phase transition {} -> {next}",
                checkpoint.phase
            )));
        }
        checkpoint.phase = next;
        let version = self.checkpoints.save(checkpoint).await?;
        if let Some(store) = &self.run_log {
            store
                .append_agent_checkpoint(
                    &checkpoint.run_id,
                    &checkpoint.agent_id,
                    &next.to_string(),
                    version,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{PlanStep, Validation};
    use aishell_core::ComponentMetadata;
    use aishell_state::MemoryBackend;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedAgent {
        metadata: ComponentMetadata,
        executed: Arc<Mutex<Vec<String>>>,
        fail_validation_times: Mutex<u32>,
    }

    impl ScriptedAgent {
        fn new(fail_validation_times: u32) -> Self {
            Self {
                metadata: ComponentMetadata::new("scripted", "test agent"),
                executed: Arc::new(Mutex::new(Vec::new())),
                fail_validation_times: Mutex::new(fail_validation_times),
            }
        }
    }

    #[async_trait]
    impl SpecialistAgent for ScriptedAgent {
        fn kind(&self) -> &str {
            "scripted"
        }

        fn metadata(&self) -> &ComponentMetadata {
            &self.metadata
        }

        async fn plan(&self, _task: &AgentTask, _ctx: &AgentContext) -> Result<Plan> {
            Ok(Plan::new(vec![
                PlanStep::new("first"),
                PlanStep::new("second"),
            ]))
        }

        async fn execute_step(&self, step: &PlanStep, _ctx: &AgentContext) -> Result<Value> {
            self.executed.lock().push(step.name.clone());
            Ok(json!({"step": step.name}))
        }

        async fn validate(
            &self,
            _plan: &Plan,
            results: &[Value],
            _ctx: &AgentContext,
        ) -> Result<Validation> {
            let mut remaining = self.fail_validation_times.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Validation::failed("not good enough yet"));
            }
            if results.len() == 2 {
                Ok(Validation::passed())
            } else {
                Ok(Validation::failed("wrong result count"))
            }
        }
    }

    fn runner() -> AgentRunner {
        AgentRunner::new(
            Arc::new(CheckpointStore::new(Arc::new(MemoryBackend::new()))),
            AgentRunnerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_happy_path_runs_all_steps() {
        let runner = runner();
        let agent = ScriptedAgent::new(0);
        let ctx = AgentContext::new("run-1", "test");

        let result = runner
            .run(&agent, "scripted", &AgentTask::new("do work"), &ctx)
            .await
            .unwrap();

        assert_eq!(*agent.executed.lock(), vec!["first", "second"]);
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replanning_is_bounded() {
        let checkpoints = Arc::new(CheckpointStore::new(Arc::new(MemoryBackend::new())));
        let runner = AgentRunner::new(
            Arc::clone(&checkpoints),
            AgentRunnerConfig { max_replans: 1 },
        );

        // Validation fails more times than the replan budget allows
        let agent = ScriptedAgent::new(5);
        let ctx = AgentContext::new("run-1", "test");
        let err = runner
            .run(&agent, "scripted", &AgentTask::new("do work"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::ValidationFailed);

        let checkpoint = checkpoints
            .load_latest("scripted", "run-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.phase, AgentPhase::Failed);
        // Planned twice: the original round plus one replan
        assert_eq!(*agent.executed.lock(), vec!["first", "second", "first", "second"]);
    }

    #[tokio::test]
    async fn test_resume_from_mid_execution_checkpoint() {
        let checkpoints = Arc::new(CheckpointStore::new(Arc::new(MemoryBackend::new())));
        let runner = AgentRunner::new(Arc::clone(&checkpoints), AgentRunnerConfig::default());

        // A previous process planned and executed the first step
        let plan = Plan::new(vec![PlanStep::new("first"), PlanStep::new("second")]);
        let mut checkpoint = AgentCheckpoint::new("scripted", "run-9");
        checkpoint.phase = AgentPhase::Planning;
        checkpoints.save(&mut checkpoint).await.unwrap();
        checkpoint.phase = AgentPhase::Executing;
        checkpoint.plan = serde_json::to_value(&plan).unwrap();
        checkpoint.step_index = 1;
        checkpoint.last_result = Some(json!([{"step": "first"}]));
        checkpoints.save(&mut checkpoint).await.unwrap();

        let agent = ScriptedAgent::new(0);
        let ctx = AgentContext::new("run-9", "test");
        let result = runner
            .run(&agent, "scripted", &AgentTask::new("do work"), &ctx)
            .await
            .unwrap();

        // Only the second step ran in this process
        assert_eq!(*agent.executed.lock(), vec!["second"]);
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completed_checkpoint_short_circuits() {
        let checkpoints = Arc::new(CheckpointStore::new(Arc::new(MemoryBackend::new())));
        let runner = AgentRunner::new(Arc::clone(&checkpoints), AgentRunnerConfig::default());

        let mut checkpoint = AgentCheckpoint::new("scripted", "run-2");
        checkpoint.phase = AgentPhase::Planning;
        checkpoints.save(&mut checkpoint).await.unwrap();
        checkpoint.phase = AgentPhase::Executing;
        checkpoints.save(&mut checkpoint).await.unwrap();
        checkpoint.phase = AgentPhase::Validating;
        checkpoints.save(&mut checkpoint).await.unwrap();
        checkpoint.phase = AgentPhase::Completed;
        checkpoint.last_result = Some(json!({"done": true}));
        checkpoints.save(&mut checkpoint).await.unwrap();

        let agent = ScriptedAgent::new(0);
        let ctx = AgentContext::new("run-2", "test");
        let result = runner
            .run(&agent, "scripted", &AgentTask::new("ignored"), &ctx)
            .await
            .unwrap();
        assert_eq!(result, json!({"done": true}));
        assert!(agent.executed.lock().is_empty());
    }
}
