//! ABOUTME: Workflow orchestrator: dependency-aware scheduling with retries, timeouts, and recovery
//! ABOUTME: Single writer of run state; steps execute on immutable snapshots with child cancellation

use crate::context::ExecutionContext;
use crate::definition::{OnFailure, StepType, WorkflowDefinition, WorkflowStep};
use aishell_core::{
    AgentDispatcher, AiShellError, CoordinationBackend, DispatchContext, ErrorKind, Result,
    RetryPolicy, ToolContext, ToolInvocation,
};
use aishell_state::{RunEvent, RunRecord, RunStatus, StateStore, StepRecord, StepStatus};
use aishell_tools::SafetyController;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callable registered for custom steps
pub type CustomFn =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Rate-limited attempts retry without consuming the attempt budget, up to
/// this many backoffs per step
const MAX_RATE_LIMIT_BACKOFFS: u32 = 32;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Per-run cap on concurrently executing steps
    pub max_concurrency: usize,
    /// Applied to steps without their own retry policy
    pub default_retry_policy: RetryPolicy,
    /// Applied to steps without their own timeout
    pub default_step_timeout: Duration,
    /// Whole-run deadline; elapsing it aborts the run
    pub run_timeout: Option<Duration>,
    /// Bound on nested sub-workflow recursion
    pub max_subworkflow_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_retry_policy: RetryPolicy::none(),
            default_step_timeout: Duration::from_secs(300),
            run_timeout: None,
            max_subworkflow_depth: 8,
        }
    }
}

/// Options for one execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub initial_state: BTreeMap<String, Value>,
    /// Identity used for rate limiting and audit
    pub caller: String,
    /// Overrides the configured per-run concurrency cap
    pub max_concurrency: Option<usize>,
    /// Fixed run id (tests, idempotent re-submission); defaults to a UUID
    pub run_id: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            initial_state: BTreeMap::new(),
            caller: "orchestrator".to_string(),
            max_concurrency: None,
            run_id: None,
        }
    }
}

/// Terminal result of a workflow run
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub state: BTreeMap<String, Value>,
    pub steps: Vec<StepRecord>,
}

impl WorkflowResult {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            workflow_id: record.workflow_id.clone(),
            status: record.status,
            state: record.state.clone(),
            steps: record.steps.values().cloned().collect(),
        }
    }

    /// Record for a single step, when the run reached it
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Lifecycle notes sent from step tasks to the scheduling loop, which is
/// the sole writer of the run record
enum StepNote {
    Started {
        index: usize,
        attempt: u32,
    },
    AttemptFailed {
        index: usize,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    },
}

/// Final outcome of a step task
struct StepDone {
    index: usize,
    attempt: u32,
    outcome: Result<Value>,
}

/// Declarative workflow orchestrator.
///
/// Runs are exclusively owned by the orchestrator that started them until
/// terminal. Every status transition is persisted through the state store,
/// so a crashed run can be resumed from its last checkpoint; steps that
/// already succeeded are not re-run.
pub struct WorkflowOrchestrator {
    workflows: DashMap<String, Arc<WorkflowDefinition>>,
    custom_fns: DashMap<String, CustomFn>,
    safety: Arc<SafetyController>,
    store: Arc<StateStore>,
    dispatcher: Option<Arc<dyn AgentDispatcher>>,
    backend: Option<Arc<dyn CoordinationBackend>>,
    active: DashMap<String, CancellationToken>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        safety: Arc<SafetyController>,
        store: Arc<StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            workflows: DashMap::new(),
            custom_fns: DashMap::new(),
            safety,
            store,
            dispatcher: None,
            backend: None,
            active: DashMap::new(),
            config,
        }
    }

    /// Wire the agent dispatcher used by agent-type steps
    #[must_use]
    pub fn with_agent_dispatcher(mut self, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Hand custom steps a coordination handle
    #[must_use]
    pub fn with_coordination_backend(mut self, backend: Arc<dyn CoordinationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Validate and store a workflow definition
    pub fn register_workflow(&self, def: WorkflowDefinition) -> Result<()> {
        def.validate()?;
        info!(workflow_id = %def.id, steps = def.steps.len(), "workflow registered");
        self.workflows.insert(def.id.clone(), Arc::new(def));
        Ok(())
    }

    /// Register a callable for custom steps by name
    pub fn register_custom_fn(&self, name: impl Into<String>, f: CustomFn) {
        self.custom_fns.insert(name.into(), f);
    }

    #[must_use]
    pub fn get_workflow(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(id).map(|w| Arc::clone(w.value()))
    }

    #[must_use]
    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|w| w.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn active_executions_count(&self) -> usize {
        self.active.len()
    }

    /// Signal cancellation of a running workflow. Steps observe it at
    /// their next suspension point; the run ends as `Aborted` once
    /// in-flight steps drain.
    pub fn abort_run(&self, run_id: &str) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                info!(run_id, "abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a registered workflow to a terminal status
    pub async fn execute_workflow(
        self: Arc<Self>,
        workflow_id: &str,
        opts: ExecuteOptions,
    ) -> Result<WorkflowResult> {
        Self::execute_inner(self, workflow_id.to_string(), opts, 0, None).await
    }

    /// Resume a crashed or interrupted run from its persisted state.
    ///
    /// Steps already terminal keep their outcome; a step that was in
    /// flight at the crash re-runs its recorded attempt, relying on the
    /// idempotency key the tool layer saw the first time.
    pub async fn resume_run(self: Arc<Self>, run_id: &str) -> Result<WorkflowResult> {
        let record = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| AiShellError::InvalidWorkflow {
                message: format!("unknown run '{run_id}'"),
            })?;
        if record.status.is_terminal() {
            return Ok(WorkflowResult::from_record(&record));
        }
        let def =
            self.get_workflow(&record.workflow_id)
                .ok_or_else(|| AiShellError::InvalidWorkflow {
                    message: format!(
                        "run '{run_id}' references unregistered workflow '{}'",
                        record.workflow_id
                    ),
                })?;
        info!(run_id, workflow_id = %record.workflow_id, "resuming run");
        Self::run_to_completion(self, def, record, "orchestrator".to_string(), None, 0, None).await
    }

    async fn execute_inner(
        this: Arc<Self>,
        workflow_id: String,
        opts: ExecuteOptions,
        depth: usize,
        parent: Option<CancellationToken>,
    ) -> Result<WorkflowResult> {
        let def = this
            .get_workflow(&workflow_id)
            .ok_or_else(|| AiShellError::InvalidWorkflow {
                message: format!("unknown workflow '{workflow_id}'"),
            })?;

        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record = RunRecord::new(run_id.clone(), workflow_id.clone());
        record.state = opts.initial_state.clone();
        for step in &def.steps {
            record
                .steps
                .insert(step.id.clone(), StepRecord::pending(step.id.clone()));
        }
        record.status = RunStatus::Running;
        this.store
            .record(
                &mut record,
                RunEvent::RunStarted {
                    run_id: run_id.clone(),
                    workflow_id,
                    timestamp: Utc::now(),
                },
            )
            .await?;

        Self::run_to_completion(
            this,
            def,
            record,
            opts.caller,
            opts.max_concurrency,
            depth,
            parent,
        )
        .await
    }

    fn execute_nested(
        this: Arc<Self>,
        workflow_id: String,
        opts: ExecuteOptions,
        depth: usize,
        parent: CancellationToken,
    ) -> BoxFuture<'static, Result<WorkflowResult>> {
        Box::pin(Self::execute_inner(this, workflow_id, opts, depth, Some(parent)))
    }

    #[allow(clippy::too_many_lines)]
    async fn run_to_completion(
        this: Arc<Self>,
        def: Arc<WorkflowDefinition>,
        mut record: RunRecord,
        caller: String,
        max_concurrency: Option<usize>,
        depth: usize,
        parent: Option<CancellationToken>,
    ) -> Result<WorkflowResult> {
        let run_id = record.run_id.clone();
        let cap = max_concurrency
            .unwrap_or(this.config.max_concurrency)
            .max(1);
        let run_token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let steps_scope = run_token.child_token();
        this.active.insert(run_id.clone(), run_token.clone());

        let watchdog = this.config.run_timeout.map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        // Working status map; terminal statuses recovered from the record
        // are kept, a step in flight at a crash re-runs its attempt
        let mut statuses: BTreeMap<String, StepStatus> = BTreeMap::new();
        let mut initial_attempts: BTreeMap<String, u32> = BTreeMap::new();
        for step in &def.steps {
            let recovered = record.steps.get(&step.id);
            let status = recovered.map_or(StepStatus::Pending, |s| s.status);
            match status {
                StepStatus::Running | StepStatus::Cancelled => {
                    let attempt = recovered.map_or(0, |s| s.attempt);
                    initial_attempts.insert(step.id.clone(), attempt.saturating_sub(1));
                    statuses.insert(step.id.clone(), StepStatus::Pending);
                }
                other => {
                    statuses.insert(step.id.clone(), other);
                }
            }
            record
                .steps
                .entry(step.id.clone())
                .or_insert_with(|| StepRecord::pending(step.id.clone()));
        }

        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<StepNote>();
        let mut join_set: JoinSet<StepDone> = JoinSet::new();
        let mut aborted = false;
        let mut failing = false;

        'main: loop {
            // Scheduling fixpoint: mark skips and launch ready steps in
            // declaration order until nothing changes
            if !failing && !aborted {
                loop {
                    let mut changed = false;
                    for (index, step) in def.steps.iter().enumerate() {
                        if statuses[&step.id] != StepStatus::Pending {
                            continue;
                        }
                        let dep_statuses: Vec<StepStatus> = step
                            .dependencies
                            .iter()
                            .map(|dep| statuses[dep])
                            .collect();
                        if !dep_statuses.iter().all(|s| s.is_terminal()) {
                            continue;
                        }
                        let unsatisfied = dep_statuses.iter().any(|s| !s.satisfies_dependency());
                        let all_skipped = !dep_statuses.is_empty()
                            && dep_statuses.iter().all(|s| *s == StepStatus::Skipped);
                        if unsatisfied || all_skipped {
                            // Failed dependency, or an entirely skipped
                            // branch, propagates a skip
                            statuses.insert(step.id.clone(), StepStatus::Skipped);
                            this.mark_skipped(&mut record, &step.id).await?;
                            changed = true;
                            continue;
                        }
                        if join_set.len() >= cap {
                            continue;
                        }
                        statuses.insert(step.id.clone(), StepStatus::Running);
                        Self::spawn_step(
                            &this,
                            &def,
                            index,
                            &record,
                            &run_id,
                            &caller,
                            &steps_scope,
                            &note_tx,
                            initial_attempts.get(&step.id).copied().unwrap_or(0),
                            depth,
                            &mut join_set,
                        );
                        changed = true;
                    }
                    if !changed {
                        break;
                    }
                }
            }

            if join_set.is_empty() {
                break 'main;
            }

            tokio::select! {
                biased;
                () = run_token.cancelled(), if !aborted && !failing => {
                    aborted = true;
                    steps_scope.cancel();
                }
                Some(note) = note_rx.recv() => {
                    this.apply_note(&def, &mut record, note).await?;
                }
                joined = join_set.join_next() => {
                    // Started/attempt notes precede the completion; drain
                    // them first so the log keeps the observed order
                    while let Ok(note) = note_rx.try_recv() {
                        this.apply_note(&def, &mut record, note).await?;
                    }
                    let done = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(join_err)) => {
                            warn!(run_id = %run_id, error = %join_err, "step task panicked");
                            continue;
                        }
                        None => continue,
                    };
                    let failure_policy = this
                        .apply_completion(&def, &mut record, &mut statuses, done)
                        .await?;
                    if let Some((step_id, policy)) = failure_policy {
                        match policy {
                            OnFailure::FailWorkflow => {
                                warn!(run_id = %run_id, step_id = %step_id, "step failed, failing workflow");
                                failing = true;
                                steps_scope.cancel();
                            }
                            OnFailure::Continue => {
                                debug!(run_id = %run_id, step_id = %step_id, "step failed, continuing");
                            }
                            OnFailure::SkipDependents => {
                                for dependent in def.transitive_dependents(&step_id) {
                                    if statuses[&dependent] == StepStatus::Pending {
                                        statuses.insert(dependent.clone(), StepStatus::Skipped);
                                        this.mark_skipped(&mut record, &dependent).await?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Any notes still queued from the last completions
        while let Ok(note) = note_rx.try_recv() {
            this.apply_note(&def, &mut record, note).await?;
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        this.active.remove(&run_id);

        this.finalize(&def, &mut record, &statuses, aborted).await?;
        Ok(WorkflowResult::from_record(&record))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_step(
        this: &Arc<Self>,
        def: &Arc<WorkflowDefinition>,
        index: usize,
        record: &RunRecord,
        run_id: &str,
        caller: &str,
        steps_scope: &CancellationToken,
        note_tx: &mpsc::UnboundedSender<StepNote>,
        initial_attempt: u32,
        depth: usize,
        join_set: &mut JoinSet<StepDone>,
    ) {
        let orchestrator = Arc::clone(this);
        let step = def.steps[index].clone();
        let snapshot = record.state.clone();
        let run_id = run_id.to_string();
        let caller = caller.to_string();
        let token = steps_scope.child_token();
        let note_tx = note_tx.clone();
        let policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| this.config.default_retry_policy.clone());
        let timeout = step.timeout.unwrap_or(this.config.default_step_timeout);

        join_set.spawn(async move {
            Self::run_step(
                orchestrator,
                step,
                index,
                snapshot,
                run_id,
                caller,
                token,
                note_tx,
                initial_attempt,
                policy,
                timeout,
                depth,
            )
            .await
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        this: Arc<Self>,
        step: WorkflowStep,
        index: usize,
        snapshot: BTreeMap<String, Value>,
        run_id: String,
        caller: String,
        token: CancellationToken,
        note_tx: mpsc::UnboundedSender<StepNote>,
        initial_attempt: u32,
        policy: RetryPolicy,
        timeout: Duration,
        depth: usize,
    ) -> StepDone {
        let mut attempt = initial_attempt + 1;
        let mut rate_limit_backoffs = 0u32;
        let _ = note_tx.send(StepNote::Started { index, attempt });

        loop {
            let once = Self::execute_step_once(
                &this, &step, &snapshot, &run_id, &caller, attempt, &token, depth,
            );
            let outcome = tokio::select! {
                finished = tokio::time::timeout(timeout, once) => match finished {
                    Ok(result) => result,
                    Err(_) => Err(AiShellError::Timeout { duration: timeout }),
                },
                () = token.cancelled() => Err(AiShellError::Cancelled),
            };

            let err = match outcome {
                Ok(value) => {
                    return StepDone {
                        index,
                        attempt,
                        outcome: Ok(value),
                    }
                }
                Err(err) => err,
            };
            let kind = err.kind();
            if kind == ErrorKind::Cancelled {
                return StepDone {
                    index,
                    attempt,
                    outcome: Err(err),
                };
            }

            // Rate-limited attempts back off without consuming the budget
            let delay = if kind == ErrorKind::RateLimited
                && policy.retry_on.contains(&ErrorKind::RateLimited)
                && rate_limit_backoffs < MAX_RATE_LIMIT_BACKOFFS
            {
                rate_limit_backoffs += 1;
                Some(policy.delay_for_attempt(rate_limit_backoffs))
            } else if policy.should_retry(kind, attempt) {
                Some(policy.delay_for_attempt(attempt))
            } else {
                None
            };

            let Some(delay) = delay else {
                return StepDone {
                    index,
                    attempt,
                    outcome: Err(err),
                };
            };

            let _ = note_tx.send(StepNote::AttemptFailed {
                index,
                attempt,
                kind,
                message: err.to_string(),
            });
            debug!(step_id = %step.id, attempt, ?delay, kind = %kind, "retrying after backoff");

            // Cancellation pre-empts the backoff sleep
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    return StepDone {
                        index,
                        attempt,
                        outcome: Err(AiShellError::Cancelled),
                    }
                }
            }

            if kind != ErrorKind::RateLimited {
                attempt += 1;
                let _ = note_tx.send(StepNote::Started { index, attempt });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step_once(
        this: &Arc<Self>,
        step: &WorkflowStep,
        snapshot: &BTreeMap<String, Value>,
        run_id: &str,
        caller: &str,
        attempt: u32,
        token: &CancellationToken,
        depth: usize,
    ) -> Result<Value> {
        match &step.config {
            StepType::Tool {
                tool_name,
                parameters,
                idempotency_key,
            } => {
                let key = idempotency_key
                    .clone()
                    .unwrap_or_else(|| format!("{run_id}:{}:{attempt}", step.id));
                let invocation = ToolInvocation::new(tool_name.clone(), parameters.clone())
                    .with_idempotency_key(key);
                let ctx = ToolContext::new(caller)
                    .with_run(run_id, step.id.clone())
                    .with_cancellation(token.clone());
                this.safety.invoke(invocation, &ctx).await
            }
            StepType::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let branch = condition.evaluate(snapshot);
                let next = if branch { if_true } else { if_false };
                Ok(json!({ "branch": branch, "next": next }))
            }
            StepType::Custom {
                function_name,
                parameters,
            } => {
                let Some(custom) = this
                    .custom_fns
                    .get(function_name)
                    .map(|f| Arc::clone(f.value()))
                else {
                    return Err(AiShellError::InvalidWorkflow {
                        message: format!("unknown custom function '{function_name}'"),
                    });
                };
                let mut ctx = ExecutionContext::new(run_id, step.id.clone())
                    .with_state(snapshot.clone())
                    .with_parameters(parameters.clone())
                    .with_cancellation(token.clone());
                ctx.caller = caller.to_string();
                if let Some(backend) = &this.backend {
                    ctx = ctx.with_backend(Arc::clone(backend));
                }
                // Panics in user callables become Internal errors
                match std::panic::AssertUnwindSafe(custom(ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(AiShellError::internal(format!(
                        "custom function '{function_name}' panicked"
                    ))),
                }
            }
            StepType::Agent { agent_kind, task } => {
                let Some(dispatcher) = this.dispatcher.clone() else {
                    return Err(AiShellError::internal(
                        "no agent dispatcher configured for agent steps",
                    ));
                };
                let ctx = DispatchContext::new(caller)
                    .with_run_id(run_id)
                    .with_cancellation(token.clone());
                dispatcher.dispatch(agent_kind, task.clone(), &ctx).await
            }
            StepType::SubWorkflow {
                workflow_id,
                initial_state,
            } => {
                if depth + 1 > this.config.max_subworkflow_depth {
                    return Err(AiShellError::InvalidWorkflow {
                        message: format!(
                            "sub-workflow nesting exceeds depth {}",
                            this.config.max_subworkflow_depth
                        ),
                    });
                }
                let opts = ExecuteOptions {
                    initial_state: initial_state.clone(),
                    caller: caller.to_string(),
                    ..Default::default()
                };
                let result = Self::execute_nested(
                    Arc::clone(this),
                    workflow_id.clone(),
                    opts,
                    depth + 1,
                    token.clone(),
                )
                .await?;
                match result.status {
                    RunStatus::Succeeded => Ok(json!({
                        "run_id": result.run_id,
                        "status": "succeeded",
                        "state": result.state,
                    })),
                    RunStatus::Aborted => Err(AiShellError::Cancelled),
                    _ => {
                        let failed = result
                            .steps
                            .iter()
                            .find(|s| s.status == StepStatus::Failed);
                        Err(AiShellError::internal(format!(
                            "sub-workflow '{workflow_id}' failed{}",
                            failed
                                .and_then(|s| s.error_message.clone())
                                .map(|m| format!(": {m}"))
                                .unwrap_or_default()
                        )))
                    }
                }
            }
        }
    }

    async fn apply_note(
        &self,
        def: &Arc<WorkflowDefinition>,
        record: &mut RunRecord,
        note: StepNote,
    ) -> Result<()> {
        match note {
            StepNote::Started { index, attempt } => {
                let step_id = def.steps[index].id.clone();
                if let Some(step) = record.steps.get_mut(&step_id) {
                    step.attempt = attempt;
                    step.status = StepStatus::Running;
                    step.started_at.get_or_insert_with(Utc::now);
                }
                let run_id = record.run_id.clone();
                self.store
                    .record(
                        record,
                        RunEvent::StepStarted {
                            run_id,
                            step_id,
                            attempt,
                            timestamp: Utc::now(),
                        },
                    )
                    .await
            }
            StepNote::AttemptFailed {
                index,
                attempt,
                kind,
                message,
            } => {
                let step_id = def.steps[index].id.clone();
                if let Some(step) = record.steps.get_mut(&step_id) {
                    step.error_kind = Some(kind);
                    step.error_message = Some(message.clone());
                }
                let run_id = record.run_id.clone();
                self.store
                    .record(
                        record,
                        RunEvent::StepFailed {
                            run_id,
                            step_id,
                            attempt,
                            error_kind: kind,
                            message,
                            timestamp: Utc::now(),
                        },
                    )
                    .await
            }
        }
    }

    /// Apply a step's terminal outcome. Returns the failure policy to act
    /// on when the step failed.
    async fn apply_completion(
        &self,
        def: &Arc<WorkflowDefinition>,
        record: &mut RunRecord,
        statuses: &mut BTreeMap<String, StepStatus>,
        done: StepDone,
    ) -> Result<Option<(String, OnFailure)>> {
        let step_def = &def.steps[done.index];
        let step_id = step_def.id.clone();
        let run_id = record.run_id.clone();

        match done.outcome {
            Ok(value) => {
                statuses.insert(step_id.clone(), StepStatus::Succeeded);
                if let Some(step) = record.steps.get_mut(&step_id) {
                    step.status = StepStatus::Succeeded;
                    step.attempt = done.attempt;
                    step.result = Some(value.clone());
                    step.ended_at = Some(Utc::now());
                }
                record.state.insert(step_id.clone(), value.clone());
                self.store
                    .record(
                        record,
                        RunEvent::StepCompleted {
                            run_id,
                            step_id: step_id.clone(),
                            attempt: done.attempt,
                            result: value.clone(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await?;

                // A conditional's untaken branch is skipped right away so
                // the next scheduling pass only sees the named branch
                if let StepType::Conditional {
                    if_true, if_false, ..
                } = &step_def.config
                {
                    let branch = value
                        .get("branch")
                        .and_then(Value::as_bool)
                        .unwrap_or_default();
                    let untaken = if branch { if_false } else { if_true };
                    for target in untaken {
                        if statuses[target] == StepStatus::Pending {
                            statuses.insert(target.clone(), StepStatus::Skipped);
                            self.mark_skipped(record, target).await?;
                        }
                    }
                }
                Ok(None)
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                statuses.insert(step_id.clone(), StepStatus::Cancelled);
                if let Some(step) = record.steps.get_mut(&step_id) {
                    step.status = StepStatus::Cancelled;
                    step.ended_at = Some(Utc::now());
                }
                self.store
                    .record(
                        record,
                        RunEvent::StepCancelled {
                            run_id,
                            step_id,
                            timestamp: Utc::now(),
                        },
                    )
                    .await?;
                Ok(None)
            }
            Err(err) => {
                let kind = err.kind();
                statuses.insert(step_id.clone(), StepStatus::Failed);
                if let Some(step) = record.steps.get_mut(&step_id) {
                    step.status = StepStatus::Failed;
                    step.attempt = done.attempt;
                    step.error_kind = Some(kind);
                    step.error_message = Some(err.to_string());
                    step.ended_at = Some(Utc::now());
                }
                self.store
                    .record(
                        record,
                        RunEvent::StepFailed {
                            run_id,
                            step_id: step_id.clone(),
                            attempt: done.attempt,
                            error_kind: kind,
                            message: err.to_string(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await?;
                Ok(Some((step_id, step_def.on_failure)))
            }
        }
    }

    async fn mark_skipped(&self, record: &mut RunRecord, step_id: &str) -> Result<()> {
        if let Some(step) = record.steps.get_mut(step_id) {
            step.status = StepStatus::Skipped;
            step.ended_at = Some(Utc::now());
        }
        let run_id = record.run_id.clone();
        self.store
            .record(
                record,
                RunEvent::StepSkipped {
                    run_id,
                    step_id: step_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await
    }

    async fn finalize(
        &self,
        def: &Arc<WorkflowDefinition>,
        record: &mut RunRecord,
        statuses: &BTreeMap<String, StepStatus>,
        aborted: bool,
    ) -> Result<()> {
        let run_id = record.run_id.clone();
        if aborted {
            record.status = RunStatus::Aborted;
            record.ended_at = Some(Utc::now());
            self.store
                .record(
                    record,
                    RunEvent::RunAborted {
                        run_id: run_id.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await?;
            info!(run_id = %run_id, "run aborted");
            return Ok(());
        }

        let succeeded = def.steps.iter().all(|step| {
            matches!(
                statuses[&step.id],
                StepStatus::Succeeded | StepStatus::Skipped
            )
        });
        record.status = if succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        record.ended_at = Some(Utc::now());
        self.store
            .record(
                record,
                RunEvent::RunFinished {
                    run_id: run_id.clone(),
                    succeeded,
                    timestamp: Utc::now(),
                },
            )
            .await?;
        info!(run_id = %run_id, status = ?record.status, "run finished");
        Ok(())
    }
}
