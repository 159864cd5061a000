//! ABOUTME: Parallel executor: bounded fan-out with aggregation policies
//! ABOUTME: Higher-priority tasks start first; cancellation propagates to in-flight work

use aishell_core::{AiShellError, Priority, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A unit of work for the executor
pub struct ParallelTask {
    pub name: String,
    pub priority: Priority,
    run: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<Value>> + Send>,
}

impl ParallelTask {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: Priority::Normal,
            run: Box::new(run),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// How the executor combines task outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Wait for every task; succeed iff all succeed
    All,
    /// Succeed as soon as any task succeeds; cancel the rest
    First,
    /// Succeed once strictly more than half succeed
    Majority,
    /// Succeed once at least `n` tasks succeed
    Threshold(usize),
}

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_concurrency: usize,
    pub aggregation: Aggregation,
    pub per_task_timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            aggregation: Aggregation::All,
            per_task_timeout: None,
        }
    }
}

/// One task's recorded outcome
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub outcome: Result<Value>,
}

/// Aggregate result, with outcomes in completion order
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub success: bool,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    /// Whether the aggregation decided before every task terminated
    pub stopped_early: bool,
    pub outcomes: Vec<TaskOutcome>,
}

/// Concurrent fan-out primitive shared by the orchestrator and the
/// coordinator.
///
/// Tasks are pulled highest priority first, FIFO within a priority.
/// Aggregate cancellation propagates to all in-flight tasks; a per-task
/// timeout cancels only that task.
pub struct ParallelExecutor;

impl ParallelExecutor {
    /// Run the tasks under the given options.
    ///
    /// Returns `Cancelled` only when the supplied token fires; aggregation
    /// failures are reported through `AggregateResult::success`.
    pub async fn run(
        tasks: Vec<ParallelTask>,
        opts: ExecutorOptions,
        cancellation: &CancellationToken,
    ) -> Result<AggregateResult> {
        let total = tasks.len();
        let needed = match opts.aggregation {
            Aggregation::All => total,
            Aggregation::First => 1.min(total),
            Aggregation::Majority => total / 2 + 1,
            Aggregation::Threshold(n) => n,
        };

        // Stable sort keeps FIFO order within each priority class
        let mut ordered: Vec<(usize, ParallelTask)> = tasks.into_iter().enumerate().collect();
        ordered.sort_by_key(|(index, task)| (std::cmp::Reverse(task.priority), *index));
        let mut pending: VecDeque<ParallelTask> =
            ordered.into_iter().map(|(_, task)| task).collect();

        let scope = cancellation.child_token();
        let mut join_set: JoinSet<(String, Result<Value>)> = JoinSet::new();
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(total);
        let mut successes = 0usize;
        let mut failures = 0usize;

        let spawn_next =
            |pending: &mut VecDeque<ParallelTask>,
             join_set: &mut JoinSet<(String, Result<Value>)>,
             scope: &CancellationToken| {
                if let Some(task) = pending.pop_front() {
                    let name = task.name.clone();
                    let token = scope.child_token();
                    let timeout = opts.per_task_timeout;
                    let future = (task.run)(token.clone());
                    join_set.spawn(async move {
                        let result = match timeout {
                            Some(limit) => tokio::select! {
                                finished = tokio::time::timeout(limit, future) => match finished {
                                    Ok(result) => result,
                                    Err(_) => {
                                        token.cancel();
                                        Err(AiShellError::Timeout { duration: limit })
                                    }
                                },
                                () = token.cancelled() => Err(AiShellError::Cancelled),
                            },
                            None => tokio::select! {
                                result = future => result,
                                () = token.cancelled() => Err(AiShellError::Cancelled),
                            },
                        };
                        (name, result)
                    });
                }
            };

        while join_set.len() < opts.max_concurrency.max(1) && !pending.is_empty() {
            spawn_next(&mut pending, &mut join_set, &scope);
        }

        let mut stopped_early = false;
        while !join_set.is_empty() {
            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                () = cancellation.cancelled() => {
                    scope.cancel();
                    while let Some(joined) = join_set.join_next().await {
                        if let Ok((name, outcome)) = joined {
                            outcomes.push(TaskOutcome { name, outcome });
                        }
                    }
                    return Err(AiShellError::Cancelled);
                }
            };
            let Some(joined) = joined else { break };
            let (name, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => (
                    "<panicked>".to_string(),
                    Err(AiShellError::internal(format!("task panicked: {join_err}"))),
                ),
            };

            match &outcome {
                Ok(_) => successes += 1,
                Err(_) => failures += 1,
            }
            outcomes.push(TaskOutcome { name, outcome });

            // ALL waits for every task; the other policies may decide as
            // soon as the outcome is settled either way
            let decide_early = !matches!(opts.aggregation, Aggregation::All);
            let satisfied = successes >= needed;
            let unreachable = successes + pending.len() + join_set.len() < needed;
            if decide_early && (satisfied || unreachable) {
                if !pending.is_empty() || !join_set.is_empty() {
                    stopped_early = true;
                    debug!(
                        successes,
                        failures,
                        remaining = pending.len() + join_set.len(),
                        "aggregation decided early"
                    );
                }
                scope.cancel();
                // Drain in-flight tasks so their cancellations are recorded
                while let Some(joined) = join_set.join_next().await {
                    if let Ok((name, outcome)) = joined {
                        match &outcome {
                            Ok(_) => successes += 1,
                            Err(_) => failures += 1,
                        }
                        outcomes.push(TaskOutcome { name, outcome });
                    }
                }
                for task in pending.drain(..) {
                    failures += 1;
                    outcomes.push(TaskOutcome {
                        name: task.name,
                        outcome: Err(AiShellError::Cancelled),
                    });
                }
                break;
            }

            spawn_next(&mut pending, &mut join_set, &scope);
        }

        // Zero-task THRESHOLD(0) and FIRST-of-nothing degenerate to success
        let success = successes >= needed;
        Ok(AggregateResult {
            success,
            successful_tasks: successes,
            failed_tasks: failures,
            stopped_early,
            outcomes,
        })
    }
}
