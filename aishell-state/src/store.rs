//! ABOUTME: State store with an append-only event log and a materialized run view
//! ABOUTME: Recovery prefers the view and replays the log when absent or inconsistent

use crate::backend::StorageBackend;
use crate::events::RunEvent;
use aishell_core::{ErrorKind, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Terminal and in-flight statuses of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// Statuses of a single step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether a dependent may start once this dependency is terminal.
    /// Cancelled counts as failed for downstream readiness.
    #[must_use]
    pub const fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// Per-step record inside the materialized run view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl StepRecord {
    #[must_use]
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            attempt: 0,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error_kind: None,
            error_message: None,
        }
    }
}

/// Materialized view of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: BTreeMap<String, StepRecord>,
    /// User-visible state map: each step's output keyed by step id
    pub state: BTreeMap<String, Value>,
    /// Count of log events reflected in this view; a mismatch with the
    /// log marks the view inconsistent and forces a replay
    pub applied_events: u64,
}

impl RunRecord {
    #[must_use]
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            steps: BTreeMap::new(),
            state: BTreeMap::new(),
            applied_events: 0,
        }
    }
}

/// Persistent state store for workflow runs.
///
/// Every status transition appends an event and rewrites the materialized
/// view under a per-run lock, so the pair stays atomic with respect to
/// readers in this process; a crash between the two writes is healed by
/// replaying the log on recovery.
pub struct StateStore {
    backend: Arc<dyn StorageBackend>,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            run_locks: DashMap::new(),
        }
    }

    fn view_key(run_id: &str) -> String {
        format!("runs:{run_id}:view")
    }

    fn log_key(run_id: &str) -> String {
        format!("runs:{run_id}:log")
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an event and persist the updated view atomically with
    /// respect to other writers of the same run.
    pub async fn record(&self, record: &mut RunRecord, event: RunEvent) -> Result<()> {
        let lock = self.run_lock(&record.run_id);
        let _guard = lock.lock().await;

        self.backend
            .append(&Self::log_key(&record.run_id), serde_json::to_vec(&event)?)
            .await?;
        record.applied_events += 1;
        self.backend
            .set(&Self::view_key(&record.run_id), serde_json::to_vec(record)?)
            .await?;
        Ok(())
    }

    /// Append an agent checkpoint marker to the run log.
    ///
    /// Checkpoint markers are written by agents mid-dispatch, outside the
    /// orchestrator's view updates, so they do not count toward the view's
    /// consistency check.
    pub async fn append_agent_checkpoint(
        &self,
        run_id: &str,
        agent_id: &str,
        phase: &str,
        version: u64,
    ) -> Result<()> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        let event = RunEvent::AgentCheckpointWritten {
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            phase: phase.to_string(),
            version,
            timestamp: Utc::now(),
        };
        self.backend
            .append(&Self::log_key(run_id), serde_json::to_vec(&event)?)
            .await
    }

    /// Events that the materialized view reflects (checkpoint markers are
    /// logged out-of-band)
    fn countable(events: &[RunEvent]) -> u64 {
        events
            .iter()
            .filter(|e| !matches!(e, RunEvent::AgentCheckpointWritten { .. }))
            .count() as u64
    }

    /// Load a run for inspection or recovery.
    ///
    /// Prefers the materialized view; when the view is missing or does not
    /// reflect every logged event, the log is replayed instead.
    pub async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let view: Option<RunRecord> = match self.backend.get(&Self::view_key(run_id)).await? {
            Some(raw) => serde_json::from_slice(&raw).ok(),
            None => None,
        };
        let events = self.events(run_id).await?;

        if let Some(view) = view {
            if view.applied_events == Self::countable(&events) {
                return Ok(Some(view));
            }
            warn!(
                run_id,
                view_events = view.applied_events,
                log_events = events.len(),
                "materialized view inconsistent with log, replaying"
            );
        }
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::replay(run_id, &events)))
    }

    /// All logged events for a run, oldest first
    pub async fn events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let mut events = Vec::new();
        for raw in self.backend.read_log(&Self::log_key(run_id)).await? {
            match serde_json::from_slice(&raw) {
                Ok(event) => events.push(event),
                Err(err) => warn!(run_id, error = %err, "skipping undecodable log entry"),
            }
        }
        Ok(events)
    }

    /// Known run ids
    pub async fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs: Vec<String> = self
            .backend
            .list_keys("runs:")
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix("runs:")
                    .and_then(|rest| rest.strip_suffix(":view").or_else(|| rest.strip_suffix(":log")))
                    .map(ToString::to_string)
            })
            .collect();
        runs.sort();
        runs.dedup();
        Ok(runs)
    }

    /// Fold an event sequence into a run record
    #[must_use]
    pub fn replay(run_id: &str, events: &[RunEvent]) -> RunRecord {
        let mut record = RunRecord::new(run_id, "");
        for event in events {
            match event {
                RunEvent::RunStarted {
                    workflow_id,
                    timestamp,
                    ..
                } => {
                    record.workflow_id.clone_from(workflow_id);
                    record.started_at = *timestamp;
                    record.status = RunStatus::Running;
                }
                RunEvent::StepStarted {
                    step_id,
                    attempt,
                    timestamp,
                    ..
                } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.attempt = *attempt;
                    step.status = StepStatus::Running;
                    step.started_at.get_or_insert(*timestamp);
                }
                RunEvent::StepCompleted {
                    step_id,
                    attempt,
                    result,
                    timestamp,
                    ..
                } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.attempt = *attempt;
                    step.status = StepStatus::Succeeded;
                    step.result = Some(result.clone());
                    step.ended_at = Some(*timestamp);
                    record.state.insert(step_id.clone(), result.clone());
                }
                RunEvent::StepFailed {
                    step_id,
                    attempt,
                    error_kind,
                    message,
                    timestamp,
                    ..
                } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.attempt = *attempt;
                    step.status = StepStatus::Failed;
                    step.error_kind = Some(*error_kind);
                    step.error_message = Some(message.clone());
                    step.ended_at = Some(*timestamp);
                }
                RunEvent::StepSkipped { step_id, timestamp, .. } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.status = StepStatus::Skipped;
                    step.ended_at = Some(*timestamp);
                }
                RunEvent::StepCancelled { step_id, timestamp, .. } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.status = StepStatus::Cancelled;
                    step.ended_at = Some(*timestamp);
                }
                RunEvent::RunAborted { timestamp, .. } => {
                    record.status = RunStatus::Aborted;
                    record.ended_at = Some(*timestamp);
                }
                RunEvent::RunFinished {
                    succeeded,
                    timestamp,
                    ..
                } => {
                    if record.status != RunStatus::Aborted {
                        record.status = if *succeeded {
                            RunStatus::Succeeded
                        } else {
                            RunStatus::Failed
                        };
                    }
                    record.ended_at = Some(*timestamp);
                }
                RunEvent::AgentCheckpointWritten { .. } => {}
            }
        }
        record.applied_events = Self::countable(events);
        debug!(run_id, events = events.len(), "replayed run log");
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()))
    }

    fn started(run_id: &str, step: &str, attempt: u32) -> RunEvent {
        RunEvent::StepStarted {
            run_id: run_id.to_string(),
            step_id: step.to_string(),
            attempt,
            timestamp: Utc::now(),
        }
    }

    fn completed(run_id: &str, step: &str, attempt: u32, result: Value) -> RunEvent {
        RunEvent::StepCompleted {
            run_id: run_id.to_string(),
            step_id: step.to_string(),
            attempt,
            result,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_load_via_view() {
        let store = store();
        let mut record = RunRecord::new("r1", "wf");
        record.status = RunStatus::Running;

        store
            .record(
                &mut record,
                RunEvent::RunStarted {
                    run_id: "r1".to_string(),
                    workflow_id: "wf".to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();

        let loaded = store.load_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.applied_events, 1);
    }

    #[tokio::test]
    async fn test_replay_matches_recorded_view() {
        let store = store();
        let mut record = RunRecord::new("r1", "wf");

        let events = vec![
            RunEvent::RunStarted {
                run_id: "r1".to_string(),
                workflow_id: "wf".to_string(),
                timestamp: Utc::now(),
            },
            started("r1", "a", 1),
            completed("r1", "a", 1, json!({"output": "x"})),
            RunEvent::RunFinished {
                run_id: "r1".to_string(),
                succeeded: true,
                timestamp: Utc::now(),
            },
        ];
        for event in events.clone() {
            // Mirror the orchestrator: mutate the view, then record
            match &event {
                RunEvent::RunStarted { .. } => record.status = RunStatus::Running,
                RunEvent::StepStarted { step_id, attempt, .. } => {
                    let step = record
                        .steps
                        .entry(step_id.clone())
                        .or_insert_with(|| StepRecord::pending(step_id.clone()));
                    step.attempt = *attempt;
                    step.status = StepStatus::Running;
                }
                RunEvent::StepCompleted { step_id, result, .. } => {
                    let step = record.steps.get_mut(step_id).unwrap();
                    step.status = StepStatus::Succeeded;
                    step.result = Some(result.clone());
                    record.state.insert(step_id.clone(), result.clone());
                }
                RunEvent::RunFinished { .. } => record.status = RunStatus::Succeeded,
                _ => {}
            }
            store.record(&mut record, event).await.unwrap();
        }

        let replayed = StateStore::replay("r1", &store.events("r1").await.unwrap());
        assert_eq!(replayed.status, RunStatus::Succeeded);
        assert_eq!(replayed.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(replayed.state["a"], json!({"output": "x"}));
        assert_eq!(replayed.applied_events, 4);
    }

    #[tokio::test]
    async fn test_inconsistent_view_triggers_replay() {
        let store = store();
        let mut record = RunRecord::new("r1", "wf");
        record.status = RunStatus::Running;
        store
            .record(
                &mut record,
                RunEvent::RunStarted {
                    run_id: "r1".to_string(),
                    workflow_id: "wf".to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();

        // Simulate a crash after the log append but before the view write:
        // an extra event exists that the view never reflected
        store
            .backend
            .append(
                &StateStore::log_key("r1"),
                serde_json::to_vec(&completed("r1", "a", 1, json!(1))).unwrap(),
            )
            .await
            .unwrap();

        let loaded = store.load_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.applied_events, 2);
        assert_eq!(loaded.steps["a"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_aborted_run_stays_aborted() {
        let events = vec![
            RunEvent::RunStarted {
                run_id: "r1".to_string(),
                workflow_id: "wf".to_string(),
                timestamp: Utc::now(),
            },
            RunEvent::RunAborted {
                run_id: "r1".to_string(),
                timestamp: Utc::now(),
            },
            RunEvent::RunFinished {
                run_id: "r1".to_string(),
                succeeded: false,
                timestamp: Utc::now(),
            },
        ];
        let record = StateStore::replay("r1", &events);
        assert_eq!(record.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_list_runs() {
        let store = store();
        for run_id in ["r1", "r2"] {
            let mut record = RunRecord::new(run_id, "wf");
            store
                .record(
                    &mut record,
                    RunEvent::RunStarted {
                        run_id: run_id.to_string(),
                        workflow_id: "wf".to_string(),
                        timestamp: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(store.list_runs().await.unwrap(), vec!["r1", "r2"]);
    }
}
