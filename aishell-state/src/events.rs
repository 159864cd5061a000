//! ABOUTME: Append-only run event log entries
//! ABOUTME: Events record step lifecycle, run termination, and agent checkpoint writes

use aishell_core::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a workflow run's append-only event log.
///
/// The log is the source of truth for recovery: replaying it reproduces
/// the materialized run view. Step start events are totally ordered within
/// a run; the log records the observed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        attempt: u32,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        attempt: u32,
        error_kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        run_id: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    StepCancelled {
        run_id: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    RunAborted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: String,
        succeeded: bool,
        timestamp: DateTime<Utc>,
    },
    AgentCheckpointWritten {
        run_id: String,
        agent_id: String,
        phase: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// The run this event belongs to
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::StepCancelled { run_id, .. }
            | Self::RunAborted { run_id, .. }
            | Self::RunFinished { run_id, .. }
            | Self::AgentCheckpointWritten { run_id, .. } => run_id,
        }
    }
}
