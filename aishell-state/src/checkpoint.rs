//! ABOUTME: Agent checkpoint records and their versioned store
//! ABOUTME: A checkpoint is written on every phase transition; recovery reads the latest version

use crate::backend::StorageBackend;
use aishell_core::{AiShellError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Lifecycle phase of a specialist agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Executing,
    Validating,
    Completed,
    Failed,
}

impl AgentPhase {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal phase transitions. Replanning after a failed validation goes
    /// back to Planning; everything else moves forward or terminates.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planning, Self::Executing | Self::Failed)
                | (Self::Executing, Self::Executing | Self::Validating | Self::Failed)
                | (Self::Validating, Self::Planning | Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Durable snapshot of an agent's progress within a run.
///
/// Versions increase by one per write; another process can reconstitute
/// the agent from the latest checkpoint after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub agent_id: String,
    pub run_id: String,
    pub phase: AgentPhase,
    /// Index of the next plan step to execute
    pub step_index: usize,
    /// Opaque plan payload owned by the agent
    pub plan: Value,
    pub last_result: Option<Value>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AgentCheckpoint {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            run_id: run_id.into(),
            phase: AgentPhase::Planning,
            step_index: 0,
            plan: Value::Null,
            last_result: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Versioned checkpoint store over a storage backend
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
        }
    }

    fn key(agent_id: &str, run_id: &str) -> String {
        format!("checkpoints:{run_id}:{agent_id}")
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist a checkpoint, bumping its version past the stored one.
    ///
    /// The caller's snapshot must be current: writing from a stale version
    /// fails with `VersionConflict` so a resumed agent cannot clobber
    /// progress made by another process.
    pub async fn save(&self, checkpoint: &mut AgentCheckpoint) -> Result<u64> {
        let key = Self::key(&checkpoint.agent_id, &checkpoint.run_id);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let stored_version = match self.backend.get(&key).await? {
            Some(raw) => serde_json::from_slice::<AgentCheckpoint>(&raw)?.version,
            None => 0,
        };
        if checkpoint.version != stored_version {
            return Err(AiShellError::VersionConflict {
                namespace: "checkpoints".to_string(),
                key,
                current_version: stored_version,
                current_value: None,
            });
        }

        checkpoint.version = stored_version + 1;
        checkpoint.updated_at = Utc::now();
        self.backend
            .set(&key, serde_json::to_vec(checkpoint)?)
            .await?;
        debug!(
            agent_id = %checkpoint.agent_id,
            run_id = %checkpoint.run_id,
            phase = %checkpoint.phase,
            version = checkpoint.version,
            "checkpoint written"
        );
        Ok(checkpoint.version)
    }

    /// Latest checkpoint for an agent within a run
    pub async fn load_latest(
        &self,
        agent_id: &str,
        run_id: &str,
    ) -> Result<Option<AgentCheckpoint>> {
        match self.backend.get(&Self::key(agent_id, run_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove a terminal agent's checkpoint
    pub async fn remove(&self, agent_id: &str, run_id: &str) -> Result<bool> {
        self.backend.delete(&Self::key(agent_id, run_id)).await
    }
}
