//! ABOUTME: Namespaced replicated key/value with optimistic versioning and change notifications
//! ABOUTME: Stale writes fail with VersionConflict carrying the current cell; events are at-least-once

use aishell_core::{AiShellError, CoordinationBackend, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A versioned cell in a namespace.
///
/// Versions increase monotonically per key; conflict resolution between
/// replicas keeps the higher version, with last-writer-wins on ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCell {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Change event delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub namespace: String,
    pub key: String,
    pub version: u64,
    pub value: Value,
    pub updated_by: String,
}

/// Namespaced replicated key/value store over the coordination backend.
///
/// Writers that supply an expected version and are stale receive the
/// current cell and must retry with their own merge logic. Subscribers
/// receive events at-least-once and may observe gaps across reconnects;
/// they reconcile by re-reading current versions on resubscribe.
pub struct StateSync {
    backend: Arc<dyn CoordinationBackend>,
    instance_id: String,
}

impl StateSync {
    pub fn new(backend: Arc<dyn CoordinationBackend>, instance_id: impl Into<String>) -> Self {
        Self {
            backend,
            instance_id: instance_id.into(),
        }
    }

    fn cell_key(namespace: &str, key: &str) -> String {
        format!("sync:{namespace}:{key}")
    }

    fn channel(namespace: &str) -> String {
        format!("sync-events:{namespace}")
    }

    /// Read a cell; `None` when the key has never been written
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<StateCell>> {
        match self.backend.get(&Self::cell_key(namespace, key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a cell, optionally guarded by an expected version.
    ///
    /// Returns the new version. A stale `expected_version` fails with
    /// `VersionConflict` carrying the current cell so the caller can merge
    /// and retry.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let storage_key = Self::cell_key(namespace, key);
        loop {
            let current_raw = self.backend.get(&storage_key).await?;
            let current: Option<StateCell> = match &current_raw {
                Some(raw) => Some(serde_json::from_str(raw)?),
                None => None,
            };
            let current_version = current.as_ref().map_or(0, |c| c.version);

            if let Some(expected) = expected_version {
                if expected != current_version {
                    return Err(AiShellError::VersionConflict {
                        namespace: namespace.to_string(),
                        key: key.to_string(),
                        current_version,
                        current_value: current.map(|c| c.value),
                    });
                }
            }

            let cell = StateCell {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.clone(),
                version: current_version + 1,
                updated_by: self.instance_id.clone(),
                updated_at: Utc::now(),
            };
            let serialized = serde_json::to_string(&cell)?;

            if self
                .backend
                .cas(&storage_key, current_raw.as_deref(), &serialized, None)
                .await?
            {
                self.notify(&cell).await?;
                debug!(namespace, key, version = cell.version, "cell written");
                return Ok(cell.version);
            }
            // Lost the race: another writer moved the version. With an
            // expected version the re-read surfaces the conflict; without
            // one, retry until the unconditional write lands.
        }
    }

    /// Apply a cell observed from another replica.
    ///
    /// The higher version prevails; on equal versions the incoming write
    /// wins (last-writer-wins). Returns whether the local cell changed.
    pub async fn apply_remote(&self, incoming: StateCell) -> Result<bool> {
        let storage_key = Self::cell_key(&incoming.namespace, &incoming.key);
        loop {
            let current_raw = self.backend.get(&storage_key).await?;
            let current_version = match &current_raw {
                Some(raw) => serde_json::from_str::<StateCell>(raw)?.version,
                None => 0,
            };
            if incoming.version < current_version {
                return Ok(false);
            }
            let serialized = serde_json::to_string(&incoming)?;
            if self
                .backend
                .cas(&storage_key, current_raw.as_deref(), &serialized, None)
                .await?
            {
                return Ok(true);
            }
        }
    }

    async fn notify(&self, cell: &StateCell) -> Result<()> {
        let change = StateChange {
            namespace: cell.namespace.clone(),
            key: cell.key.clone(),
            version: cell.version,
            value: cell.value.clone(),
            updated_by: cell.updated_by.clone(),
        };
        self.backend
            .publish(&Self::channel(&cell.namespace), &serde_json::to_string(&change)?)
            .await
    }

    /// Subscribe to changes in a namespace whose keys match `pattern`.
    ///
    /// Patterns are exact keys or a prefix followed by `*`.
    pub async fn subscribe(
        &self,
        namespace: &str,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<StateChange>> {
        let mut raw_rx = self.backend.subscribe(&Self::channel(namespace)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                let Ok(change) = serde_json::from_str::<StateChange>(&raw) else {
                    continue;
                };
                if key_matches(&pattern, &change.key) && tx.send(change).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Exact match, `*` wildcard, or `prefix*` match
fn key_matches(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCoordinationBackend;
    use serde_json::json;

    fn sync() -> StateSync {
        StateSync::new(Arc::new(MemoryCoordinationBackend::new()), "node-1")
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let sync = sync();
        assert!(sync.get("agents", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_versions_increase_monotonically() {
        let sync = sync();
        assert_eq!(sync.set("ns", "k", json!(1), None).await.unwrap(), 1);
        assert_eq!(sync.set("ns", "k", json!(2), None).await.unwrap(), 2);
        assert_eq!(sync.set("ns", "k", json!(3), None).await.unwrap(), 3);

        let cell = sync.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(cell.version, 3);
        assert_eq!(cell.value, json!(3));
        assert_eq!(cell.updated_by, "node-1");
    }

    #[tokio::test]
    async fn test_expected_version_guard() {
        let sync = sync();
        sync.set("ns", "k", json!("a"), None).await.unwrap();

        // Correct expectation succeeds and bumps the version
        assert_eq!(sync.set("ns", "k", json!("b"), Some(1)).await.unwrap(), 2);

        // Stale expectation fails with the current cell attached
        let err = sync.set("ns", "k", json!("c"), Some(1)).await.unwrap_err();
        match err {
            AiShellError::VersionConflict {
                current_version,
                current_value,
                ..
            } => {
                assert_eq!(current_version, 2);
                assert_eq!(current_value, Some(json!("b")));
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expected_version_zero_means_create() {
        let sync = sync();
        assert_eq!(sync.set("ns", "new", json!(1), Some(0)).await.unwrap(), 1);
        let err = sync.set("ns", "new", json!(2), Some(0)).await.unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::VersionConflict);
    }

    #[tokio::test]
    async fn test_subscribe_pattern_filtering() {
        let sync = sync();
        let mut agent_rx = sync.subscribe("ns", "agent.*").await.unwrap();
        let mut all_rx = sync.subscribe("ns", "*").await.unwrap();

        sync.set("ns", "agent.1", json!("a"), None).await.unwrap();
        sync.set("ns", "task.1", json!("t"), None).await.unwrap();

        let change = agent_rx.recv().await.unwrap();
        assert_eq!(change.key, "agent.1");

        let first = all_rx.recv().await.unwrap();
        let second = all_rx.recv().await.unwrap();
        assert_eq!(first.key, "agent.1");
        assert_eq!(second.key, "task.1");
    }

    #[tokio::test]
    async fn test_apply_remote_higher_version_wins() {
        let sync = sync();
        sync.set("ns", "k", json!("local"), None).await.unwrap();

        let newer = StateCell {
            namespace: "ns".to_string(),
            key: "k".to_string(),
            value: json!("remote"),
            version: 5,
            updated_by: "node-2".to_string(),
            updated_at: Utc::now(),
        };
        assert!(sync.apply_remote(newer).await.unwrap());
        let cell = sync.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(cell.version, 5);
        assert_eq!(cell.value, json!("remote"));

        let stale = StateCell {
            namespace: "ns".to_string(),
            key: "k".to_string(),
            value: json!("old"),
            version: 2,
            updated_by: "node-3".to_string(),
            updated_at: Utc::now(),
        };
        assert!(!sync.apply_remote(stale).await.unwrap());
    }
}
