//! ABOUTME: Core types and foundational data structures
//! ABOUTME: Provides ComponentId, Priority, RiskLevel, and ComponentMetadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for components in the orchestration core.
///
/// Uses UUID v4 for random generation and UUID v5 for deterministic
/// generation from names, so named components (agents, workflows) get
/// reproducible identifiers.
///
/// # Examples
///
/// ```
/// use aishell_core::ComponentId;
///
/// let id1 = ComponentId::new();
/// let id2 = ComponentId::new();
/// assert_ne!(id1, id2);
///
/// let id3 = ComponentId::from_name("backup-agent");
/// let id4 = ComponentId::from_name("backup-agent");
/// assert_eq!(id3, id4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId(Uuid);

impl ComponentId {
    /// Generate a new random ComponentId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create ComponentId from name (deterministic)
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let namespace = Uuid::NAMESPACE_DNS;
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }

    /// Get inner UUID
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling priority for queued tasks and parallel executor entries.
///
/// Higher priorities are delivered first; within the same priority the
/// ordering is FIFO by enqueue timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric score used as the primary component of ordering keys
    #[must_use]
    pub const fn score(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Risk classification attached to every registered tool.
///
/// Drives the safety controller's decision matrix: `Safe` and `Low`
/// auto-approve, `Medium` auto-approves unless overridden, `High` and
/// `Critical` require explicit approval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Metadata shared by registered components (agents, tools, workflows)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub id: ComponentId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl ComponentMetadata {
    /// Create new metadata with a deterministic id derived from the name
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: ComponentId::from_name(&name),
            name,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_determinism() {
        let a = ComponentId::from_name("coordinator");
        let b = ComponentId::from_name("coordinator");
        assert_eq!(a, b);
        assert_ne!(ComponentId::new(), ComponentId::new());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Critical.score(), 3);
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::Safe < RiskLevel::Low);
    }

    #[test]
    fn test_metadata_derives_id_from_name() {
        let meta = ComponentMetadata::new("optimizer", "database optimizer agent");
        assert_eq!(meta.id, ComponentId::from_name("optimizer"));
    }
}
