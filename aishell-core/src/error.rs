//! ABOUTME: Error types and canonical error kinds for the orchestration core
//! ABOUTME: Provides AiShellError enum, ErrorKind classification, and Result alias

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Canonical error kinds.
///
/// Retry logic throughout the core dispatches on kind, never on message
/// strings. `WorkflowStep::retry_policy.retry_on` is a set of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Workflow definition failed validation
    InvalidWorkflow,
    /// Dependency graph contains a cycle
    CyclicDependency,
    /// A step or dependency reference does not resolve
    UnknownStep,
    /// Input failed structural schema validation
    SchemaViolation,
    /// Network or backend unavailability; retryable
    Transient,
    /// An operation exceeded its deadline
    Timeout,
    /// Cancellation was observed at a suspension point
    Cancelled,
    /// Optimistic concurrency conflict; caller merges and retries
    VersionConflict,
    /// A rate limit rejected the call; retryable with caller backoff
    RateLimited,
    /// The safety layer denied the call
    Denied,
    /// Approval was not granted within the configured window
    ApprovalTimeout,
    /// Lock or queue item is owned by someone else
    NotOwner,
    /// A lease or lock TTL elapsed
    Expired,
    /// Queue capacity exceeded
    QueueFull,
    /// A queued task exhausted retries and was dead-lettered
    DeadLetter,
    /// The planner could not produce a valid plan within its bound
    PlanningFailed,
    /// Agent validation failed after bounded replanning
    ValidationFailed,
    /// Unexpected failure; non-retryable, logged with context
    Internal,
}

impl ErrorKind {
    /// Whether the orchestrator may retry an error of this kind without an
    /// explicit `retry_on` entry. Only `Transient` and `RateLimited` qualify;
    /// `Timeout` and `Cancelled` are retried only when policy names them.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }

    /// Whether the kind represents a terminal control-flow outcome rather
    /// than a fault (cancellation, dead-letter).
    #[must_use]
    pub const fn is_control_flow(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadLetter)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidWorkflow => "invalid_workflow",
            Self::CyclicDependency => "cyclic_dependency",
            Self::UnknownStep => "unknown_step",
            Self::SchemaViolation => "schema_violation",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::VersionConflict => "version_conflict",
            Self::RateLimited => "rate_limited",
            Self::Denied => "denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::NotOwner => "not_owner",
            Self::Expired => "expired",
            Self::QueueFull => "queue_full",
            Self::DeadLetter => "dead_letter",
            Self::PlanningFailed => "planning_failed",
            Self::ValidationFailed => "validation_failed",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// Error enum for all orchestration core operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum AiShellError {
    #[error("Invalid workflow: {message}")]
    InvalidWorkflow { message: String },

    #[error("Workflow '{workflow_id}' contains a dependency cycle")]
    CyclicDependency { workflow_id: String },

    #[error("Unknown step reference: {step_id}")]
    UnknownStep { step_id: String },

    #[error("Schema violation: {message}")]
    SchemaViolation { message: String },

    #[error("Transient failure: {message}")]
    Transient { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Version conflict on {namespace}/{key}: current version is {current_version}")]
    VersionConflict {
        namespace: String,
        key: String,
        current_version: u64,
        current_value: Option<serde_json::Value>,
    },

    #[error("Rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("Denied by safety controller: {reason}")]
    Denied { reason: String },

    #[error("Approval not granted within {deadline:?}")]
    ApprovalTimeout { deadline: Duration },

    #[error("Not the owner of '{name}'")]
    NotOwner { name: String },

    #[error("Lease on '{name}' has expired")]
    Expired { name: String },

    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task {task_id} was dead-lettered: {reason}")]
    DeadLetter { task_id: String, reason: String },

    #[error("Planning failed: {message}")]
    PlanningFailed { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AiShellError {
    /// The canonical kind of this error, for retry dispatch
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidWorkflow { .. } => ErrorKind::InvalidWorkflow,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::UnknownStep { .. } => ErrorKind::UnknownStep,
            Self::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Denied { .. } => ErrorKind::Denied,
            Self::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            Self::NotOwner { .. } => ErrorKind::NotOwner,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::DeadLetter { .. } => ErrorKind::DeadLetter,
            Self::PlanningFailed { .. } => ErrorKind::PlanningFailed,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this error is retryable absent an explicit `retry_on` entry
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Shorthand for an internal error with context
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a transient error with context
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for AiShellError {
    fn from(err: serde_json::Error) -> Self {
        Self::SchemaViolation {
            message: err.to_string(),
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, AiShellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping_is_stable() {
        let err = AiShellError::Transient {
            message: "backend unreachable".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());

        let err = AiShellError::Denied {
            reason: "critical risk".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Denied);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_control_flow_kinds() {
        assert!(ErrorKind::Cancelled.is_control_flow());
        assert!(ErrorKind::DeadLetter.is_control_flow());
        assert!(!ErrorKind::Timeout.is_control_flow());
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let kind = ErrorKind::VersionConflict;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"version_conflict\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_error_serde_round_trip() {
        let err = AiShellError::VersionConflict {
            namespace: "agents".to_string(),
            key: "a1".to_string(),
            current_version: 7,
            current_value: Some(serde_json::json!({"phase": "executing"})),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: AiShellError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), ErrorKind::VersionConflict);
    }
}
