//! ABOUTME: Tool trait and descriptor consumed by the registry and safety controller
//! ABOUTME: Every tool carries an input schema, a risk level, and an optional rate limit

use crate::error::Result;
use crate::types::RiskLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-tool rate limit: at most `max_calls` within each `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: u64,
    pub window: Duration,
}

impl RateLimit {
    #[must_use]
    pub const fn new(max_calls: u64, window: Duration) -> Self {
        Self { max_calls, window }
    }
}

/// Descriptor for a registered tool.
///
/// The input schema is a JSON Schema document validated against every
/// invocation's parameters before the call reaches the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub risk_level: RiskLevel,
    pub rate_limit: Option<RateLimit>,
    /// Escalates medium-risk tools to require approval
    pub requires_approval: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            risk_level: RiskLevel::default(),
            rate_limit: None,
            requires_approval: false,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    #[must_use]
    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Context handed to a tool at invocation time
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Identity of the caller (agent id, step id, or external principal)
    pub caller: String,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    /// Cancellation observed at the tool's suspension points
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            run_id: None,
            step_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self.step_id = Some(step_id.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// An intended tool invocation, as submitted to the safety controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub params: Value,
    /// Lets the tool layer deduplicate replayed calls after crash recovery
    pub idempotency_key: Option<String>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            params,
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Descriptor used for registration, risk classification, and validation
    fn descriptor(&self) -> &ToolDescriptor;

    /// Execute the tool. Implementations must observe `ctx.cancellation`
    /// at their suspension points.
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ToolDescriptor::new("sql_execute", "Run a SQL statement")
            .with_risk_level(RiskLevel::High)
            .with_rate_limit(RateLimit::new(10, Duration::from_secs(60)))
            .requires_approval();

        assert_eq!(descriptor.name, "sql_execute");
        assert_eq!(descriptor.risk_level, RiskLevel::High);
        assert_eq!(descriptor.rate_limit.unwrap().max_calls, 10);
        assert!(descriptor.requires_approval);
    }

    #[test]
    fn test_invocation_idempotency_key() {
        let invocation = ToolInvocation::new("echo", serde_json::json!({"s": "x"}))
            .with_idempotency_key("run-1:step-a:1");
        assert_eq!(invocation.idempotency_key.as_deref(), Some("run-1:step-a:1"));
    }
}
