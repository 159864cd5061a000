//! ABOUTME: Built-in tools registered through the normal registry path
//! ABOUTME: echo and sleep for pipelines and tests, sql_execute over the database collaborator

use aishell_core::{
    AiShellError, DatabaseClient, Result, RiskLevel, Tool, ToolContext, ToolDescriptor,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Returns its `s` parameter as `{"output": s}`
pub struct EchoTool {
    descriptor: ToolDescriptor,
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoTool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("echo", "Echo a string back")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"s": {"type": "string"}},
                    "required": ["s"]
                }))
                .with_risk_level(RiskLevel::Safe),
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Value, _ctx: &ToolContext) -> Result<Value> {
        let s = params
            .get("s")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(json!({ "output": s }))
    }
}

/// Sleeps for `ms` milliseconds, observing cancellation
pub struct SleepTool {
    descriptor: ToolDescriptor,
}

impl Default for SleepTool {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepTool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("sleep", "Sleep for a number of milliseconds")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"ms": {"type": "integer", "minimum": 0}},
                    "required": ["ms"]
                }))
                .with_risk_level(RiskLevel::Safe),
        }
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            () = ctx.cancellation.cancelled() => Err(AiShellError::Cancelled),
        }
    }
}

/// Executes a SQL statement through the database collaborator.
///
/// High risk: the safety controller routes every call through approval.
pub struct SqlExecuteTool {
    descriptor: ToolDescriptor,
    client: Arc<dyn DatabaseClient>,
}

impl SqlExecuteTool {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self {
            descriptor: ToolDescriptor::new("sql_execute", "Execute a SQL statement")
                .with_schema(json!({
                    "type": "object",
                    "properties": {
                        "statement": {"type": "string"},
                        "params": {"type": "array"}
                    },
                    "required": ["statement"]
                }))
                .with_risk_level(RiskLevel::High),
            client,
        }
    }
}

#[async_trait]
impl Tool for SqlExecuteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let statement = params
            .get("statement")
            .and_then(Value::as_str)
            .ok_or_else(|| AiShellError::SchemaViolation {
                message: "sql_execute requires a statement".to_string(),
            })?;
        let bound: Vec<Value> = params
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let result = tokio::select! {
            rows = self.client.execute(statement, &bound) => rows?,
            () = ctx.cancellation.cancelled() => return Err(AiShellError::Cancelled),
        };
        Ok(serde_json::to_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_echo() {
        let tool = EchoTool::new();
        let out = tool
            .invoke(json!({"s": "x"}), &ToolContext::new("t"))
            .await
            .unwrap();
        assert_eq!(out, json!({"output": "x"}));
    }

    #[tokio::test]
    async fn test_sleep_observes_cancellation() {
        let tool = SleepTool::new();
        let token = CancellationToken::new();
        let ctx = ToolContext::new("t").with_cancellation(token.clone());

        let sleeper = tokio::spawn(async move { tool.invoke(json!({"ms": 5000}), &ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let err = sleeper.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::Cancelled);
    }
}
