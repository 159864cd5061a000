//! ABOUTME: Audit sinks and redaction for tool-call records
//! ABOUTME: Secret-looking fields are masked before an event is constructed

use aishell_core::{AuditEvent, AuditSink, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

/// Field names whose values are masked in audit records
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "credentials",
    "private_key",
];

/// Recursively mask values of secret-looking keys.
///
/// Key matching is case-insensitive substring matching, so `dbPassword`
/// and `AWS_SECRET_ACCESS_KEY` are both caught.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                let lowered = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), redact(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Audit sink that emits structured tracing events with an `audit` marker
#[derive(Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        info!(
            audit = true,
            actor = %event.actor,
            tool = event.tool.as_deref().unwrap_or("-"),
            risk = event.risk_level.map(|r| r.to_string()).unwrap_or_default(),
            decision = ?event.decision,
            duration_ms = event.duration_ms,
            error_kind = event.error_kind.map(|k| k.to_string()).unwrap_or_default(),
            run_id = event.run_id.as_deref().unwrap_or("-"),
            step_id = event.step_id.as_deref().unwrap_or("-"),
            "tool call audited"
        );
        Ok(())
    }
}

/// In-memory audit sink for inspection and tests
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redaction_masks_nested_secrets() {
        let input = json!({
            "host": "db.internal",
            "dbPassword": "hunter2",
            "options": {
                "api_key": "sk-123",
                "retries": 3,
            },
            "targets": [{"token": "abc", "name": "replica"}],
        });

        let redacted = redact(&input);
        assert_eq!(redacted["host"], "db.internal");
        assert_eq!(redacted["dbPassword"], "***");
        assert_eq!(redacted["options"]["api_key"], "***");
        assert_eq!(redacted["options"]["retries"], 3);
        assert_eq!(redacted["targets"][0]["token"], "***");
        assert_eq!(redacted["targets"][0]["name"], "replica");
    }

    #[tokio::test]
    async fn test_memory_sink_records() {
        use aishell_core::AuditDecision;
        let sink = MemoryAuditSink::new();
        sink.write(AuditEvent::new("caller", AuditDecision::AutoApproved))
            .await
            .unwrap();
        assert_eq!(sink.events().len(), 1);
    }
}
