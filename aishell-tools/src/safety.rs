//! ABOUTME: Safety controller gating every tool invocation
//! ABOUTME: Rate limit, schema validation, risk classification, approval, idempotency, audit

use crate::audit::redact;
use crate::rate_limit::RateLimiter;
use crate::registry::{RegisteredTool, ToolRegistry};
use aishell_core::{
    AiShellError, ApprovalOutcome, ApprovalRequest, ApprovalSink, AuditDecision, AuditEvent,
    AuditSink, CoordinationBackend, ErrorKind, Result, RiskLevel, ToolContext, ToolInvocation,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Safety controller configuration
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Window granted to the approval collaborator before `ApprovalTimeout`
    pub approval_timeout: Duration,
    /// Upper bound on remembered idempotent results
    pub idempotency_cache_size: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(60),
            idempotency_cache_size: 10_000,
        }
    }
}

/// The gate every tool call passes through.
///
/// Order of checks: rate limit, then input schema, then the risk decision
/// matrix. When both the rate limit and the schema would reject a call,
/// the rate-limit error wins, protecting downstream resources from
/// validation-probe storms. Approval is requested for high risk always and
/// for medium risk when the descriptor demands it; critical risk is
/// audited on every path regardless of outcome.
pub struct SafetyController {
    registry: Arc<ToolRegistry>,
    rate_limiter: RateLimiter,
    approval: Arc<dyn ApprovalSink>,
    audit: Arc<dyn AuditSink>,
    idempotency: DashMap<String, Value>,
    config: SafetyConfig,
}

impl SafetyController {
    pub fn new(
        registry: Arc<ToolRegistry>,
        backend: Arc<dyn CoordinationBackend>,
        approval: Arc<dyn ApprovalSink>,
        audit: Arc<dyn AuditSink>,
        config: SafetyConfig,
    ) -> Self {
        Self {
            registry,
            rate_limiter: RateLimiter::new(backend),
            approval,
            audit,
            idempotency: DashMap::new(),
            config,
        }
    }

    /// Validate, gate, and execute a tool invocation
    pub async fn invoke(&self, invocation: ToolInvocation, ctx: &ToolContext) -> Result<Value> {
        let Some(tool) = self.registry.get(&invocation.tool) else {
            return Err(AiShellError::SchemaViolation {
                message: format!("unknown tool '{}'", invocation.tool),
            });
        };
        let risk = tool.descriptor.risk_level;
        let redacted_params = redact(&invocation.params);

        // Replayed call: return the recorded outcome without re-executing
        if let Some(key) = &invocation.idempotency_key {
            if let Some(cached) = self.idempotency.get(key) {
                debug!(tool = %invocation.tool, key, "deduplicated replayed call");
                return Ok(cached.clone());
            }
        }

        // Rate limit first so its error wins over schema violations
        if let Some(limit) = tool.descriptor.rate_limit {
            if let Err(err) = self
                .rate_limiter
                .acquire(&invocation.tool, &ctx.caller, limit)
                .await
            {
                self.audit_decision(&tool, ctx, &redacted_params, AuditDecision::RateLimited, None)
                    .await?;
                return Err(err);
            }
        }

        if let Err(err) = tool.validate_params(&invocation.params) {
            self.audit_decision(
                &tool,
                ctx,
                &redacted_params,
                AuditDecision::SchemaRejected,
                Some(ErrorKind::SchemaViolation),
            )
            .await?;
            return Err(err);
        }

        let needs_approval = match risk {
            RiskLevel::Safe | RiskLevel::Low => false,
            RiskLevel::Medium => tool.descriptor.requires_approval,
            RiskLevel::High | RiskLevel::Critical => true,
        };

        if needs_approval {
            self.request_approval(&tool, ctx, &redacted_params).await?;
        }

        self.execute(&tool, invocation, ctx, redacted_params).await
    }

    async fn request_approval(
        &self,
        tool: &Arc<RegisteredTool>,
        ctx: &ToolContext,
        redacted_params: &Value,
    ) -> Result<()> {
        let request = ApprovalRequest {
            caller: ctx.caller.clone(),
            tool: tool.descriptor.name.clone(),
            risk_level: tool.descriptor.risk_level,
            redacted_params: redacted_params.clone(),
            run_id: ctx.run_id.clone(),
            step_id: ctx.step_id.clone(),
        };
        let deadline = self.config.approval_timeout;

        let outcome = tokio::select! {
            granted = tokio::time::timeout(deadline, self.approval.request_approval(&request, deadline)) => {
                match granted {
                    Ok(result) => result?,
                    Err(_) => ApprovalOutcome::TimedOut,
                }
            }
            () = ctx.cancellation.cancelled() => return Err(AiShellError::Cancelled),
        };

        match outcome {
            ApprovalOutcome::Approved => {
                self.audit_decision(tool, ctx, redacted_params, AuditDecision::Approved, None)
                    .await?;
                Ok(())
            }
            ApprovalOutcome::Denied => {
                self.audit_decision(tool, ctx, redacted_params, AuditDecision::Denied, None)
                    .await?;
                Err(AiShellError::Denied {
                    reason: format!(
                        "approval denied for '{}' at risk {}",
                        tool.descriptor.name, tool.descriptor.risk_level
                    ),
                })
            }
            ApprovalOutcome::TimedOut => {
                self.audit_decision(
                    tool,
                    ctx,
                    redacted_params,
                    AuditDecision::ApprovalTimedOut,
                    Some(ErrorKind::ApprovalTimeout),
                )
                .await?;
                Err(AiShellError::ApprovalTimeout { deadline })
            }
        }
    }

    async fn execute(
        &self,
        tool: &Arc<RegisteredTool>,
        invocation: ToolInvocation,
        ctx: &ToolContext,
        redacted_params: Value,
    ) -> Result<Value> {
        let started = Instant::now();
        let result = tokio::select! {
            output = tool.callable.invoke(invocation.params, ctx) => output,
            () = ctx.cancellation.cancelled() => Err(AiShellError::Cancelled),
        };
        let duration = started.elapsed();

        let (decision, error_kind) = match &result {
            Ok(_) => (AuditDecision::Succeeded, None),
            Err(err) => (AuditDecision::Failed, Some(err.kind())),
        };
        let event = AuditEvent::new(ctx.caller.clone(), decision)
            .with_tool(tool.descriptor.name.clone(), tool.descriptor.risk_level)
            .with_run(ctx.run_id.clone(), ctx.step_id.clone())
            .with_duration(duration)
            .with_redacted_input(redacted_params);
        let event = match error_kind {
            Some(kind) => event.with_error_kind(kind),
            None => event,
        };
        self.write_audit(event).await?;

        if let (Ok(output), Some(key)) = (&result, &invocation.idempotency_key) {
            if self.idempotency.len() < self.config.idempotency_cache_size {
                self.idempotency.insert(key.clone(), output.clone());
            }
        }
        result
    }

    /// Record a gate decision. Non-execution decisions are always audited
    /// for critical risk; approval outcomes are audited at every risk level
    /// that can reach them.
    async fn audit_decision(
        &self,
        tool: &Arc<RegisteredTool>,
        ctx: &ToolContext,
        redacted_params: &Value,
        decision: AuditDecision,
        error_kind: Option<ErrorKind>,
    ) -> Result<()> {
        let always = matches!(
            decision,
            AuditDecision::Approved
                | AuditDecision::Denied
                | AuditDecision::ApprovalTimedOut
                | AuditDecision::AutoApproved
        );
        if !always && tool.descriptor.risk_level != RiskLevel::Critical {
            return Ok(());
        }
        let event = AuditEvent::new(ctx.caller.clone(), decision)
            .with_tool(tool.descriptor.name.clone(), tool.descriptor.risk_level)
            .with_run(ctx.run_id.clone(), ctx.step_id.clone())
            .with_redacted_input(redacted_params.clone());
        let event = match error_kind {
            Some(kind) => event.with_error_kind(kind),
            None => event,
        };
        self.write_audit(event).await
    }

    /// Audit writes are retried once and then surfaced; they never drop
    /// silently.
    async fn write_audit(&self, event: AuditEvent) -> Result<()> {
        if let Err(first) = self.audit.write(event.clone()).await {
            warn!(error = %first, "audit write failed, retrying");
            self.audit.write(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use aishell_coordination::MemoryCoordinationBackend;
    use aishell_core::{RateLimit, Tool, ToolDescriptor};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct EchoBack {
        descriptor: ToolDescriptor,
    }

    impl EchoBack {
        fn with_descriptor(descriptor: ToolDescriptor) -> Self {
            Self { descriptor }
        }
    }

    #[async_trait]
    impl Tool for EchoBack {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, params: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({ "echoed": params }))
        }
    }

    struct ScriptedApproval {
        outcomes: Mutex<Vec<ApprovalOutcome>>,
    }

    impl ScriptedApproval {
        fn new(outcomes: Vec<ApprovalOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl ApprovalSink for ScriptedApproval {
        async fn request_approval(
            &self,
            _request: &ApprovalRequest,
            _deadline: Duration,
        ) -> Result<ApprovalOutcome> {
            Ok(self
                .outcomes
                .lock()
                .pop()
                .unwrap_or(ApprovalOutcome::Denied))
        }
    }

    fn controller(
        tools: Vec<Arc<dyn Tool>>,
        approval: Arc<dyn ApprovalSink>,
    ) -> (SafetyController, Arc<MemoryAuditSink>) {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register(tool).unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        let controller = SafetyController::new(
            registry,
            Arc::new(MemoryCoordinationBackend::new()),
            approval,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            SafetyConfig::default(),
        );
        (controller, audit)
    }

    #[tokio::test]
    async fn test_safe_tool_auto_approves() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("echo", "echo").with_risk_level(RiskLevel::Safe),
        ));
        let (controller, audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));

        let result = controller
            .invoke(
                ToolInvocation::new("echo", json!({"s": "x"})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap();
        assert_eq!(result["echoed"]["s"], "x");

        // Execution outcome is audited
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, AuditDecision::Succeeded);
    }

    #[tokio::test]
    async fn test_high_risk_denied_without_approval() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("drop_table", "dangerous").with_risk_level(RiskLevel::High),
        ));
        let (controller, audit) = controller(
            vec![tool],
            Arc::new(ScriptedApproval::new(vec![ApprovalOutcome::Denied])),
        );

        let err = controller
            .invoke(
                ToolInvocation::new("drop_table", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Denied);
        assert_eq!(audit.events()[0].decision, AuditDecision::Denied);
    }

    #[tokio::test]
    async fn test_high_risk_proceeds_on_approval() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("migrate", "migration").with_risk_level(RiskLevel::High),
        ));
        let (controller, audit) = controller(
            vec![tool],
            Arc::new(ScriptedApproval::new(vec![ApprovalOutcome::Approved])),
        );

        controller
            .invoke(
                ToolInvocation::new("migrate", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap();

        let decisions: Vec<AuditDecision> = audit.events().iter().map(|e| e.decision).collect();
        assert_eq!(
            decisions,
            vec![AuditDecision::Approved, AuditDecision::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_approval_timeout() {
        struct NeverAnswers;

        #[async_trait]
        impl ApprovalSink for NeverAnswers {
            async fn request_approval(
                &self,
                _request: &ApprovalRequest,
                _deadline: Duration,
            ) -> Result<ApprovalOutcome> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("drop_table", "dangerous").with_risk_level(RiskLevel::High),
        ));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(tool).unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let controller = SafetyController::new(
            registry,
            Arc::new(MemoryCoordinationBackend::new()),
            Arc::new(NeverAnswers),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            SafetyConfig {
                approval_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let err = controller
            .invoke(
                ToolInvocation::new("drop_table", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ApprovalTimeout);
        assert_eq!(audit.events()[0].decision, AuditDecision::ApprovalTimedOut);
    }

    #[tokio::test]
    async fn test_medium_risk_respects_requires_approval() {
        let plain = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("analyze", "analysis").with_risk_level(RiskLevel::Medium),
        ));
        let gated = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("rewrite", "rewrites data")
                .with_risk_level(RiskLevel::Medium)
                .requires_approval(),
        ));
        let (controller, _audit) = controller(
            vec![plain, gated],
            Arc::new(ScriptedApproval::new(vec![ApprovalOutcome::Denied])),
        );

        // Plain medium risk auto-approves
        controller
            .invoke(
                ToolInvocation::new("analyze", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap();

        // The override forces the approval path
        let err = controller
            .invoke(
                ToolInvocation::new("rewrite", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Denied);
    }

    #[tokio::test]
    async fn test_rate_limit_wins_over_schema_violation() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("strict", "strict schema")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"n": {"type": "integer"}},
                    "required": ["n"]
                }))
                .with_rate_limit(RateLimit::new(1, Duration::from_secs(60))),
        ));
        let (controller, _audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));
        let ctx = ToolContext::new("caller");

        // First call spends the only token
        controller
            .invoke(ToolInvocation::new("strict", json!({"n": 1})), &ctx)
            .await
            .unwrap();

        // Second call violates both the rate limit and the schema; the
        // rate-limit error must win
        let err = controller
            .invoke(ToolInvocation::new("strict", json!({"bad": true})), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_schema_violation_rejects() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("strict", "strict schema").with_schema(json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            })),
        ));
        let (controller, _audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));

        let err = controller
            .invoke(
                ToolInvocation::new("strict", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn test_idempotency_key_deduplicates() {
        struct Counting {
            descriptor: ToolDescriptor,
            calls: Arc<Mutex<u32>>,
        }

        #[async_trait]
        impl Tool for Counting {
            fn descriptor(&self) -> &ToolDescriptor {
                &self.descriptor
            }
            async fn invoke(&self, _params: Value, _ctx: &ToolContext) -> Result<Value> {
                let mut calls = self.calls.lock();
                *calls += 1;
                Ok(json!({ "call": *calls }))
            }
        }

        let calls = Arc::new(Mutex::new(0));
        let tool = Arc::new(Counting {
            descriptor: ToolDescriptor::new("side_effect", "counts calls"),
            calls: Arc::clone(&calls),
        });
        let (controller, _audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));
        let ctx = ToolContext::new("caller");

        let invocation =
            ToolInvocation::new("side_effect", json!({})).with_idempotency_key("run:step:1");
        let first = controller.invoke(invocation.clone(), &ctx).await.unwrap();
        let replay = controller.invoke(invocation, &ctx).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_critical_risk_audits_rejections() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("wipe", "critical")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"confirm": {"type": "boolean"}},
                    "required": ["confirm"]
                }))
                .with_risk_level(RiskLevel::Critical),
        ));
        let (controller, audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));

        let err = controller
            .invoke(
                ToolInvocation::new("wipe", json!({})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);

        // Even a schema rejection leaves an audit trail at critical risk
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, AuditDecision::SchemaRejected);
    }

    #[tokio::test]
    async fn test_secrets_redacted_in_audit() {
        let tool = Arc::new(EchoBack::with_descriptor(
            ToolDescriptor::new("connect", "connects").with_risk_level(RiskLevel::Safe),
        ));
        let (controller, audit) =
            controller(vec![tool], Arc::new(ScriptedApproval::new(vec![])));

        controller
            .invoke(
                ToolInvocation::new("connect", json!({"host": "db", "password": "hunter2"})),
                &ToolContext::new("caller"),
            )
            .await
            .unwrap();

        let events = audit.events();
        assert_eq!(events[0].redacted_input["password"], "***");
        assert_eq!(events[0].redacted_input["host"], "db");
    }
}
