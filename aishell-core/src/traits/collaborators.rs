//! ABOUTME: Contracts for external collaborators: LLM, database, vector store, vault, approval, audit
//! ABOUTME: The core consumes these interfaces only; implementations live in the hosting program

use crate::error::{ErrorKind, Result};
use crate::types::RiskLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

/// Options for a single generation request
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop: Vec<String>,
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// A completed generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// LLM provider interface.
///
/// Provider failures must be surfaced as `Transient` (retryable) or
/// `Internal` (client error, not retryable); the planner and agents
/// dispatch on kind.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Generate a completion for the prompt
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation>;

    /// Generate a completion as a stream of text chunks
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    /// Embed text into a vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// Database client
// ---------------------------------------------------------------------------

/// Result of a statement execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

/// Uniform query interface over the host's database clients.
///
/// All methods are async and observe cancellation at their suspension
/// points; the core never sees a concrete driver.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<ResultSet>;

    async fn execute_many(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<ResultSet>>;

    async fn begin_tx(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// A search hit from the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: HashMap<String, Value>,
}

/// Vector store interface
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: HashMap<String, Value>,
    ) -> Result<()>;

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<VectorMatch>>;
}

// ---------------------------------------------------------------------------
// Credential vault
// ---------------------------------------------------------------------------

/// An opaque secret. The Debug and Display impls never reveal the bytes;
/// audit records must go through redaction before any secret-adjacent
/// value is persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Expose the raw bytes. Callers must not log the result.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

/// Credential vault interface
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Fetch a secret by name; `None` when absent
    async fn get(&self, name: &str) -> Result<Option<Secret>>;
}

// ---------------------------------------------------------------------------
// Approval sink
// ---------------------------------------------------------------------------

/// A tool call pending approval, with inputs already redacted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub caller: String,
    pub tool: String,
    pub risk_level: RiskLevel,
    pub redacted_params: Value,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
}

/// Outcome of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

/// Human (or policy) approval collaborator
#[async_trait]
pub trait ApprovalSink: Send + Sync {
    /// Request approval, waiting at most `deadline`
    async fn request_approval(
        &self,
        request: &ApprovalRequest,
        deadline: Duration,
    ) -> Result<ApprovalOutcome>;
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

/// Decision recorded for an audited tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    AutoApproved,
    Approved,
    Denied,
    ApprovalTimedOut,
    RateLimited,
    SchemaRejected,
    Succeeded,
    Failed,
}

/// Persisted audit record. Inputs are redacted before the event is
/// constructed; stack traces never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub actor: String,
    pub tool: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub decision: AuditDecision,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub redacted_input: Value,
}

impl AuditEvent {
    pub fn new(actor: impl Into<String>, decision: AuditDecision) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: None,
            step_id: None,
            actor: actor.into(),
            tool: None,
            risk_level: None,
            decision,
            duration_ms: 0,
            error_kind: None,
            redacted_input: Value::Null,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>, risk: RiskLevel) -> Self {
        self.tool = Some(tool.into());
        self.risk_level = Some(risk);
        self
    }

    #[must_use]
    pub fn with_run(mut self, run_id: Option<String>, step_id: Option<String>) -> Self {
        self.run_id = run_id;
        self.step_id = step_id;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_redacted_input(mut self, input: Value) -> Self {
        self.redacted_input = input;
        self
    }
}

/// Audit destination. Writes are best-effort but must not silently drop:
/// implementations retry or surface the error to the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: AuditEvent) -> Result<()>;
}
