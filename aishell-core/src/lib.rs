//! ABOUTME: Core traits, types, and error taxonomy for the AI-Shell orchestration core
//! ABOUTME: Foundation layer shared by coordination, state, tools, agents, and workflows

pub mod error;
pub mod logging;
pub mod retry;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{AiShellError, ErrorKind, Result};
pub use retry::RetryPolicy;
pub use traits::{
    backend::CoordinationBackend,
    collaborators::{
        ApprovalOutcome, ApprovalRequest, ApprovalSink, AuditDecision, AuditEvent, AuditSink,
        CredentialVault, DatabaseClient, FinishReason, GenerateOptions, Generation, LLMClient,
        ResultSet, Secret, TokenUsage, VectorMatch, VectorStore,
    },
    dispatch::{AgentDispatcher, DispatchContext},
    tool::{RateLimit, Tool, ToolContext, ToolDescriptor, ToolInvocation},
};
pub use types::{ComponentId, ComponentMetadata, Priority, RiskLevel};
