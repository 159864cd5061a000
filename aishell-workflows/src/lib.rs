//! ABOUTME: Declarative DAG workflows for the orchestration core
//! ABOUTME: Orchestrator, parallel executor, and sequential agent chain

pub mod chain;
pub mod context;
pub mod definition;
pub mod executor;
pub mod orchestrator;

pub use chain::{
    AgentChain, ChainLink, ChainResult, LinkErrorPolicy, LinkRecord, LinkStatus,
};
pub use context::ExecutionContext;
pub use definition::{Condition, OnFailure, StepType, WorkflowDefinition, WorkflowStep};
pub use executor::{
    AggregateResult, Aggregation, ExecutorOptions, ParallelExecutor, ParallelTask, TaskOutcome,
};
pub use orchestrator::{
    CustomFn, ExecuteOptions, OrchestratorConfig, WorkflowOrchestrator, WorkflowResult,
};
