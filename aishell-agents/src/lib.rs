//! ABOUTME: Specialist agents and the coordinator for the orchestration core
//! ABOUTME: Plan/execute/validate loops with checkpoints, factories, and LLM-assisted planning

pub mod agent;
pub mod coordinator;
pub mod registry;
pub mod runner;
pub mod specialists;

pub use agent::{AgentContext, AgentTask, Plan, PlanStep, SpecialistAgent, Validation};
pub use coordinator::{
    AggregationPolicy, CoordinationResult, CoordinatorAgent, CoordinatorConfig, SubtaskRecord,
};
pub use registry::{AgentFactory, AgentRegistry};
pub use runner::{AgentRunner, AgentRunnerConfig};
pub use specialists::{
    BackupAgent, MigrationAgent, OptimizerAgent, BACKUP_KIND, MIGRATION_KIND, OPTIMIZER_KIND,
};
