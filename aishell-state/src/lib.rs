//! ABOUTME: Checkpointed state persistence for the orchestration core
//! ABOUTME: Run event logs, materialized run views, and versioned agent checkpoints

pub mod backend;
pub mod checkpoint;
pub mod events;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use checkpoint::{AgentCheckpoint, AgentPhase, CheckpointStore};
pub use events::RunEvent;
pub use store::{RunRecord, RunStatus, StateStore, StepRecord, StepStatus};
