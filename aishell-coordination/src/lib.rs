//! ABOUTME: Distributed coordination primitives for the orchestration core
//! ABOUTME: Lock manager, priority task queue, and state sync over a shared backend

pub mod backend;
pub mod lock;
pub mod queue;
pub mod sync;

pub use backend::MemoryCoordinationBackend;
pub use lock::{LockConfig, LockHandle, LockManager, LockOptions};
pub use queue::{
    DequeueOptions, NackOptions, NackOutcome, QueueConfig, Task, TaskQueue, TaskSubmission,
};
pub use sync::{StateCell, StateChange, StateSync};
