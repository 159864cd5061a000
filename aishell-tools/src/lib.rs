//! ABOUTME: Tool invocation layer of the orchestration core
//! ABOUTME: Registry, safety controller, rate limiting, audit sinks, and built-in tools

pub mod audit;
pub mod builtin;
pub mod rate_limit;
pub mod registry;
pub mod safety;

pub use audit::{redact, MemoryAuditSink, TracingAuditSink};
pub use builtin::{EchoTool, SleepTool, SqlExecuteTool};
pub use rate_limit::RateLimiter;
pub use registry::{RegisteredTool, ToolRegistry};
pub use safety::{SafetyConfig, SafetyController};
