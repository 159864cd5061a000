//! ABOUTME: Cross-instance tool rate limiting via windowed counters on the coordination backend
//! ABOUTME: Buckets are keyed by (tool, caller); counters reset when their window elapses

use aishell_core::{AiShellError, CoordinationBackend, RateLimit, Result};
use std::sync::Arc;
use tracing::debug;

/// Tool-call rate limiter.
///
/// Consuming a token is an atomic windowed increment on the coordination
/// backend, which keeps the count correct across concurrent calls and
/// across instances sharing the backend.
pub struct RateLimiter {
    backend: Arc<dyn CoordinationBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self { backend }
    }

    fn bucket_key(tool: &str, caller: &str) -> String {
        format!("ratelimit:{tool}:{caller}")
    }

    /// Consume one token from the (tool, caller) bucket.
    ///
    /// Fails with `RateLimited` once the window's budget is spent. The
    /// failed call still counts against the window, so a hot caller stays
    /// limited until it backs off.
    pub async fn acquire(&self, tool: &str, caller: &str, limit: RateLimit) -> Result<()> {
        let key = Self::bucket_key(tool, caller);
        let count = self.backend.incr(&key, Some(limit.window)).await?;
        if count > limit.max_calls {
            debug!(tool, caller, count, max = limit.max_calls, "rate limited");
            return Err(AiShellError::RateLimited { key });
        }
        Ok(())
    }
}
