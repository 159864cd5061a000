//! ABOUTME: Coordination backend contract: the sole shared-mutable substrate across instances
//! ABOUTME: All cross-instance mutation flows through CAS, expiring keys, ordered sets, and pub/sub

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared key-value backend used by the lock manager, task queue, state
/// sync, and cross-instance rate limiting.
///
/// The contract assumes a trusted shared store (commonly Redis-shaped):
/// atomic compare-and-set, keys with TTL, atomic windowed counters,
/// score-ordered sets, and pub/sub channels. Single-process deployments
/// use the in-memory implementation; multi-node deployments plug in a
/// shared store behind the same trait.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Atomically set `key` to `new` if its current value equals `old`
    /// (`None` means "must be absent"). Returns whether the swap applied.
    /// When `ttl` is given the key expires after it.
    async fn cas(
        &self,
        key: &str,
        old: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Read a key; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key. With `if_value` the delete applies only when the
    /// current value matches (token-guarded delete for lock release).
    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str, if_value: Option<&str>) -> Result<bool>;

    /// Atomically increment a counter and return the new value. With a
    /// `window` the counter resets when the window elapses (rate-limit
    /// buckets); without one it is a persistent monotonic counter
    /// (fencing tokens).
    async fn incr(&self, key: &str, window: Option<Duration>) -> Result<u64>;

    /// Add `member` to the ordered set with the given score; re-adding
    /// updates the score
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()>;

    /// Pop the member with the lowest score, if any
    async fn zpopmin(&self, set: &str) -> Result<Option<(String, f64)>>;

    /// Remove a member from an ordered set; returns whether it was present
    async fn zrem(&self, set: &str, member: &str) -> Result<bool>;

    /// Number of members in an ordered set
    async fn zcard(&self, set: &str) -> Result<usize>;

    /// All members of an ordered set in ascending score order
    async fn zrange(&self, set: &str) -> Result<Vec<(String, f64)>>;

    /// Publish a payload to a channel (fire-and-forget fan-out)
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. Delivery is at-least-once from the point of
    /// subscription; subscribers reconcile by re-reading current state on
    /// resubscribe.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}
