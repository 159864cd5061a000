//! ABOUTME: In-memory coordination backend for tests and single-node deployments
//! ABOUTME: Implements CAS with TTL, windowed counters, ordered sets, and pub/sub fan-out

use aishell_core::{CoordinationBackend, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// A key-value entry with optional expiry
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// A counter with an optional reset window
#[derive(Debug, Clone)]
struct Counter {
    value: u64,
    window_started: Instant,
    window: Option<Duration>,
}

/// Single-process implementation of [`CoordinationBackend`].
///
/// Semantically equivalent to a Redis-shaped shared store: CAS is atomic
/// per key, counters reset when their window elapses, ordered sets break
/// score ties by member, and pub/sub fans out to every live subscriber.
/// Multi-node deployments substitute a shared store behind the same trait.
#[derive(Default)]
pub struct MemoryCoordinationBackend {
    entries: DashMap<String, Entry>,
    counters: DashMap<String, Counter>,
    sorted_sets: Mutex<HashMap<String, Vec<(String, f64)>>>,
    channels: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl MemoryCoordinationBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            drop(self.entries.remove(key));
        }
        None
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordinationBackend {
    async fn cas(
        &self,
        key: &str,
        old: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        // Entry-level lock makes the read-compare-write atomic per key
        let mut slot = self.entries.entry(key.to_string()).or_insert(Entry {
            value: String::new(),
            expires_at: Some(Instant::now()),
        });
        let current = if slot.is_expired() {
            None
        } else {
            Some(slot.value.as_str())
        };
        if current != old {
            return Ok(false);
        }
        slot.value = new.to_string();
        slot.expires_at = ttl.map(|t| Instant::now() + t);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn delete(&self, key: &str, if_value: Option<&str>) -> Result<bool> {
        if let Some(expected) = if_value {
            let matches = self.live_value(key).as_deref() == Some(expected);
            if !matches {
                return Ok(false);
            }
        } else if self.live_value(key).is_none() {
            return Ok(false);
        }
        Ok(self.entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str, window: Option<Duration>) -> Result<u64> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            window_started: Instant::now(),
            window,
        });
        if let Some(w) = counter.window {
            if counter.window_started.elapsed() >= w {
                counter.value = 0;
                counter.window_started = Instant::now();
            }
        }
        counter.value += 1;
        Ok(counter.value)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let mut sets = self.sorted_sets.lock();
        let entries = sets.entry(set.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
        } else {
            entries.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zpopmin(&self, set: &str) -> Result<Option<(String, f64)>> {
        let mut sets = self.sorted_sets.lock();
        let Some(entries) = sets.get_mut(set) else {
            return Ok(None);
        };
        // Ties break by member, matching Redis ZPOPMIN
        let min_index = entries
            .iter()
            .enumerate()
            .min_by(|(_, (ma, sa)), (_, (mb, sb))| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ma.cmp(mb))
            })
            .map(|(i, _)| i);
        Ok(min_index.map(|i| entries.swap_remove(i)))
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        let mut sets = self.sorted_sets.lock();
        let Some(entries) = sets.get_mut(set) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|(m, _)| m != member);
        Ok(entries.len() < before)
    }

    async fn zcard(&self, set: &str) -> Result<usize> {
        let sets = self.sorted_sets.lock();
        Ok(sets.get(set).map_or(0, Vec::len))
    }

    async fn zrange(&self, set: &str) -> Result<Vec<(String, f64)>> {
        let sets = self.sorted_sets.lock();
        let mut entries = sets.get(set).cloned().unwrap_or_default();
        entries.sort_by(|(ma, sa), (mb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ma.cmp(mb))
        });
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if let Some(mut senders) = self.channels.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
            debug!(channel, subscribers = senders.len(), "published");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_set_if_absent() {
        let backend = MemoryCoordinationBackend::new();
        assert!(backend.cas("k", None, "v1", None).await.unwrap());
        // Second set-if-absent fails
        assert!(!backend.cas("k", None, "v2", None).await.unwrap());
        // Conditional swap succeeds
        assert!(backend.cas("k", Some("v1"), "v2", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_cas_ttl_expiry() {
        let backend = MemoryCoordinationBackend::new();
        backend
            .cas("k", None, "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        // Expired slot behaves as absent for set-if-absent
        assert!(backend.cas("k", None, "v2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_guarded_delete() {
        let backend = MemoryCoordinationBackend::new();
        backend.cas("k", None, "owner-a", None).await.unwrap();
        assert!(!backend.delete("k", Some("owner-b")).await.unwrap());
        assert!(backend.delete("k", Some("owner-a")).await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_windowed_counter_resets() {
        let backend = MemoryCoordinationBackend::new();
        let window = Some(Duration::from_millis(30));
        assert_eq!(backend.incr("c", window).await.unwrap(), 1);
        assert_eq!(backend.incr("c", window).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.incr("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_monotonic_counter() {
        let backend = MemoryCoordinationBackend::new();
        assert_eq!(backend.incr("fence", None).await.unwrap(), 1);
        assert_eq!(backend.incr("fence", None).await.unwrap(), 2);
        assert_eq!(backend.incr("fence", None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zpopmin_ordering() {
        let backend = MemoryCoordinationBackend::new();
        backend.zadd("s", "b", 2.0).await.unwrap();
        backend.zadd("s", "a", 1.0).await.unwrap();
        backend.zadd("s", "c", 1.0).await.unwrap();

        // Lowest score first; score ties break by member
        assert_eq!(
            backend.zpopmin("s").await.unwrap(),
            Some(("a".to_string(), 1.0))
        );
        assert_eq!(
            backend.zpopmin("s").await.unwrap(),
            Some(("c".to_string(), 1.0))
        );
        assert_eq!(
            backend.zpopmin("s").await.unwrap(),
            Some(("b".to_string(), 2.0))
        );
        assert_eq!(backend.zpopmin("s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pub_sub_fan_out() {
        let backend = MemoryCoordinationBackend::new();
        let mut rx1 = backend.subscribe("ch").await.unwrap();
        let mut rx2 = backend.subscribe("ch").await.unwrap();

        backend.publish("ch", "hello").await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }
}
