//! ABOUTME: Distributed lock manager with TTL leases, fencing tokens, and quorum mode
//! ABOUTME: Ownership is proved by a unique owner token; release is a token-guarded delete

use aishell_core::{AiShellError, CoordinationBackend, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of ownership of a named distributed mutex.
///
/// The fencing token is monotonically increasing across successful
/// acquisitions of the same name; consumers that need mutual exclusion to
/// survive network partitions present it to the protected resource.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub name: String,
    pub owner: String,
    pub token: u64,
    pub lease_expires_at: DateTime<Utc>,
}

/// Options for a single acquisition
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration; must be non-zero
    pub ttl: Duration,
    /// How long to keep retrying a contended lock; `None` means one attempt
    pub wait_timeout: Option<Duration>,
}

impl LockOptions {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            wait_timeout: None,
        }
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, wait: Duration) -> Self {
        self.wait_timeout = Some(wait);
        self
    }
}

/// Lock manager configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease applied when callers do not specify one
    pub default_ttl: Duration,
    /// Poll interval while waiting on a contended lock
    pub retry_interval: Duration,
    /// Fraction of the TTL budgeted for clock drift in quorum mode
    pub drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(25),
            drift_factor: 0.01,
        }
    }
}

/// Distributed lock manager.
///
/// Single-backend mode acquires with an atomic set-if-absent under TTL.
/// Quorum mode runs the same protocol against N independent backends and
/// succeeds only with strictly more than N/2 of them locked inside the
/// drift budget.
pub struct LockManager {
    backends: Vec<Arc<dyn CoordinationBackend>>,
    config: LockConfig,
}

impl LockManager {
    /// Single-backend lock manager
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backends: vec![backend],
            config: LockConfig::default(),
        }
    }

    /// Quorum-mode lock manager over independent backends
    pub fn with_quorum(backends: Vec<Arc<dyn CoordinationBackend>>) -> Self {
        Self {
            backends,
            config: LockConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    fn lock_key(name: &str) -> String {
        format!("lock:{name}")
    }

    fn fence_key(name: &str) -> String {
        format!("lock:{name}:fence")
    }

    /// Acquire the named lock, retrying until `wait_timeout` elapses.
    ///
    /// Returns `Timeout` when the lock stays contended for the whole wait
    /// window, and `SchemaViolation` for a zero TTL.
    pub async fn acquire(&self, name: &str, opts: LockOptions) -> Result<LockHandle> {
        if opts.ttl.is_zero() {
            return Err(AiShellError::SchemaViolation {
                message: format!("lock '{name}' requested with zero ttl"),
            });
        }

        let deadline = opts.wait_timeout.map(|w| tokio::time::Instant::now() + w);
        loop {
            if let Some(handle) = self.try_acquire(name, opts.ttl).await? {
                debug!(lock = name, token = handle.token, "lock acquired");
                return Ok(handle);
            }
            match deadline {
                Some(d) if tokio::time::Instant::now() + self.config.retry_interval <= d => {
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                _ => {
                    return Err(AiShellError::Timeout {
                        duration: opts.wait_timeout.unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// One acquisition round against all backends
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let owner = Uuid::new_v4().to_string();
        let key = Self::lock_key(name);
        let started = tokio::time::Instant::now();

        let mut locked: Vec<&Arc<dyn CoordinationBackend>> = Vec::new();
        for backend in &self.backends {
            match backend.cas(&key, None, &owner, Some(ttl)).await {
                Ok(true) => locked.push(backend),
                Ok(false) => {}
                Err(err) => warn!(lock = name, error = %err, "backend error during acquire"),
            }
        }

        let quorum = self.backends.len() / 2 + 1;
        let drift = ttl.mul_f64(self.config.drift_factor) + Duration::from_millis(2);
        let within_budget = started.elapsed() + drift < ttl;

        if locked.len() >= quorum && within_budget {
            // Fencing tokens stay monotonic: every acquired backend advances
            // its counter and the handle carries the maximum
            let mut token = 0u64;
            for backend in &locked {
                token = token.max(backend.incr(&Self::fence_key(name), None).await?);
            }
            let usable = ttl.checked_sub(drift).unwrap_or_default();
            let expires = Utc::now()
                + ChronoDuration::from_std(usable).unwrap_or_else(|_| ChronoDuration::zero());
            Ok(Some(LockHandle {
                name: name.to_string(),
                owner,
                token,
                lease_expires_at: expires,
            }))
        } else {
            // Failed round: undo partial acquisition everywhere
            for backend in &locked {
                let _ = backend.delete(&key, Some(&owner)).await;
            }
            Ok(None)
        }
    }

    /// Extend the lease on a held lock.
    ///
    /// Returns `Expired` when the lease is no longer current (the TTL
    /// elapsed, or another caller has since acquired).
    pub async fn extend(&self, handle: &mut LockHandle, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(AiShellError::SchemaViolation {
                message: format!("lock '{}' extension with zero ttl", handle.name),
            });
        }
        let key = Self::lock_key(&handle.name);
        let mut extended = 0usize;
        for backend in &self.backends {
            if backend
                .cas(&key, Some(&handle.owner), &handle.owner, Some(ttl))
                .await?
            {
                extended += 1;
            }
        }
        let quorum = self.backends.len() / 2 + 1;
        if extended >= quorum {
            handle.lease_expires_at = Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
            Ok(())
        } else {
            Err(AiShellError::Expired {
                name: handle.name.clone(),
            })
        }
    }

    /// Release a held lock.
    ///
    /// Returns `NotOwner` when the handle no longer owns the lock on a
    /// quorum of backends.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let key = Self::lock_key(&handle.name);
        let mut released = 0usize;
        for backend in &self.backends {
            if backend.delete(&key, Some(&handle.owner)).await? {
                released += 1;
            }
        }
        let quorum = self.backends.len() / 2 + 1;
        if released >= quorum {
            debug!(lock = %handle.name, token = handle.token, "lock released");
            Ok(())
        } else {
            Err(AiShellError::NotOwner {
                name: handle.name.clone(),
            })
        }
    }

    /// Scoped acquisition: runs `f` under the lock and releases on every
    /// exit path, including errors, cancellation, and panics.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        opts: LockOptions,
        cancellation: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = tokio::select! {
            acquired = self.acquire(name, opts) => acquired?,
            () = cancellation.cancelled() => return Err(AiShellError::Cancelled),
        };

        let guarded = std::panic::AssertUnwindSafe(async {
            tokio::select! {
                result = f(handle.clone()) => result,
                () = cancellation.cancelled() => Err(AiShellError::Cancelled),
            }
        })
        .catch_unwind()
        .await;

        let release_result = self.release(&handle).await;
        match guarded {
            Ok(result) => {
                // A failed release after a clean body is surfaced; stale
                // leases self-heal through TTL expiry either way
                if let Err(release_err) = release_result {
                    if result.is_ok() {
                        return Err(release_err);
                    }
                }
                result
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
