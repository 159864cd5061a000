//! ABOUTME: Priority task queue with visibility timeouts, retry backoff, and a dead-letter partition
//! ABOUTME: Ordering key is (priority, enqueue timestamp, task id); delivery is at-least-once

use aishell_core::{AiShellError, CoordinationBackend, Priority, Result, RetryPolicy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Priority bands dominate the ordering score; the enqueue timestamp in
/// epoch milliseconds stays well below one band width.
const PRIORITY_BAND: f64 = 1.0e13;

/// A queued unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub payload: Value,
    pub priority: Priority,
    /// Number of deliveries so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// While in flight: when the item becomes eligible for re-delivery
    pub visible_at: Option<DateTime<Utc>>,
    /// Absolute wall-clock deadline after which the task is dead-lettered
    pub deadline: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// Reason recorded on the last nack or dead-letter transition
    pub last_error: Option<String>,
}

/// Parameters for enqueueing a task
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub payload: Value,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
    pub deadline: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl TaskSubmission {
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            priority: Priority::Normal,
            max_attempts: None,
            deadline: None,
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Options for a dequeue call
#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    /// Overrides the queue's configured visibility timeout
    pub visibility_timeout: Option<Duration>,
    /// Blocks up to this long for an eligible item; `None` returns at once
    pub wait_timeout: Option<Duration>,
}

/// Outcome of a nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Requeued; eligible again at the contained time
    Requeued { visible_at: DateTime<Utc> },
    /// Moved to the dead-letter partition
    DeadLettered,
}

/// Options for a nack
#[derive(Debug, Clone)]
pub struct NackOptions {
    /// Explicit re-delivery delay; defaults to the backoff policy
    pub requeue_after: Option<Duration>,
    pub reason: String,
    /// Non-retryable failures go straight to the dead-letter partition
    pub retryable: bool,
}

impl NackOptions {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            requeue_after: None,
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            requeue_after: None,
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// `None` is unbounded; `Some(0)` disables the queue entirely
    pub max_size: Option<usize>,
    pub default_visibility_timeout: Duration,
    pub default_max_attempts: u32,
    /// Backoff applied to nack re-deliveries (delay fields only)
    pub requeue_backoff: RetryPolicy,
    pub reaper_interval: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: None,
            default_visibility_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
            requeue_backoff: RetryPolicy::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(250))
                .with_backoff_multiplier(2.0)
                .with_max_delay(Duration::from_secs(60)),
            reaper_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.default_visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }
}

/// Priority task queue over the coordination backend.
///
/// Items are exclusively owned by the dequeuing consumer until ack, nack,
/// or visibility-timeout expiry. The reaper restores expired in-flight
/// items, so consumers must be idempotent (at-least-once delivery).
pub struct TaskQueue {
    backend: Arc<dyn CoordinationBackend>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn CoordinationBackend>, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    fn ready_set(&self) -> String {
        format!("queue:{}:ready", self.config.name)
    }

    fn inflight_set(&self) -> String {
        format!("queue:{}:inflight", self.config.name)
    }

    fn dead_set(&self) -> String {
        format!("queue:{}:dead", self.config.name)
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("queue:{}:task:{task_id}", self.config.name)
    }

    fn idem_key(&self, key: &str) -> String {
        format!("queue:{}:idem:{key}", self.config.name)
    }

    /// Ordering score: strictly higher priorities always sort ahead of
    /// lower ones; FIFO by enqueue time within a priority; ZPOPMIN's member
    /// tie-break supplies the task-id component.
    fn ordering_score(priority: Priority, enqueued_at: DateTime<Utc>) -> f64 {
        let band = f64::from(3 - priority.score());
        band * PRIORITY_BAND + enqueued_at.timestamp_millis() as f64
    }

    /// Unconditional write of a task record
    async fn put_task(&self, task: &Task) -> Result<()> {
        let key = self.task_key(&task.task_id);
        let serialized = serde_json::to_string(task)?;
        loop {
            let current = self.backend.get(&key).await?;
            if self
                .backend
                .cas(&key, current.as_deref(), &serialized, None)
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn read_task(&self, task_id: &str) -> Result<Option<Task>> {
        match self.backend.get(&self.task_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Enqueue a task. Rejects with `QueueFull` when the configured size is
    /// exceeded; a queue with `max_size = 0` rejects everything.
    pub async fn enqueue(&self, submission: TaskSubmission) -> Result<String> {
        if let Some(max) = self.config.max_size {
            let live = self.backend.zcard(&self.ready_set()).await?
                + self.backend.zcard(&self.inflight_set()).await?;
            if live >= max {
                return Err(AiShellError::QueueFull { capacity: max });
            }
        }

        // Idempotent enqueue: a live task with the same key wins
        if let Some(idem) = &submission.idempotency_key {
            if let Some(existing_id) = self.backend.get(&self.idem_key(idem)).await? {
                if self.read_task(&existing_id).await?.is_some() {
                    debug!(queue = %self.config.name, task_id = %existing_id, "deduplicated enqueue");
                    return Ok(existing_id);
                }
            }
        }

        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            payload: submission.payload,
            priority: submission.priority,
            attempts: 0,
            max_attempts: submission
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            enqueued_at: Utc::now(),
            visible_at: None,
            deadline: submission.deadline,
            idempotency_key: submission.idempotency_key.clone(),
            last_error: None,
        };

        self.put_task(&task).await?;
        if let Some(idem) = &submission.idempotency_key {
            let key = self.idem_key(idem);
            let current = self.backend.get(&key).await?;
            let _ = self
                .backend
                .cas(&key, current.as_deref(), &task.task_id, None)
                .await?;
        }
        let score = Self::ordering_score(task.priority, task.enqueued_at);
        self.backend
            .zadd(&self.ready_set(), &task.task_id, score)
            .await?;
        debug!(queue = %self.config.name, task_id = %task.task_id, priority = %task.priority, "enqueued");
        Ok(task.task_id)
    }

    /// Dequeue the highest-priority eligible task, making it invisible to
    /// other consumers until its visibility timeout elapses.
    pub async fn dequeue(&self, opts: DequeueOptions) -> Result<Option<Task>> {
        let deadline = opts.wait_timeout.map(|w| tokio::time::Instant::now() + w);
        loop {
            if let Some(task) = self.try_dequeue(&opts).await? {
                return Ok(Some(task));
            }
            match deadline {
                Some(d) if tokio::time::Instant::now() < d => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn try_dequeue(&self, opts: &DequeueOptions) -> Result<Option<Task>> {
        loop {
            let Some((task_id, _score)) = self.backend.zpopmin(&self.ready_set()).await? else {
                return Ok(None);
            };
            let Some(mut task) = self.read_task(&task_id).await? else {
                warn!(queue = %self.config.name, task_id = %task_id, "dropping orphaned ready entry");
                continue;
            };

            if task.deadline.is_some_and(|d| Utc::now() >= d) {
                self.move_to_dead_letter(task, "deadline exceeded").await?;
                continue;
            }

            let visibility = opts
                .visibility_timeout
                .unwrap_or(self.config.default_visibility_timeout);
            task.attempts += 1;
            task.visible_at = Some(
                Utc::now()
                    + ChronoDuration::from_std(visibility)
                        .unwrap_or_else(|_| ChronoDuration::zero()),
            );
            self.put_task(&task).await?;
            let visible_ms = task
                .visible_at
                .map(|v| v.timestamp_millis() as f64)
                .unwrap_or_default();
            self.backend
                .zadd(&self.inflight_set(), &task.task_id, visible_ms)
                .await?;
            debug!(queue = %self.config.name, task_id = %task.task_id, attempt = task.attempts, "dequeued");
            return Ok(Some(task));
        }
    }

    /// Acknowledge a completed task, removing it permanently
    pub async fn ack(&self, task_id: &str) -> Result<()> {
        if !self.backend.zrem(&self.inflight_set(), task_id).await? {
            return Err(AiShellError::NotOwner {
                name: task_id.to_string(),
            });
        }
        if let Some(task) = self.read_task(task_id).await? {
            if let Some(idem) = &task.idempotency_key {
                let _ = self.backend.delete(&self.idem_key(idem), None).await;
            }
        }
        self.backend.delete(&self.task_key(task_id), None).await?;
        debug!(queue = %self.config.name, task_id, "acked");
        Ok(())
    }

    /// Negatively acknowledge an in-flight task: requeue with backoff, or
    /// dead-letter it when retries are exhausted or the failure is
    /// non-retryable.
    pub async fn nack(&self, task_id: &str, opts: NackOptions) -> Result<NackOutcome> {
        if !self.backend.zrem(&self.inflight_set(), task_id).await? {
            return Err(AiShellError::NotOwner {
                name: task_id.to_string(),
            });
        }
        let Some(mut task) = self.read_task(task_id).await? else {
            return Err(AiShellError::internal(format!(
                "in-flight task {task_id} has no record"
            )));
        };

        task.last_error = Some(opts.reason.clone());
        if !opts.retryable || task.attempts >= task.max_attempts {
            let reason = opts.reason.clone();
            self.move_to_dead_letter(task, &reason).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = opts
            .requeue_after
            .unwrap_or_else(|| self.config.requeue_backoff.delay_for_attempt(task.attempts));
        let visible_at =
            Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        task.visible_at = Some(visible_at);
        self.put_task(&task).await?;
        // Delayed re-delivery rides the in-flight set until visible_at, when
        // the reaper restores it to ready
        self.backend
            .zadd(
                &self.inflight_set(),
                &task.task_id,
                visible_at.timestamp_millis() as f64,
            )
            .await?;
        debug!(queue = %self.config.name, task_id, ?delay, "nacked, requeue scheduled");
        Ok(NackOutcome::Requeued { visible_at })
    }

    async fn move_to_dead_letter(&self, mut task: Task, reason: &str) -> Result<()> {
        task.visible_at = None;
        task.last_error = Some(reason.to_string());
        self.put_task(&task).await?;
        self.backend
            .zadd(
                &self.dead_set(),
                &task.task_id,
                Utc::now().timestamp_millis() as f64,
            )
            .await?;
        warn!(queue = %self.config.name, task_id = %task.task_id, reason, "dead-lettered");
        Ok(())
    }

    /// Restore in-flight items whose visibility timeout has elapsed.
    /// Returns how many were restored to the ready set.
    pub async fn reap_expired(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let mut restored = 0usize;
        loop {
            let Some((task_id, visible_ms)) = self.backend.zpopmin(&self.inflight_set()).await?
            else {
                break;
            };
            if visible_ms > now_ms {
                // Still invisible; put it back and stop scanning
                self.backend
                    .zadd(&self.inflight_set(), &task_id, visible_ms)
                    .await?;
                break;
            }
            let Some(mut task) = self.read_task(&task_id).await? else {
                continue;
            };
            if task.attempts >= task.max_attempts {
                self.move_to_dead_letter(task, "visibility timeout after final attempt")
                    .await?;
                continue;
            }
            task.visible_at = None;
            self.put_task(&task).await?;
            let score = Self::ordering_score(task.priority, task.enqueued_at);
            self.backend
                .zadd(&self.ready_set(), &task_id, score)
                .await?;
            restored += 1;
            debug!(queue = %self.config.name, task_id = %task_id, "restored expired in-flight task");
        }
        Ok(restored)
    }

    /// Run the reaper until cancellation
    pub fn start_reaper(self: Arc<Self>, cancellation: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.config.reaper_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = self.reap_expired().await {
                            warn!(queue = %self.config.name, error = %err, "reaper pass failed");
                        }
                    }
                }
            }
        })
    }

    /// Inspect the dead-letter partition
    pub async fn list_dead_letter(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for (task_id, _) in self.backend.zrange(&self.dead_set()).await? {
            if let Some(task) = self.read_task(&task_id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Manually resubmit a dead-lettered task with a fresh attempt budget
    pub async fn resubmit(&self, task_id: &str) -> Result<()> {
        if !self.backend.zrem(&self.dead_set(), task_id).await? {
            return Err(AiShellError::NotOwner {
                name: task_id.to_string(),
            });
        }
        let Some(mut task) = self.read_task(task_id).await? else {
            return Err(AiShellError::internal(format!(
                "dead-lettered task {task_id} has no record"
            )));
        };
        task.attempts = 0;
        task.enqueued_at = Utc::now();
        task.last_error = None;
        self.put_task(&task).await?;
        let score = Self::ordering_score(task.priority, task.enqueued_at);
        self.backend
            .zadd(&self.ready_set(), task_id, score)
            .await?;
        Ok(())
    }

    /// Number of ready (visible) tasks
    pub async fn ready_len(&self) -> Result<usize> {
        self.backend.zcard(&self.ready_set()).await
    }

    /// Number of in-flight (invisible) tasks
    pub async fn in_flight_len(&self) -> Result<usize> {
        self.backend.zcard(&self.inflight_set()).await
    }
}
