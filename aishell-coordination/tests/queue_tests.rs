//! At-least-once delivery and ordering behavior of the priority task queue

use aishell_coordination::{
    DequeueOptions, MemoryCoordinationBackend, QueueConfig, TaskQueue, TaskSubmission,
};
use aishell_core::Priority;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn queue(config: QueueConfig) -> TaskQueue {
    TaskQueue::new(Arc::new(MemoryCoordinationBackend::new()), config)
}

/// An unacked task comes back after its visibility timeout, still ahead of
/// lower-priority work.
#[tokio::test]
async fn test_at_least_once_redelivery_preserves_priority() {
    let queue = queue(QueueConfig::new("jobs"));

    let t1 = queue
        .enqueue(TaskSubmission::new(json!({"job": "t1"})).with_priority(Priority::Normal))
        .await
        .unwrap();
    let t2 = queue
        .enqueue(TaskSubmission::new(json!({"job": "t2"})).with_priority(Priority::High))
        .await
        .unwrap();

    // High priority wins the first dequeue
    let task = queue
        .dequeue(DequeueOptions {
            visibility_timeout: Some(Duration::from_millis(100)),
            wait_timeout: None,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.task_id, t2);
    assert_eq!(task.attempts, 1);

    // Never acked: after the visibility timeout the reaper restores it
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(queue.reap_expired().await.unwrap(), 1);

    // Redelivered ahead of t1 because of its priority, with the attempt
    // count reflecting the second delivery
    let task = queue
        .dequeue(DequeueOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.task_id, t2);
    assert_eq!(task.attempts, 2);

    let task = queue
        .dequeue(DequeueOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.task_id, t1);
}

/// The background reaper restores expired items without manual passes.
#[tokio::test]
async fn test_background_reaper() {
    let mut config = QueueConfig::new("jobs");
    config.reaper_interval = Duration::from_millis(20);
    let queue = Arc::new(queue(config));

    queue
        .enqueue(TaskSubmission::new(json!({"job": 1})))
        .await
        .unwrap();
    queue
        .dequeue(DequeueOptions {
            visibility_timeout: Some(Duration::from_millis(40)),
            wait_timeout: None,
        })
        .await
        .unwrap()
        .unwrap();

    let cancellation = CancellationToken::new();
    let reaper = Arc::clone(&queue).start_reaper(cancellation.clone());

    // The reaper restores the expired item; a waiting dequeue picks it up
    let task = queue
        .dequeue(DequeueOptions {
            visibility_timeout: None,
            wait_timeout: Some(Duration::from_secs(2)),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.attempts, 2);

    cancellation.cancel();
    reaper.await.unwrap();
}

/// FIFO holds within a priority class even across many tasks.
#[tokio::test]
async fn test_fifo_within_priority() {
    let queue = queue(QueueConfig::new("jobs"));

    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(
            queue
                .enqueue(TaskSubmission::new(json!({ "seq": i })))
                .await
                .unwrap(),
        );
        // Distinct enqueue timestamps keep the ordering observable
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut seen = Vec::new();
    while let Some(task) = queue.dequeue(DequeueOptions::default()).await.unwrap() {
        seen.push(task.task_id);
    }
    assert_eq!(seen, expected);
}
