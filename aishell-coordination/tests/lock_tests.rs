//! Distributed lock behavior across competing callers

use aishell_coordination::{LockManager, LockOptions, MemoryCoordinationBackend};
use aishell_core::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

/// Two callers race on the same lock; the loser observes Expired/NotOwner
/// after its lease lapses and the winner holds a strictly larger fencing
/// token.
#[tokio::test]
async fn test_lock_fencing_after_ttl_expiry() {
    let backend = Arc::new(MemoryCoordinationBackend::new());
    let manager = LockManager::new(backend);

    // Caller 1 takes the lock with a short lease and then stalls past it
    let mut stale = manager
        .acquire("l", LockOptions::new(Duration::from_millis(100)))
        .await
        .unwrap();
    let t1 = stale.token;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Caller 2 acquires after expiry with a larger fencing token
    let fresh = manager
        .acquire("l", LockOptions::new(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(fresh.token > t1, "fencing tokens must be monotonic");

    // Caller 1's lease is gone: extend reports Expired, release NotOwner
    let err = manager
        .extend(&mut stale, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);

    let err = manager.release(&stale).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOwner);

    manager.release(&fresh).await.unwrap();
}

/// Holding intervals of two callers never overlap: the second acquire
/// blocks until the first release.
#[tokio::test]
async fn test_hold_intervals_are_disjoint() {
    let backend = Arc::new(MemoryCoordinationBackend::new());
    let manager = Arc::new(LockManager::new(backend));

    let held = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let held = Arc::clone(&held);
        handles.push(tokio::spawn(async move {
            let lock = manager
                .acquire(
                    "shared",
                    LockOptions::new(Duration::from_secs(5))
                        .with_wait_timeout(Duration::from_secs(5)),
                )
                .await
                .unwrap();

            let was_held = held.swap(true, std::sync::atomic::Ordering::SeqCst);
            assert!(!was_held, "two callers held the lock at once");
            tokio::time::sleep(Duration::from_millis(20)).await;
            held.store(false, std::sync::atomic::Ordering::SeqCst);

            manager.release(&lock).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Extending a live lease pushes the expiry forward and keeps ownership.
#[tokio::test]
async fn test_extend_live_lease() {
    let backend = Arc::new(MemoryCoordinationBackend::new());
    let manager = LockManager::new(backend);

    let mut handle = manager
        .acquire("l", LockOptions::new(Duration::from_millis(150)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    manager
        .extend(&mut handle, Duration::from_millis(300))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Without the extension the original lease would have lapsed by now
    manager.release(&handle).await.unwrap();
}
