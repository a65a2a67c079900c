//! Integration tests for common Leasehold workflows.
//!
//! These tests verify that the most common use cases work correctly.

use futures::future::join_all;
use leasehold::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Fenced Resource Tests
// =============================================================================

/// A resource that only accepts writes carrying a current fencing token.
struct Ledger {
    validator: FencingValidator,
    entries: parking_lot::Mutex<Vec<(FencingToken, String)>>,
}

impl Ledger {
    fn new() -> Self {
        Self {
            validator: FencingValidator::new(),
            entries: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn append(&self, token: FencingToken, entry: &str) -> bool {
        if self.validator.validate(token).is_err() {
            return false;
        }
        self.entries.lock().push((token, entry.to_string()));
        true
    }
}

#[tokio::test(start_paused = true)]
async fn test_workers_take_turns_on_fenced_resource() {
    let store = InMemoryStore::new();
    let ledger = Arc::new(Ledger::new());

    let workers = (0..5).map(|i| {
        let store = store.clone();
        let ledger = ledger.clone();
        async move {
            let lock = LeaseLock::builder("ledger")
                .with_holder(format!("worker-{}", i))
                .with_ttl(Duration::from_secs(2))
                .build(Arc::new(store))
                .unwrap();

            let mut handle = lock.acquire().await.unwrap();
            assert!(ledger.append(handle.fencing_token(), &format!("entry-{}", i)));
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.release().await.unwrap()
        }
    });

    let outcomes = join_all(workers).await;
    assert!(outcomes.iter().all(|o| *o == ReleaseOutcome::Released));

    let entries = ledger.entries.lock();
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
    assert_eq!(store.key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_paused_holder_is_fenced_out() {
    let store = InMemoryStore::new();
    let ledger = Ledger::new();

    let lock = |holder: &str| {
        LeaseLock::builder("ledger")
            .with_holder(holder)
            .with_ttl(Duration::from_secs(2))
            .build(Arc::new(store.clone()))
            .unwrap()
    };

    let mut paused = lock("slow").acquire().await.unwrap();
    assert!(ledger.append(paused.fencing_token(), "first"));

    // A long pause: renewals stop reaching the store
    store.isolate_lease(paused.lease_id());
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!paused.is_held());

    let mut successor = lock("fast").acquire().await.unwrap();
    assert!(ledger.append(successor.fencing_token(), "second"));

    // The resumed holder's write is rejected
    assert!(!ledger.append(paused.fencing_token(), "late"));
    assert_eq!(paused.release().await.unwrap(), ReleaseOutcome::LostOwnership);
    assert_eq!(successor.release().await.unwrap(), ReleaseOutcome::Released);
}

// =============================================================================
// Trait Object Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_lock_behind_trait_object() {
    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryStore::new());
    let lock: Box<dyn DistributedLock> = Box::new(
        LeaseLock::builder("jobs")
            .with_ttl(Duration::from_secs(2))
            .build(store)
            .unwrap(),
    );

    let mut handle = lock.try_acquire().await.unwrap().unwrap();
    assert!(lock.try_acquire().await.unwrap().is_none());
    let err = tokio_test::assert_err!(lock.acquire_timeout(Duration::from_millis(500)).await);
    assert!(matches!(err, LockError::Timeout));

    assert_eq!(handle.state(), HandleState::Held);
    tokio_test::assert_ok!(handle.release().await);
    assert!(lock.try_acquire().await.unwrap().is_some());
}
