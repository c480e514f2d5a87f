//! Pool concurrency tests.
//!
//! Many tasks contending for a handful of workers: exclusivity, wake-ups on
//! release, shutdown while waiting, and lease cleanup when a holder panics.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flock::*;
use flock_testkit::{MockAdapter, fast_config, running_pool, wait_until};
use parking_lot::Mutex;
use tokio::time::timeout;

#[tokio::test]
async fn contended_pool_hands_each_worker_to_one_holder() {
    let adapters: Vec<_> = (0..4).map(|_| Arc::new(MockAdapter::new())).collect();
    let (pool, ids) = running_pool(fast_config(), adapters).await;

    let holders = Arc::new(Mutex::new(HashSet::new()));
    let mut tasks = Vec::new();
    for task in 0..50u32 {
        let pool = pool.clone();
        let holders = holders.clone();
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(Some(Duration::from_secs(10))).await.unwrap();
            assert!(
                holders.lock().insert(lease.worker_id()),
                "worker {} leased twice",
                lease.worker_id()
            );
            tokio::time::sleep(Duration::from_millis(u64::from(task % 3))).await;
            holders.lock().remove(&lease.worker_id());
            lease.worker_id()
        }));
    }

    let mut used = HashSet::new();
    for task in tasks {
        used.insert(timeout(Duration::from_secs(20), task).await.unwrap().unwrap());
    }
    assert!(used.iter().all(|id| ids.contains(id)));
    let usages: u64 = pool.list().iter().map(|w| w.usages).sum();
    assert_eq!(usages, 50);
}

#[tokio::test]
async fn waiters_are_woken_by_release_not_by_polling() {
    let config = fast_config().with_acquire_poll_interval(5_000);
    let (pool, _) = running_pool(config, vec![Arc::new(MockAdapter::new())]).await;

    let held = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let lease = pool.acquire(Some(Duration::from_secs(10))).await.unwrap();
            (lease.worker_id(), started.elapsed())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let holder = held.worker_id();
    drop(held);

    let (got, waited) = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert_eq!(got, holder);
    assert!(waited < Duration::from_secs(2));
}

#[tokio::test]
async fn shutdown_fails_pending_acquires() {
    let (pool, _) = running_pool(fast_config(), vec![Arc::new(MockAdapter::new())]).await;
    let held = pool.acquire(None).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.shutdown().await })
    };
    let result = timeout(Duration::from_secs(3), waiter).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), PoolError::ShuttingDown);

    drop(held);
    timeout(Duration::from_secs(5), shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(pool.is_draining());
}

#[tokio::test]
async fn panicking_holder_returns_its_lease() {
    let (pool, ids) = running_pool(fast_config(), vec![Arc::new(MockAdapter::new())]).await;

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let _lease = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
            panic!("holder crashed");
        })
    };
    assert!(task.await.is_err());

    wait_until("lease release", || pool.get(ids[0]).is_some_and(|w| !w.is_in_use())).await;
    let lease = pool.acquire(Some(Duration::from_millis(500))).await.unwrap();
    assert_eq!(lease.worker_id(), ids[0]);
}

#[tokio::test]
async fn lease_events_pair_up() {
    let (pool, ids) = running_pool(fast_config(), vec![Arc::new(MockAdapter::new())]).await;
    let mut events = pool.subscribe();

    for _ in 0..3 {
        let lease = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
        lease.release();
    }

    let mut acquired = Vec::new();
    let mut released = Vec::new();
    while acquired.len() < 3 || released.len() < 3 {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.meta.worker_id, ids[0]);
        match event.payload {
            PoolEventPayload::LeaseAcquired { lease_id } => acquired.push(lease_id),
            PoolEventPayload::LeaseReleased { lease_id } => released.push(lease_id),
            _ => {}
        }
    }
    assert_eq!(acquired, released);
}
