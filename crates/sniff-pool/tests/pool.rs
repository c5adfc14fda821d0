use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use sniff_core::{PoolKey, SniffError};
use sniff_pool::{CancellationToken, WorkerPool};

fn key(name: &str) -> PoolKey {
    PoolKey::diagnostic(name)
}

#[tokio::test]
async fn grants_immediately_when_capacity_is_free() {
    let pool = WorkerPool::new(2);
    let token = CancellationToken::new();

    let lease = pool.acquire(key("/a.php"), &token).await.unwrap();
    assert_eq!(pool.available(), 1);
    assert_eq!(lease.key(), &key("/a.php"));

    drop(lease);
    assert_eq!(pool.available(), 2);
}

#[tokio::test]
async fn same_key_leases_are_exclusive_and_fifo() {
    let pool = WorkerPool::new(4);
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        let active = Arc::clone(&active);
        handles.push(tokio::spawn(async move {
            let token = CancellationToken::new();
            let lease = pool.acquire(key("/a.php"), &token).await.unwrap();
            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "lease overlap");
            order.lock().unwrap().push(i);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            drop(lease);
        }));
        // Give each submission time to enqueue so FIFO order is observable.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn capacity_bounds_concurrency_across_keys() {
    let pool = WorkerPool::new(1);
    let token = CancellationToken::new();
    let first = pool.acquire(key("/a.php"), &token).await.unwrap();

    let acquired = Arc::new(AtomicBool::new(false));
    let second = {
        let pool = pool.clone();
        let acquired = Arc::clone(&acquired);
        tokio::spawn(async move {
            let token = CancellationToken::new();
            let _lease = pool.acquire(key("/b.php"), &token).await.unwrap();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acquired.load(Ordering::SeqCst), "slot granted beyond capacity");

    drop(first);
    second.await.unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancelled_queued_request_is_skipped_without_disturbing_order() {
    // R1, R2, R3 queue for the same key while a different key holds the only
    // slot; cancelling R2 before it is granted must leave R1 then R3.
    let pool = WorkerPool::new(1);
    let blocker_token = CancellationToken::new();
    let blocker = pool.acquire(key("/z.php"), &blocker_token).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    let r2_token = CancellationToken::new();

    for (name, token) in [
        ("r1", CancellationToken::new()),
        ("r2", r2_token.clone()),
        ("r3", CancellationToken::new()),
    ] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let result = pool.acquire(key("/a.php"), &token).await;
            if let Ok(lease) = &result {
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = lease;
            }
            result.map(|_| ())
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    r2_token.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.queued(), 2, "cancelled waiter should leave the queue");

    drop(blocker);

    let results: Vec<_> = futures_join(handles).await;
    assert!(results[0].is_ok());
    assert_eq!(results[1], Err(SniffError::Cancelled));
    assert!(results[2].is_ok());
    assert_eq!(*order.lock().unwrap(), vec!["r1", "r3"]);
}

#[tokio::test]
async fn freed_slot_goes_to_longest_waiting_key() {
    let pool = WorkerPool::new(1);
    let token = CancellationToken::new();
    let blocker = pool.acquire(key("/z.php"), &token).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for name in ["/b.php", "/c.php"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let token = CancellationToken::new();
            let lease = pool.acquire(key(name), &token).await.unwrap();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(lease);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(blocker);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["/b.php", "/c.php"]);
}

#[tokio::test]
async fn grant_racing_a_cancellation_does_not_leak_the_slot() {
    let pool = WorkerPool::new(1);
    let blocker_token = CancellationToken::new();
    let blocker = pool.acquire(key("/a.php"), &blocker_token).await.unwrap();

    let token = CancellationToken::new();
    let waiter = pool.acquire(key("/a.php"), &token);
    tokio::pin!(waiter);
    // First poll enqueues the waiter without letting it observe anything yet.
    let pending = poll_fn(|cx| Poll::Ready(waiter.as_mut().poll(cx).is_pending())).await;
    assert!(pending);
    assert_eq!(pool.queued(), 1);

    // The release sends a lease into the waiter's channel; the token then
    // fires before the waiter polls again, so the grant sits unobserved.
    drop(blocker);
    token.cancel();

    let result = waiter.await;
    assert_eq!(result.err(), Some(SniffError::Cancelled));

    // The unclaimed lease was returned on drop: full capacity, empty queue,
    // and the key is acquirable again.
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.queued(), 0);
    let lease = pool
        .acquire(key("/a.php"), &CancellationToken::new())
        .await
        .unwrap();
    drop(lease);
}

#[tokio::test]
async fn pre_cancelled_token_never_queues() {
    let pool = WorkerPool::new(1);
    let token = CancellationToken::new();
    token.cancel();

    let result = pool.acquire(key("/a.php"), &token).await;
    assert_eq!(result.err(), Some(SniffError::Cancelled));
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.queued(), 0);
}

#[tokio::test]
async fn shutdown_rejects_queued_and_future_waiters() {
    let pool = WorkerPool::new(1);
    let token = CancellationToken::new();
    let lease = pool.acquire(key("/a.php"), &token).await.unwrap();

    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let token = CancellationToken::new();
            pool.acquire(key("/b.php"), &token).await.map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.shutdown();
    assert_eq!(queued.await.unwrap(), Err(SniffError::PoolShutdown));

    let late = pool.acquire(key("/c.php"), &token).await;
    assert_eq!(late.err(), Some(SniffError::PoolShutdown));

    // Releasing an in-flight lease after shutdown must not grant anything.
    drop(lease);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn released_lease_is_reusable_for_the_same_key() {
    let pool = WorkerPool::new(1);
    let token = CancellationToken::new();

    for _ in 0..3 {
        let lease = pool.acquire(key("/a.php"), &token).await.unwrap();
        drop(lease);
    }
    assert_eq!(pool.available(), 1);
}

async fn futures_join<T: Send + 'static>(
    handles: Vec<tokio::task::JoinHandle<T>>,
) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
