//! Key-serialized worker pool with a bounded global slot budget.
//!
//! At most one operation per key holds a lease at a time; across keys,
//! concurrency is bounded by the configured capacity. Waiters are granted
//! strictly FIFO within a key, and FIFO by admission time across keys
//! competing for a freed slot. All queue/slot mutations happen under a single
//! mutex, so a release and the grant it enables are one indivisible step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use sniff_core::{PoolKey, SniffError};

pub use tokio_util::sync::CancellationToken;

struct Waiter {
    seq: u64,
    token: CancellationToken,
    tx: oneshot::Sender<Result<WorkerLease, SniffError>>,
}

struct PoolState {
    free_slots: usize,
    shut_down: bool,
    next_seq: u64,
    /// Keys currently holding a lease.
    active: HashSet<PoolKey>,
    /// Per-key FIFO queues of waiters. Queues are removed when emptied.
    queues: HashMap<PoolKey, VecDeque<Waiter>>,
}

struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Remove a queued waiter by sequence number. Returns false when the
    /// waiter was already granted or rejected.
    fn remove_waiter(&self, key: &PoolKey, seq: u64) -> bool {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|waiter| waiter.seq != seq);
        let removed = queue.len() != before;
        if queue.is_empty() {
            state.queues.remove(key);
        }
        removed
    }

    /// Return `key`'s slot to the pool and grant what the freed slot enables:
    /// the next waiter of the same key first, then the longest-waiting waiter
    /// across all admissible keys.
    fn release(self: &Arc<Self>, key: &PoolKey) {
        let mut state = self.state.lock();
        state.active.remove(key);
        state.free_slots += 1;
        if state.shut_down {
            return;
        }
        self.try_grant_key(&mut state, key);
        self.grant_by_admission_order(&mut state);
    }

    /// Grant the front waiter of `key` if the key is idle and a slot is free.
    /// Cancelled waiters are dropped on the way; their futures observe their
    /// own token. Returns whether a lease was handed out.
    fn try_grant_key(self: &Arc<Self>, state: &mut PoolState, key: &PoolKey) -> bool {
        if state.free_slots == 0 || state.active.contains(key) {
            return false;
        }
        loop {
            let waiter = match state.queues.get_mut(key) {
                Some(queue) => match queue.pop_front() {
                    Some(waiter) => {
                        if queue.is_empty() {
                            state.queues.remove(key);
                        }
                        waiter
                    }
                    None => {
                        state.queues.remove(key);
                        return false;
                    }
                },
                None => return false,
            };

            if waiter.token.is_cancelled() {
                continue;
            }

            let lease = WorkerLease {
                pool: Some(Arc::clone(self)),
                key: key.clone(),
            };
            match waiter.tx.send(Ok(lease)) {
                Ok(()) => {
                    state.free_slots -= 1;
                    state.active.insert(key.clone());
                    tracing::trace!(target: "sniff.pool", key = %key, seq = waiter.seq, "granted lease");
                    return true;
                }
                Err(rejected) => {
                    // The waiter's future was dropped. Defuse the undelivered
                    // lease so its Drop does not re-enter the pool lock.
                    if let Ok(mut lease) = rejected {
                        lease.defuse();
                    }
                    continue;
                }
            }
        }
    }

    /// Grant free slots to queued waiters, lowest admission sequence first,
    /// skipping keys that already hold a lease.
    fn grant_by_admission_order(self: &Arc<Self>, state: &mut PoolState) {
        while state.free_slots > 0 {
            // Drop cancelled waiters at queue fronts so sequence comparison
            // only sees waiters that can actually be granted.
            state.queues.retain(|_, queue| {
                while queue
                    .front()
                    .is_some_and(|waiter| waiter.token.is_cancelled())
                {
                    queue.pop_front();
                }
                !queue.is_empty()
            });

            let next = state
                .queues
                .iter()
                .filter(|(key, _)| !state.active.contains(*key))
                .min_by_key(|(_, queue)| queue.front().map(|w| w.seq).unwrap_or(u64::MAX))
                .map(|(key, _)| key.clone());
            let Some(key) = next else {
                return;
            };
            if !self.try_grant_key(state, &key) {
                // Queue drained without a viable waiter; look again.
                continue;
            }
        }
    }
}

/// Pool of worker slots with key-based mutual exclusion.
///
/// Cloning is cheap and all clones share the same slots and queues.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with `capacity` concurrent slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                state: Mutex::new(PoolState {
                    free_slots: capacity,
                    shut_down: false,
                    next_seq: 0,
                    active: HashSet::new(),
                    queues: HashMap::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots not currently leased.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free_slots
    }

    /// Waiters currently queued across all keys.
    pub fn queued(&self) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Wait for exclusive use of `key`.
    ///
    /// Suspends until the key is idle and a slot is free, or until `token` is
    /// cancelled (the waiter is then removed from its queue immediately and
    /// never receives a lease, even one granted in the same instant — a grant
    /// that races the cancellation is returned to the pool unused).
    pub async fn acquire(
        &self,
        key: PoolKey,
        token: &CancellationToken,
    ) -> Result<WorkerLease, SniffError> {
        if token.is_cancelled() {
            return Err(SniffError::Cancelled);
        }

        let (seq, rx) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(SniffError::PoolShutdown);
            }

            let queue_empty = state.queues.get(&key).map_or(true, VecDeque::is_empty);
            if queue_empty && !state.active.contains(&key) && state.free_slots > 0 {
                state.free_slots -= 1;
                state.active.insert(key.clone());
                return Ok(WorkerLease {
                    pool: Some(Arc::clone(&self.inner)),
                    key,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.queues.entry(key.clone()).or_default().push_back(Waiter {
                seq,
                token: token.clone(),
                tx,
            });
            tracing::trace!(target: "sniff.pool", key = %key, seq, "queued waiter");
            (seq, rx)
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                // If a grant raced this cancellation the lease sits in `rx`,
                // which is dropped with the select; its Drop frees the slot.
                self.inner.remove_waiter(&key, seq);
                Err(SniffError::Cancelled)
            }
            result = rx => match result {
                Ok(result) => result,
                // Sender dropped without a grant.
                Err(_) => Err(SniffError::PoolShutdown),
            }
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    ///
    /// In-flight executions have no queue entry to reject, so the layer that
    /// cancels them checks this to report disposal rather than an ordinary
    /// supersede.
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Reject every queued waiter and refuse all future `acquire` calls.
    /// Leases already handed out stay valid; their release is a no-op grant.
    pub fn shutdown(&self) {
        let queues = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.queues)
        };
        for (_, mut queue) in queues {
            for waiter in queue.drain(..) {
                let _ = waiter.tx.send(Err(SniffError::PoolShutdown));
            }
        }
        tracing::debug!(target: "sniff.pool", "pool shut down");
    }
}

/// Temporary exclusive right to run one operation for a key.
///
/// Dropping the lease returns the slot to the pool and wakes the next waiter,
/// so release cannot be forgotten on any exit path.
pub struct WorkerLease {
    pool: Option<Arc<PoolInner>>,
    key: PoolKey,
}

impl WorkerLease {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    fn defuse(&mut self) {
        self.pool = None;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(&self.key);
        }
    }
}
