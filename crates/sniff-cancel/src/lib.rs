//! Per-subject cancellation registry.
//!
//! Each subject (one document) owns at most one live cancellation source.
//! Beginning a new operation for a subject cancels and replaces the previous
//! source, which gives "latest request wins" semantics: two operations for the
//! same document never proceed with live tokens at the same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sniff_core::Subject;

pub use tokio_util::sync::CancellationToken;

struct Entry {
    id: u64,
    token: CancellationToken,
}

struct RegistryState {
    shut_down: bool,
    sources: HashMap<Subject, Entry>,
}

struct RegistryInner {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    /// Remove the entry for `subject` if it is still the one `id` created.
    ///
    /// A guard whose operation was superseded finds a newer id in the map and
    /// leaves it alone.
    fn end(&self, subject: &Subject, id: u64) {
        let mut state = self.state.lock();
        let current = state.sources.get(subject).map(|entry| entry.id);
        if current == Some(id) {
            state.sources.remove(subject);
        }
    }
}

/// Registry of one live cancellation source per subject.
///
/// Cloning is cheap and all clones share the same state.
#[derive(Clone)]
pub struct CancellationRegistry {
    inner: Arc<RegistryInner>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                state: Mutex::new(RegistryState {
                    shut_down: false,
                    sources: HashMap::new(),
                }),
            }),
        }
    }

    /// Begin an operation for `subject`, superseding any in-flight one.
    ///
    /// Any previous source for the subject is cancelled before this returns.
    /// When `parent` is given the new source is chained to it, so cancelling
    /// the parent also cancels this operation.
    ///
    /// Returns `None` only after [`shutdown`](Self::shutdown); callers must
    /// not start the operation in that case.
    pub fn begin(
        &self,
        subject: Subject,
        parent: Option<&CancellationToken>,
    ) -> Option<OperationGuard> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return None;
        }

        if let Some(previous) = state.sources.remove(&subject) {
            previous.token.cancel();
            tracing::debug!(
                target: "sniff.cancel",
                subject = %subject,
                "superseded in-flight operation"
            );
        }
        state.sources.insert(
            subject.clone(),
            Entry {
                id,
                token: token.clone(),
            },
        );
        drop(state);

        Some(OperationGuard {
            inner: Arc::clone(&self.inner),
            subject,
            id,
            token,
            ended: false,
        })
    }

    /// Whether `subject` currently has a live source.
    pub fn is_active(&self, subject: &Subject) -> bool {
        self.inner.state.lock().sources.contains_key(subject)
    }

    /// Cancel every live source and refuse all future `begin` calls.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for (_, entry) in state.sources.drain() {
            entry.token.cancel();
        }
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one begun operation.
///
/// The dispatcher that called [`CancellationRegistry::begin`] must end the
/// operation on every exit path; `Drop` does it if the explicit call was
/// missed, and ending twice (or after being superseded) is a no-op.
pub struct OperationGuard {
    inner: Arc<RegistryInner>,
    subject: Subject,
    id: u64,
    token: CancellationToken,
    ended: bool,
}

impl OperationGuard {
    /// Token observed by the operation this guard tracks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// End the operation, removing its source from the registry unless a newer
    /// operation already replaced it.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.inner.end(&self.subject, self.id);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.end();
    }
}
