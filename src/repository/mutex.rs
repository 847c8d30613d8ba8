use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct Waiter {
    ticket: u64,
    mode: LockMode,
    tag: String,
    grant: oneshot::Sender<()>,
}

struct Holder {
    ticket: u64,
    mode: LockMode,
    tag: String,
}

#[derive(Default)]
struct LockState {
    holders: Vec<Holder>,
    queue: VecDeque<Waiter>,
}

impl LockState {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.holders.iter().all(|h| h.mode == LockMode::Shared),
            LockMode::Exclusive => self.holders.is_empty(),
        }
    }

    /// Grants queued requests in arrival order until the head conflicts.
    fn dispatch(&mut self) {
        while let Some(head) = self.queue.front() {
            if !self.admits(head.mode) {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            let holder = Holder {
                ticket: waiter.ticket,
                mode: waiter.mode,
                tag: waiter.tag,
            };
            self.holders.push(holder);
            if waiter.grant.send(()).is_err() {
                // The waiter went away between queueing and now.
                self.holders.pop();
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    locks: Mutex<HashMap<String, LockState>>,
    tickets: AtomicU64,
}

impl Inner {
    fn locks(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, repository_id: &str, ticket: u64) {
        let mut locks = self.locks();
        let Some(state) = locks.get_mut(repository_id) else {
            return;
        };
        if let Some(pos) = state.holders.iter().position(|h| h.ticket == ticket) {
            let holder = state.holders.remove(pos);
            debug!(repository = repository_id, tag = %holder.tag, "repository lock released");
        }
        state.dispatch();
        if state.is_idle() {
            locks.remove(repository_id);
        }
    }

    fn abandon(&self, repository_id: &str, ticket: u64) {
        let mut locks = self.locks();
        let Some(state) = locks.get_mut(repository_id) else {
            return;
        };
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == ticket) {
            state.queue.remove(pos);
            state.dispatch();
            if state.is_idle() {
                locks.remove(repository_id);
            }
            return;
        }
        drop(locks);
        self.release(repository_id, ticket);
    }
}

/// Shared/exclusive lock per repository id, served in arrival order.
/// Process-local: it never survives a restart.
#[derive(Clone, Default)]
pub struct RepositoryMutex {
    inner: Arc<Inner>,
}

impl RepositoryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_shared(&self, repository_id: &str, tag: &str) -> RepositoryLockGuard {
        self.acquire(repository_id, LockMode::Shared, tag).await
    }

    pub async fn acquire_exclusive(&self, repository_id: &str, tag: &str) -> RepositoryLockGuard {
        self.acquire(repository_id, LockMode::Exclusive, tag).await
    }

    /// True while an exclusive holder is active or queued.
    pub fn is_locked(&self, repository_id: &str) -> bool {
        let locks = self.inner.locks();
        match locks.get(repository_id) {
            Some(state) => {
                state.holders.iter().any(|h| h.mode == LockMode::Exclusive)
                    || state.queue.iter().any(|w| w.mode == LockMode::Exclusive)
            }
            None => false,
        }
    }

    /// Tags of the active holders, for diagnostics.
    pub fn holders(&self, repository_id: &str) -> Vec<String> {
        let locks = self.inner.locks();
        locks
            .get(repository_id)
            .map(|state| state.holders.iter().map(|h| h.tag.clone()).collect())
            .unwrap_or_default()
    }

    async fn acquire(&self, repository_id: &str, mode: LockMode, tag: &str) -> RepositoryLockGuard {
        let ticket = self.inner.tickets.fetch_add(1, Ordering::Relaxed);
        let granted = {
            let mut locks = self.inner.locks();
            let state = locks.entry(repository_id.to_string()).or_default();
            if state.queue.is_empty() && state.admits(mode) {
                state.holders.push(Holder {
                    ticket,
                    mode,
                    tag: tag.to_string(),
                });
                None
            } else {
                debug!(
                    repository = repository_id,
                    tag,
                    mode = ?mode,
                    holders = state.holders.len(),
                    queued = state.queue.len(),
                    "waiting for repository lock"
                );
                let (grant, granted) = oneshot::channel();
                state.queue.push_back(Waiter {
                    ticket,
                    mode,
                    tag: tag.to_string(),
                    grant,
                });
                Some(granted)
            }
        };

        if let Some(granted) = granted {
            let mut pending = PendingAcquire {
                inner: self.inner.clone(),
                repository_id: repository_id.to_string(),
                ticket,
                armed: true,
            };
            // The sender is only dropped after a grant or by `pending` itself.
            let _ = granted.await;
            pending.armed = false;
        }
        debug!(repository = repository_id, tag, mode = ?mode, "repository lock acquired");
        RepositoryLockGuard {
            inner: self.inner.clone(),
            repository_id: repository_id.to_string(),
            ticket,
        }
    }
}

/// Leaves the queue (or releases a grant that raced the drop) when the
/// acquiring future is dropped before completion.
struct PendingAcquire {
    inner: Arc<Inner>,
    repository_id: String,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon(&self.repository_id, self.ticket);
        }
    }
}

/// Held lock; released exactly once when dropped.
pub struct RepositoryLockGuard {
    inner: Arc<Inner>,
    repository_id: String,
    ticket: u64,
}

impl RepositoryLockGuard {
    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }
}

impl Drop for RepositoryLockGuard {
    fn drop(&mut self) {
        self.inner.release(&self.repository_id, self.ticket);
    }
}
