//! Concurrent container for poolable entries.
//!
//! The hot path is lock-minimal: a borrow scans a snapshot of the entry
//! list and claims an entry with a single CAS; nothing holds a lock while
//! waiting. Waiting borrowers park on a `Notify` handoff and are woken by
//! returns, unreserves and additions. Entry creation on demand is the
//! pool's job (try-available, then try-create, then wait).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::pool::entry::{
    PoolEntry, STATE_IN_USE, STATE_NOT_IN_USE, STATE_REMOVED, STATE_RESERVED,
};

pub(crate) struct ConcurrentBag {
    entries: RwLock<Vec<Arc<PoolEntry>>>,
    handoff: Notify,
    closed: AtomicBool,
}

impl ConcurrentBag {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            handoff: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Single scan over the current entries; claims the first free one.
    /// Stamps last-access on success.
    pub(crate) fn try_borrow(&self) -> Option<Arc<PoolEntry>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let entries = self.entries.read().expect("bag lock poisoned");
        for entry in entries.iter() {
            if entry.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE) {
                entry.touch();
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    /// Blocking borrow: scan, then park on the handoff up to `timeout`.
    pub(crate) async fn borrow(&self, timeout: Duration) -> Option<Arc<PoolEntry>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.try_borrow() {
                return Some(entry);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.handoff.notified()).await;
        }
    }

    /// Return a borrowed entry to the free set.
    pub(crate) fn requite(&self, entry: &Arc<PoolEntry>) {
        entry.state.store(STATE_NOT_IN_USE, Ordering::SeqCst);
        self.handoff.notify_one();
    }

    /// Register a new entry. The entry keeps whatever state it was created
    /// with (`IN_USE` for direct handoff to the creator, `NOT_IN_USE` for
    /// pool refill).
    pub(crate) fn add(&self, entry: Arc<PoolEntry>) {
        self.entries.write().expect("bag lock poisoned").push(entry);
        self.handoff.notify_one();
    }

    /// Take an entry out of the bag for good. Only the first caller to move
    /// the entry out succeeds; duplicate removals are no-ops.
    pub(crate) fn remove(&self, entry: &Arc<PoolEntry>) -> bool {
        let removed = entry.compare_and_set(STATE_IN_USE, STATE_REMOVED)
            || entry.compare_and_set(STATE_RESERVED, STATE_REMOVED)
            || entry.compare_and_set(STATE_NOT_IN_USE, STATE_REMOVED);
        if removed {
            self.entries
                .write()
                .expect("bag lock poisoned")
                .retain(|e| !Arc::ptr_eq(e, entry));
        }
        removed
    }

    /// Park an idle entry for maintenance so no borrower can claim it.
    pub(crate) fn reserve(&self, entry: &Arc<PoolEntry>) -> bool {
        entry.compare_and_set(STATE_NOT_IN_USE, STATE_RESERVED)
    }

    pub(crate) fn unreserve(&self, entry: &Arc<PoolEntry>) {
        if entry.compare_and_set(STATE_RESERVED, STATE_NOT_IN_USE) {
            self.handoff.notify_one();
        }
    }

    /// Snapshot of all entries currently in `state`.
    pub(crate) fn values(&self, state: usize) -> Vec<Arc<PoolEntry>> {
        self.entries
            .read()
            .expect("bag lock poisoned")
            .iter()
            .filter(|e| e.state() == state)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self, state: usize) -> usize {
        self.entries
            .read()
            .expect("bag lock poisoned")
            .iter()
            .filter(|e| e.state() == state)
            .count()
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.read().expect("bag lock poisoned").len()
    }

    /// Stop serving borrows and wake every waiter.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handoff.notify_waiters();
    }
}
