use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::driver::DriverConnection;

/// Bag states of an entry. `REMOVED` is terminal; the first successful
/// transition into it is the only one that decrements the live count.
pub(crate) const STATE_NOT_IN_USE: usize = 0;
pub(crate) const STATE_IN_USE: usize = 1;
pub(crate) const STATE_RESERVED: usize = 2;
pub(crate) const STATE_REMOVED: usize = 3;

/// One pooled physical connection plus bookkeeping.
///
/// The driver connection is taken out of the entry at checkout and put back
/// at close, so the borrowing task owns it exclusively while `IN_USE`.
pub(crate) struct PoolEntry {
    pub(crate) id: u64,
    connection: Mutex<Option<Box<dyn DriverConnection>>>,
    pub(crate) state: AtomicUsize,
    last_access: AtomicI64,
    created_at: Instant,
    evicted: AtomicBool,
    aborted: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl PoolEntry {
    pub(crate) fn new(id: u64, connection: Box<dyn DriverConnection>) -> Self {
        Self {
            id,
            connection: Mutex::new(Some(connection)),
            state: AtomicUsize::new(STATE_NOT_IN_USE),
            last_access: AtomicI64::new(now_millis()),
            created_at: Instant::now(),
            evicted: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            reaper: Mutex::new(None),
        }
    }

    pub(crate) fn compare_and_set(&self, from: usize, to: usize) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn state(&self) -> usize {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn take_connection(&self) -> Option<Box<dyn DriverConnection>> {
        self.connection.lock().expect("entry lock poisoned").take()
    }

    pub(crate) fn put_connection(&self, connection: Box<dyn DriverConnection>) {
        *self.connection.lock().expect("entry lock poisoned") = Some(connection);
    }

    pub(crate) fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::SeqCst);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let idle = now_millis() - self.last_access.load(Ordering::SeqCst);
        Duration::from_millis(idle.max(0) as u64)
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reaper(&self, handle: JoinHandle<()>) {
        *self.reaper.lock().expect("entry lock poisoned") = Some(handle);
    }

    pub(crate) fn cancel_reaper(&self) {
        if let Some(handle) = self.reaper.lock().expect("entry lock poisoned").take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("evicted", &self.is_evicted())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
