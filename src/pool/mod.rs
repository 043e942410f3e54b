//! The twin-mirroring connection pool.
//!
//! Construction order matters: any persisted invocation log is replayed
//! against the twin side *before* the pool serves its first borrow, then the
//! pool is filled to its minimum and the housekeeper starts.

pub(crate) mod bag;
pub mod config;
pub(crate) mod entry;
pub(crate) mod housekeeper;
pub(crate) mod leak;

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{DriverResult, IdGenerator, PoolError, PoolState, Result};
use crate::driver::DriverConnection;
use crate::pool::bag::ConcurrentBag;
use crate::pool::config::TwinPoolConfig;
use crate::pool::entry::{PoolEntry, STATE_IN_USE, STATE_NOT_IN_USE};
use crate::pool::leak::LeakDetector;
use crate::proxy::connection::TwinConnection;
use crate::replay::player::Player;
use crate::replay::takeover::run_takeover;

/// Entries idle for less than this skip the liveness probe on borrow.
const ALIVE_BYPASS_WINDOW: Duration = Duration::from_millis(500);

/// How long a borrower sleeps between polls while the pool is suspended.
const SUSPEND_POLL: Duration = Duration::from_millis(10);

pub struct TwinPool {
    config: TwinPoolConfig,
    bag: ConcurrentBag,
    ids: Arc<IdGenerator>,
    leak: LeakDetector,
    total: AtomicUsize,
    entry_seq: AtomicU64,
    fallback: AtomicBool,
    suspended: AtomicBool,
    shutdown: AtomicBool,
    connection_timeout_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl TwinPool {
    /// Build the pool: replay any persisted log, run the optional takeover
    /// handshake with the peer pool, fill to the minimum, start the
    /// housekeeper. No borrow is served before replay finishes.
    pub async fn new(config: TwinPoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let leak = LeakDetector::new(&config.pool_name, config.leak_detection_threshold);
        let connection_timeout_ms = config.connection_timeout.as_millis() as u64;
        let validation_timeout_ms = config.validation_timeout.as_millis() as u64;
        let pool = Arc::new(Self {
            config,
            bag: ConcurrentBag::new(),
            ids: Arc::new(IdGenerator::new()),
            leak,
            total: AtomicUsize::new(0),
            entry_seq: AtomicU64::new(1),
            fallback: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            connection_timeout_ms: AtomicU64::new(connection_timeout_ms),
            validation_timeout_ms: AtomicU64::new(validation_timeout_ms),
            housekeeper: Mutex::new(None),
        });

        let mut player = Player::connect(pool.config.clone()).await;
        let applied = player.play().await?;
        if applied > 0 {
            info!(pool = %pool.config.pool_name, applied, "replayed persisted invocation log");
        }
        if let Some(peer) = &pool.config.peer {
            if let Err(e) = run_takeover(&mut player, peer.as_ref()).await {
                info!(pool = %pool.config.pool_name, error = %e, "peer handshake failed; continuing without takeover");
            }
        }
        player.close().await;

        pool.fill_to_min().await;
        let handle = housekeeper::spawn(&pool);
        *pool.housekeeper.lock().expect("pool lock poisoned") = Some(handle);
        Ok(pool)
    }

    pub fn config(&self) -> &TwinPoolConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.pool_name
    }

    pub(crate) fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub(crate) fn leak_detector(&self) -> &LeakDetector {
        &self.leak
    }

    /// Borrow a wrapped connection. Blocks up to `connection_timeout`.
    pub async fn connection(self: &Arc<Self>) -> Result<TwinConnection> {
        let entry = self.acquire().await?;
        Ok(TwinConnection::attach(Arc::clone(self), entry).await)
    }

    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Arc<PoolEntry>> {
        let timeout = self.connection_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_shutdown() {
                return Err(PoolError::PoolClosed);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::AcquireTimeout(timeout));
            }
            if self.suspended.load(Ordering::SeqCst) {
                tokio::time::sleep(SUSPEND_POLL.min(remaining)).await;
                continue;
            }

            let candidate = match self.bag.try_borrow() {
                Some(entry) => Some(entry),
                None => match self.try_create_entry(STATE_IN_USE).await {
                    // Freshly opened connections skip validation.
                    Ok(Some(entry)) => return Ok(entry),
                    Ok(None) => {
                        self.bag
                            .borrow(remaining.min(Duration::from_millis(100)))
                            .await
                    }
                    Err(e) => {
                        warn!(pool = %self.name(), error = %e, "failed to open primary connection");
                        tokio::time::sleep(Duration::from_millis(10).min(remaining)).await;
                        None
                    }
                },
            };
            let Some(entry) = candidate else { continue };

            if entry.is_evicted() {
                self.close_entry(&entry).await;
                continue;
            }
            if entry.idle_for() > ALIVE_BYPASS_WINDOW && !self.still_alive(&entry).await {
                warn!(pool = %self.name(), entry = entry.id, "idle connection failed validation; closing");
                entry.mark_evicted();
                self.close_entry(&entry).await;
                continue;
            }
            return Ok(entry);
        }
    }

    async fn still_alive(&self, entry: &Arc<PoolEntry>) -> bool {
        let Some(mut conn) = entry.take_connection() else {
            return false;
        };
        let alive = conn.is_valid(self.validation_timeout()).await;
        entry.put_connection(conn);
        alive
    }

    /// Create a new entry if capacity allows. `initial_state` is
    /// `STATE_IN_USE` for direct handoff to the creator, `STATE_NOT_IN_USE`
    /// for refill.
    async fn try_create_entry(
        self: &Arc<Self>,
        initial_state: usize,
    ) -> DriverResult<Option<Arc<PoolEntry>>> {
        let prev = self.total.fetch_add(1, Ordering::SeqCst);
        if prev >= self.config.max_pool_size {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }

        let mut conn = match self.config.primary.connect().await {
            Ok(c) => c,
            Err(e) => {
                self.total.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        if let Err(e) = setup_session(conn.as_mut(), &self.config).await {
            self.total.fetch_sub(1, Ordering::SeqCst);
            let _ = conn.close().await;
            return Err(e);
        }

        let id = self.entry_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(PoolEntry::new(id, conn));
        entry.state.store(initial_state, Ordering::SeqCst);
        self.schedule_reaper(&entry);
        self.bag.add(Arc::clone(&entry));
        debug!(pool = %self.name(), entry = id, total = prev + 1, "opened new primary connection");
        Ok(Some(entry))
    }

    fn schedule_reaper(self: &Arc<Self>, entry: &Arc<PoolEntry>) {
        let Some(lifetime) = self.config.max_lifetime else {
            return;
        };
        let pool = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        entry.set_reaper(tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            let (Some(pool), Some(entry)) = (pool.upgrade(), weak_entry.upgrade()) else {
                return;
            };
            entry.mark_evicted();
            // Idle entries die now; in-use entries die on release.
            if pool.bag.reserve(&entry) {
                debug!(pool = %pool.name(), entry = entry.id, "max lifetime reached");
                pool.close_entry(&entry).await;
            }
        }));
    }

    /// Return a borrowed entry; evicted entries are destroyed instead.
    pub(crate) async fn release(&self, entry: Arc<PoolEntry>) {
        if entry.is_evicted() || self.is_shutdown() {
            self.close_entry(&entry).await;
        } else {
            self.bag.requite(&entry);
        }
    }

    /// Physically destroy an entry. Safe to call from several paths at
    /// once; only the caller that wins the bag removal closes the driver
    /// connection, asynchronously.
    pub(crate) async fn close_entry(&self, entry: &Arc<PoolEntry>) {
        entry.cancel_reaper();
        if self.bag.remove(entry) {
            self.total.fetch_sub(1, Ordering::SeqCst);
            if let Some(mut conn) = entry.take_connection() {
                tokio::spawn(async move {
                    let _ = conn.close().await;
                });
            }
            debug!(pool = %self.name(), entry = entry.id, "closed pool entry");
        }
    }

    /// One housekeeping pass: evict, then refill.
    pub(crate) async fn housekeep(self: &Arc<Self>) {
        let idle_timeout = self.config.idle_timeout;
        for entry in self.bag.values(STATE_NOT_IN_USE) {
            if !self.bag.reserve(&entry) {
                continue;
            }
            let expired = idle_timeout.is_some_and(|t| entry.idle_for() > t);
            if entry.is_evicted() || expired {
                self.close_entry(&entry).await;
            } else {
                self.bag.unreserve(&entry);
            }
        }
        self.fill_to_min().await;
    }

    pub(crate) async fn fill_to_min(self: &Arc<Self>) {
        while self.total.load(Ordering::SeqCst) < self.config.min_idle {
            match self.try_create_entry(STATE_NOT_IN_USE).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(pool = %self.name(), error = %e, "refill failed");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // fallback / administrative surface
    // ------------------------------------------------------------------

    /// Shared, monotonic fallback flag. New connections opened after this
    /// observe it and skip their twin.
    pub fn fallback(&self) {
        if !self.fallback.swap(true, Ordering::SeqCst) {
            warn!(pool = %self.name(), "twin unavailable; pool entering fallback mode");
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    /// Leave fallback mode. Only meaningful after a successful full replay
    /// has resynchronized the twin; invoked by the replaying peer.
    pub fn restore_direct(&self) {
        if self.fallback.swap(false, Ordering::SeqCst) {
            info!(pool = %self.name(), "twin resynchronized; direct mirroring restored");
        }
    }

    /// Block new borrows until [`resume`](Self::resume).
    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            info!(pool = %self.name(), "pool suspended");
        }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!(pool = %self.name(), "pool resumed");
        }
    }

    /// Mark every connection for eviction: borrowed ones die on return,
    /// idle ones immediately.
    pub async fn soft_evict_all(&self) {
        for entry in self.bag.values(STATE_IN_USE) {
            entry.mark_evicted();
        }
        for entry in self.bag.values(STATE_NOT_IN_USE) {
            if self.bag.reserve(&entry) {
                self.close_entry(&entry).await;
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.bag.len(STATE_IN_USE)
    }

    pub fn idle_connections(&self) -> usize {
        self.bag.len(STATE_NOT_IN_USE)
    }

    pub fn total_connections(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PoolState {
        if self.is_shutdown() {
            PoolState::Shutdown
        } else if self.suspended.load(Ordering::SeqCst) {
            PoolState::Suspended
        } else if self.is_fallback() {
            PoolState::Fallback
        } else {
            PoolState::Running
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.total_connections();
        let idle = self.idle_connections();
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: self.active_connections(),
            max_pool_size: self.config.max_pool_size,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.connection_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_validation_timeout(&self, timeout: Duration) {
        self.validation_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stop the pool: close idle entries, abort borrowed ones (primary
    /// side only), refuse further borrows.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.name(), "pool shutting down");
        if let Some(handle) = self.housekeeper.lock().expect("pool lock poisoned").take() {
            handle.abort();
        }
        self.bag.close();

        let idle: Vec<_> = self
            .bag
            .values(STATE_NOT_IN_USE)
            .into_iter()
            .filter(|e| self.bag.reserve(e))
            .collect();
        futures::future::join_all(idle.iter().map(|e| self.close_entry(e))).await;

        for entry in self.bag.values(STATE_IN_USE) {
            entry.mark_aborted();
            entry.mark_evicted();
            entry.cancel_reaper();
            if let Some(mut conn) = entry.take_connection() {
                let _ = conn.abort().await;
            }
            if self.bag.remove(&entry) {
                self.total.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl fmt::Debug for TwinPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwinPool")
            .field("name", &self.config.pool_name)
            .field("state", &self.state())
            .field("total", &self.total_connections())
            .finish_non_exhaustive()
    }
}

/// Apply the configured session defaults to a fresh physical connection.
/// Used for both primary and twin connections so the two sessions match.
pub(crate) async fn setup_session(
    conn: &mut dyn DriverConnection,
    config: &TwinPoolConfig,
) -> DriverResult<()> {
    conn.set_auto_commit(config.auto_commit).await?;
    conn.set_read_only(config.read_only).await?;
    if let Some(level) = config.isolation {
        conn.set_isolation(level).await?;
    }
    if let Some(catalog) = &config.catalog {
        conn.set_catalog(catalog).await?;
    }
    if let Some(schema) = &config.schema {
        conn.set_schema(schema).await?;
    }
    Ok(())
}

/// Point-in-time pool counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub max_pool_size: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle, max {}",
            self.active_connections, self.total_connections, self.idle_connections, self.max_pool_size
        )
    }
}
