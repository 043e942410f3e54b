//! Connection wrapper — the dual-dispatch proxy.
//!
//! Every mutating call goes to the primary first; the primary's result is
//! what the application sees. While the twin is healthy the call is mirrored
//! to it synchronously and also buffered as a record; a successful twin
//! commit discards the buffered records, a twin failure flushes them to the
//! persisted invocation log and drops the connection into fallback mode.
//! Twin failures never surface to the caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{DriverError, IsolationLevel, ParamValue, PoolError, Result};
use crate::driver::{DriverConnection, Rows};
use crate::journal::{Record, RecordedCall, store};
use crate::pool::entry::PoolEntry;
use crate::pool::{TwinPool, setup_session};
use crate::proxy::statement::{StatementCore, TwinStatement};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DirtyBits {
    pub(crate) auto_commit: bool,
    pub(crate) read_only: bool,
    pub(crate) isolation: bool,
    pub(crate) catalog: bool,
    pub(crate) schema: bool,
    pub(crate) network_timeout: bool,
}

impl DirtyBits {
    fn any(&self) -> bool {
        self.auto_commit
            || self.read_only
            || self.isolation
            || self.catalog
            || self.schema
            || self.network_timeout
    }
}

/// Shared state of one wrapped connection. The application-facing
/// [`TwinConnection`] and every child [`TwinStatement`] hold it through an
/// `Arc`; nothing points back at the wrappers, so there are no ownership
/// cycles.
pub(crate) struct ConnCore {
    pub(crate) pool: Arc<TwinPool>,
    pub(crate) entry: Arc<PoolEntry>,
    pub(crate) connection_id: u64,
    pub(crate) primary: Option<Box<dyn DriverConnection>>,
    pub(crate) twin: Option<Box<dyn DriverConnection>>,
    pub(crate) queue: VecDeque<Record>,
    pub(crate) statements: Vec<Arc<Mutex<StatementCore>>>,
    pub(crate) commit_state_dirty: bool,
    pub(crate) dirty: DirtyBits,
    pub(crate) auto_commit: bool,
    /// Value to restore on close when the network timeout was changed.
    pub(crate) saved_network_timeout: Option<std::time::Duration>,
    pub(crate) closed: bool,
}

impl ConnCore {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) fn primary_mut(&mut self) -> Result<&mut (dyn DriverConnection + 'static)> {
        self.primary
            .as_deref_mut()
            .ok_or(PoolError::ConnectionClosed)
    }

    pub(crate) fn is_fallback(&self) -> bool {
        self.twin.is_none()
    }

    pub(crate) fn mark_commit_state_dirty(&mut self) {
        self.commit_state_dirty = true;
        self.entry.touch();
    }

    fn record(&mut self, call: RecordedCall) {
        self.queue
            .push_back(Record::connection_level(self.connection_id, call));
    }

    pub(crate) fn untrack_statement(&mut self, core: &Arc<Mutex<StatementCore>>) {
        self.statements.retain(|s| !Arc::ptr_eq(s, core));
    }

    /// Classify a primary-side failure: disconnect errors evict the entry;
    /// the error itself always flows back to the caller.
    pub(crate) fn classify_primary(&mut self, err: DriverError) -> PoolError {
        if err.is_disconnect() {
            warn!(
                pool = %self.pool.name(),
                connection_id = self.connection_id,
                sqlstate = ?err.sqlstate,
                "connection marked as broken"
            );
            self.entry.mark_evicted();
        }
        PoolError::Database(err)
    }

    /// Connection-level fallback: discard the twin, flush everything
    /// buffered to the persisted log, flip the shared pool flag. The twin's
    /// own error is swallowed; only a failure to persist the log surfaces.
    pub(crate) async fn twin_failed(&mut self, err: DriverError) -> Result<()> {
        debug!(
            pool = %self.pool.name(),
            connection_id = self.connection_id,
            error = %err,
            "twin call failed; entering fallback"
        );
        self.pool.fallback();
        if let Some(mut twin) = self.twin.take() {
            let _ = twin.close().await;
        }
        self.drain_statements().await;
        self.flush_queue().await
    }

    /// Close every child's twin delegate and pull the children's buffered
    /// records into the connection queue.
    pub(crate) async fn drain_statements(&mut self) {
        let statements = self.statements.clone();
        for stmt in statements {
            let mut core = stmt.lock().await;
            if let Some(mut twin) = core.twin.take() {
                let _ = twin.close().await;
            }
            core.drain_into(&mut self.queue);
        }
    }

    /// Write the connection queue to the invocation-log table through the
    /// primary connection, in queue order, as one committed batch.
    pub(crate) async fn flush_queue(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let records: Vec<Record> = self.queue.drain(..).collect();
        let primary = self.primary_mut()?;
        store::append_batch(primary, &records).await?;
        Ok(())
    }

    /// Discard records superseded by a successful twin commit: all
    /// per-statement queues and the statement-linked records of the
    /// connection queue. Session-settings records survive.
    async fn clear_successful(&mut self) {
        let statements = self.statements.clone();
        for stmt in statements {
            let mut core = stmt.lock().await;
            core.queue.clear();
            core.needs_reprepare = true;
        }
        self.queue.retain(|r| r.statement_id == 0);
    }

    /// Restore dirtied session settings to the pool defaults.
    async fn reset_session(&mut self) -> Result<()> {
        let config = self.pool.config().clone();
        let dirty = self.dirty;

        if dirty.auto_commit {
            self.primary_mut()?
                .set_auto_commit(config.auto_commit)
                .await
                .map_err(|e| self.classify_primary(e))?;
            self.auto_commit = config.auto_commit;
            if let Some(twin) = self.twin.as_deref_mut() {
                if let Err(e) = twin.set_auto_commit(config.auto_commit).await {
                    self.twin_failed(e).await?;
                }
            }
        }
        if dirty.read_only {
            self.primary_mut()?
                .set_read_only(config.read_only)
                .await
                .map_err(|e| self.classify_primary(e))?;
            if let Some(twin) = self.twin.as_deref_mut() {
                if let Err(e) = twin.set_read_only(config.read_only).await {
                    self.twin_failed(e).await?;
                }
            }
        }
        if dirty.isolation {
            if let Some(level) = config.isolation {
                self.primary_mut()?
                    .set_isolation(level)
                    .await
                    .map_err(|e| self.classify_primary(e))?;
                if let Some(twin) = self.twin.as_deref_mut() {
                    if let Err(e) = twin.set_isolation(level).await {
                        self.twin_failed(e).await?;
                    }
                }
            }
        }
        if dirty.catalog {
            if let Some(catalog) = &config.catalog {
                self.primary_mut()?
                    .set_catalog(catalog)
                    .await
                    .map_err(|e| self.classify_primary(e))?;
                if let Some(twin) = self.twin.as_deref_mut() {
                    if let Err(e) = twin.set_catalog(catalog).await {
                        self.twin_failed(e).await?;
                    }
                }
            }
        }
        if dirty.schema {
            if let Some(schema) = &config.schema {
                self.primary_mut()?
                    .set_schema(schema)
                    .await
                    .map_err(|e| self.classify_primary(e))?;
                if let Some(twin) = self.twin.as_deref_mut() {
                    if let Err(e) = twin.set_schema(schema).await {
                        self.twin_failed(e).await?;
                    }
                }
            }
        }
        if dirty.network_timeout {
            if let Some(saved) = self.saved_network_timeout.take() {
                self.primary_mut()?
                    .set_network_timeout(saved)
                    .await
                    .map_err(|e| self.classify_primary(e))?;
            }
        }
        self.dirty = DirtyBits::default();
        self.queue.clear();
        Ok(())
    }
}

/// Application-facing pooled connection.
///
/// Call [`close`](Self::close) when done: it flushes fallback records,
/// resets dirtied session state and returns the entry to the pool. A
/// dropped-but-not-closed wrapper is treated as leaked — the entry is
/// evicted and physically closed in the background.
pub struct TwinConnection {
    core: Arc<Mutex<ConnCore>>,
    connection_id: u64,
    leak_task: Option<JoinHandle<()>>,
    released: Arc<AtomicBool>,
}

impl TwinConnection {
    /// Wrap a freshly borrowed entry. If the pool is not in fallback mode,
    /// a twin connection is opened and configured with the same session
    /// settings; failure to do so flips the pool to fallback but never
    /// fails the borrow.
    pub(crate) async fn attach(pool: Arc<TwinPool>, entry: Arc<PoolEntry>) -> Self {
        let connection_id = pool.ids().next_id();
        let primary = entry.take_connection();
        let auto_commit = pool.config().auto_commit;

        let twin = if primary.is_some() && !pool.is_fallback() {
            match pool.config().twin.connect().await {
                Ok(mut twin) => match setup_session(twin.as_mut(), pool.config()).await {
                    Ok(()) => Some(twin),
                    Err(e) => {
                        warn!(pool = %pool.name(), error = %e, "error configuring twin connection");
                        pool.fallback();
                        let _ = twin.close().await;
                        None
                    }
                },
                Err(e) => {
                    warn!(pool = %pool.name(), error = %e, "error getting twin connection");
                    pool.fallback();
                    None
                }
            }
        } else {
            None
        };

        let leak_task = pool.leak_detector().schedule(connection_id);
        let core = ConnCore {
            pool,
            entry,
            connection_id,
            primary,
            twin,
            queue: VecDeque::new(),
            statements: Vec::new(),
            commit_state_dirty: false,
            dirty: DirtyBits::default(),
            auto_commit,
            saved_network_timeout: None,
            closed: false,
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            connection_id,
            leak_task,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub async fn is_fallback(&self) -> bool {
        self.core.lock().await.is_fallback()
    }

    /// Prepare a statement on the primary and, when mirroring, on the twin.
    pub async fn prepare(&mut self, sql: &str) -> Result<TwinStatement> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.entry.touch();

        let primary_stmt = conn
            .primary_mut()?
            .prepare(sql)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        let statement_id = conn.pool.ids().next_id();
        let connection_id = conn.connection_id;
        conn.queue.push_back(Record::statement_level(
            connection_id,
            statement_id,
            RecordedCall::Prepare {
                sql: sql.to_string(),
            },
        ));

        let mut needs_reprepare = false;
        let twin_stmt = match conn.twin.as_deref_mut() {
            Some(twin) => match twin.prepare(sql).await {
                Ok(stmt) => {
                    // In autocommit mode the mirrored prepare is durable on
                    // the twin right away; drop the record and re-log it
                    // only if this statement ever drains after a fallback.
                    if conn.auto_commit {
                        conn.queue.pop_back();
                        needs_reprepare = true;
                    }
                    Some(stmt)
                }
                Err(e) => {
                    conn.twin_failed(e).await?;
                    None
                }
            },
            None => None,
        };

        let core = Arc::new(Mutex::new(StatementCore {
            connection_id: conn.connection_id,
            statement_id,
            sql: sql.to_string(),
            primary: Some(primary_stmt),
            twin: twin_stmt,
            queue: VecDeque::new(),
            needs_reprepare,
            closed: false,
        }));
        conn.statements.push(Arc::clone(&core));
        Ok(TwinStatement::new(Arc::clone(&self.core), core))
    }

    /// One-shot execute: prepared, bound, executed and closed through the
    /// regular dual-dispatch path, so it records and mirrors like any other
    /// statement traffic.
    pub async fn execute(&mut self, sql: &str, params: &[ParamValue]) -> Result<u64> {
        let mut stmt = self.prepare(sql).await?;
        for (i, value) in params.iter().enumerate() {
            stmt.bind((i + 1) as u16, value.clone()).await?;
        }
        let count = stmt.execute().await?;
        stmt.close().await?;
        Ok(count)
    }

    /// Read-only query on the primary; never recorded, never mirrored.
    pub async fn query(&mut self, sql: &str, params: &[ParamValue]) -> Result<Rows> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.mark_commit_state_dirty();
        conn.primary_mut()?
            .query(sql, params)
            .await
            .map_err(|e| conn.classify_primary(e))
    }

    pub async fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .set_auto_commit(on)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.auto_commit = on;
        conn.dirty.auto_commit = on != conn.pool.config().auto_commit;
        conn.record(RecordedCall::SetAutoCommit(on));
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.set_auto_commit(on).await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    pub async fn set_read_only(&mut self, on: bool) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .set_read_only(on)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.dirty.read_only = on != conn.pool.config().read_only;
        conn.record(RecordedCall::SetReadOnly(on));
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.set_read_only(on).await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    pub async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .set_isolation(level)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.dirty.isolation = conn.pool.config().isolation != Some(level);
        conn.record(RecordedCall::SetIsolation(level));
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.set_isolation(level).await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    pub async fn set_catalog(&mut self, catalog: &str) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .set_catalog(catalog)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.dirty.catalog = conn.pool.config().catalog.as_deref() != Some(catalog);
        conn.record(RecordedCall::SetCatalog(catalog.to_string()));
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.set_catalog(catalog).await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    pub async fn set_schema(&mut self, schema: &str) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .set_schema(schema)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.dirty.schema = conn.pool.config().schema.as_deref() != Some(schema);
        conn.record(RecordedCall::SetSchema(schema.to_string()));
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.set_schema(schema).await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    /// Network timeouts act on the primary only and are never recorded or
    /// mirrored; the pre-checkout value is restored at close.
    pub async fn set_network_timeout(&mut self, timeout: std::time::Duration) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        if conn.saved_network_timeout.is_none() {
            let current = conn.primary_mut()?.network_timeout();
            conn.saved_network_timeout = Some(current);
        }
        conn.primary_mut()?
            .set_network_timeout(timeout)
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.dirty.network_timeout = true;
        Ok(())
    }

    /// Commit the primary, then the twin. A successful twin commit
    /// supersedes the buffered records; a failed one flushes every queue —
    /// including the commit itself — and enters fallback. In fallback the
    /// commit is recorded and the whole queue flushed.
    pub async fn commit(&mut self) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .commit()
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.commit_state_dirty = false;

        if conn.is_fallback() {
            conn.drain_statements().await;
            conn.record(RecordedCall::Commit);
            return conn.flush_queue().await;
        }

        let outcome = match conn.twin.as_deref_mut() {
            Some(twin) => twin.commit().await,
            None => Ok(()),
        };
        match outcome {
            Ok(()) => {
                conn.clear_successful().await;
                Ok(())
            }
            Err(e) => {
                conn.drain_statements().await;
                conn.record(RecordedCall::Commit);
                conn.twin_failed(e).await
            }
        }
    }

    /// Roll back the primary and discard every buffered record — mirrors
    /// are never replayed past a rollback. The rollback itself is mirrored
    /// when the twin is present.
    pub async fn rollback(&mut self) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.primary_mut()?
            .rollback()
            .await
            .map_err(|e| conn.classify_primary(e))?;
        conn.commit_state_dirty = false;
        conn.clear_successful().await;
        if let Some(twin) = conn.twin.as_deref_mut() {
            if let Err(e) = twin.rollback().await {
                conn.twin_failed(e).await?;
            }
        }
        Ok(())
    }

    /// Forced termination; acts on the primary only.
    pub async fn abort(&mut self) -> Result<()> {
        let mut conn = self.core.lock().await;
        conn.check_open()?;
        conn.entry.mark_aborted();
        conn.entry.mark_evicted();
        conn.primary_mut()?
            .abort()
            .await
            .map_err(|e| conn.classify_primary(e))
    }

    /// Close the wrapper: children first, then rollback-or-flush, then
    /// session reset. The entry always goes back to the pool, even when
    /// cleanup fails; cleanup errors are suppressed for aborted entries.
    pub async fn close(mut self) -> Result<()> {
        if let Some(handle) = self.leak_task.take() {
            handle.abort();
        }
        self.released.store(true, Ordering::SeqCst);

        let mut conn = self.core.lock().await;
        if conn.closed {
            return Ok(());
        }
        conn.closed = true;

        let mut first_err: Option<PoolError> = None;

        // Children go first: a child's buffered records must be in the
        // connection queue before the dirty-state handling below flushes it.
        let statements = std::mem::take(&mut conn.statements);
        for stmt in statements {
            let mut core = stmt.lock().await;
            if core.closed {
                continue;
            }
            core.closed = true;
            if let Some(mut primary) = core.primary.take() {
                if let Err(e) = primary.close().await {
                    let classified = conn.classify_primary(e);
                    first_err.get_or_insert(classified);
                }
            }
            if let Some(mut twin) = core.twin.take() {
                let _ = twin.close().await;
            }
            core.drain_into(&mut conn.queue);
        }

        let cleanup = Self::cleanup(&mut conn).await;
        if let Err(e) = cleanup {
            if conn.entry.is_aborted() {
                debug!(
                    pool = %conn.pool.name(),
                    connection_id = conn.connection_id,
                    error = %e,
                    "suppressing close failure on aborted connection"
                );
            } else {
                first_err.get_or_insert(e);
            }
        }

        // The entry goes back no matter what happened above.
        if let Some(primary) = conn.primary.take() {
            conn.entry.put_connection(primary);
        }
        if let Some(mut twin) = conn.twin.take() {
            let _ = twin.close().await;
        }
        conn.entry.touch();
        let pool = Arc::clone(&conn.pool);
        let entry = Arc::clone(&conn.entry);
        drop(conn);
        pool.release(entry).await;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cleanup(conn: &mut ConnCore) -> Result<()> {
        if conn.commit_state_dirty && !conn.auto_commit {
            conn.primary_mut()?
                .rollback()
                .await
                .map_err(|e| conn.classify_primary(e))?;
            if let Some(twin) = conn.twin.as_deref_mut() {
                if let Err(e) = twin.rollback().await {
                    conn.twin_failed(e).await?;
                }
            }
            // uncommitted records die with the transaction
            conn.queue.clear();
        } else if conn.is_fallback() {
            conn.record(RecordedCall::CloseConnection);
            conn.flush_queue().await?;
        }

        if conn.dirty.any() {
            conn.reset_session().await?;
        }
        Ok(())
    }
}

impl Drop for TwinConnection {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.leak_task.take() {
            handle.abort();
        }
        warn!(
            connection_id = self.connection_id,
            "connection dropped without close(); evicting its pool entry"
        );
        let core = Arc::clone(&self.core);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut conn = core.lock().await;
                if conn.closed {
                    return;
                }
                conn.closed = true;
                conn.entry.mark_evicted();
                if let Some(mut primary) = conn.primary.take() {
                    let _ = primary.rollback().await;
                    let _ = primary.close().await;
                }
                if let Some(mut twin) = conn.twin.take() {
                    let _ = twin.close().await;
                }
                let pool = Arc::clone(&conn.pool);
                let entry = Arc::clone(&conn.entry);
                drop(conn);
                pool.close_entry(&entry).await;
            });
        }
    }
}

impl std::fmt::Debug for TwinConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwinConnection")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
