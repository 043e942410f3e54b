// ============================================================================
// twinpool
// ============================================================================
//
// A client-side connection pool that keeps a shadow ("twin") database in
// sync with the primary. Mutating calls are dispatched to the primary,
// mirrored synchronously to the twin and buffered as replayable records;
// when the twin becomes unreachable the pool keeps serving traffic in
// fallback mode, persisting the records it could not mirror to an
// invocation-log table. A later pool instance replays that log to bring the
// stale side back in step before serving its first borrow.

pub mod core;
pub mod driver;
pub mod journal;
pub mod pool;
pub mod proxy;
pub mod replay;

// Re-export main types for convenience
pub use crate::core::{
    ByteSource, CharSource, DriverError, DriverErrorKind, DriverResult, IsolationLevel,
    ParamValue, PoolError, PoolState, Result,
};
pub use crate::driver::{DataSource, DriverConnection, DriverStatement, Rows};
pub use crate::journal::{Record, RecordedCall};
pub use crate::pool::config::TwinPoolConfig;
pub use crate::pool::{PoolStats, TwinPool};
pub use crate::proxy::{TwinConnection, TwinStatement};
pub use crate::replay::{LocalPeer, PeerControl, Player};

use std::sync::Arc;

/// Pool facade with the ergonomics of a data source.
///
/// # Examples
///
/// ```ignore
/// use twinpool::{TwinDataSource, TwinPoolConfig, ParamValue};
///
/// let config = TwinPoolConfig::new(primary, twin).max_pool_size(8);
/// let ds = TwinDataSource::new(config).await?;
///
/// let mut conn = ds.connection().await?;
/// conn.execute("INSERT INTO events VALUES (?)", &[ParamValue::Integer(1)]).await?;
/// conn.commit().await?;
/// conn.close().await?;
/// ```
#[derive(Debug, Clone)]
pub struct TwinDataSource {
    pool: Arc<TwinPool>,
}

impl TwinDataSource {
    /// Construct the pool; replays any persisted invocation log before the
    /// first borrow can happen.
    pub async fn new(config: TwinPoolConfig) -> Result<Self> {
        let pool = TwinPool::new(config).await?;
        Ok(Self { pool })
    }

    /// Borrow a wrapped connection.
    pub async fn connection(&self) -> Result<TwinConnection> {
        self.pool.connection().await
    }

    /// The pool behind the facade, for administrative operations.
    pub fn pool(&self) -> &Arc<TwinPool> {
        &self.pool
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
