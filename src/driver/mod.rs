//! The opaque database-driver capability.
//!
//! The pool never speaks a wire protocol itself; it consumes connections and
//! statements through these traits and stays agnostic of the database
//! product behind them. Implementations are expected to report failures as
//! [`DriverError`] with the SQLSTATE filled in when known.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{DriverResult, IsolationLevel, ParamValue};

/// Factory for physical connections to one database.
#[async_trait]
pub trait DataSource: Send + Sync + fmt::Debug {
    async fn connect(&self) -> DriverResult<Box<dyn DriverConnection>>;
}

/// One physical connection.
///
/// Statements returned by [`prepare`](DriverConnection::prepare) are
/// self-contained objects; how they share the underlying link with their
/// connection is the driver's business.
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute a one-shot statement; returns the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[ParamValue]) -> DriverResult<u64>;

    /// Run a query; read-only from the pool's point of view.
    async fn query(&mut self, sql: &str, params: &[ParamValue]) -> DriverResult<Rows>;

    async fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;

    async fn set_auto_commit(&mut self, on: bool) -> DriverResult<()>;

    fn auto_commit(&self) -> bool;

    async fn set_read_only(&mut self, on: bool) -> DriverResult<()>;

    async fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()>;

    async fn set_catalog(&mut self, catalog: &str) -> DriverResult<()>;

    async fn set_schema(&mut self, schema: &str) -> DriverResult<()>;

    /// Per-call network timeout; zero means driver default.
    async fn set_network_timeout(&mut self, timeout: Duration) -> DriverResult<()>;

    fn network_timeout(&self) -> Duration;

    /// Liveness probe with a driver-side timeout.
    async fn is_valid(&mut self, timeout: Duration) -> bool;

    /// Forcibly terminate the connection, abandoning any in-flight work.
    async fn abort(&mut self) -> DriverResult<()>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// One prepared statement.
#[async_trait]
pub trait DriverStatement: Send {
    /// Bind the 1-based parameter `index`.
    async fn bind(&mut self, index: u16, value: ParamValue) -> DriverResult<()>;

    /// Execute with the currently bound parameters; returns the
    /// affected-row count.
    async fn execute(&mut self) -> DriverResult<u64>;

    /// Run as a query with the currently bound parameters.
    async fn query(&mut self) -> DriverResult<Rows>;

    /// Snapshot the current bindings into the pending batch.
    async fn add_batch(&mut self) -> DriverResult<()>;

    /// Execute the pending batch in order; returns per-entry counts.
    async fn execute_batch(&mut self) -> DriverResult<Vec<u64>>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// Materialized query result. Passed through to the application untouched;
/// the pool never records or mirrors reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ParamValue>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<ParamValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<ParamValue>> {
        self.rows.iter()
    }
}
