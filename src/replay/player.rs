//! The replay engine.
//!
//! Drains a persisted invocation log found on the pool's twin side and
//! applies it, record by record in id order, to connections opened lazily
//! from the pool's primary data source. A record is only deleted after the
//! whole pass applied; a crashed pass resumes from the same log state
//! (at-least-once delivery).

use std::collections::HashMap;

use tracing::{debug, info};

use crate::core::{PoolError, Result};
use crate::driver::{DriverConnection, DriverStatement};
use crate::journal::record::{Record, RecordedCall};
use crate::journal::store;
use crate::pool::config::TwinPoolConfig;
use crate::pool::setup_session;

pub struct Player {
    config: TwinPoolConfig,
    /// Dedicated connection to the twin side; `None` when the twin is
    /// unreachable, which makes every pass a no-op.
    log_conn: Option<Box<dyn DriverConnection>>,
    connections: HashMap<u64, Box<dyn DriverConnection>>,
    statements: HashMap<u64, Box<dyn DriverStatement>>,
}

impl Player {
    /// Open the dedicated log connection. An unreachable twin is not an
    /// error: there is nothing to replay from it.
    pub async fn connect(config: TwinPoolConfig) -> Self {
        let log_conn = match config.twin.connect().await {
            Ok(mut conn) => match conn.set_auto_commit(false).await {
                Ok(()) => Some(conn),
                Err(e) => {
                    info!(error = %e, "twin log connection unusable; skipping replay");
                    let _ = conn.close().await;
                    None
                }
            },
            Err(e) => {
                info!(error = %e, "twin unreachable; skipping replay");
                None
            }
        };
        Self {
            config,
            log_conn,
            connections: HashMap::new(),
            statements: HashMap::new(),
        }
    }

    /// One full pass: read ordered, apply, delete applied, commit. Returns
    /// the number of records applied.
    pub async fn play(&mut self) -> Result<u64> {
        let Some(log_conn) = self.log_conn.as_deref_mut() else {
            return Ok(0);
        };
        let records = store::read_all(log_conn).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut applied = Vec::with_capacity(records.len());
        for (id, record) in records {
            debug!(id, %record, "replaying");
            self.apply(&record).await?;
            applied.push(id);
        }

        let log_conn = self
            .log_conn
            .as_deref_mut()
            .ok_or_else(|| PoolError::Replay("log connection lost".into()))?;
        store::delete_batch(log_conn, &applied).await?;
        log_conn.commit().await?;
        Ok(applied.len() as u64)
    }

    async fn apply(&mut self, record: &Record) -> Result<()> {
        match record.call.target() {
            crate::core::CallTarget::Connection => self.apply_connection(record).await,
            crate::core::CallTarget::Statement => self.apply_statement(record).await,
        }
    }

    async fn apply_connection(&mut self, record: &Record) -> Result<()> {
        if !self.connections.contains_key(&record.connection_id) {
            // A close for a connection we never opened is a leftover from a
            // producer that had nothing else to say; skip it.
            if matches!(record.call, RecordedCall::CloseConnection) {
                return Ok(());
            }
            // Fresh connections carry the pool's session defaults, exactly
            // like the twin connection the records were meant for; recorded
            // session calls then adjust from there.
            let mut conn = self.config.primary.connect().await?;
            setup_session(conn.as_mut(), &self.config).await?;
            self.connections.insert(record.connection_id, conn);
        }
        let conn = self
            .connections
            .get_mut(&record.connection_id)
            .ok_or_else(|| PoolError::Replay("connection vanished from working map".into()))?;

        match &record.call {
            RecordedCall::SetAutoCommit(on) => conn.set_auto_commit(*on).await?,
            RecordedCall::SetReadOnly(on) => conn.set_read_only(*on).await?,
            RecordedCall::SetIsolation(level) => conn.set_isolation(*level).await?,
            RecordedCall::SetCatalog(name) => conn.set_catalog(name).await?,
            RecordedCall::SetSchema(name) => conn.set_schema(name).await?,
            RecordedCall::Commit => conn.commit().await?,
            RecordedCall::Prepare { sql } => {
                let stmt = conn.prepare(sql).await?;
                self.statements.insert(record.statement_id, stmt);
            }
            RecordedCall::CloseConnection => {
                if let Some(mut conn) = self.connections.remove(&record.connection_id) {
                    let _ = conn.close().await;
                }
            }
            other => {
                return Err(PoolError::Replay(format!(
                    "statement call {} recorded against a connection",
                    other.method()
                )));
            }
        }
        Ok(())
    }

    async fn apply_statement(&mut self, record: &Record) -> Result<()> {
        let Some(stmt) = self.statements.get_mut(&record.statement_id) else {
            // Symmetric with the unknown-connection rule: a close for a
            // statement we never opened is skippable, anything else means
            // the log is incoherent.
            if matches!(record.call, RecordedCall::CloseStatement) {
                return Ok(());
            }
            return Err(PoolError::Replay(format!(
                "record references unknown statement {}",
                record.statement_id
            )));
        };

        match &record.call {
            RecordedCall::BindParam { index, value } => stmt.bind(*index, value.clone()).await?,
            RecordedCall::Execute => {
                stmt.execute().await?;
            }
            RecordedCall::AddBatch => stmt.add_batch().await?,
            RecordedCall::ExecuteBatch => {
                stmt.execute_batch().await?;
            }
            RecordedCall::CloseStatement => {
                if let Some(mut stmt) = self.statements.remove(&record.statement_id) {
                    let _ = stmt.close().await;
                }
            }
            other => {
                return Err(PoolError::Replay(format!(
                    "connection call {} recorded against a statement",
                    other.method()
                )));
            }
        }
        Ok(())
    }

    /// Close everything the pass opened, quietly.
    pub async fn close(mut self) {
        for (_, mut stmt) in self.statements.drain() {
            let _ = stmt.close().await;
        }
        for (_, mut conn) in self.connections.drain() {
            let _ = conn.close().await;
        }
        if let Some(mut log_conn) = self.log_conn.take() {
            let _ = log_conn.close().await;
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("has_log_conn", &self.log_conn.is_some())
            .field("open_connections", &self.connections.len())
            .field("open_statements", &self.statements.len())
            .finish()
    }
}
