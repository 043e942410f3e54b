//! Statement wrapper.
//!
//! Same dual-dispatch discipline as the connection, scoped to one prepared
//! statement. The wrapper and its parent connection share the statement's
//! core through an `Arc`, so the connection can close and drain children it
//! no longer sees; lock order is always connection core first, then
//! statement core.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::core::{ByteSource, CharSource, ParamValue, PoolError, Result};
use crate::driver::{DriverStatement, Rows};
use crate::journal::{Record, RecordedCall};
use crate::proxy::connection::ConnCore;

pub(crate) struct StatementCore {
    pub(crate) connection_id: u64,
    pub(crate) statement_id: u64,
    pub(crate) sql: String,
    pub(crate) primary: Option<Box<dyn DriverStatement>>,
    pub(crate) twin: Option<Box<dyn DriverStatement>>,
    pub(crate) queue: VecDeque<Record>,
    /// Set when this statement's buffered records were discarded by a
    /// successful twin commit; the next drain re-logs the prepare so replay
    /// can resolve the statement id.
    pub(crate) needs_reprepare: bool,
    pub(crate) closed: bool,
}

impl StatementCore {
    pub(crate) fn record(&mut self, call: RecordedCall) {
        self.queue.push_back(Record::statement_level(
            self.connection_id,
            self.statement_id,
            call,
        ));
    }

    /// Move this statement's buffered records into the connection queue,
    /// re-logging the prepare first when it was consumed by an earlier twin
    /// commit.
    pub(crate) fn drain_into(&mut self, out: &mut VecDeque<Record>) {
        if self.queue.is_empty() {
            return;
        }
        if self.needs_reprepare {
            out.push_back(Record::statement_level(
                self.connection_id,
                self.statement_id,
                RecordedCall::Prepare {
                    sql: self.sql.clone(),
                },
            ));
            self.needs_reprepare = false;
        }
        out.append(&mut self.queue);
    }

    fn primary_mut(&mut self) -> Result<&mut (dyn DriverStatement + 'static)> {
        if self.closed {
            return Err(PoolError::StatementClosed);
        }
        self.primary
            .as_deref_mut()
            .ok_or(PoolError::StatementClosed)
    }
}

/// Application-facing prepared statement, dispatching to the primary and
/// mirroring to the twin.
pub struct TwinStatement {
    conn: Arc<Mutex<ConnCore>>,
    core: Arc<Mutex<StatementCore>>,
}

impl TwinStatement {
    pub(crate) fn new(conn: Arc<Mutex<ConnCore>>, core: Arc<Mutex<StatementCore>>) -> Self {
        Self { conn, core }
    }

    pub async fn statement_id(&self) -> u64 {
        self.core.lock().await.statement_id
    }

    /// Bind the 1-based parameter `index`.
    pub async fn bind(&mut self, index: u16, value: ParamValue) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut core = self.core.lock().await;
        core.primary_mut()?
            .bind(index, value.clone())
            .await
            .map_err(|e| conn.classify_primary(e))?;
        core.record(RecordedCall::BindParam {
            index,
            value: value.clone(),
        });

        let mirror = match core.twin.as_deref_mut() {
            Some(twin) => twin.bind(index, value).await.err(),
            None => None,
        };
        if let Some(e) = mirror {
            Self::discard_twin(&mut core).await;
            drop(core);
            conn.twin_failed(e).await?;
        }
        Ok(())
    }

    /// Buffer a byte stream fully, then bind it; the same buffered source
    /// backs the primary bind, the twin bind and the journal record.
    pub async fn bind_byte_stream<R: AsyncRead + Unpin>(
        &mut self,
        index: u16,
        reader: R,
    ) -> Result<()> {
        let source = ByteSource::from_reader(reader)
            .await
            .map_err(|e| PoolError::Stream(e.to_string()))?;
        self.bind(index, ParamValue::Bytes(source)).await
    }

    /// As [`bind_byte_stream`](Self::bind_byte_stream), reading at most
    /// `limit` bytes.
    pub async fn bind_byte_stream_limited<R: AsyncRead + Unpin>(
        &mut self,
        index: u16,
        reader: R,
        limit: u64,
    ) -> Result<()> {
        let source = ByteSource::from_reader_limited(reader, limit)
            .await
            .map_err(|e| PoolError::Stream(e.to_string()))?;
        self.bind(index, ParamValue::Bytes(source)).await
    }

    /// Buffer a UTF-8 character stream fully, then bind it.
    pub async fn bind_char_stream<R: AsyncRead + Unpin>(
        &mut self,
        index: u16,
        reader: R,
    ) -> Result<()> {
        let source = CharSource::from_reader(reader)
            .await
            .map_err(|e| PoolError::Stream(e.to_string()))?;
        self.bind(index, ParamValue::Chars(source)).await
    }

    /// Execute with the bound parameters; the primary's count is returned.
    pub async fn execute(&mut self) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        conn.mark_commit_state_dirty();
        let mut core = self.core.lock().await;
        let count = core
            .primary_mut()?
            .execute()
            .await
            .map_err(|e| conn.classify_primary(e))?;
        core.record(RecordedCall::Execute);

        let mirror = match core.twin.as_deref_mut() {
            Some(twin) => match twin.execute().await {
                // An autocommitted execute is durable on the twin: the
                // records it covers are superseded on the spot.
                Ok(_) => {
                    if conn.auto_commit {
                        core.queue.clear();
                        core.needs_reprepare = true;
                    }
                    None
                }
                Err(e) => Some(e),
            },
            None => None,
        };
        if let Some(e) = mirror {
            Self::discard_twin(&mut core).await;
            drop(core);
            conn.twin_failed(e).await?;
        }
        Ok(count)
    }

    /// Read-only path: never recorded, never mirrored.
    pub async fn query(&mut self) -> Result<Rows> {
        let mut conn = self.conn.lock().await;
        conn.mark_commit_state_dirty();
        let mut core = self.core.lock().await;
        core.primary_mut()?
            .query()
            .await
            .map_err(|e| conn.classify_primary(e))
    }

    pub async fn add_batch(&mut self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut core = self.core.lock().await;
        core.primary_mut()?
            .add_batch()
            .await
            .map_err(|e| conn.classify_primary(e))?;
        core.record(RecordedCall::AddBatch);

        let mirror = match core.twin.as_deref_mut() {
            Some(twin) => twin.add_batch().await.err(),
            None => None,
        };
        if let Some(e) = mirror {
            Self::discard_twin(&mut core).await;
            drop(core);
            conn.twin_failed(e).await?;
        }
        Ok(())
    }

    pub async fn execute_batch(&mut self) -> Result<Vec<u64>> {
        let mut conn = self.conn.lock().await;
        conn.mark_commit_state_dirty();
        let mut core = self.core.lock().await;
        let counts = core
            .primary_mut()?
            .execute_batch()
            .await
            .map_err(|e| conn.classify_primary(e))?;
        core.record(RecordedCall::ExecuteBatch);

        let mirror = match core.twin.as_deref_mut() {
            Some(twin) => match twin.execute_batch().await {
                Ok(_) => {
                    if conn.auto_commit {
                        core.queue.clear();
                        core.needs_reprepare = true;
                    }
                    None
                }
                Err(e) => Some(e),
            },
            None => None,
        };
        if let Some(e) = mirror {
            Self::discard_twin(&mut core).await;
            drop(core);
            conn.twin_failed(e).await?;
        }
        Ok(counts)
    }

    /// Close the statement: primary first (classified), twin quietly, then
    /// the buffered records drain into the parent connection's queue so a
    /// later flush still carries them.
    pub async fn close(self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut core = self.core.lock().await;
        if core.closed {
            return Ok(());
        }
        core.closed = true;
        conn.untrack_statement(&self.core);

        let mut result = Ok(());
        if let Some(mut primary) = core.primary.take() {
            if let Err(e) = primary.close().await {
                result = Err(conn.classify_primary(e));
            }
        }
        if let Some(mut twin) = core.twin.take() {
            // secondary close failures never escalate
            let _ = twin.close().await;
        }
        // A close is only worth replaying when this statement leaves
        // records behind; a fully mirrored statement vanishes silently.
        if !core.queue.is_empty() || conn.is_fallback() {
            core.record(RecordedCall::CloseStatement);
            core.drain_into(&mut conn.queue);
        }
        result
    }

    async fn discard_twin(core: &mut StatementCore) {
        if let Some(mut twin) = core.twin.take() {
            let _ = twin.close().await;
        }
    }
}

impl std::fmt::Debug for TwinStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwinStatement").finish_non_exhaustive()
    }
}
