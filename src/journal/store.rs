//! Persisted form of the invocation log.
//!
//! The table lives in the database on the *reachable* side: fallback flushes
//! write it through the caller's primary connection, and the replay engine
//! later reads and deletes it through its own dedicated connection. All
//! writes are append-then-delete, transactional per flush or per replay
//! pass.

use tracing::debug;

use crate::core::{CallTarget, ParamValue, PoolError, Result};
use crate::driver::DriverConnection;
use crate::journal::record::{Record, RecordedCall, args_blob};

/// Table contract: `(id AUTOINCREMENT PK, connection_id BIGINT,
/// statement_id BIGINT, target TEXT, method TEXT, args BLOB NULL)`.
/// Creation scripts are per database product and applied at deployment.
pub const TABLE: &str = "invocation_log";

const INSERT_SQL: &str = "INSERT INTO invocation_log (connection_id, statement_id, target, method, args) VALUES (?, ?, ?, ?, ?)";
const SELECT_SQL: &str = "SELECT * FROM invocation_log ORDER BY id";
const DELETE_SQL: &str = "DELETE FROM invocation_log WHERE id = ?";

/// Append records in queue order as one transactional batch. Commits the
/// write when the connection is not in autocommit mode.
pub async fn append_batch(
    conn: &mut dyn DriverConnection,
    records: &[Record],
) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    for record in records {
        let params = [
            ParamValue::Integer(record.connection_id as i64),
            ParamValue::Integer(record.statement_id as i64),
            ParamValue::Text(record.call.target().as_str().to_string()),
            ParamValue::Text(record.method().to_string()),
            args_blob(&record.call)?,
        ];
        conn.execute(INSERT_SQL, &params).await?;
    }
    if !conn.auto_commit() {
        conn.commit().await?;
    }
    debug!(count = records.len(), "flushed records to {TABLE}");
    Ok(records.len())
}

/// Read the whole log ordered by id.
pub async fn read_all(conn: &mut dyn DriverConnection) -> Result<Vec<(i64, Record)>> {
    let rows = conn.query(SELECT_SQL, &[]).await?;
    let mut records = Vec::with_capacity(rows.row_count());
    for row in rows.iter() {
        records.push(decode_row(row)?);
    }
    Ok(records)
}

/// Delete the given row ids. The caller owns the surrounding transaction.
pub async fn delete_batch(conn: &mut dyn DriverConnection, ids: &[i64]) -> Result<()> {
    for id in ids {
        conn.execute(DELETE_SQL, &[ParamValue::Integer(*id)]).await?;
    }
    Ok(())
}

fn decode_row(row: &[ParamValue]) -> Result<(i64, Record)> {
    let malformed = |what: &str| PoolError::Codec(format!("malformed {TABLE} row: {what}"));

    let id = field(row, 0)?.as_i64().ok_or_else(|| malformed("id"))?;
    let connection_id = field(row, 1)?
        .as_i64()
        .ok_or_else(|| malformed("connection_id"))? as u64;
    let statement_id = field(row, 2)?
        .as_i64()
        .ok_or_else(|| malformed("statement_id"))? as u64;
    let target = field(row, 3)?
        .as_str()
        .and_then(CallTarget::parse)
        .ok_or_else(|| malformed("target"))?;
    let method = field(row, 4)?
        .as_str()
        .ok_or_else(|| malformed("method"))?
        .to_string();
    let args = match field(row, 5)? {
        ParamValue::Null => None,
        ParamValue::Bytes(b) => Some(b.as_bytes().to_vec()),
        _ => return Err(malformed("args")),
    };

    let call = RecordedCall::decode(target, &method, args.as_deref())?;
    Ok((
        id,
        Record {
            connection_id,
            statement_id,
            call,
        },
    ))
}

fn field(row: &[ParamValue], index: usize) -> Result<&ParamValue> {
    row.get(index)
        .ok_or_else(|| PoolError::Codec(format!("{TABLE} row is missing column {index}")))
}
