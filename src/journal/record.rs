//! Replayable call records.
//!
//! Every recordable operation is a variant of the closed [`RecordedCall`]
//! union; the replay engine dispatches on the tag, never on method-name
//! strings. The persisted form is `(target, method, args)` where `args` is
//! the MessagePack encoding of the ordered argument list and a missing blob
//! denotes a zero-argument call.

use std::fmt;

use crate::core::{ByteSource, CallTarget, IsolationLevel, ParamValue, PoolError, Result};

/// One recordable operation with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    // connection capability
    SetAutoCommit(bool),
    SetReadOnly(bool),
    SetIsolation(IsolationLevel),
    SetCatalog(String),
    SetSchema(String),
    Commit,
    Prepare { sql: String },
    CloseConnection,
    // statement capability
    BindParam { index: u16, value: ParamValue },
    Execute,
    AddBatch,
    ExecuteBatch,
    CloseStatement,
}

impl RecordedCall {
    pub fn target(&self) -> CallTarget {
        match self {
            RecordedCall::SetAutoCommit(_)
            | RecordedCall::SetReadOnly(_)
            | RecordedCall::SetIsolation(_)
            | RecordedCall::SetCatalog(_)
            | RecordedCall::SetSchema(_)
            | RecordedCall::Commit
            | RecordedCall::Prepare { .. }
            | RecordedCall::CloseConnection => CallTarget::Connection,
            RecordedCall::BindParam { .. }
            | RecordedCall::Execute
            | RecordedCall::AddBatch
            | RecordedCall::ExecuteBatch
            | RecordedCall::CloseStatement => CallTarget::Statement,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            RecordedCall::SetAutoCommit(_) => "set_auto_commit",
            RecordedCall::SetReadOnly(_) => "set_read_only",
            RecordedCall::SetIsolation(_) => "set_isolation",
            RecordedCall::SetCatalog(_) => "set_catalog",
            RecordedCall::SetSchema(_) => "set_schema",
            RecordedCall::Commit => "commit",
            RecordedCall::Prepare { .. } => "prepare",
            RecordedCall::CloseConnection | RecordedCall::CloseStatement => "close",
            RecordedCall::BindParam { .. } => "bind",
            RecordedCall::Execute => "execute",
            RecordedCall::AddBatch => "add_batch",
            RecordedCall::ExecuteBatch => "execute_batch",
        }
    }

    /// Ordered argument list of the call; empty for zero-argument calls.
    fn args(&self) -> Vec<ParamValue> {
        match self {
            RecordedCall::SetAutoCommit(on) | RecordedCall::SetReadOnly(on) => {
                vec![ParamValue::Boolean(*on)]
            }
            RecordedCall::SetIsolation(level) => {
                vec![ParamValue::Integer(isolation_code(*level))]
            }
            RecordedCall::SetCatalog(name) | RecordedCall::SetSchema(name) => {
                vec![ParamValue::Text(name.clone())]
            }
            RecordedCall::Prepare { sql } => vec![ParamValue::Text(sql.clone())],
            RecordedCall::BindParam { index, value } => {
                vec![ParamValue::Integer(*index as i64), value.clone()]
            }
            RecordedCall::Commit
            | RecordedCall::CloseConnection
            | RecordedCall::Execute
            | RecordedCall::AddBatch
            | RecordedCall::ExecuteBatch
            | RecordedCall::CloseStatement => Vec::new(),
        }
    }

    /// Encode the argument list; `None` marks a zero-argument call (stored
    /// as a NULL blob).
    pub fn encode_args(&self) -> Result<Option<Vec<u8>>> {
        let args = self.args();
        if args.is_empty() {
            return Ok(None);
        }
        let encoded =
            rmp_serde::to_vec(&args).map_err(|e| PoolError::Codec(format!("encode args: {e}")))?;
        Ok(Some(encoded))
    }

    /// Reconstruct a call from its persisted `(target, method, args)` form.
    pub fn decode(target: CallTarget, method: &str, args: Option<&[u8]>) -> Result<RecordedCall> {
        let args: Vec<ParamValue> = match args {
            Some(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| PoolError::Codec(format!("decode args for '{method}': {e}")))?,
            None => Vec::new(),
        };
        let bad = || PoolError::Codec(format!("malformed arguments for '{method}'"));

        let call = match (target, method) {
            (CallTarget::Connection, "set_auto_commit") => {
                RecordedCall::SetAutoCommit(bool_arg(&args).ok_or_else(bad)?)
            }
            (CallTarget::Connection, "set_read_only") => {
                RecordedCall::SetReadOnly(bool_arg(&args).ok_or_else(bad)?)
            }
            (CallTarget::Connection, "set_isolation") => {
                let code = args.first().and_then(ParamValue::as_i64).ok_or_else(bad)?;
                RecordedCall::SetIsolation(isolation_from_code(code).ok_or_else(bad)?)
            }
            (CallTarget::Connection, "set_catalog") => {
                RecordedCall::SetCatalog(text_arg(&args).ok_or_else(bad)?)
            }
            (CallTarget::Connection, "set_schema") => {
                RecordedCall::SetSchema(text_arg(&args).ok_or_else(bad)?)
            }
            (CallTarget::Connection, "commit") => RecordedCall::Commit,
            (CallTarget::Connection, "prepare") => RecordedCall::Prepare {
                sql: text_arg(&args).ok_or_else(bad)?,
            },
            (CallTarget::Connection, "close") => RecordedCall::CloseConnection,
            (CallTarget::Statement, "bind") => {
                let index = args.first().and_then(ParamValue::as_i64).ok_or_else(bad)?;
                let value = args.get(1).cloned().ok_or_else(bad)?;
                RecordedCall::BindParam {
                    index: u16::try_from(index).map_err(|_| bad())?,
                    value,
                }
            }
            (CallTarget::Statement, "execute") => RecordedCall::Execute,
            (CallTarget::Statement, "add_batch") => RecordedCall::AddBatch,
            (CallTarget::Statement, "execute_batch") => RecordedCall::ExecuteBatch,
            (CallTarget::Statement, "close") => RecordedCall::CloseStatement,
            _ => {
                return Err(PoolError::Codec(format!(
                    "unknown journaled call: {} {method}",
                    target.as_str()
                )));
            }
        };
        Ok(call)
    }
}

fn bool_arg(args: &[ParamValue]) -> Option<bool> {
    match args.first() {
        Some(ParamValue::Boolean(b)) => Some(*b),
        _ => None,
    }
}

fn text_arg(args: &[ParamValue]) -> Option<String> {
    match args.first() {
        Some(ParamValue::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn isolation_code(level: IsolationLevel) -> i64 {
    match level {
        IsolationLevel::ReadUncommitted => 1,
        IsolationLevel::ReadCommitted => 2,
        IsolationLevel::RepeatableRead => 4,
        IsolationLevel::Serializable => 8,
    }
}

fn isolation_from_code(code: i64) -> Option<IsolationLevel> {
    match code {
        1 => Some(IsolationLevel::ReadUncommitted),
        2 => Some(IsolationLevel::ReadCommitted),
        4 => Some(IsolationLevel::RepeatableRead),
        8 => Some(IsolationLevel::Serializable),
        _ => None,
    }
}

/// One logged, replayable call, correlated to its logical connection and
/// statement. `statement_id == 0` marks a connection-level record, except
/// for `Prepare`, whose `statement_id` is the id assigned to the statement
/// it creates.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub connection_id: u64,
    pub statement_id: u64,
    pub call: RecordedCall,
}

impl Record {
    pub fn connection_level(connection_id: u64, call: RecordedCall) -> Self {
        Self {
            connection_id,
            statement_id: 0,
            call,
        }
    }

    pub fn statement_level(connection_id: u64, statement_id: u64, call: RecordedCall) -> Self {
        Self {
            connection_id,
            statement_id,
            call,
        }
    }

    /// Buffered-stream binds may be large; used to trace-log cheaply.
    pub fn method(&self) -> &'static str {
        self.call.method()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record{{conn={}, stmt={}, {}:{}}}",
            self.connection_id,
            self.statement_id,
            self.call.target().as_str(),
            self.method()
        )
    }
}

/// A record bound to a [`ByteSource`]-backed args blob, as read back from
/// the invocation-log table.
pub(crate) fn args_blob(call: &RecordedCall) -> Result<ParamValue> {
    Ok(match call.encode_args()? {
        Some(bytes) => ParamValue::Bytes(ByteSource::from_bytes(bytes)),
        None => ParamValue::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(call: RecordedCall) {
        let target = call.target();
        let method = call.method();
        let args = call.encode_args().unwrap();
        let decoded = RecordedCall::decode(target, method, args.as_deref()).unwrap();
        assert_eq!(call, decoded);
    }

    #[test]
    fn test_zero_arg_calls_encode_to_none() {
        assert!(RecordedCall::Commit.encode_args().unwrap().is_none());
        assert!(RecordedCall::CloseConnection.encode_args().unwrap().is_none());
        assert!(RecordedCall::ExecuteBatch.encode_args().unwrap().is_none());
    }

    #[test]
    fn test_connection_calls_round_trip() {
        round_trip(RecordedCall::SetAutoCommit(false));
        round_trip(RecordedCall::SetReadOnly(true));
        round_trip(RecordedCall::SetIsolation(IsolationLevel::Serializable));
        round_trip(RecordedCall::SetCatalog("reporting".into()));
        round_trip(RecordedCall::SetSchema("app".into()));
        round_trip(RecordedCall::Commit);
        round_trip(RecordedCall::Prepare {
            sql: "INSERT INTO t VALUES (?)".into(),
        });
        round_trip(RecordedCall::CloseConnection);
    }

    #[test]
    fn test_statement_calls_round_trip() {
        round_trip(RecordedCall::BindParam {
            index: 3,
            value: ParamValue::Text("x".into()),
        });
        round_trip(RecordedCall::BindParam {
            index: 1,
            value: ParamValue::Bytes(ByteSource::from_bytes(vec![9u8; 64])),
        });
        round_trip(RecordedCall::Execute);
        round_trip(RecordedCall::AddBatch);
        round_trip(RecordedCall::ExecuteBatch);
        round_trip(RecordedCall::CloseStatement);
    }

    #[test]
    fn test_close_is_disambiguated_by_target() {
        let conn = RecordedCall::decode(CallTarget::Connection, "close", None).unwrap();
        assert_eq!(conn, RecordedCall::CloseConnection);
        let stmt = RecordedCall::decode(CallTarget::Statement, "close", None).unwrap();
        assert_eq!(stmt, RecordedCall::CloseStatement);
    }

    #[test]
    fn test_unknown_method_is_a_codec_error() {
        let err = RecordedCall::decode(CallTarget::Statement, "explain", None).unwrap_err();
        assert!(matches!(err, PoolError::Codec(_)));
    }
}
