use std::time::Duration;

use thiserror::Error;

/// SQLSTATE values that mark the physical link as gone even though they are
/// not in class 08 (admin/crash shutdown, vendor disconnect codes).
const DISCONNECT_STATES: &[&str] = &["57P01", "57P02", "57P03", "01002", "JZ0C0", "JZ0C1"];

/// Coarse failure categories reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The database could not be reached or the link dropped mid-call.
    Unavailable,
    /// The call exceeded a driver-side timeout.
    Timeout,
    /// The statement/connection was rejected by the database (constraint,
    /// syntax, permission, ...).
    Rejected,
    /// Anything the driver could not classify.
    Other,
}

/// Error surfaced by the opaque driver capability.
///
/// Carries the SQLSTATE when the driver knows it; classification into the
/// pool's taxonomy happens here rather than at every call site.
#[derive(Debug, Clone, Error)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "driver error [{state}]: {}", self.message),
            None => write!(f, "driver error: {}", self.message),
        }
    }
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn with_state(kind: DriverErrorKind, sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_state(DriverErrorKind::Unavailable, "08S01", message)
    }

    /// True when the error means the physical connection is broken and the
    /// pool entry must be evicted: SQLSTATE class 08, a known disconnect
    /// state, or a driver-level unavailable/timeout classification.
    pub fn is_disconnect(&self) -> bool {
        if matches!(self.kind, DriverErrorKind::Unavailable | DriverErrorKind::Timeout) {
            return true;
        }
        match &self.sqlstate {
            Some(state) => state.starts_with("08") || DISCONNECT_STATES.contains(&state.as_str()),
            None => false,
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("acquire timed out after {0:?}: no connection available")]
    AcquireTimeout(Duration),

    #[error("pool is shut down")]
    PoolClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("statement is closed")]
    StatementClosed,

    #[error(transparent)]
    Database(#[from] DriverError),

    #[error("journal codec error: {0}")]
    Codec(String),

    #[error("stream buffering error: {0}")]
    Stream(String),

    #[error("replay error: {0}")]
    Replay(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_08_is_disconnect() {
        let e = DriverError::with_state(DriverErrorKind::Other, "08006", "link lost");
        assert!(e.is_disconnect());
    }

    #[test]
    fn test_admin_shutdown_is_disconnect() {
        let e = DriverError::with_state(DriverErrorKind::Rejected, "57P01", "admin shutdown");
        assert!(e.is_disconnect());
    }

    #[test]
    fn test_rejected_statement_is_not_disconnect() {
        let e = DriverError::with_state(DriverErrorKind::Rejected, "23505", "duplicate key");
        assert!(!e.is_disconnect());
    }

    #[test]
    fn test_timeout_kind_is_disconnect() {
        let e = DriverError::new(DriverErrorKind::Timeout, "validation timed out");
        assert!(e.is_disconnect());
    }

    #[test]
    fn test_display_includes_state() {
        let e = DriverError::with_state(DriverErrorKind::Rejected, "23505", "duplicate key");
        assert_eq!(e.to_string(), "driver error [23505]: duplicate key");
    }
}
