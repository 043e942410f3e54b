use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Observable pool state.
///
/// `Fallback` and `Suspended` are tracked as independent flags on the pool;
/// this enum is the single value reported on the admin surface, with the
/// more restrictive state winning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Suspended,
    Fallback,
    Shutdown,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Running => "RUNNING",
            PoolState::Suspended => "SUSPENDED",
            PoolState::Fallback => "FALLBACK",
            PoolState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

/// Transaction isolation levels understood by the wrapped drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Which capability a journal record targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Connection,
    Statement,
}

impl CallTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallTarget::Connection => "connection",
            CallTarget::Statement => "statement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connection" => Some(CallTarget::Connection),
            "statement" => Some(CallTarget::Statement),
            _ => None,
        }
    }
}

/// Pool-owned generator for connection and statement correlation ids.
///
/// Ids must stay unique within one invocation-log table even across process
/// restarts: a restarted producer appends to a log that may still hold the
/// previous process's records. The high bits carry the pool start time in
/// seconds, the low 20 bits a per-process counter.
#[derive(Debug)]
pub struct IdGenerator {
    epoch: u64,
    counter: AtomicU64,
}

const COUNTER_BITS: u32 = 20;

impl IdGenerator {
    pub fn new() -> Self {
        let seconds = chrono::Utc::now().timestamp().max(0) as u64;
        Self {
            epoch: seconds << COUNTER_BITS,
            counter: AtomicU64::new(1),
        }
    }

    /// Next correlation id. Never returns 0 (0 marks connection-level
    /// records in the journal).
    pub fn next_id(&self) -> u64 {
        self.epoch + self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
