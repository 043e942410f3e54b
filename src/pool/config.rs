use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::core::{IsolationLevel, PoolError, Result};
use crate::driver::DataSource;
use crate::replay::takeover::PeerControl;

/// Pool configuration.
///
/// Consumed, not owned: loading it from files or the environment is the
/// embedder's concern.
#[derive(Clone)]
pub struct TwinPoolConfig {
    /// Authoritative database; always serves the application's calls.
    pub primary: Arc<dyn DataSource>,
    /// Shadow database kept in sync best-effort.
    pub twin: Arc<dyn DataSource>,

    pub pool_name: String,
    pub max_pool_size: usize,
    pub min_idle: usize,

    /// How long a borrow may wait for an entry.
    pub connection_timeout: Duration,
    /// Driver-side budget for liveness probes.
    pub validation_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    /// Borrows held longer than this log a leak warning. `None` disables.
    pub leak_detection_threshold: Option<Duration>,
    pub housekeeping_interval: Duration,

    // session defaults applied to every new physical connection
    pub auto_commit: bool,
    pub read_only: bool,
    pub isolation: Option<IsolationLevel>,
    pub catalog: Option<String>,
    pub schema: Option<String>,

    /// Peer pool coordinated with during the replay handoff.
    pub peer: Option<Arc<dyn PeerControl>>,
}

impl TwinPoolConfig {
    pub fn new(primary: Arc<dyn DataSource>, twin: Arc<dyn DataSource>) -> Self {
        Self {
            primary,
            twin,
            pool_name: format!("twinpool-{}", Uuid::new_v4()),
            max_pool_size: 10,
            min_idle: 1,
            connection_timeout: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            leak_detection_threshold: None,
            housekeeping_interval: Duration::from_secs(30),
            auto_commit: true,
            read_only: false,
            isolation: None,
            catalog: None,
            schema: None,
            peer: None,
        }
    }

    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    pub fn max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    pub fn min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn leak_detection_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.leak_detection_threshold = threshold;
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn auto_commit(mut self, on: bool) -> Self {
        self.auto_commit = on;
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn peer(mut self, peer: Arc<dyn PeerControl>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(PoolError::Config("max_pool_size must be > 0".into()));
        }
        if self.min_idle > self.max_pool_size {
            return Err(PoolError::Config(
                "min_idle cannot exceed max_pool_size".into(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(PoolError::Config("connection_timeout must be > 0".into()));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(PoolError::Config(
                "housekeeping_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TwinPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwinPoolConfig")
            .field("pool_name", &self.pool_name)
            .field("max_pool_size", &self.max_pool_size)
            .field("min_idle", &self.min_idle)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("auto_commit", &self.auto_commit)
            .field("has_peer", &self.peer.is_some())
            .finish_non_exhaustive()
    }
}
