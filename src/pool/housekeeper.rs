use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::pool::TwinPool;

/// Background maintenance: evict idle/expired entries, refill to the
/// configured minimum. Holds only a weak reference so an abandoned pool can
/// drop.
pub(crate) fn spawn(pool: &Arc<TwinPool>) -> JoinHandle<()> {
    let weak = Arc::downgrade(pool);
    let interval = pool.config().housekeeping_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else { break };
            if pool.is_shutdown() {
                break;
            }
            debug!(pool = %pool.name(), "housekeeping pass");
            pool.housekeep().await;
        }
    })
}
