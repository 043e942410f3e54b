use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Schedules a delayed warning for connections held past the configured
/// threshold. The warning is advisory, never corrective: a task that fires
/// just after the connection was returned is a benign false positive.
#[derive(Debug, Clone)]
pub(crate) struct LeakDetector {
    pool_name: String,
    threshold: Option<Duration>,
}

impl LeakDetector {
    pub(crate) fn new(pool_name: &str, threshold: Option<Duration>) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            threshold,
        }
    }

    /// Arm a leak task for one checkout. The caller aborts the handle on
    /// close/return.
    pub(crate) fn schedule(&self, connection_id: u64) -> Option<JoinHandle<()>> {
        let threshold = self.threshold?;
        let pool_name = self.pool_name.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            warn!(
                pool = %pool_name,
                connection_id,
                held_for = ?threshold,
                "connection has not been returned; possible leak"
            );
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_detector_schedules_nothing() {
        let detector = LeakDetector::new("p", None);
        assert!(detector.schedule(1).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_task_never_fires() {
        let detector = LeakDetector::new("p", Some(Duration::from_millis(20)));
        let handle = detector.schedule(1).unwrap();
        handle.abort();
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Nothing to assert beyond "no panic": the warning path is logging
        // only. The abort must win the race with the timer.
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_armed_task_completes_after_threshold() {
        let detector = LeakDetector::new("p", Some(Duration::from_millis(5)));
        let handle = detector.schedule(7).unwrap();
        assert!(handle.await.is_ok());
    }
}
