//! Pool capacity, exclusivity and lifecycle under concurrent load.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use twinpool::driver::memory::MemServer;
use twinpool::{PoolError, TwinPool, TwinPoolConfig};

/// Opt into pool logs with e.g. `RUST_LOG=twinpool=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn config(primary: &MemServer, twin: &MemServer) -> TwinPoolConfig {
    init_tracing();
    TwinPoolConfig::new(Arc::new(primary.clone()), Arc::new(twin.clone()))
        .pool_name("concurrency-tests")
        .min_idle(0)
        .connection_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_in_use_never_exceeds_capacity() -> Result<()> {
    const CAPACITY: usize = 4;
    const TASKS: usize = 16;
    const ROUNDS: usize = 10;

    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(config(&primary, &twin).max_pool_size(CAPACITY)).await?;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pool = Arc::clone(&pool);
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let conn = pool.connection().await.expect("borrow");
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                conn.close().await.expect("close");
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }

    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert!(pool.total_connections() <= CAPACITY);
    assert_eq!(pool.active_connections(), 0);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_borrow_fails_with_timeout_not_stale_entry() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(
        config(&primary, &twin)
            .max_pool_size(1)
            .connection_timeout(Duration::from_millis(100)),
    )
    .await?;

    let held = pool.connection().await?;
    let err = pool.connection().await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout(_)));
    held.close().await?;
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_housekeeper_evicts_idle_entries_within_one_interval() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(
        config(&primary, &twin)
            .idle_timeout(Some(Duration::from_millis(50)))
            .housekeeping_interval(Duration::from_millis(30)),
    )
    .await?;

    let conn = pool.connection().await?;
    conn.close().await?;
    assert_eq!(pool.total_connections(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.total_connections(), 0);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_housekeeper_refills_to_minimum_idle() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(
        config(&primary, &twin)
            .min_idle(2)
            .housekeeping_interval(Duration::from_millis(30)),
    )
    .await?;
    assert_eq!(pool.idle_connections(), 2);

    pool.soft_evict_all().await;
    assert_eq!(pool.total_connections(), 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(pool.idle_connections(), 2);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_max_lifetime_retires_connections() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(
        config(&primary, &twin)
            .min_idle(1)
            .max_lifetime(Some(Duration::from_millis(60)))
            .housekeeping_interval(Duration::from_millis(500)),
    )
    .await?;
    assert_eq!(pool.total_connections(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    // The reaper closed the idle entry without waiting for housekeeping.
    assert_eq!(pool.total_connections(), 0);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_leak_detection_does_not_disturb_the_borrower() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(
        config(&primary, &twin).leak_detection_threshold(Some(Duration::from_millis(10))),
    )
    .await?;

    let mut conn = pool.connection().await?;
    // Hold past the threshold: the leak task fires (warning only), the
    // connection keeps working and returns normally.
    tokio::time::sleep(Duration::from_millis(40)).await;
    conn.query("SELECT COUNT(*) FROM t", &[]).await?;
    conn.close().await?;
    assert_eq!(pool.active_connections(), 0);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_suspend_blocks_until_resume() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(config(&primary, &twin)).await?;

    pool.suspend();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.connection().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    pool.resume();
    let conn = waiter.await??;
    conn.close().await?;
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_broken_primary_call_evicts_the_entry() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let pool = TwinPool::new(config(&primary, &twin)).await?;

    let mut conn = pool.connection().await?;
    primary.fail_next_with("57P01"); // admin shutdown: connection-broken class
    let err = conn
        .execute("INSERT INTO t VALUES (?)", &[1i64.into()])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Database(_)));

    let _ = conn.close().await; // entry evicted, physically closed
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.total_connections(), 0);
    pool.shutdown().await;
    Ok(())
}
