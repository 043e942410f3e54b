//! End-to-end resynchronization: a pool records while its twin is down; a
//! pool constructed with inverted data sources drains the log and brings
//! the stale side level.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use twinpool::driver::memory::MemServer;
use twinpool::{ParamValue, TwinDataSource, TwinPoolConfig};

fn config(primary: &MemServer, twin: &MemServer) -> TwinPoolConfig {
    TwinPoolConfig::new(Arc::new(primary.clone()), Arc::new(twin.clone()))
        .pool_name("replay-tests")
        .min_idle(0)
        .connection_timeout(Duration::from_secs(5))
}

/// Record traffic on `a` while `b` is unreachable; the log lands in `a`.
async fn record_while_twin_down(a: &MemServer, b: &MemServer, values: &[i64]) -> Result<()> {
    b.set_unreachable(true);
    let ds = TwinDataSource::new(config(a, b)).await?;
    let mut conn = ds.connection().await?;
    for v in values {
        conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(*v)])
            .await?;
    }
    conn.close().await?;
    ds.shutdown().await;
    b.set_unreachable(false);
    Ok(())
}

#[tokio::test]
async fn test_inverted_pool_drains_the_log_and_converges() -> Result<()> {
    let a = MemServer::new("a");
    let b = MemServer::new("b");
    record_while_twin_down(&a, &b, &[1, 2, 3]).await?;
    assert!(a.row_count("invocation_log") > 0);
    assert_eq!(b.row_count("t"), 0);

    // Pool constructed against a twin holding the log: primary is the
    // stale side, twin is the side that kept recording.
    let ds = TwinDataSource::new(config(&b, &a)).await?;

    assert_eq!(a.row_count("invocation_log"), 0);
    assert_eq!(a.rows("t"), b.rows("t"));
    assert_eq!(b.row_count("t"), 3);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_replayed_state_matches_direct_inserts() -> Result<()> {
    // Reference: the same inserts applied directly.
    let reference = MemServer::new("reference");
    {
        let twin = MemServer::new("ref-twin");
        let ds = TwinDataSource::new(config(&reference, &twin)).await?;
        let mut conn = ds.connection().await?;
        for v in [10i64, 20, 30] {
            conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(v)])
                .await?;
        }
        conn.close().await?;
        ds.shutdown().await;
    }

    // Recorded-then-replayed path.
    let a = MemServer::new("a");
    let b = MemServer::new("b");
    record_while_twin_down(&a, &b, &[10, 20, 30]).await?;
    let ds = TwinDataSource::new(config(&b, &a)).await?;
    ds.shutdown().await;

    assert_eq!(b.rows("t"), reference.rows("t"));
    Ok(())
}

#[tokio::test]
async fn test_buffered_streams_replay_byte_for_byte() -> Result<()> {
    let a = MemServer::new("a");
    let b = MemServer::new("b");
    let payload: &[u8] = b"\x00\x01binary\xffpayload";

    b.set_unreachable(true);
    {
        let ds = TwinDataSource::new(config(&a, &b)).await?;
        let mut conn = ds.connection().await?;
        let mut stmt = conn.prepare("INSERT INTO blobs VALUES (?)").await?;
        stmt.bind_byte_stream(1, payload).await?;
        stmt.execute().await?;
        stmt.close().await?;
        conn.close().await?;
        ds.shutdown().await;
    }
    b.set_unreachable(false);

    let ds = TwinDataSource::new(config(&b, &a)).await?;
    ds.shutdown().await;

    assert_eq!(b.rows("blobs"), a.rows("blobs"));
    assert_eq!(b.rows("blobs")[0][0].as_bytes(), Some(payload));
    Ok(())
}

#[tokio::test]
async fn test_replay_applies_work_from_several_recorded_connections() -> Result<()> {
    let a = MemServer::new("a");
    let b = MemServer::new("b");

    b.set_unreachable(true);
    {
        let ds = TwinDataSource::new(config(&a, &b).max_pool_size(2)).await?;
        for v in [1i64, 2] {
            let mut conn = ds.connection().await?;
            conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(v)])
                .await?;
            conn.close().await?;
        }
        ds.shutdown().await;
    }
    b.set_unreachable(false);

    let ds = TwinDataSource::new(config(&b, &a)).await?;
    ds.shutdown().await;

    assert_eq!(b.row_count("t"), 2);
    assert_eq!(a.rows("t"), b.rows("t"));
    assert_eq!(a.row_count("invocation_log"), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_log_means_no_replay_work() -> Result<()> {
    let a = MemServer::new("a");
    let b = MemServer::new("b");
    let ds = TwinDataSource::new(config(&b, &a)).await?;
    ds.shutdown().await;
    assert_eq!(a.row_count("t"), 0);
    assert_eq!(b.row_count("t"), 0);
    Ok(())
}
