//! Healthy-twin mirroring: every mutating call lands on both databases and
//! the persisted log stays empty.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use twinpool::driver::memory::MemServer;
use twinpool::{ParamValue, PoolState, TwinDataSource, TwinPoolConfig};

fn config(primary: &MemServer, twin: &MemServer) -> TwinPoolConfig {
    TwinPoolConfig::new(Arc::new(primary.clone()), Arc::new(twin.clone()))
        .pool_name("mirroring-tests")
        .min_idle(0)
        .connection_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_insert_and_commit_reach_both_databases() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin).max_pool_size(1)).await?;

    let mut conn = ds.connection().await?;
    conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
        .await?;
    conn.commit().await?;
    conn.close().await?;

    assert_eq!(primary.rows("t"), twin.rows("t"));
    assert_eq!(primary.rows("t"), vec![vec![ParamValue::Integer(1)]]);
    assert_eq!(primary.row_count("invocation_log"), 0);
    assert_eq!(twin.row_count("invocation_log"), 0);
    assert_eq!(ds.pool().state(), PoolState::Running);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_prepared_statement_traffic_is_mirrored_in_order() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let mut conn = ds.connection().await?;
    let mut stmt = conn.prepare("INSERT INTO orders VALUES (?, ?)").await?;
    for (id, name) in [(1i64, "first"), (2, "second"), (3, "third")] {
        stmt.bind(1, ParamValue::Integer(id)).await?;
        stmt.bind(2, ParamValue::Text(name.into())).await?;
        stmt.execute().await?;
    }
    stmt.close().await?;
    conn.commit().await?;
    conn.close().await?;

    assert_eq!(primary.rows("orders"), twin.rows("orders"));
    assert_eq!(primary.row_count("orders"), 3);
    assert_eq!(primary.row_count("invocation_log"), 0);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_batches_are_mirrored() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let mut conn = ds.connection().await?;
    let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").await?;
    for v in 0..5i64 {
        stmt.bind(1, ParamValue::Integer(v)).await?;
        stmt.add_batch().await?;
    }
    let counts = stmt.execute_batch().await?;
    assert_eq!(counts.len(), 5);
    stmt.close().await?;
    conn.close().await?;

    assert_eq!(primary.rows("t"), twin.rows("t"));
    assert_eq!(twin.row_count("t"), 5);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_byte_stream_binds_use_the_same_buffered_bytes() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let payload: &[u8] = b"binary payload that must replay byte-for-byte";
    let mut conn = ds.connection().await?;
    let mut stmt = conn.prepare("INSERT INTO blobs VALUES (?)").await?;
    stmt.bind_byte_stream(1, payload).await?;
    stmt.execute().await?;
    stmt.close().await?;
    conn.close().await?;

    assert_eq!(primary.rows("blobs"), twin.rows("blobs"));
    let row = &twin.rows("blobs")[0];
    assert_eq!(row[0].as_bytes(), Some(payload));
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reads_are_never_mirrored_or_recorded() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let mut conn = ds.connection().await?;
    conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(9)])
        .await?;
    // A twin outage during a pure read must go unnoticed.
    twin.set_unreachable(true);
    let rows = conn.query("SELECT COUNT(*) FROM t", &[]).await?;
    assert_eq!(rows.rows[0][0], ParamValue::Integer(1));
    twin.set_unreachable(false);
    conn.close().await?;

    assert_eq!(ds.pool().state(), PoolState::Running);
    assert_eq!(primary.row_count("invocation_log"), 0);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_session_settings_are_mirrored() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let mut conn = ds.connection().await?;
    conn.set_auto_commit(false).await?;
    conn.set_read_only(false).await?;
    conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(5)])
        .await?;
    conn.commit().await?;
    conn.close().await?;

    assert_eq!(primary.rows("t"), twin.rows("t"));
    assert_eq!(primary.row_count("t"), 1);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_network_timeout_changes_are_primary_only() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin)).await?;

    let mut conn = ds.connection().await?;
    // Even with the twin gone, a network-timeout change must neither fail
    // nor trip fallback: it is a primary-only, unrecorded operation.
    twin.set_unreachable(true);
    conn.set_network_timeout(Duration::from_secs(3)).await?;
    twin.set_unreachable(false);
    assert_eq!(ds.pool().state(), PoolState::Running);
    conn.close().await?;

    assert_eq!(primary.row_count("invocation_log"), 0);
    ds.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rollback_reaches_both_sides_and_discards_records() -> Result<()> {
    let primary = MemServer::new("primary");
    let twin = MemServer::new("twin");
    let ds = TwinDataSource::new(config(&primary, &twin).auto_commit(false)).await?;

    let mut conn = ds.connection().await?;
    conn.execute("INSERT INTO t VALUES (?)", &[ParamValue::Integer(1)])
        .await?;
    conn.rollback().await?;
    conn.close().await?;

    assert_eq!(primary.row_count("t"), 0);
    assert_eq!(twin.row_count("t"), 0);
    assert_eq!(primary.row_count("invocation_log"), 0);
    ds.shutdown().await;
    Ok(())
}
