use std::sync::Arc;
use std::time::Duration;

use sqlgate_core::{
    ConnectionFactory, ConnectionMetrics, ConnectionStrategy, DatabaseContext,
    DatabaseContextConfiguration, DbError, ExecutionType, KeepAliveStrategy, ProductVersion,
    SingleWriterStrategy, SupportedDatabase, dialect_for,
};
use sqlgate_test_support::FakeAdapter;

fn factory(adapter: &FakeAdapter, product: SupportedDatabase) -> Arc<ConnectionFactory> {
    ConnectionFactory::new(
        adapter.clone().as_adapter_arc(),
        "Data Source=app.db".to_string(),
        None,
        dialect_for(product, ProductVersion::new(3, 45, 0)),
        false,
        Arc::new(ConnectionMetrics::disabled()),
    )
}

#[tokio::test]
async fn single_writer_read_lease_fails_the_write_guard() {
    let adapter = FakeAdapter::sqlite();
    let strategy = SingleWriterStrategy::new(
        factory(&adapter, SupportedDatabase::Sqlite),
        Some(Duration::from_secs(1)),
    );

    let lease = strategy.acquire(ExecutionType::Read).await.unwrap();
    let result = lease.assert_write_capable();
    assert!(matches!(result, Err(DbError::WriteGuardViolation(_))));

    // The guard fires before any SQL reaches the wire.
    assert!(
        adapter
            .executed_sql()
            .iter()
            .all(|sql| !sql.starts_with("INSERT") && !sql.starts_with("UPDATE"))
    );
    strategy.release(lease).await.unwrap();
}

#[tokio::test]
async fn single_writer_serializes_write_acquisition() {
    let adapter = FakeAdapter::sqlite();
    let strategy = SingleWriterStrategy::new(
        factory(&adapter, SupportedDatabase::Sqlite),
        Some(Duration::from_millis(30)),
    );

    let held = strategy.acquire(ExecutionType::Write).await.unwrap();
    let contended = strategy.acquire(ExecutionType::Write).await;
    assert!(matches!(
        contended,
        Err(DbError::ModeContention { .. })
    ));

    strategy.release(held).await.unwrap();
    let reacquired = strategy.acquire(ExecutionType::Write).await.unwrap();
    strategy.release(reacquired).await.unwrap();
    strategy.dispose().await.unwrap();
}

#[tokio::test]
async fn single_writer_reads_run_alongside_the_writer() {
    let adapter = FakeAdapter::sqlite();
    let strategy = SingleWriterStrategy::new(
        factory(&adapter, SupportedDatabase::Sqlite),
        Some(Duration::from_millis(30)),
    );

    let writer = strategy.acquire(ExecutionType::Write).await.unwrap();
    // Reads open fresh pooled connections and never touch the mode lock.
    let read_a = strategy.acquire(ExecutionType::Read).await.unwrap();
    let read_b = strategy.acquire(ExecutionType::Read).await.unwrap();

    strategy.release(read_a).await.unwrap();
    strategy.release(read_b).await.unwrap();
    strategy.release(writer).await.unwrap();
    strategy.dispose().await.unwrap();
}

#[tokio::test]
async fn keep_alive_holds_an_idle_sentinel() {
    let adapter = FakeAdapter::sql_server();
    let strategy = KeepAliveStrategy::connect(factory(&adapter, SupportedDatabase::SqlServer))
        .await
        .unwrap();

    assert_eq!(adapter.stats().opens, 1, "sentinel opens at construction");

    let lease = strategy.acquire(ExecutionType::Read).await.unwrap();
    assert_eq!(adapter.stats().opens, 2);
    strategy.release(lease).await.unwrap();
    assert_eq!(adapter.stats().closes, 1, "pooled connection closes on release");

    strategy.dispose().await.unwrap();
    assert_eq!(adapter.stats().closes, 2, "sentinel closes at disposal");
}

#[tokio::test]
async fn memory_sqlite_shares_one_connection() {
    let adapter = FakeAdapter::sqlite();
    let config = DatabaseContextConfiguration::new("Data Source=:memory:", "sqlite");
    let ctx = DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
        .await
        .unwrap();

    for _ in 0..3 {
        let mut container = sqlgate_core::DbContext::create_container(&ctx);
        container.append_sql("SELECT 1 AS probe");
        container
            .execute_non_query(ExecutionType::Read)
            .await
            .unwrap();
    }

    let executed = adapter.executed();
    let work: Vec<_> = executed
        .iter()
        .filter(|r| r.sql == "SELECT 1 AS probe")
        .collect();
    assert_eq!(work.len(), 3);
    assert!(
        work.iter().all(|r| r.connection_id == work[0].connection_id),
        "single-connection mode must reuse one physical connection"
    );

    // Session preamble ran exactly once for that physical connection.
    let preambles = executed
        .iter()
        .filter(|r| r.sql == "PRAGMA foreign_keys = ON;")
        .count();
    assert_eq!(preambles, 1);
}

#[tokio::test]
async fn standard_mode_applies_preamble_per_physical_connection() {
    let adapter = FakeAdapter::postgres();
    let config = DatabaseContextConfiguration::new("Host=db;Database=app", "npgsql");
    let ctx = DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
        .await
        .unwrap();

    for _ in 0..2 {
        let mut container = sqlgate_core::DbContext::create_container(&ctx);
        container.append_sql("SELECT 1");
        container
            .execute_non_query(ExecutionType::Read)
            .await
            .unwrap();
    }

    // Two executions in Standard mode = two fresh connections, each with
    // its own one-shot preamble. The detection probe connection gets none.
    let preambles = adapter
        .executed_sql()
        .iter()
        .filter(|sql| sql.contains("standard_conforming_strings"))
        .count();
    assert_eq!(preambles, 2);
}

#[tokio::test]
async fn open_failure_is_not_retried() {
    let adapter = FakeAdapter::postgres().with_open_error("connection refused");
    let config = DatabaseContextConfiguration::new("Host=db", "npgsql");
    let result = DatabaseContext::connect(config, adapter.clone().as_adapter_arc()).await;

    assert!(matches!(result, Err(DbError::ConnectionFailed { .. })));
    assert_eq!(adapter.stats().opens, 0);
}
