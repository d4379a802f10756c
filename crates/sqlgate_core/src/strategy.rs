use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::OnceCell;

use crate::dialect::Dialect;
use crate::driver::DriverAdapter;
use crate::error::DbError;
use crate::locker::LockPermit;
use crate::metrics::ConnectionMetrics;
use crate::modes::{DbMode, ExecutionType};
use crate::product::SupportedDatabase;
use crate::tracked::{ConnectionRole, TrackedConnection};

/// Opens tracked connections for the strategies, routing reads to the
/// read-only connection string when one is configured.
pub struct ConnectionFactory {
    adapter: Arc<dyn DriverAdapter>,
    connection_string: String,
    read_connection_string: Option<String>,
    dialect: Arc<dyn Dialect>,
    read_only: bool,
    metrics: Arc<ConnectionMetrics>,
}

impl ConnectionFactory {
    pub fn new(
        adapter: Arc<dyn DriverAdapter>,
        connection_string: String,
        read_connection_string: Option<String>,
        dialect: Arc<dyn Dialect>,
        read_only: bool,
        metrics: Arc<ConnectionMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            connection_string,
            read_connection_string,
            dialect,
            read_only,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub async fn open(
        &self,
        role: ConnectionRole,
        execution: ExecutionType,
    ) -> Result<Arc<TrackedConnection>, DbError> {
        let connection_string = match execution {
            ExecutionType::Read => self
                .read_connection_string
                .as_deref()
                .unwrap_or(&self.connection_string),
            ExecutionType::Write => &self.connection_string,
        };
        TrackedConnection::open(
            self.adapter.as_ref(),
            connection_string,
            self.dialect.as_ref(),
            role,
            execution,
            self.read_only,
            self.metrics.clone(),
        )
        .await
    }
}

/// A connection handed out by a strategy, together with everything needed
/// to put it back: the mode-lock permit (if the connection is shared) and
/// whether release closes it.
pub struct ConnectionLease {
    conn: Arc<TrackedConnection>,
    permit: Option<LockPermit>,
    dispose_on_release: bool,
    write_capable: bool,
    acquired_at: Instant,
}

impl ConnectionLease {
    fn new(
        conn: Arc<TrackedConnection>,
        permit: Option<LockPermit>,
        dispose_on_release: bool,
        write_capable: bool,
    ) -> Self {
        Self {
            conn,
            permit,
            dispose_on_release,
            write_capable,
            acquired_at: Instant::now(),
        }
    }

    pub fn connection(&self) -> &Arc<TrackedConnection> {
        &self.conn
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_write_capable(&self) -> bool {
        self.write_capable
    }

    /// Guard executed before any write SQL is sent: a lease that is not
    /// backed by a write-capable connection must never carry a write.
    pub fn assert_write_capable(&self) -> Result<(), DbError> {
        if self.write_capable && self.conn.is_write_capable() {
            Ok(())
        } else {
            Err(DbError::write_guard(
                "write execution routed to a non-writer connection",
            ))
        }
    }

    fn into_parts(self) -> (Arc<TrackedConnection>, Option<LockPermit>, bool, Instant) {
        (
            self.conn,
            self.permit,
            self.dispose_on_release,
            self.acquired_at,
        )
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("role", &self.conn.role())
            .field("write_capable", &self.write_capable)
            .finish()
    }
}

/// Acquire/release discipline for tracked connections.
///
/// Four variants; see the module docs of each. `acquire` suspends on the
/// mode lock where the variant shares a connection; `release` is cheap and
/// infallible for pinned connections.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn mode(&self) -> DbMode;

    async fn acquire(&self, execution: ExecutionType) -> Result<ConnectionLease, DbError>;

    async fn release(&self, lease: ConnectionLease) -> Result<(), DbError>;

    /// Close strategy-owned connections. Called once at context disposal.
    async fn dispose(&self) -> Result<(), DbError>;
}

/// Shared release path: record the lease duration, drop the permit, close
/// the connection when the lease owns it.
async fn release_lease(
    metrics: &ConnectionMetrics,
    lease: ConnectionLease,
) -> Result<(), DbError> {
    let (conn, permit, dispose, acquired_at) = lease.into_parts();
    metrics.record_lease(acquired_at.elapsed());
    drop(permit);
    if dispose {
        conn.dispose().await
    } else {
        Ok(())
    }
}

/// Each acquire opens a fresh connection from the driver pool; release
/// closes it. No long-lived sentinel. Transactions pin their own lease.
pub struct StandardStrategy {
    factory: Arc<ConnectionFactory>,
}

impl StandardStrategy {
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl ConnectionStrategy for StandardStrategy {
    fn mode(&self) -> DbMode {
        DbMode::Standard
    }

    async fn acquire(&self, execution: ExecutionType) -> Result<ConnectionLease, DbError> {
        let conn = self.factory.open(ConnectionRole::Pooled, execution).await?;
        Ok(ConnectionLease::new(conn, None, true, true))
    }

    async fn release(&self, lease: ConnectionLease) -> Result<(), DbError> {
        release_lease(self.factory.metrics(), lease).await
    }

    async fn dispose(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Standard behaviour plus one sentinel connection opened at construction
/// and held until disposal. The sentinel is never handed out; its only
/// role is keeping attach-style backends (LocalDB) loaded.
pub struct KeepAliveStrategy {
    inner: StandardStrategy,
    sentinel: Arc<TrackedConnection>,
}

impl KeepAliveStrategy {
    pub async fn connect(factory: Arc<ConnectionFactory>) -> Result<Self, DbError> {
        let sentinel = factory
            .open(ConnectionRole::Sentinel, ExecutionType::Read)
            .await?;
        Ok(Self {
            inner: StandardStrategy::new(factory),
            sentinel,
        })
    }
}

#[async_trait]
impl ConnectionStrategy for KeepAliveStrategy {
    fn mode(&self) -> DbMode {
        DbMode::KeepAlive
    }

    async fn acquire(&self, execution: ExecutionType) -> Result<ConnectionLease, DbError> {
        self.inner.acquire(execution).await
    }

    async fn release(&self, lease: ConnectionLease) -> Result<(), DbError> {
        self.inner.release(lease).await
    }

    async fn dispose(&self) -> Result<(), DbError> {
        self.sentinel.dispose().await
    }
}

/// One persistent writer serialized by the connection's async mutex;
/// reads run on fresh pooled connections, concurrently with each other and
/// with the current writer.
pub struct SingleWriterStrategy {
    factory: Arc<ConnectionFactory>,
    writer: OnceCell<Arc<TrackedConnection>>,
    mode_lock_timeout: Option<Duration>,
}

impl SingleWriterStrategy {
    pub fn new(factory: Arc<ConnectionFactory>, mode_lock_timeout: Option<Duration>) -> Self {
        Self {
            factory,
            writer: OnceCell::new(),
            mode_lock_timeout,
        }
    }

    async fn writer(&self) -> Result<&Arc<TrackedConnection>, DbError> {
        self.writer
            .get_or_try_init(|| {
                self.factory
                    .open(ConnectionRole::Writer, ExecutionType::Write)
            })
            .await
    }
}

#[async_trait]
impl ConnectionStrategy for SingleWriterStrategy {
    fn mode(&self) -> DbMode {
        DbMode::SingleWriter
    }

    async fn acquire(&self, execution: ExecutionType) -> Result<ConnectionLease, DbError> {
        match execution {
            ExecutionType::Write => {
                let writer = self.writer().await?.clone();
                let locker = writer
                    .locker()
                    .ok_or_else(|| DbError::write_guard("writer connection lost its lock"))?;
                let permit = locker.try_lock(self.mode_lock_timeout).await?;
                Ok(ConnectionLease::new(writer, Some(permit), false, true))
            }
            ExecutionType::Read => {
                let conn = self
                    .factory
                    .open(ConnectionRole::Pooled, ExecutionType::Read)
                    .await?;
                // Read leases are never write-capable in this mode.
                Ok(ConnectionLease::new(conn, None, true, false))
            }
        }
    }

    async fn release(&self, lease: ConnectionLease) -> Result<(), DbError> {
        // Releasing the writer is a no-op beyond dropping its permit.
        release_lease(self.factory.metrics(), lease).await
    }

    async fn dispose(&self) -> Result<(), DbError> {
        if let Some(writer) = self.writer.get() {
            writer.dispose().await?;
        }
        Ok(())
    }
}

/// One shared connection; every acquisition takes the mode lock, so all
/// execution is serialized in acquisition order.
pub struct SingleConnectionStrategy {
    factory: Arc<ConnectionFactory>,
    conn: OnceCell<Arc<TrackedConnection>>,
    mode_lock_timeout: Option<Duration>,
}

impl SingleConnectionStrategy {
    pub fn new(factory: Arc<ConnectionFactory>, mode_lock_timeout: Option<Duration>) -> Self {
        Self {
            factory,
            conn: OnceCell::new(),
            mode_lock_timeout,
        }
    }

    async fn shared(&self) -> Result<&Arc<TrackedConnection>, DbError> {
        self.conn
            .get_or_try_init(|| {
                self.factory
                    .open(ConnectionRole::Shared, ExecutionType::Write)
            })
            .await
    }
}

#[async_trait]
impl ConnectionStrategy for SingleConnectionStrategy {
    fn mode(&self) -> DbMode {
        DbMode::SingleConnection
    }

    async fn acquire(&self, _execution: ExecutionType) -> Result<ConnectionLease, DbError> {
        let conn = self.shared().await?.clone();
        let locker = conn
            .locker()
            .ok_or_else(|| DbError::write_guard("shared connection lost its lock"))?;
        let permit = locker.try_lock(self.mode_lock_timeout).await?;
        Ok(ConnectionLease::new(conn, Some(permit), false, true))
    }

    async fn release(&self, lease: ConnectionLease) -> Result<(), DbError> {
        release_lease(self.factory.metrics(), lease).await
    }

    async fn dispose(&self) -> Result<(), DbError> {
        if let Some(conn) = self.conn.get() {
            conn.dispose().await?;
        }
        Ok(())
    }
}

fn mode_rank(mode: DbMode) -> u8 {
    match mode {
        DbMode::Standard => 0,
        DbMode::KeepAlive => 1,
        DbMode::SingleWriter => 2,
        DbMode::SingleConnection => 3,
        DbMode::Best => 0,
    }
}

/// The weakest mode the data source can tolerate.
fn minimum_mode_for(product: SupportedDatabase, connection_string: &str) -> DbMode {
    let lowered = connection_string.to_ascii_lowercase();
    match product {
        SupportedDatabase::Sqlite if lowered.contains(":memory:") => DbMode::SingleConnection,
        SupportedDatabase::Sqlite | SupportedDatabase::DuckDb => DbMode::SingleWriter,
        SupportedDatabase::SqlServer if lowered.contains("(localdb)") => DbMode::KeepAlive,
        _ => DbMode::Standard,
    }
}

/// Resolve the configured mode against the detected product.
///
/// `Best` picks the minimum viable mode for the data source. An explicit
/// mode weaker than the product can tolerate is coerced upward; both
/// outcomes are logged so operators can see why the runtime mode differs
/// from configuration.
pub fn resolve_mode(
    requested: DbMode,
    product: SupportedDatabase,
    connection_string: &str,
) -> DbMode {
    let minimum = minimum_mode_for(product, connection_string);
    match requested {
        DbMode::Best => {
            info!(
                "event=ConnectionModeCoerced product={} resolved={}",
                product.display_name(),
                minimum.label()
            );
            minimum
        }
        explicit if mode_rank(explicit) < mode_rank(minimum) => {
            warn!(
                "event=ConnectionModeMismatch product={} requested={} coerced={}",
                product.display_name(),
                explicit.label(),
                minimum.label()
            );
            minimum
        }
        explicit => explicit,
    }
}

/// Build the strategy for a resolved mode.
pub async fn create_strategy(
    mode: DbMode,
    factory: Arc<ConnectionFactory>,
    mode_lock_timeout: Option<Duration>,
) -> Result<Arc<dyn ConnectionStrategy>, DbError> {
    let strategy: Arc<dyn ConnectionStrategy> = match mode {
        DbMode::Standard | DbMode::Best => Arc::new(StandardStrategy::new(factory)),
        DbMode::KeepAlive => Arc::new(KeepAliveStrategy::connect(factory).await?),
        DbMode::SingleWriter => Arc::new(SingleWriterStrategy::new(factory, mode_lock_timeout)),
        DbMode::SingleConnection => {
            Arc::new(SingleConnectionStrategy::new(factory, mode_lock_timeout))
        }
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_resolves_per_product() {
        assert_eq!(
            resolve_mode(DbMode::Best, SupportedDatabase::Sqlite, "Data Source=:memory:"),
            DbMode::SingleConnection
        );
        assert_eq!(
            resolve_mode(DbMode::Best, SupportedDatabase::Sqlite, "Data Source=app.db"),
            DbMode::SingleWriter
        );
        assert_eq!(
            resolve_mode(DbMode::Best, SupportedDatabase::DuckDb, "app.duckdb"),
            DbMode::SingleWriter
        );
        assert_eq!(
            resolve_mode(
                DbMode::Best,
                SupportedDatabase::SqlServer,
                "Server=(localdb)\\MSSQLLocalDB;Database=app"
            ),
            DbMode::KeepAlive
        );
        assert_eq!(
            resolve_mode(DbMode::Best, SupportedDatabase::PostgreSql, "Host=db"),
            DbMode::Standard
        );
    }

    #[test]
    fn explicit_weak_mode_is_coerced() {
        assert_eq!(
            resolve_mode(DbMode::Standard, SupportedDatabase::Sqlite, ":memory:"),
            DbMode::SingleConnection
        );
        assert_eq!(
            resolve_mode(DbMode::SingleWriter, SupportedDatabase::Sqlite, "file.db"),
            DbMode::SingleWriter
        );
    }

    #[test]
    fn explicit_strong_mode_is_kept() {
        assert_eq!(
            resolve_mode(
                DbMode::SingleConnection,
                SupportedDatabase::PostgreSql,
                "Host=db"
            ),
            DbMode::SingleConnection
        );
    }
}
