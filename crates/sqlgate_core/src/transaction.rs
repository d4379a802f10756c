use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use log::{debug, warn};

use crate::container::{ExecutionHome, SqlContainer};
use crate::context::{ContextServices, DbContext};
use crate::data_source::DataSourceInfo;
use crate::dialect::{Dialect, DialectFeatures};
use crate::driver::Statement;
use crate::error::DbError;
use crate::governor::GovernorPermit;
use crate::modes::{ExecutionType, IsolationLevel, IsolationProfile, ReadWriteMode};
use crate::product::SupportedDatabase;
use crate::strategy::ConnectionLease;
use crate::tracked::TrackedConnection;

/// How a transaction is to be started.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Routing for the pinned connection. Defaults to write.
    pub execution: Option<ExecutionType>,
    /// Explicit level; must be supported by the dialect.
    pub isolation: Option<IsolationLevel>,
    /// Intent profile, resolved per product when no explicit level given.
    pub profile: Option<IsolationProfile>,
}

impl TransactionOptions {
    pub fn read() -> Self {
        Self {
            execution: Some(ExecutionType::Read),
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn with_profile(mut self, profile: IsolationProfile) -> Self {
        self.profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
    Disposed,
}

impl TxnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxnState::Active,
            1 => TxnState::Committed,
            2 => TxnState::RolledBack,
            _ => TxnState::Disposed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled back",
            TxnState::Disposed => "disposed",
        }
    }
}

/// Shared state between a transaction and the containers it spawns.
pub(crate) struct TransactionInner {
    conn: Arc<TrackedConnection>,
    lease: std::sync::Mutex<Option<ConnectionLease>>,
    write_capable: bool,
    state: AtomicU8,
    // One statement at a time on the pinned connection.
    exec_lock: tokio::sync::Mutex<()>,
    _permit: GovernorPermit,
}

impl TransactionInner {
    pub(crate) async fn execution_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }

    pub(crate) fn connection(&self) -> &Arc<TrackedConnection> {
        &self.conn
    }

    fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn assert_active(&self) -> Result<(), DbError> {
        match self.state() {
            TxnState::Active => Ok(()),
            other => Err(DbError::TransactionModeNotSupported(format!(
                "transaction is already {}",
                other.label()
            ))),
        }
    }

    pub(crate) fn assert_write_capable(&self) -> Result<(), DbError> {
        if self.write_capable {
            Ok(())
        } else {
            Err(DbError::write_guard(
                "write execution inside a read-routed transaction",
            ))
        }
    }

    fn take_lease(&self) -> Option<ConnectionLease> {
        self.lease.lock().expect("transaction lease poisoned").take()
    }
}

/// A scoped view of the owning context that pins exactly one connection
/// and one driver transaction.
///
/// Containers created from it execute on the pinned connection, serialized.
/// `commit`/`rollback` are terminal; disposal without a terminal call rolls
/// back. Nested `begin_transaction` is refused.
pub struct TransactionContext {
    services: Arc<ContextServices>,
    inner: Arc<TransactionInner>,
    isolation: IsolationLevel,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

impl TransactionContext {
    pub(crate) async fn begin(
        services: Arc<ContextServices>,
        options: TransactionOptions,
    ) -> Result<Self, DbError> {
        let execution = options.execution.unwrap_or(ExecutionType::Write);
        services.assert_usable(execution)?;

        let dialect = services.dialect().clone();
        let isolation = resolve_transaction_isolation(
            dialect.as_ref(),
            services.read_write_mode(),
            &options,
        )?;

        let permit = services.admit(execution).await?;
        let lease = services.strategy().acquire(execution).await?;
        if execution.is_write() {
            if let Err(e) = lease.assert_write_capable() {
                services.strategy().release(lease).await.ok();
                return Err(e);
            }
        }

        let conn = lease.connection().clone();
        if let Err(e) = conn.raw().begin(isolation).await {
            services.strategy().release(lease).await.ok();
            return Err(e);
        }
        debug!("transaction started at {:?}", isolation);

        Ok(Self {
            inner: Arc::new(TransactionInner {
                conn,
                write_capable: execution.is_write(),
                lease: std::sync::Mutex::new(Some(lease)),
                state: AtomicU8::new(0),
                exec_lock: tokio::sync::Mutex::new(()),
                _permit: permit,
            }),
            services,
            isolation,
        })
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn was_committed(&self) -> bool {
        self.inner.state() == TxnState::Committed
    }

    pub fn was_rolled_back(&self) -> bool {
        self.inner.state() == TxnState::RolledBack
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state() != TxnState::Active
    }

    fn transition(&self, to: TxnState) -> Result<(), DbError> {
        self.inner
            .state
            .compare_exchange(
                0,
                match to {
                    TxnState::Committed => 1,
                    TxnState::RolledBack => 2,
                    _ => 3,
                },
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|prior| {
                DbError::TransactionModeNotSupported(format!(
                    "transaction is already {}",
                    TxnState::from_u8(prior).label()
                ))
            })
    }

    /// Commit. Terminal: a second terminal call fails.
    pub async fn commit(&self) -> Result<(), DbError> {
        let _serial = self.inner.execution_lock().await;
        self.transition(TxnState::Committed)?;
        self.inner.conn.raw().commit().await
    }

    /// Roll back. Terminal: a second terminal call fails.
    pub async fn rollback(&self) -> Result<(), DbError> {
        let _serial = self.inner.execution_lock().await;
        self.transition(TxnState::RolledBack)?;
        self.inner.conn.raw().rollback().await
    }

    /// Create a named savepoint.
    pub async fn savepoint(&self, name: &str) -> Result<(), DbError> {
        let dialect = self.services.dialect().clone();
        if !dialect.capabilities().supports(DialectFeatures::SAVEPOINTS) {
            return Err(DbError::not_supported(format!(
                "{} does not support savepoints",
                dialect.product().display_name()
            )));
        }
        let _serial = self.inner.execution_lock().await;
        self.inner.assert_active()?;
        let sql = dialect.create_savepoint_sql(name);
        self.inner.conn.raw().execute(&Statement::new(sql)).await?;
        Ok(())
    }

    /// Roll back to a savepoint, keeping the transaction alive.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError> {
        let dialect = self.services.dialect().clone();
        let _serial = self.inner.execution_lock().await;
        self.inner.assert_active()?;
        let sql = dialect.rollback_to_savepoint_sql(name);
        self.inner.conn.raw().execute(&Statement::new(sql)).await?;
        Ok(())
    }

    /// Release a savepoint where the product has a release statement.
    pub async fn release_savepoint(&self, name: &str) -> Result<(), DbError> {
        let dialect = self.services.dialect().clone();
        let Some(sql) = dialect.release_savepoint_sql(name) else {
            return Ok(());
        };
        let _serial = self.inner.execution_lock().await;
        self.inner.assert_active()?;
        self.inner.conn.raw().execute(&Statement::new(sql)).await?;
        Ok(())
    }

    /// Finish the transaction: roll back if still active (errors logged
    /// and swallowed so they never mask the original failure), then return
    /// the pinned connection to the strategy.
    pub async fn dispose(&self) -> Result<(), DbError> {
        if self.inner.state() == TxnState::Active {
            match self.rollback().await {
                Ok(()) => debug!("transaction auto-rolled back on dispose"),
                Err(e) => warn!("auto-rollback on dispose failed: {e}"),
            }
        }
        if let Some(lease) = self.inner.take_lease() {
            self.services.strategy().release(lease).await?;
        }
        Ok(())
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        // Only the last holder cleans up, and only if dispose() never ran.
        if Arc::strong_count(&self.inner) > 1 {
            return;
        }
        let Some(lease) = self.inner.take_lease() else {
            return;
        };
        let still_active = self.inner.state() == TxnState::Active;
        let conn = self.inner.conn.clone();
        let strategy = self.services.strategy().clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if still_active {
                    if let Err(e) = conn.raw().rollback().await {
                        warn!("rollback on drop failed: {e}");
                    }
                }
                if let Err(e) = strategy.release(lease).await {
                    warn!("lease release on drop failed: {e}");
                }
            });
        } else if still_active {
            warn!("transaction dropped while active outside a runtime; connection abandoned");
        }
    }
}

#[async_trait]
impl DbContext for TransactionContext {
    fn product(&self) -> SupportedDatabase {
        self.services.data_source().product()
    }

    fn data_source(&self) -> &DataSourceInfo {
        self.services.data_source()
    }

    fn dialect(&self) -> Arc<dyn Dialect> {
        self.services.dialect().clone()
    }

    fn read_write_mode(&self) -> ReadWriteMode {
        self.services.read_write_mode()
    }

    fn in_transaction(&self) -> bool {
        true
    }

    fn open_connection_count(&self) -> usize {
        self.services.metrics().currently_open()
    }

    fn create_container(&self) -> SqlContainer {
        SqlContainer::new(ExecutionHome::Transaction {
            services: self.services.clone(),
            txn: self.inner.clone(),
        })
    }

    async fn begin_transaction(
        &self,
        _options: TransactionOptions,
    ) -> Result<TransactionContext, DbError> {
        Err(DbError::NestedTransactionUnsupported)
    }
}

/// Pick the isolation level for a new transaction.
///
/// Explicit level first (validated), then the profile mapping, then the
/// mode default: read-only contexts get repeatable read, everything else
/// the weakest supported level at or above read committed.
fn resolve_transaction_isolation(
    dialect: &dyn Dialect,
    read_write: ReadWriteMode,
    options: &TransactionOptions,
) -> Result<IsolationLevel, DbError> {
    if let Some(level) = options.isolation {
        return dialect.validate_isolation(level).map_err(|e| match e {
            DbError::UnsupportedIsolation { product, level, .. } => {
                DbError::TransactionModeNotSupported(format!(
                    "{} does not support isolation level {:?}",
                    product.display_name(),
                    level
                ))
            }
            other => other,
        });
    }

    if let Some(profile) = options.profile {
        let level = dialect.resolve_isolation(profile)?;
        return dialect.validate_isolation(level);
    }

    if read_write.is_read_only() {
        let preferred = IsolationLevel::RepeatableRead;
        if dialect.capabilities().supports_isolation(preferred) {
            return Ok(preferred);
        }
        // Products without repeatable read get the strongest they have.
        return dialect
            .capabilities()
            .supported_isolation
            .iter()
            .max()
            .copied()
            .ok_or_else(|| {
                DbError::TransactionModeNotSupported(
                    "dialect reports no supported isolation levels".to_string(),
                )
            });
    }

    let caps = dialect.capabilities();
    caps.supported_isolation
        .iter()
        .filter(|l| **l >= IsolationLevel::ReadCommitted)
        .min()
        .or_else(|| caps.supported_isolation.iter().max())
        .copied()
        .ok_or_else(|| {
            DbError::TransactionModeNotSupported(
                "dialect reports no supported isolation levels".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DuckDbDialect, PostgresDialect, SqliteDialect};
    use crate::product::ProductVersion;

    #[test]
    fn explicit_unsupported_level_fails() {
        let pg = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        let options = TransactionOptions::default().with_isolation(IsolationLevel::Snapshot);
        let err = resolve_transaction_isolation(&pg, ReadWriteMode::ReadWrite, &options)
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionModeNotSupported(_)));
    }

    #[test]
    fn read_only_defaults_to_repeatable_read() {
        let pg = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        let level = resolve_transaction_isolation(
            &pg,
            ReadWriteMode::ReadOnly,
            &TransactionOptions::default(),
        )
        .unwrap();
        assert_eq!(level, IsolationLevel::RepeatableRead);
    }

    #[test]
    fn read_only_without_repeatable_read_upgrades() {
        let duck = DuckDbDialect::new(ProductVersion::new(1, 2, 0));
        let level = resolve_transaction_isolation(
            &duck,
            ReadWriteMode::ReadOnly,
            &TransactionOptions::default(),
        )
        .unwrap();
        assert_eq!(level, IsolationLevel::Snapshot);
    }

    #[test]
    fn default_is_read_committed_where_supported() {
        let pg = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        let level = resolve_transaction_isolation(
            &pg,
            ReadWriteMode::ReadWrite,
            &TransactionOptions::default(),
        )
        .unwrap();
        assert_eq!(level, IsolationLevel::ReadCommitted);

        // SQLite has no read committed; the weakest level at or above it
        // is serializable.
        let sqlite = SqliteDialect::new(ProductVersion::new(3, 45, 0));
        let level = resolve_transaction_isolation(
            &sqlite,
            ReadWriteMode::ReadWrite,
            &TransactionOptions::default(),
        )
        .unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }

    #[test]
    fn profile_resolution_goes_through_dialect() {
        let pg = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        let options =
            TransactionOptions::default().with_profile(IsolationProfile::SafeNonBlockingReads);
        assert!(
            resolve_transaction_isolation(&pg, ReadWriteMode::ReadWrite, &options).is_err()
        );
    }
}
