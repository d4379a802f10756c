use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info};

use crate::config::DatabaseContextConfiguration;
use crate::container::{ExecutionHome, SqlContainer};
use crate::data_source::DataSourceInfo;
use crate::dialect::Dialect;
use crate::driver::{DriverAdapter, Statement};
use crate::error::DbError;
use crate::governor::{GovernorPermit, PoolGovernor};
use crate::metrics::ConnectionMetrics;
use crate::modes::{ExecutionType, ReadWriteMode};
use crate::params::{Parameter, ParameterPool};
use crate::product::SupportedDatabase;
use crate::strategy::{
    ConnectionFactory, ConnectionStrategy, create_strategy, resolve_mode,
};
use crate::tracked::TrackedConnection;
use crate::transaction::{TransactionContext, TransactionOptions};

/// Everything a container or transaction needs from its owning context.
/// One instance per `DatabaseContext`, shared by reference.
pub(crate) struct ContextServices {
    data_source: DataSourceInfo,
    strategy: Arc<dyn ConnectionStrategy>,
    pool: ParameterPool,
    governor: PoolGovernor,
    config: DatabaseContextConfiguration,
    metrics: Arc<ConnectionMetrics>,
    disposed: AtomicBool,
}

impl ContextServices {
    pub(crate) fn dialect(&self) -> &Arc<dyn Dialect> {
        self.data_source.dialect()
    }

    pub(crate) fn data_source(&self) -> &DataSourceInfo {
        &self.data_source
    }

    pub(crate) fn strategy(&self) -> &Arc<dyn ConnectionStrategy> {
        &self.strategy
    }

    pub(crate) fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub(crate) fn read_write_mode(&self) -> ReadWriteMode {
        self.config.read_write_mode
    }

    /// Refuse work on disposed contexts and writes on read-only ones.
    pub(crate) fn assert_usable(&self, execution: ExecutionType) -> Result<(), DbError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DbError::configuration("context has been disposed"));
        }
        if execution.is_write() && self.config.read_write_mode.is_read_only() {
            return Err(DbError::ReadOnlyViolation(
                "write execution requested on a read-only context".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn admit(&self, execution: ExecutionType) -> Result<GovernorPermit, DbError> {
        self.governor.admit(execution).await
    }

    pub(crate) async fn maybe_prepare(
        &self,
        statement: &Statement,
        conn: &Arc<TrackedConnection>,
    ) -> Result<(), DbError> {
        let dialect_prepares = self.dialect().capabilities().prepare_statements;
        if self.config.prepare_enabled(dialect_prepares) {
            conn.raw().prepare(statement).await?;
        }
        Ok(())
    }

    /// Recognize provider failures the dialect can classify.
    pub(crate) fn classify<T>(&self, result: Result<T, DbError>) -> Result<T, DbError> {
        match result {
            Err(e) if self.dialect().is_unique_violation(&e) => match e {
                DbError::Driver(payload) => Err(DbError::UniqueViolation(payload)),
                other => Err(other),
            },
            other => other,
        }
    }

    pub(crate) fn rent_parameter(&self) -> Parameter {
        self.pool
            .rent(1)
            .pop()
            .unwrap_or_default()
    }

    pub(crate) fn return_parameters(&self, params: impl IntoIterator<Item = Parameter>) {
        self.pool.give_back(params);
    }
}

/// The capability surface shared by plain contexts and transactions:
/// containers, transactions, product identity, quoting, and limits.
///
/// A transaction is itself a context whose containers ride its pinned
/// connection, which is what lets gateways route the same operations
/// through either.
#[async_trait]
pub trait DbContext: Send + Sync {
    fn product(&self) -> SupportedDatabase;

    fn data_source(&self) -> &DataSourceInfo;

    fn dialect(&self) -> Arc<dyn Dialect>;

    fn read_write_mode(&self) -> ReadWriteMode;

    fn in_transaction(&self) -> bool;

    fn quote_prefix(&self) -> &'static str {
        self.data_source().dialect().capabilities().quote_prefix
    }

    fn quote_suffix(&self) -> &'static str {
        self.data_source().dialect().capabilities().quote_suffix
    }

    fn max_parameters(&self) -> usize {
        self.data_source().dialect().capabilities().max_parameters
    }

    fn open_connection_count(&self) -> usize;

    fn create_container(&self) -> SqlContainer;

    /// Begin a transaction. Fails with `NestedTransactionUnsupported`
    /// when called on a transaction.
    async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> Result<TransactionContext, DbError>;
}

/// Composition root: owns the dialect, detection result, connection
/// strategy, governor, and parameter pool for one data source.
pub struct DatabaseContext {
    services: Arc<ContextServices>,
}

impl DatabaseContext {
    /// Detect the product, resolve the connection mode, and assemble the
    /// context. The probe connection is opened directly on the adapter and
    /// closed before the strategy comes up.
    pub async fn connect(
        config: DatabaseContextConfiguration,
        adapter: Arc<dyn DriverAdapter>,
    ) -> Result<Self, DbError> {
        let config = config.validated()?;
        let connection_string = config.effective_connection_string();

        let declared = SupportedDatabase::from_provider_name(&config.provider_name);
        let probe = adapter
            .open(&connection_string)
            .await
            .map_err(|e| match e {
                DbError::Driver(source) => DbError::ConnectionFailed {
                    phase: crate::error::ConnectionPhase::Open,
                    role: ExecutionType::Read,
                    source,
                },
                other => other,
            })?;
        let data_source = DataSourceInfo::detect(probe.as_ref(), declared).await?;
        if let Err(e) = probe.close().await {
            debug!("probe connection close failed: {e}");
        }

        let mode = resolve_mode(config.db_mode, data_source.product(), &connection_string);
        info!(
            "context up: product={} version={} mode={} read_write={:?}",
            data_source.product().display_name(),
            data_source.version(),
            mode.label(),
            config.read_write_mode,
        );

        let metrics = Arc::new(ConnectionMetrics::new(
            config.enable_metrics,
            config.metrics_options.clone(),
        ));

        let factory = ConnectionFactory::new(
            adapter,
            connection_string,
            config.read_only_connection_string.clone(),
            data_source.dialect().clone(),
            config.read_write_mode.is_read_only(),
            metrics.clone(),
        );
        let strategy = create_strategy(mode, factory, config.mode_lock_timeout).await?;

        let governor = if config.enable_pool_governor {
            PoolGovernor::new(
                config.max_concurrent_reads,
                config.max_concurrent_writes,
                config.pool_acquire_timeout,
                config.enable_writer_preference,
            )
        } else {
            PoolGovernor::unlimited()
        };

        Ok(Self {
            services: Arc::new(ContextServices {
                data_source,
                strategy,
                pool: ParameterPool::default(),
                governor,
                config,
                metrics,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        self.services.metrics()
    }

    pub fn is_fallback_dialect(&self) -> bool {
        self.services.data_source().is_fallback()
    }

    /// Close strategy-owned connections and drain the parameter pool.
    /// Idempotent.
    pub async fn dispose(&self) -> Result<(), DbError> {
        if self.services.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.services.strategy.dispose().await;
        self.services.pool.drain();
        result
    }

    pub(crate) fn services(&self) -> &Arc<ContextServices> {
        &self.services
    }
}

#[async_trait]
impl DbContext for DatabaseContext {
    fn product(&self) -> SupportedDatabase {
        self.services.data_source.product()
    }

    fn data_source(&self) -> &DataSourceInfo {
        &self.services.data_source
    }

    fn dialect(&self) -> Arc<dyn Dialect> {
        self.services.dialect().clone()
    }

    fn read_write_mode(&self) -> ReadWriteMode {
        self.services.read_write_mode()
    }

    fn in_transaction(&self) -> bool {
        false
    }

    fn open_connection_count(&self) -> usize {
        self.services.metrics.currently_open()
    }

    fn create_container(&self) -> SqlContainer {
        SqlContainer::new(ExecutionHome::Context(self.services.clone()))
    }

    async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> Result<TransactionContext, DbError> {
        TransactionContext::begin(self.services.clone(), options).await
    }
}
