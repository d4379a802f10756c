use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DbError;
use crate::modes::IsolationLevel;
use crate::params::Parameter;
use crate::value::Value;

/// One statement ready for the wire: SQL text plus parameters bound in
/// ordinal order.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Parameter>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Parameter>) -> Self {
        self.params = params;
        self
    }
}

/// Column metadata reported by a result set.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

/// Forward-only row stream returned by [`DriverConnection::query`].
///
/// Implementations must release the underlying cursor when dropped; the
/// engine additionally holds a connection lease for the stream's lifetime.
#[async_trait]
pub trait DriverRows: Send {
    fn columns(&self) -> &[ColumnMeta];

    /// Advance to the next row. `Ok(None)` signals exhaustion.
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;
}

/// A raw provider connection.
///
/// The engine interacts exclusively through this trait; lifecycle
/// accounting, preambles, and locking live in `TrackedConnection` above it.
/// Implementations must be thread-safe for shared-mode execution.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Execute a statement that returns no rows; yields the affected count.
    async fn execute(&self, statement: &Statement) -> Result<u64, DbError>;

    /// Execute a statement and stream its rows.
    async fn query(&self, statement: &Statement) -> Result<Box<dyn DriverRows>, DbError>;

    /// Server-side prepare. Providers without real preparation may no-op.
    async fn prepare(&self, _statement: &Statement) -> Result<(), DbError> {
        Ok(())
    }

    /// Begin a driver transaction at the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<(), DbError>;

    async fn commit(&self) -> Result<(), DbError>;

    async fn rollback(&self) -> Result<(), DbError>;

    /// Close and release the physical resource. Must be idempotent.
    async fn close(&self) -> Result<(), DbError>;

    /// Whether the connection is unusable (socket dead, fatal error seen).
    fn is_broken(&self) -> bool {
        false
    }

    /// Version banner the driver learned during its handshake, if any.
    /// Used as a detection shortcut before the probe query runs.
    fn server_version_hint(&self) -> Option<String> {
        None
    }
}

/// Factory for raw connections; one adapter per provider.
///
/// Adapters are registered by provider name at context construction. An
/// open failure is surfaced as-is and never retried by the engine.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Provider invariant name (e.g. `"npgsql"`, `"sqlite"`).
    fn provider_name(&self) -> &str;

    async fn open(&self, connection_string: &str) -> Result<Arc<dyn DriverConnection>, DbError>;
}

/// Execute a scalar-shaped statement: first column of the first row.
///
/// Shared by detection probes, last-insert-id reads, and sequence
/// prefetches; `Ok(None)` means the statement produced no rows.
pub async fn query_scalar(
    conn: &dyn DriverConnection,
    statement: &Statement,
) -> Result<Option<Value>, DbError> {
    let mut rows = conn.query(statement).await?;
    match rows.next_row().await? {
        Some(row) => Ok(row.into_iter().next()),
        None => Ok(None),
    }
}
