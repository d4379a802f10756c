use std::time::Duration;

use thiserror::Error;

use crate::modes::{ExecutionType, IsolationLevel};
use crate::product::SupportedDatabase;

/// Phase in which a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// The driver refused to open the physical connection.
    Open,
    /// The session preamble could not be applied.
    Preamble,
    /// The product/version probe failed.
    Detection,
}

impl ConnectionPhase {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionPhase::Open => "open",
            ConnectionPhase::Preamble => "preamble",
            ConnectionPhase::Detection => "detection",
        }
    }
}

/// Structured error information surfaced by a provider.
///
/// Drivers populate `code` (vendor error number) and `sqlstate` when the
/// backend reports them; the dialect layer uses both to classify unique
/// violations without string matching on messages.
#[derive(Debug, Clone, Default)]
pub struct DriverError {
    pub message: String,
    pub code: Option<String>,
    pub sqlstate: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            sqlstate: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.sqlstate, &self.code) {
            (Some(state), _) => write!(f, "{} (SQLSTATE {})", self.message, state),
            (None, Some(code)) => write!(f, "{} (code {})", self.message, code),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Snapshot of governor state attached to a saturation failure.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub label: &'static str,
    pub in_use: usize,
    pub max: usize,
    pub queued: usize,
    pub timeout: Duration,
}

impl std::fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} in use, {} queued, waited {:?}",
            self.label, self.in_use, self.max, self.queued, self.timeout
        )
    }
}

/// Engine error taxonomy.
///
/// Every execution method either returns a well-defined value or raises one
/// of these variants with enough context (phase, role, waiters, pool
/// snapshot) for diagnosis. Driver errors are surfaced untranslated except
/// where the dialect recognizes them (unique violations).
#[derive(Debug, Error)]
pub enum DbError {
    /// Invalid connection string, unknown provider, or a mode the detected
    /// product cannot honour.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The driver failed to open a connection. Never retried internally.
    #[error("Connection failed during {}: {source} ({role:?})", phase.label())]
    ConnectionFailed {
        phase: ConnectionPhase,
        role: ExecutionType,
        source: DriverError,
    },

    /// The product probe itself threw. Unrecognized-but-successful probes
    /// yield a fallback dialect instead of this error.
    #[error("Dialect detection failed: {0}")]
    DialectDetection(DriverError),

    /// Statement exceeded the dialect's safe parameter budget.
    #[error("Too many parameters: limit is {max_allowed}")]
    TooManyParameters { max_allowed: usize },

    /// Explicit isolation level rejected by the dialect.
    #[error("{product:?} does not support isolation level {level:?}{}", detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    UnsupportedIsolation {
        product: SupportedDatabase,
        level: IsolationLevel,
        detail: Option<String>,
    },

    /// Requested transaction shape not supported on this context.
    #[error("Transaction mode not supported: {0}")]
    TransactionModeNotSupported(String),

    /// `begin_transaction` called on a transaction context.
    #[error("Nested transactions are not supported")]
    NestedTransactionUnsupported,

    /// A non-writer connection was handed to a write operation.
    #[error("Write guard violation: {0}")]
    WriteGuardViolation(String),

    /// A write operation was declared on a read-only context.
    #[error("Context is read-only: {0}")]
    ReadOnlyViolation(String),

    /// The mode lock timed out.
    #[error("Mode lock contention: {waiters} waiter(s), timed out after {timeout:?}")]
    ModeContention { waiters: usize, timeout: Duration },

    /// The governor could not grant a permit in time.
    #[error("Pool saturated: {0}")]
    PoolSaturated(PoolSnapshot),

    /// Dialect-classified unique/duplicate-key violation.
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(DriverError),

    /// Type coercion failure.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Single-row retrieval matched more than one row.
    #[error("Query returned {0} rows where at most one was expected")]
    MultipleRowsFound(u64),

    /// Untranslated provider failure.
    #[error("{0}")]
    Driver(DriverError),

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation not supported by the current dialect or mode.
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DbError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection_failed(
        phase: ConnectionPhase,
        role: ExecutionType,
        source: DriverError,
    ) -> Self {
        Self::ConnectionFailed {
            phase,
            role,
            source,
        }
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(DriverError::new(msg))
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn write_guard(msg: impl Into<String>) -> Self {
        Self::WriteGuardViolation(msg.into())
    }

    /// Access the provider payload, if the variant carries one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::ConnectionFailed { source, .. } => Some(source),
            Self::DialectDetection(e) | Self::UniqueViolation(e) | Self::Driver(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error left the surrounding transaction usable.
    ///
    /// Guard failures and validation errors are raised before any SQL is
    /// sent; driver failures may have poisoned the transaction.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::TooManyParameters { .. }
                | Self::UnsupportedIsolation { .. }
                | Self::TransactionModeNotSupported(_)
                | Self::NestedTransactionUnsupported
                | Self::WriteGuardViolation(_)
                | Self::ReadOnlyViolation(_)
                | Self::InvalidValue(_)
        )
    }
}
