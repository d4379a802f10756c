use serde::{Deserialize, Serialize};

/// Connection lifecycle discipline for a context.
///
/// `Best` is resolved once at construction from the detected product and
/// data source; all other modes stay fixed for the context's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DbMode {
    /// Open per operation, close on release. Driver pool does the reuse.
    Standard,
    /// Standard plus one idle sentinel connection held open so file/attach
    /// style backends (LocalDB) are never unloaded between operations.
    KeepAlive,
    /// One persistent writer serialized by an async mutex; reads use fresh
    /// pooled connections.
    SingleWriter,
    /// One shared connection; every operation serialized.
    SingleConnection,
    /// Resolve to the most appropriate of the above at construction.
    #[default]
    Best,
}

impl DbMode {
    pub fn label(&self) -> &'static str {
        match self {
            DbMode::Standard => "Standard",
            DbMode::KeepAlive => "KeepAlive",
            DbMode::SingleWriter => "SingleWriter",
            DbMode::SingleConnection => "SingleConnection",
            DbMode::Best => "Best",
        }
    }
}

/// Declared intent of an execution; drives strategy routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
    Read,
    Write,
}

impl ExecutionType {
    pub fn is_write(&self) -> bool {
        matches!(self, ExecutionType::Write)
    }
}

/// Read/write posture of a context.
///
/// `WriteOnly` is coerced to `ReadWrite` at configuration time: writers
/// must also read to verify state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadWriteMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl ReadWriteMode {
    /// Apply the WriteOnly→ReadWrite coercion.
    pub fn normalized(self) -> Self {
        match self {
            ReadWriteMode::WriteOnly => ReadWriteMode::ReadWrite,
            other => other,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, ReadWriteMode::ReadOnly)
    }
}

/// Driver-level transaction isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Intent-level isolation request, resolved per product by the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationProfile {
    /// Readers must not block writers nor be blocked by them.
    SafeNonBlockingReads,
    /// Full serializable consistency.
    StrictConsistency,
    /// Weakest level the product offers; caller accepts anomalies.
    FastWithRisks,
}

/// Stored-procedure invocation syntax family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcWrappingStyle {
    Call,
    Exec,
    ExecuteProcedure,
    PostgreSqlCall,
    OracleBlock,
    #[default]
    None,
}

/// Ordered preference for retrieving a server-assigned id after INSERT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratedKeyPlan {
    /// `RETURNING <id>` appended to the INSERT.
    Returning,
    /// `OUTPUT INSERTED.<id>` clause (SQL Server).
    OutputInserted,
    /// INSERT, then the dialect's last-id query on the same connection.
    SessionScopedFunction,
    /// Fetch the sequence value first, include it in the INSERT.
    PrefetchSequence,
    /// INSERT a unique token column, SELECT the row back by token.
    CorrelationToken,
    /// SELECT back by the business key after INSERT; explicit opt-in only.
    NaturalKeyLookup,
    /// Row count only.
    None,
}

/// Upsert statement family selected by the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertShape {
    OnConflictDoUpdate,
    OnDuplicateKeyUpdate,
    MergeStatement,
    /// Try-update-then-insert inside a savepoint.
    PerRowFallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_only_is_coerced() {
        assert_eq!(ReadWriteMode::WriteOnly.normalized(), ReadWriteMode::ReadWrite);
        assert_eq!(ReadWriteMode::ReadOnly.normalized(), ReadWriteMode::ReadOnly);
    }

    #[test]
    fn isolation_keywords() {
        assert_eq!(IsolationLevel::RepeatableRead.sql_keyword(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Snapshot.sql_keyword(), "SNAPSHOT");
    }

    #[test]
    fn default_mode_is_best() {
        assert_eq!(DbMode::default(), DbMode::Best);
    }
}
