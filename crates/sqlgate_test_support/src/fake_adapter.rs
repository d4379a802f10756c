use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use sqlgate_core::{
    ColumnMeta, DbError, DriverAdapter, DriverConnection, DriverError, DriverRows,
    IsolationLevel, Statement, Value,
};

/// Scripted response for one SQL text.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Row set with column metadata.
    Rows {
        columns: Vec<ColumnMeta>,
        rows: Vec<Vec<Value>>,
    },
    /// Affected-row count for non-query execution.
    Affected(u64),
    /// Single-row, single-column result.
    Scalar(Value),
    /// Driver failure with optional vendor code / SQLSTATE.
    Error {
        message: String,
        code: Option<String>,
        sqlstate: Option<String>,
    },
}

impl FakeOutcome {
    pub fn scalar(value: impl Into<Value>) -> Self {
        FakeOutcome::Scalar(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        FakeOutcome::Error {
            message: message.into(),
            code: None,
            sqlstate: None,
        }
    }

    pub fn unique_violation(
        message: impl Into<String>,
        code: Option<&str>,
        sqlstate: Option<&str>,
    ) -> Self {
        FakeOutcome::Error {
            message: message.into(),
            code: code.map(String::from),
            sqlstate: sqlstate.map(String::from),
        }
    }

    fn driver_error(&self) -> Option<DbError> {
        match self {
            FakeOutcome::Error {
                message,
                code,
                sqlstate,
            } => {
                let mut e = DriverError::new(message.clone());
                if let Some(code) = code {
                    e = e.with_code(code.clone());
                }
                if let Some(state) = sqlstate {
                    e = e.with_sqlstate(state.clone());
                }
                Some(DbError::Driver(e))
            }
            _ => None,
        }
    }
}

/// One statement as the fake saw it: SQL text, bound parameters in ordinal
/// order, and the connection that carried it.
#[derive(Debug, Clone)]
pub struct RecordedStatement {
    pub sql: String,
    pub params: Vec<(String, Value)>,
    pub connection_id: usize,
}

/// Counters snapshot for assertions.
#[derive(Debug, Clone, Default)]
pub struct FakeStats {
    pub opens: usize,
    pub closes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub prepares: usize,
}

#[derive(Default)]
struct FakeState {
    outcomes: RwLock<HashMap<String, FakeOutcome>>,
    default_outcome: RwLock<Option<FakeOutcome>>,
    open_error: RwLock<Option<String>>,
    executed: Mutex<Vec<RecordedStatement>>,
    connection_counter: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    prepares: AtomicUsize,
}

/// Scripted in-memory driver adapter.
///
/// Exact SQL texts map to outcomes; everything else falls back to the
/// default outcome (affected-1 for execute, an empty row set for query).
/// Every statement is recorded with its parameters for assertions.
#[derive(Clone)]
pub struct FakeAdapter {
    provider: &'static str,
    state: Arc<FakeState>,
}

impl FakeAdapter {
    pub fn new(provider: &'static str, probe_sql: &str, banner: &str) -> Self {
        let adapter = Self {
            provider,
            state: Arc::new(FakeState::default()),
        };
        adapter.script(probe_sql, FakeOutcome::scalar(banner));
        adapter
    }

    pub fn postgres() -> Self {
        Self::new(
            "npgsql",
            "SELECT version()",
            "PostgreSQL 16.2 on x86_64-pc-linux-gnu",
        )
    }

    pub fn cockroach() -> Self {
        Self::new(
            "npgsql",
            "SELECT version()",
            "CockroachDB CCL v23.1.11 (PostgreSQL 13 compatible)",
        )
    }

    pub fn sql_server() -> Self {
        Self::new(
            "Microsoft.Data.SqlClient",
            "SELECT @@VERSION",
            "Microsoft SQL Server 2022 (RTM) - 16.0.1000.6",
        )
    }

    pub fn mysql() -> Self {
        Self::new("MySql.Data", "SELECT VERSION()", "8.0.36 MySQL Community Server")
    }

    pub fn mariadb() -> Self {
        Self::new("MySql.Data", "SELECT VERSION()", "11.4.2-MariaDB-log")
    }

    pub fn sqlite() -> Self {
        Self::new("sqlite", "SELECT sqlite_version()", "3.45.1")
    }

    pub fn oracle() -> Self {
        Self::new(
            "Oracle.ManagedDataAccess",
            "SELECT banner FROM v$version WHERE ROWNUM = 1",
            "Oracle Database 19c Enterprise Edition Release 19.0.0.0.0",
        )
    }

    pub fn duckdb() -> Self {
        Self::new("duckdb", "SELECT version()", "DuckDB v1.2.0 5f5512b827")
    }

    /// An adapter whose probe returns data no classifier recognizes, so
    /// detection lands on the fallback dialect.
    pub fn unrecognized() -> Self {
        Self::new("acme-dbms", "SELECT 1", "AcmeDB 0.9 experimental")
    }

    /// Script an outcome for an exact SQL text.
    pub fn script(&self, sql: impl Into<String>, outcome: FakeOutcome) -> &Self {
        self.state
            .outcomes
            .write()
            .expect("outcomes poisoned")
            .insert(sql.into(), outcome);
        self
    }

    pub fn with_default_outcome(self, outcome: FakeOutcome) -> Self {
        *self
            .state
            .default_outcome
            .write()
            .expect("outcomes poisoned") = Some(outcome);
        self
    }

    pub fn with_open_error(self, message: impl Into<String>) -> Self {
        *self.state.open_error.write().expect("open_error poisoned") = Some(message.into());
        self
    }

    /// Every statement seen so far, in execution order.
    pub fn executed(&self) -> Vec<RecordedStatement> {
        self.state.executed.lock().expect("executed poisoned").clone()
    }

    /// Statements excluding probes and session preambles, which is what
    /// gateway assertions usually care about.
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|r| r.sql).collect()
    }

    pub fn stats(&self) -> FakeStats {
        FakeStats {
            opens: self.state.opens.load(Ordering::SeqCst),
            closes: self.state.closes.load(Ordering::SeqCst),
            begins: self.state.begins.load(Ordering::SeqCst),
            commits: self.state.commits.load(Ordering::SeqCst),
            rollbacks: self.state.rollbacks.load(Ordering::SeqCst),
            prepares: self.state.prepares.load(Ordering::SeqCst),
        }
    }

    pub fn as_adapter_arc(self) -> Arc<dyn DriverAdapter> {
        Arc::new(self)
    }
}

#[async_trait]
impl DriverAdapter for FakeAdapter {
    fn provider_name(&self) -> &str {
        self.provider
    }

    async fn open(&self, _connection_string: &str) -> Result<Arc<dyn DriverConnection>, DbError> {
        if let Some(message) = self
            .state
            .open_error
            .read()
            .expect("open_error poisoned")
            .clone()
        {
            return Err(DbError::Driver(DriverError::new(message)));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let id = self.state.connection_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    id: usize,
    state: Arc<FakeState>,
}

impl FakeConnection {
    fn record(&self, statement: &Statement) {
        self.state
            .executed
            .lock()
            .expect("executed poisoned")
            .push(RecordedStatement {
                sql: statement.sql.clone(),
                params: statement
                    .params
                    .iter()
                    .map(|p| (p.name.clone(), p.value.clone()))
                    .collect(),
                connection_id: self.id,
            });
    }

    fn resolve(&self, sql: &str) -> Option<FakeOutcome> {
        let scripted = self
            .state
            .outcomes
            .read()
            .expect("outcomes poisoned")
            .get(sql)
            .cloned();
        scripted.or_else(|| {
            self.state
                .default_outcome
                .read()
                .expect("outcomes poisoned")
                .clone()
        })
    }
}

/// Affected-row estimate for unscripted statements: one per VALUES tuple
/// for multi-row inserts, one otherwise.
fn estimate_affected(sql: &str) -> u64 {
    if sql.starts_with("INSERT") {
        sql.matches("),(").count() as u64 + 1
    } else {
        1
    }
}

#[async_trait]
impl DriverConnection for FakeConnection {
    async fn execute(&self, statement: &Statement) -> Result<u64, DbError> {
        self.record(statement);
        match self.resolve(&statement.sql) {
            Some(outcome) => {
                if let Some(error) = outcome.driver_error() {
                    return Err(error);
                }
                match outcome {
                    FakeOutcome::Affected(n) => Ok(n),
                    FakeOutcome::Scalar(_) => Ok(1),
                    FakeOutcome::Rows { rows, .. } => Ok(rows.len() as u64),
                    FakeOutcome::Error { .. } => unreachable!(),
                }
            }
            None => Ok(estimate_affected(&statement.sql)),
        }
    }

    async fn query(&self, statement: &Statement) -> Result<Box<dyn DriverRows>, DbError> {
        self.record(statement);
        match self.resolve(&statement.sql) {
            Some(outcome) => {
                if let Some(error) = outcome.driver_error() {
                    return Err(error);
                }
                match outcome {
                    FakeOutcome::Rows { columns, rows } => {
                        Ok(Box::new(FakeRows::new(columns, rows)))
                    }
                    FakeOutcome::Scalar(value) => Ok(Box::new(FakeRows::new(
                        vec![ColumnMeta {
                            name: "value".to_string(),
                            type_name: "scalar".to_string(),
                            nullable: true,
                        }],
                        vec![vec![value]],
                    ))),
                    FakeOutcome::Affected(_) => Ok(Box::new(FakeRows::empty())),
                    FakeOutcome::Error { .. } => unreachable!(),
                }
            }
            None => Ok(Box::new(FakeRows::empty())),
        }
    }

    async fn prepare(&self, _statement: &Statement) -> Result<(), DbError> {
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn begin(&self, _isolation: IsolationLevel) -> Result<(), DbError> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeRows {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl FakeRows {
    fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl DriverRows for FakeRows {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(self.rows.next())
    }
}
