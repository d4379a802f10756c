use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::coercion::FromValue;
use crate::context::ContextServices;
use crate::driver::Statement;
use crate::error::DbError;
use crate::modes::ExecutionType;
use crate::params::Parameter;
use crate::reader::TrackedReader;
use crate::tracked::TrackedConnection;
use crate::transaction::TransactionInner;
use crate::value::{DbType, Value};

/// Where a container executes: straight through the context's strategy,
/// or on the pinned connection of an active transaction.
#[derive(Clone)]
pub(crate) enum ExecutionHome {
    Context(Arc<ContextServices>),
    Transaction {
        services: Arc<ContextServices>,
        txn: Arc<TransactionInner>,
    },
}

impl ExecutionHome {
    fn services(&self) -> &Arc<ContextServices> {
        match self {
            ExecutionHome::Context(services) => services,
            ExecutionHome::Transaction { services, .. } => services,
        }
    }
}

/// One SQL statement under construction and execution.
///
/// A growable SQL buffer plus an insertion-ordered parameter map keyed by
/// base name: markers rendered into the text are dialect-formatted, but
/// lookups always use the base name. Instances are not thread-safe;
/// callers serialize access to a single container.
pub struct SqlContainer {
    home: ExecutionHome,
    sql: String,
    params: IndexMap<String, Parameter>,
}

impl SqlContainer {
    pub(crate) fn new(home: ExecutionHome) -> Self {
        Self {
            home,
            sql: String::new(),
            params: IndexMap::new(),
        }
    }

    fn services(&self) -> &Arc<ContextServices> {
        self.home.services()
    }

    /// Append a fragment to the SQL buffer.
    pub fn append_sql<T: std::fmt::Display>(&mut self, fragment: T) -> &mut Self {
        use std::fmt::Write;
        let _ = write!(self.sql, "{fragment}");
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Quote an identifier through the context dialect.
    pub fn wrap_object_name(&self, name: &str) -> String {
        self.services().dialect().wrap_identifier(name)
    }

    /// Dialect-formatted marker for a parameter. For parameters not yet
    /// added, the marker is computed for the ordinal they will occupy.
    pub fn make_parameter_name(&self, base_name: &str) -> String {
        let dialect = self.services().dialect();
        let ordinal = self
            .params
            .get_index_of(base_name)
            .unwrap_or(self.params.len());
        dialect.parameter_marker_at(ordinal, base_name)
    }

    /// Add a parameter, generating a name when the caller omits one.
    /// Returns the base name under which the parameter is addressable.
    pub fn add_parameter(
        &mut self,
        name: Option<&str>,
        db_type: DbType,
        value: Value,
    ) -> Result<String, DbError> {
        let services = self.services();
        let budget = services.dialect().capabilities().parameter_budget();
        if self.params.len() >= budget {
            return Err(DbError::TooManyParameters {
                max_allowed: budget,
            });
        }

        let ordinal = self.params.len();
        let mut parameter = services.rent_parameter();
        let named = services
            .dialect()
            .make_parameter(name, db_type, Value::Null, ordinal);
        parameter.name = named.name;
        parameter.db_type = db_type;
        parameter.assign(value);

        let base = parameter.name.clone();
        self.params.insert(base.clone(), parameter);
        Ok(base)
    }

    /// Add a parameter and return the marker to splice into the SQL.
    pub fn bind(
        &mut self,
        name: Option<&str>,
        db_type: DbType,
        value: Value,
    ) -> Result<String, DbError> {
        let base = self.add_parameter(name, db_type, value)?;
        Ok(self.make_parameter_name(&base))
    }

    /// Re-assign a parameter by base name.
    pub fn set_parameter_value(&mut self, base_name: &str, value: Value) -> Result<(), DbError> {
        match self.params.get_mut(base_name) {
            Some(p) => {
                p.assign(value);
                Ok(())
            }
            None => Err(DbError::invalid_value(format!(
                "no parameter named {base_name:?}"
            ))),
        }
    }

    /// Read a parameter's value by base name, coerced to `T`.
    pub fn get_parameter_value<T: FromValue>(&self, base_name: &str) -> Result<T, DbError> {
        let p = self.params.get(base_name).ok_or_else(|| {
            DbError::invalid_value(format!("no parameter named {base_name:?}"))
        })?;
        T::from_value(p.value.clone())
    }

    /// Rewrite the buffer as a stored-procedure invocation of the current
    /// text, optionally passing the bound parameters as arguments.
    pub fn wrap_for_stored_procedure(
        &mut self,
        execution: ExecutionType,
        include_params: bool,
    ) -> Result<(), DbError> {
        let dialect = self.services().dialect();
        let proc_name = self.sql.trim().to_string();
        let args: Vec<String> = if include_params {
            self.params
                .iter()
                .enumerate()
                .map(|(ordinal, (base, _))| dialect.parameter_marker_at(ordinal, base))
                .collect()
        } else {
            Vec::new()
        };
        self.sql = dialect.wrap_procedure_call(&proc_name, &args, execution)?;
        Ok(())
    }

    /// Reset the buffer and return every parameter to the pool.
    pub fn clear(&mut self) {
        self.sql.clear();
        let params = std::mem::take(&mut self.params);
        self.services().return_parameters(params.into_values());
    }

    /// The statement text with bound values rendered as literals in a
    /// trailing comment. Log/diagnostic form; never sent to the server.
    pub fn preview(&self) -> String {
        if self.params.is_empty() {
            return self.sql.clone();
        }
        let dialect = self.services().dialect();
        let rendered: Vec<String> = self
            .params
            .iter()
            .map(|(base, p)| format!("{base}={}", dialect.value_to_literal(&p.value)))
            .collect();
        format!("{} /* {} */", self.sql, rendered.join(", "))
    }

    fn statement(&self) -> Statement {
        Statement {
            sql: self.sql.clone(),
            // IndexMap preserves insertion order, which is binding order.
            params: self.params.values().cloned().collect(),
        }
    }

    async fn run<T: Send + 'static>(
        &self,
        execution: ExecutionType,
        op: impl FnOnce(Statement, Arc<TrackedConnection>) -> BoxFuture<'static, Result<T, DbError>>,
    ) -> Result<T, DbError> {
        let services = self.services();
        services.assert_usable(execution)?;

        let statement = self.statement();
        log::debug!("executing [{:?}] {}", execution, self.preview());

        match &self.home {
            ExecutionHome::Transaction { txn, .. } => {
                // All work through a transaction is serialized on its
                // pinned connection.
                let _serial = txn.execution_lock().await;
                txn.assert_active()?;
                if execution.is_write() {
                    txn.assert_write_capable()?;
                }
                let conn = txn.connection().clone();
                services.maybe_prepare(&statement, &conn).await?;
                op(statement, conn).await
            }
            ExecutionHome::Context(services) => {
                let _permit = services.admit(execution).await?;
                let lease = services.strategy().acquire(execution).await?;
                if execution.is_write() {
                    if let Err(e) = lease.assert_write_capable() {
                        services.strategy().release(lease).await.ok();
                        return Err(e);
                    }
                }
                let conn = lease.connection().clone();
                let result = async {
                    services.maybe_prepare(&statement, &conn).await?;
                    op(statement, conn).await
                }
                .await;
                services.strategy().release(lease).await?;
                result
            }
        }
    }

    /// Execute and return the affected row count.
    pub async fn execute_non_query(&self, execution: ExecutionType) -> Result<u64, DbError> {
        let services = self.services().clone();
        let result = self
            .run(execution, |statement, conn| {
                async move { conn.raw().execute(&statement).await }.boxed()
            })
            .await;
        services.classify(result)
    }

    /// Execute and return the first column of the first row as a raw value.
    pub async fn execute_scalar_value(
        &self,
        execution: ExecutionType,
    ) -> Result<Option<Value>, DbError> {
        let services = self.services().clone();
        let result = self
            .run(execution, |statement, conn| {
                async move {
                    crate::driver::query_scalar(conn.raw().as_ref(), &statement).await
                }
                .boxed()
            })
            .await;
        services.classify(result)
    }

    /// Execute and coerce the scalar to `T`. A null or absent scalar is
    /// `None`.
    pub async fn execute_scalar<T: FromValue>(
        &self,
        execution: ExecutionType,
    ) -> Result<Option<T>, DbError> {
        match self.execute_scalar_value(execution).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::from_value(value).map(Some),
        }
    }

    /// Execute the statement, then a follow-up scalar on the same
    /// connection. Required by session-scoped key retrieval, where the
    /// last-insert-id function only answers on the inserting connection.
    pub(crate) async fn execute_non_query_then_scalar(
        &self,
        execution: ExecutionType,
        follow_up_sql: &str,
    ) -> Result<(u64, Option<Value>), DbError> {
        let follow_up = Statement::new(follow_up_sql);
        let services = self.services().clone();
        let result = self
            .run(execution, move |statement, conn| {
                async move {
                    let rows = conn.raw().execute(&statement).await?;
                    let scalar =
                        crate::driver::query_scalar(conn.raw().as_ref(), &follow_up).await?;
                    Ok((rows, scalar))
                }
                .boxed()
            })
            .await;
        services.classify(result)
    }

    /// Execute and stream rows. The reader holds the connection lease (or
    /// borrows the transaction's pinned connection) until disposed.
    pub async fn execute_reader(
        &self,
        execution: ExecutionType,
    ) -> Result<TrackedReader, DbError> {
        let services = self.services();
        services.assert_usable(execution)?;
        let statement = self.statement();

        match &self.home {
            ExecutionHome::Transaction { txn, .. } => {
                let _serial = txn.execution_lock().await;
                txn.assert_active()?;
                if execution.is_write() {
                    txn.assert_write_capable()?;
                }
                let conn = txn.connection().clone();
                services.maybe_prepare(&statement, &conn).await?;
                let rows = services.classify(conn.raw().query(&statement).await)?;
                Ok(TrackedReader::pinned(rows))
            }
            ExecutionHome::Context(services) => {
                let _permit = services.admit(execution).await?;
                let lease = services.strategy().acquire(execution).await?;
                if execution.is_write() {
                    if let Err(e) = lease.assert_write_capable() {
                        services.strategy().release(lease).await.ok();
                        return Err(e);
                    }
                }
                let conn = lease.connection().clone();
                let opened = async {
                    services.maybe_prepare(&statement, &conn).await?;
                    conn.raw().query(&statement).await
                }
                .await;
                match services.classify(opened) {
                    Ok(rows) => Ok(TrackedReader::leased(
                        rows,
                        lease,
                        services.strategy().clone(),
                    )),
                    Err(e) => {
                        services.strategy().release(lease).await.ok();
                        Err(e)
                    }
                }
            }
        }
    }
}

impl Drop for SqlContainer {
    fn drop(&mut self) {
        let params = std::mem::take(&mut self.params);
        self.services().return_parameters(params.into_values());
    }
}

impl std::fmt::Debug for SqlContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlContainer")
            .field("sql", &self.sql)
            .field("parameters", &self.params.len())
            .finish()
    }
}
