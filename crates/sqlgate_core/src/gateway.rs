use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::audit::{AuditValueResolver, SystemAuditResolver};
use crate::coercion::coerce;
use crate::container::SqlContainer;
use crate::context::{DatabaseContext, DbContext};
use crate::dialect::{Dialect, DialectFeatures};
use crate::entity::{AuditRole, ColumnSchema, Entity, TableSchema, TypeMapRegistry};
use crate::error::DbError;
use crate::modes::{ExecutionType, GeneratedKeyPlan, UpsertShape};
use crate::value::Value;

/// Per-entity CRUD synthesizer. Stateless across calls.
///
/// Every operation takes an optional context override: when provided, the
/// same gateway instance routes its SQL through that context (and its
/// dialect), which is how one gateway serves tenants on different
/// backends. When omitted, the default context is used.
///
/// Generated parameter names follow a fixed convention so emitted SQL is
/// stable across runs: `i<N>` insert values, `s<N>` update assignments,
/// `w<N>` filters, `k<N>` key lookups, `v<N>` version checks, `j<N>`
/// join bindings, `b<N>` batch values.
pub struct TableGateway<E: Entity> {
    context: Arc<DatabaseContext>,
    schema: Arc<TableSchema>,
    audit: Arc<dyn AuditValueResolver>,
    natural_key_lookup: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> TableGateway<E> {
    pub fn new(context: Arc<DatabaseContext>) -> Result<Self, DbError> {
        Ok(Self {
            context,
            schema: TypeMapRegistry::table_for::<E>()?,
            audit: Arc::new(SystemAuditResolver::default()),
            natural_key_lookup: false,
            _entity: PhantomData,
        })
    }

    pub fn with_audit_resolver(mut self, resolver: Arc<dyn AuditValueResolver>) -> Self {
        self.audit = resolver;
        self
    }

    /// Opt in to natural-key id lookup after INSERT. Requires a unique
    /// business key.
    pub fn with_natural_key_lookup(mut self, enabled: bool) -> Self {
        self.natural_key_lookup = enabled;
        self
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn ctx<'a>(&'a self, over: Option<&'a dyn DbContext>) -> &'a dyn DbContext {
        over.unwrap_or(self.context.as_ref() as &dyn DbContext)
    }

    fn table_ref(&self, dialect: &dyn Dialect) -> String {
        dialect.wrap_identifier(&self.schema.qualified_name())
    }

    // --- audit / version side effects (applied before SQL emission) ---

    fn stamp_create(&self, entity: &mut E) -> Result<(), DbError> {
        let audit = self.audit.resolve();
        for (role, value) in [
            (AuditRole::CreatedBy, audit.user_id.clone()),
            (AuditRole::UpdatedBy, audit.user_id.clone()),
            (AuditRole::CreatedOn, Value::DateTime(audit.utc_now)),
            (AuditRole::UpdatedOn, Value::DateTime(audit.utc_now)),
        ] {
            if let Some(col) = self.schema.audit_column(role) {
                entity.set(&col.name, value)?;
            }
        }
        if let Some(version) = self.schema.version() {
            let current = entity.get(&version.name);
            if matches!(current, Value::Null | Value::Int(0)) {
                entity.set(&version.name, Value::Int(1))?;
            }
        }
        Ok(())
    }

    fn stamp_update(&self, entity: &mut E) -> Result<(), DbError> {
        let audit = self.audit.resolve();
        if let Some(col) = self.schema.audit_column(AuditRole::UpdatedBy) {
            entity.set(&col.name, audit.user_id.clone())?;
        }
        if let Some(col) = self.schema.audit_column(AuditRole::UpdatedOn) {
            entity.set(&col.name, Value::DateTime(audit.utc_now))?;
        }
        Ok(())
    }

    // --- create ---

    /// INSERT the entity, retrieving the server-assigned id per the
    /// dialect's generated-key plan. Returns `true` when exactly one row
    /// was inserted and, where a plan applies, the id was populated.
    pub async fn create(
        &self,
        entity: &mut E,
        over: Option<&dyn DbContext>,
    ) -> Result<bool, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        self.stamp_create(entity)?;

        let plan = self.effective_key_plan(dialect.as_ref());
        // Declaration order, with the id joining the list only when its
        // value is prefetched client-side.
        let columns: Vec<&ColumnSchema> = self
            .schema
            .columns()
            .iter()
            .filter(|c| {
                c.is_insertable() || (c.is_id && plan == GeneratedKeyPlan::PrefetchSequence)
            })
            .collect();

        match plan {
            GeneratedKeyPlan::PrefetchSequence => {
                let id = self.id_column()?;
                let value = self.prefetch_sequence_value(ctx, dialect.as_ref()).await?;
                entity.set(&id.name, coerce(value, id.db_type)?)?;
            }
            GeneratedKeyPlan::CorrelationToken => {
                let token = self
                    .schema
                    .correlation_token_column()
                    .ok_or_else(|| DbError::configuration("no correlation token column mapped"))?;
                entity.set(&token.name, Value::Guid(Uuid::new_v4()))?;
            }
            _ => {}
        }

        let mut container = ctx.create_container();
        self.append_insert(&mut container, dialect.as_ref(), &columns, entity, plan, "i")?;

        let rows = match plan {
            GeneratedKeyPlan::Returning | GeneratedKeyPlan::OutputInserted => {
                let id = self.id_column()?;
                match container.execute_scalar_value(ExecutionType::Write).await? {
                    Some(value) if !value.is_null() => {
                        entity.set(&id.name, coerce(value, id.db_type)?)?;
                        1
                    }
                    _ => 0,
                }
            }
            GeneratedKeyPlan::SessionScopedFunction => {
                let id = self.id_column()?;
                let last_id_sql = dialect
                    .capabilities()
                    .last_insert_id_query
                    .ok_or_else(|| {
                        DbError::configuration("dialect has no last-insert-id query")
                    })?;
                let (rows, scalar) = container
                    .execute_non_query_then_scalar(ExecutionType::Write, last_id_sql)
                    .await?;
                if let Some(value) = scalar
                    && !value.is_null()
                {
                    entity.set(&id.name, coerce(value, id.db_type)?)?;
                }
                rows
            }
            GeneratedKeyPlan::CorrelationToken => {
                let rows = container.execute_non_query(ExecutionType::Write).await?;
                if rows == 1 {
                    self.lookup_id_by_token(ctx, dialect.as_ref(), entity).await?;
                }
                rows
            }
            GeneratedKeyPlan::NaturalKeyLookup => {
                let rows = container.execute_non_query(ExecutionType::Write).await?;
                if rows == 1 {
                    self.lookup_id_by_natural_key(ctx, dialect.as_ref(), entity)
                        .await?;
                }
                rows
            }
            GeneratedKeyPlan::PrefetchSequence | GeneratedKeyPlan::None => {
                container.execute_non_query(ExecutionType::Write).await?
            }
        };

        if rows != 1 {
            return Ok(false);
        }
        match self.schema.id() {
            Some(id) if plan != GeneratedKeyPlan::None => {
                Ok(!entity.get(&id.name).is_null())
            }
            _ => Ok(true),
        }
    }

    /// Pick the runtime key plan for this entity on this dialect.
    fn effective_key_plan(&self, dialect: &dyn Dialect) -> GeneratedKeyPlan {
        let Some(id) = self.schema.id() else {
            return GeneratedKeyPlan::None;
        };
        if id.id_writable {
            // Client supplies the id; nothing to fetch back.
            return GeneratedKeyPlan::None;
        }
        let plan = dialect.generated_key_plan();
        match plan {
            GeneratedKeyPlan::SessionScopedFunction
                if dialect.capabilities().last_insert_id_query.is_none() =>
            {
                GeneratedKeyPlan::None
            }
            GeneratedKeyPlan::CorrelationToken => {
                if self.schema.correlation_token_column().is_some() {
                    plan
                } else if self.natural_key_lookup && self.schema.has_primary_key() {
                    GeneratedKeyPlan::NaturalKeyLookup
                } else {
                    GeneratedKeyPlan::None
                }
            }
            other => other,
        }
    }

    fn id_column(&self) -> Result<&ColumnSchema, DbError> {
        self.schema
            .id()
            .ok_or_else(|| DbError::configuration("entity maps no id column"))
    }

    async fn prefetch_sequence_value(
        &self,
        ctx: &dyn DbContext,
        dialect: &dyn Dialect,
    ) -> Result<Value, DbError> {
        let id = self.id_column()?;
        let sequence = id
            .sequence
            .clone()
            .unwrap_or_else(|| format!("{}_seq", self.schema.table()));
        let sql = dialect.next_sequence_value_sql(&sequence).ok_or_else(|| {
            DbError::not_supported(format!(
                "{} cannot prefetch sequence values",
                dialect.product().display_name()
            ))
        })?;
        let mut container = ctx.create_container();
        container.append_sql(sql);
        container
            .execute_scalar_value(ExecutionType::Write)
            .await?
            .ok_or_else(|| DbError::driver(format!("sequence {sequence} returned no value")))
    }

    /// Emit `INSERT INTO t (cols) [OUTPUT ...] VALUES (markers) [RETURNING ...]`.
    fn append_insert(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
        columns: &[&ColumnSchema],
        entity: &E,
        plan: GeneratedKeyPlan,
        prefix: &str,
    ) -> Result<(), DbError> {
        let column_list = columns
            .iter()
            .map(|c| dialect.wrap_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(",");

        container.append_sql(format!(
            "INSERT INTO {} ({column_list})",
            self.table_ref(dialect)
        ));

        if plan == GeneratedKeyPlan::OutputInserted {
            let id = self.id_column()?;
            container.append_sql(format!(
                " OUTPUT INSERTED.{}",
                dialect.wrap_identifier(&id.name)
            ));
        }

        let mut markers = Vec::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            let value = coerce(entity.get(&col.name), col.db_type)?;
            let marker =
                container.bind(Some(&format!("{prefix}{i}")), col.db_type, value)?;
            markers.push(marker);
        }
        container.append_sql(format!(" VALUES ({})", markers.join(",")));

        if plan == GeneratedKeyPlan::Returning {
            let id = self.id_column()?;
            container.append_sql(format!(" RETURNING {}", dialect.wrap_identifier(&id.name)));
        }
        Ok(())
    }

    async fn lookup_id_by_token(
        &self,
        ctx: &dyn DbContext,
        dialect: &dyn Dialect,
        entity: &mut E,
    ) -> Result<(), DbError> {
        let id = self.id_column()?;
        let token = self
            .schema
            .correlation_token_column()
            .ok_or_else(|| DbError::configuration("no correlation token column mapped"))?;

        let mut container = ctx.create_container();
        container.append_sql(format!(
            "SELECT {} FROM {} WHERE ",
            dialect.wrap_identifier(&id.name),
            self.table_ref(dialect)
        ));
        let marker = container.bind(Some("w0"), token.db_type, entity.get(&token.name))?;
        container.append_sql(format!("{}={marker}", dialect.wrap_identifier(&token.name)));

        if let Some(value) = container.execute_scalar_value(ExecutionType::Write).await?
            && !value.is_null()
        {
            entity.set(&id.name, coerce(value, id.db_type)?)?;
        }
        Ok(())
    }

    async fn lookup_id_by_natural_key(
        &self,
        ctx: &dyn DbContext,
        dialect: &dyn Dialect,
        entity: &mut E,
    ) -> Result<(), DbError> {
        let id = self.id_column()?;
        let mut container = ctx.create_container();
        container.append_sql(format!(
            "SELECT {} FROM {} WHERE ",
            dialect.wrap_identifier(&id.name),
            self.table_ref(dialect)
        ));
        self.append_key_predicate(&mut container, dialect, entity, "w")?;

        if let Some(value) = container.execute_scalar_value(ExecutionType::Write).await?
            && !value.is_null()
        {
            entity.set(&id.name, coerce(value, id.db_type)?)?;
        }
        Ok(())
    }

    /// `pk0=<m> AND pk1=<m> ...` over the business key.
    fn append_key_predicate(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
        entity: &E,
        prefix: &str,
    ) -> Result<(), DbError> {
        if !self.schema.has_primary_key() {
            return Err(DbError::configuration(
                "entity maps no primary key columns",
            ));
        }
        let keys: Vec<&ColumnSchema> = self.schema.primary_keys().collect();
        for (i, col) in keys.iter().enumerate() {
            let value = coerce(entity.get(&col.name), col.db_type)?;
            if value.is_null() {
                return Err(DbError::invalid_value(format!(
                    "primary key column {:?} is null",
                    col.name
                )));
            }
            if i > 0 {
                container.append_sql(" AND ");
            }
            let marker = container.bind(Some(&format!("{prefix}{i}")), col.db_type, value)?;
            container.append_sql(format!(
                "{}={marker}",
                dialect.wrap_identifier(&col.name)
            ));
        }
        Ok(())
    }

    // --- retrieve ---

    fn select_list(&self, dialect: &dyn Dialect) -> String {
        self.schema
            .columns()
            .iter()
            .map(|c| dialect.wrap_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn hydrate(&self, row: &[Value]) -> Result<E, DbError> {
        let mut entity = E::default();
        for (i, col) in self.schema.columns().iter().enumerate() {
            let value = row
                .get(i)
                .cloned()
                .ok_or_else(|| DbError::driver(format!("row is missing column {:?}", col.name)))?;
            entity.set(&col.name, coerce(value, col.db_type)?)?;
        }
        Ok(entity)
    }

    async fn fetch_single(&self, container: &SqlContainer) -> Result<Option<E>, DbError> {
        let mut reader = container.execute_reader(ExecutionType::Read).await?;

        let result = async {
            if !reader.read().await? {
                return Ok(None);
            }
            let entity = self.hydrate(&reader.row()?)?;
            if reader.read().await? {
                // A single-row retrieval finding more means the schema's
                // uniqueness assumption is broken.
                return Err(DbError::MultipleRowsFound(2));
            }
            Ok(Some(entity))
        }
        .await;

        reader.dispose().await?;
        result
    }

    /// SELECT one row by surrogate id.
    pub async fn retrieve_one(
        &self,
        id: &Value,
        over: Option<&dyn DbContext>,
    ) -> Result<Option<E>, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();
        let id_col = self.id_column()?;

        let mut container = ctx.create_container();
        container.append_sql(format!(
            "SELECT {} FROM {} WHERE ",
            self.select_list(dialect.as_ref()),
            self.table_ref(dialect.as_ref())
        ));
        let marker = container.bind(Some("w0"), id_col.db_type, coerce(id.clone(), id_col.db_type)?)?;
        container.append_sql(format!(
            "{}={marker}",
            dialect.wrap_identifier(&id_col.name)
        ));

        self.fetch_single(&container).await
    }

    /// SELECT one row by the entity's business key.
    pub async fn retrieve_one_by_key(
        &self,
        entity: &E,
        over: Option<&dyn DbContext>,
    ) -> Result<Option<E>, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        let mut container = ctx.create_container();
        container.append_sql(format!(
            "SELECT {} FROM {} WHERE ",
            self.select_list(dialect.as_ref()),
            self.table_ref(dialect.as_ref())
        ));
        self.append_key_predicate(&mut container, dialect.as_ref(), entity, "w")?;

        self.fetch_single(&container).await
    }

    /// SELECT many rows by id, chunked to the dialect's parameter budget.
    /// Results preserve input order where ids are distinct.
    pub async fn retrieve(
        &self,
        ids: &[Value],
        over: Option<&dyn DbContext>,
    ) -> Result<Vec<E>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();
        let id_col = self.id_column()?;

        let chunk_size = dialect.capabilities().parameter_budget().max(1);
        let mut found = Vec::new();

        for chunk in ids.chunks(chunk_size) {
            let mut container = ctx.create_container();
            container.append_sql(format!(
                "SELECT {} FROM {} WHERE {} IN (",
                self.select_list(dialect.as_ref()),
                self.table_ref(dialect.as_ref()),
                dialect.wrap_identifier(&id_col.name)
            ));
            let mut markers = Vec::with_capacity(chunk.len());
            for (i, id) in chunk.iter().enumerate() {
                let value = coerce(id.clone(), id_col.db_type)?;
                markers.push(container.bind(Some(&format!("w{i}")), id_col.db_type, value)?);
            }
            container.append_sql(format!("{})", markers.join(",")));

            let mut reader = container.execute_reader(ExecutionType::Read).await?;
            let collected: Result<(), DbError> = async {
                while reader.read().await? {
                    found.push(self.hydrate(&reader.row()?)?);
                }
                Ok(())
            }
            .await;
            reader.dispose().await?;
            collected?;
        }

        // Re-order by first occurrence of each id in the request.
        let positions: BTreeMap<&Value, usize> = ids
            .iter()
            .enumerate()
            .rev()
            .map(|(i, id)| (id, i))
            .collect();
        found.sort_by_key(|e| {
            let id = e.get(&id_col.name);
            positions.get(&id).copied().unwrap_or(usize::MAX)
        });
        Ok(found)
    }

    // --- update ---

    /// UPDATE by id (or business key), excluding non-updateable and
    /// creation-audit columns. With a version column, the statement carries
    /// an optimistic check: a stale version updates nothing and returns 0,
    /// which is a conflict signal, not an error.
    pub async fn update(
        &self,
        entity: &mut E,
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        self.stamp_update(entity)?;

        let previous_version = match self.schema.version() {
            Some(version) => {
                let raw = entity.get(&version.name);
                let current = match &raw {
                    Value::Null => 0,
                    Value::Int(v) => *v,
                    other => {
                        return Err(DbError::invalid_value(format!(
                            "version column holds non-integer value {other:?}"
                        )));
                    }
                };
                // The entity sees the post-update version before emission.
                entity.set(&version.name, Value::Int(current + 1))?;
                Some((version.name.clone(), current))
            }
            None => None,
        };

        let mut container = ctx.create_container();
        container.append_sql(format!("UPDATE {} SET ", self.table_ref(dialect.as_ref())));

        let updatable: Vec<&ColumnSchema> = self.schema.updatable_columns().collect();
        if updatable.is_empty() && previous_version.is_none() {
            return Err(DbError::configuration(
                "entity maps no updatable columns",
            ));
        }
        for (i, col) in updatable.iter().enumerate() {
            if i > 0 {
                container.append_sql(", ");
            }
            let value = coerce(entity.get(&col.name), col.db_type)?;
            let marker = container.bind(Some(&format!("s{i}")), col.db_type, value)?;
            container.append_sql(format!(
                "{}={marker}",
                dialect.wrap_identifier(&col.name)
            ));
        }
        if let Some((version_name, _)) = &previous_version {
            let wrapped = dialect.wrap_identifier(version_name);
            if !updatable.is_empty() {
                container.append_sql(", ");
            }
            container.append_sql(format!("{wrapped}={wrapped}+1"));
        }

        container.append_sql(" WHERE ");
        self.append_row_identity(&mut container, dialect.as_ref(), entity)?;

        if let Some((version_name, previous)) = &previous_version {
            container.append_sql(" AND ");
            let marker =
                container.bind(Some("v0"), crate::value::DbType::Int64, Value::Int(*previous))?;
            container.append_sql(format!(
                "{}={marker}",
                dialect.wrap_identifier(version_name)
            ));
        }

        let rows = container.execute_non_query(ExecutionType::Write).await?;
        if rows == 0 {
            debug!("update affected no rows (stale version or missing key)");
        }
        Ok(rows)
    }

    /// `id=<k0>` or the composite business key, bound with the key prefix.
    fn append_row_identity(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
        entity: &E,
    ) -> Result<(), DbError> {
        if let Some(id_col) = self.schema.id() {
            let value = coerce(entity.get(&id_col.name), id_col.db_type)?;
            if value.is_null() {
                return Err(DbError::invalid_value("entity id is null"));
            }
            let marker = container.bind(Some("k0"), id_col.db_type, value)?;
            container.append_sql(format!(
                "{}={marker}",
                dialect.wrap_identifier(&id_col.name)
            ));
            return Ok(());
        }
        self.append_key_predicate(container, dialect, entity, "k")
    }

    // --- delete ---

    pub async fn delete(
        &self,
        id: &Value,
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();
        let id_col = self.id_column()?;

        let mut container = ctx.create_container();
        container.append_sql(format!("DELETE FROM {} WHERE ", self.table_ref(dialect.as_ref())));
        let marker =
            container.bind(Some("k0"), id_col.db_type, coerce(id.clone(), id_col.db_type)?)?;
        container.append_sql(format!(
            "{}={marker}",
            dialect.wrap_identifier(&id_col.name)
        ));
        container.execute_non_query(ExecutionType::Write).await
    }

    /// DELETE by the entity's business key.
    pub async fn delete_by_key(
        &self,
        entity: &E,
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        let mut container = ctx.create_container();
        container.append_sql(format!("DELETE FROM {} WHERE ", self.table_ref(dialect.as_ref())));
        self.append_key_predicate(&mut container, dialect.as_ref(), entity, "k")?;
        container.execute_non_query(ExecutionType::Write).await
    }

    /// DELETE many ids, chunked like `retrieve`.
    pub async fn delete_many(
        &self,
        ids: &[Value],
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();
        let id_col = self.id_column()?;

        let chunk_size = dialect.capabilities().parameter_budget().max(1);
        let mut total = 0u64;
        for chunk in ids.chunks(chunk_size) {
            let mut container = ctx.create_container();
            container.append_sql(format!(
                "DELETE FROM {} WHERE {} IN (",
                self.table_ref(dialect.as_ref()),
                dialect.wrap_identifier(&id_col.name)
            ));
            let mut markers = Vec::with_capacity(chunk.len());
            for (i, id) in chunk.iter().enumerate() {
                let value = coerce(id.clone(), id_col.db_type)?;
                markers.push(container.bind(Some(&format!("k{i}")), id_col.db_type, value)?);
            }
            container.append_sql(format!("{})", markers.join(",")));
            total += container.execute_non_query(ExecutionType::Write).await?;
        }
        Ok(total)
    }

    // --- upsert ---

    /// Insert-or-update in the dialect's native shape. The version column
    /// is incremented on the update path in SQL.
    pub async fn upsert(
        &self,
        entity: &mut E,
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        self.stamp_create(entity)?;

        match dialect.upsert_shape() {
            UpsertShape::OnConflictDoUpdate | UpsertShape::OnDuplicateKeyUpdate => {
                let mut container = ctx.create_container();
                let columns: Vec<&ColumnSchema> = self.schema.insertable_columns().collect();
                self.append_insert(
                    &mut container,
                    dialect.as_ref(),
                    &columns,
                    entity,
                    GeneratedKeyPlan::None,
                    "i",
                )?;
                self.append_upsert_clause(&mut container, dialect.as_ref())?;
                container.execute_non_query(ExecutionType::Write).await
            }
            UpsertShape::MergeStatement => {
                let mut container = ctx.create_container();
                self.append_merge(&mut container, dialect.as_ref(), entity)?;
                container.execute_non_query(ExecutionType::Write).await
            }
            UpsertShape::PerRowFallback => self.fallback_upsert(ctx, entity).await,
        }
    }

    /// `ON CONFLICT(pk) DO UPDATE SET ...` / `ON DUPLICATE KEY UPDATE ...`.
    fn append_upsert_clause(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
    ) -> Result<(), DbError> {
        if !self.schema.has_primary_key() {
            return Err(DbError::configuration(
                "upsert requires mapped primary key columns",
            ));
        }
        let on_conflict = dialect
            .capabilities()
            .supports(DialectFeatures::INSERT_ON_CONFLICT);

        let mut assignments: Vec<String> = self
            .schema
            .updatable_columns()
            .map(|c| {
                let wrapped = dialect.wrap_identifier(&c.name);
                if on_conflict {
                    format!("{wrapped}=EXCLUDED.{wrapped}")
                } else {
                    format!("{wrapped}=VALUES({wrapped})")
                }
            })
            .collect();
        if let Some(version) = self.schema.version() {
            let wrapped = dialect.wrap_identifier(&version.name);
            assignments.push(format!("{wrapped}={wrapped}+1"));
        }

        if on_conflict {
            let conflict_target = self
                .schema
                .primary_keys()
                .map(|c| dialect.wrap_identifier(&c.name))
                .collect::<Vec<_>>()
                .join(",");
            container.append_sql(format!(
                " ON CONFLICT({conflict_target}) DO UPDATE SET {}",
                assignments.join(", ")
            ));
        } else {
            container.append_sql(format!(
                " ON DUPLICATE KEY UPDATE {}",
                assignments.join(", ")
            ));
        }
        Ok(())
    }

    /// `MERGE INTO t USING (SELECT markers AS cols) s ON (...) ...`.
    /// Multi-row MERGE is deliberately not emitted; one statement per row.
    fn append_merge(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
        entity: &E,
    ) -> Result<(), DbError> {
        if !self.schema.has_primary_key() {
            return Err(DbError::configuration(
                "upsert requires mapped primary key columns",
            ));
        }
        let columns: Vec<&ColumnSchema> = self.schema.insertable_columns().collect();

        container.append_sql(format!("MERGE INTO {} t USING (SELECT ", self.table_ref(dialect)));
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                container.append_sql(", ");
            }
            let value = coerce(entity.get(&col.name), col.db_type)?;
            let marker = container.bind(Some(&format!("i{i}")), col.db_type, value)?;
            container.append_sql(format!(
                "{marker} AS {}",
                dialect.wrap_identifier(&col.name)
            ));
        }
        container.append_sql(dialect.dual_clause());
        container.append_sql(") s ON (");

        let keys: Vec<String> = self
            .schema
            .primary_keys()
            .map(|c| {
                let wrapped = dialect.wrap_identifier(&c.name);
                format!("t.{wrapped}=s.{wrapped}")
            })
            .collect();
        container.append_sql(keys.join(" AND "));
        container.append_sql(")");

        let mut assignments: Vec<String> = self
            .schema
            .updatable_columns()
            .map(|c| {
                let wrapped = dialect.wrap_identifier(&c.name);
                format!("t.{wrapped}=s.{wrapped}")
            })
            .collect();
        if let Some(version) = self.schema.version() {
            let wrapped = dialect.wrap_identifier(&version.name);
            assignments.push(format!("t.{wrapped}=t.{wrapped}+1"));
        }
        container.append_sql(format!(
            " WHEN MATCHED THEN UPDATE SET {}",
            assignments.join(", ")
        ));

        let insert_cols = columns
            .iter()
            .map(|c| dialect.wrap_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(",");
        let insert_vals = columns
            .iter()
            .map(|c| format!("s.{}", dialect.wrap_identifier(&c.name)))
            .collect::<Vec<_>>()
            .join(",");
        container.append_sql(format!(
            " WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})"
        ));
        container.append_sql(dialect.merge_terminator());
        Ok(())
    }

    /// Try-update-then-insert for dialects with no native upsert. Inside a
    /// transaction on a savepoint-capable dialect, the insert attempt is
    /// fenced by a savepoint so a unique-violation race leaves the
    /// transaction usable.
    async fn fallback_upsert(
        &self,
        ctx: &dyn DbContext,
        entity: &mut E,
    ) -> Result<u64, DbError> {
        let dialect = ctx.dialect();
        let rows = self.update_by_business_key(ctx, entity).await?;
        if rows > 0 {
            return Ok(rows);
        }

        let use_savepoint = ctx.in_transaction()
            && dialect.capabilities().supports(DialectFeatures::SAVEPOINTS);
        if use_savepoint {
            let mut sp = ctx.create_container();
            sp.append_sql(dialect.create_savepoint_sql("upsert_insert"));
            sp.execute_non_query(ExecutionType::Write).await?;
        }

        let mut container = ctx.create_container();
        let columns: Vec<&ColumnSchema> = self.schema.insertable_columns().collect();
        self.append_insert(
            &mut container,
            dialect.as_ref(),
            &columns,
            entity,
            GeneratedKeyPlan::None,
            "i",
        )?;
        match container.execute_non_query(ExecutionType::Write).await {
            Ok(rows) => Ok(rows),
            Err(DbError::UniqueViolation(_)) => {
                // Lost the race to a concurrent insert; roll back the
                // failed insert attempt and update instead.
                if use_savepoint {
                    let mut sp = ctx.create_container();
                    sp.append_sql(dialect.rollback_to_savepoint_sql("upsert_insert"));
                    sp.execute_non_query(ExecutionType::Write).await?;
                }
                self.update_by_business_key(ctx, entity).await
            }
            Err(other) => Err(other),
        }
    }

    /// UPDATE keyed only by the business key (the id may be unknown on
    /// the upsert path).
    async fn update_by_business_key(
        &self,
        ctx: &dyn DbContext,
        entity: &E,
    ) -> Result<u64, DbError> {
        let dialect = ctx.dialect();
        let updatable: Vec<&ColumnSchema> = self.schema.updatable_columns().collect();
        if updatable.is_empty() {
            return Ok(0);
        }

        let mut container = ctx.create_container();
        container.append_sql(format!("UPDATE {} SET ", self.table_ref(dialect.as_ref())));
        for (i, col) in updatable.iter().enumerate() {
            if i > 0 {
                container.append_sql(", ");
            }
            let value = coerce(entity.get(&col.name), col.db_type)?;
            let marker = container.bind(Some(&format!("s{i}")), col.db_type, value)?;
            container.append_sql(format!(
                "{}={marker}",
                dialect.wrap_identifier(&col.name)
            ));
        }
        if let Some(version) = self.schema.version() {
            let wrapped = dialect.wrap_identifier(&version.name);
            container.append_sql(format!(", {wrapped}={wrapped}+1"));
        }
        container.append_sql(" WHERE ");
        self.append_key_predicate(&mut container, dialect.as_ref(), entity, "k")?;
        container.execute_non_query(ExecutionType::Write).await
    }

    // --- batch ---

    /// Multi-row INSERT, chunked so each statement stays inside the
    /// parameter budget. Returns total rows inserted.
    pub async fn batch_create(
        &self,
        entities: &mut [E],
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        if entities.is_empty() {
            return Ok(0);
        }
        if entities.len() == 1 {
            let created = self.create(&mut entities[0], over).await?;
            return Ok(created as u64);
        }

        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        if !dialect
            .capabilities()
            .supports(DialectFeatures::MULTI_ROW_INSERT)
        {
            let mut total = 0u64;
            for entity in entities.iter_mut() {
                total += self.create(entity, over).await? as u64;
            }
            return Ok(total);
        }

        for entity in entities.iter_mut() {
            self.stamp_create(entity)?;
        }

        let columns: Vec<&ColumnSchema> = self.schema.insertable_columns().collect();
        let rows_per_chunk = self.batch_rows_per_chunk(dialect.as_ref(), columns.len());

        let mut total = 0u64;
        for chunk in entities.chunks(rows_per_chunk) {
            let mut container = ctx.create_container();
            self.append_multi_row_insert(&mut container, dialect.as_ref(), &columns, chunk)?;
            total += container.execute_non_query(ExecutionType::Write).await?;
        }
        Ok(total)
    }

    /// Multi-row upsert where the dialect's shape allows it; one-per-row
    /// otherwise.
    pub async fn batch_upsert(
        &self,
        entities: &mut [E],
        over: Option<&dyn DbContext>,
    ) -> Result<u64, DbError> {
        if entities.is_empty() {
            return Ok(0);
        }
        let ctx = self.ctx(over);
        let dialect = ctx.dialect();

        let multi_row = dialect
            .capabilities()
            .supports(DialectFeatures::MULTI_ROW_INSERT)
            && matches!(
                dialect.upsert_shape(),
                UpsertShape::OnConflictDoUpdate | UpsertShape::OnDuplicateKeyUpdate
            );
        if !multi_row {
            let mut total = 0u64;
            for entity in entities.iter_mut() {
                total += self.upsert(entity, over).await?;
            }
            return Ok(total);
        }

        for entity in entities.iter_mut() {
            self.stamp_create(entity)?;
        }

        let columns: Vec<&ColumnSchema> = self.schema.insertable_columns().collect();
        let rows_per_chunk = self.batch_rows_per_chunk(dialect.as_ref(), columns.len());

        let mut total = 0u64;
        for chunk in entities.chunks(rows_per_chunk) {
            let mut container = ctx.create_container();
            self.append_multi_row_insert(&mut container, dialect.as_ref(), &columns, chunk)?;
            self.append_upsert_clause(&mut container, dialect.as_ref())?;
            total += container.execute_non_query(ExecutionType::Write).await?;
        }
        Ok(total)
    }

    fn batch_rows_per_chunk(&self, dialect: &dyn Dialect, column_count: usize) -> usize {
        let budget = dialect.capabilities().parameter_budget();
        (budget / column_count.max(1)).max(1)
    }

    fn append_multi_row_insert(
        &self,
        container: &mut SqlContainer,
        dialect: &dyn Dialect,
        columns: &[&ColumnSchema],
        entities: &[E],
    ) -> Result<(), DbError> {
        let column_list = columns
            .iter()
            .map(|c| dialect.wrap_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(",");
        container.append_sql(format!(
            "INSERT INTO {} ({column_list}) VALUES ",
            self.table_ref(dialect)
        ));

        let mut ordinal = 0usize;
        for (row, entity) in entities.iter().enumerate() {
            if row > 0 {
                container.append_sql(",");
            }
            let mut markers = Vec::with_capacity(columns.len());
            for col in columns {
                let value = coerce(entity.get(&col.name), col.db_type)?;
                markers.push(container.bind(
                    Some(&format!("b{ordinal}")),
                    col.db_type,
                    value,
                )?);
                ordinal += 1;
            }
            container.append_sql(format!("({})", markers.join(",")));
        }
        Ok(())
    }
}
