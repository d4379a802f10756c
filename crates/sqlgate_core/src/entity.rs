use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::DbError;
use crate::value::{DbType, Value};

/// How an enum-typed column is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumRepr {
    /// Stored as the variant name in a string column (case-sensitive).
    Name,
    /// Stored as the underlying ordinal in a numeric column.
    Ordinal,
}

/// Audit role a column plays, populated by the gateway on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditRole {
    CreatedBy,
    CreatedOn,
    UpdatedBy,
    UpdatedOn,
}

/// Dialect-independent upper bound on mapped columns per entity. Engines
/// may reject wide tables earlier at CREATE time; this guards the mapping
/// layer itself.
pub const MAX_MAPPED_COLUMNS: usize = 1_000;

/// One mapped column.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub db_type: DbType,
    /// Surrogate key. At most one per entity.
    pub is_id: bool,
    /// Whether the id is client-writable (no server generation).
    pub id_writable: bool,
    /// Position in the business key, if part of it.
    pub pk_order: Option<u32>,
    pub non_insertable: bool,
    pub non_updateable: bool,
    pub is_version: bool,
    pub audit_role: Option<AuditRole>,
    pub enum_repr: Option<EnumRepr>,
    pub is_json: bool,
    /// Backing sequence for prefetch-style key generation.
    pub sequence: Option<String>,
    /// Unique token used to find the row after INSERT on backends with no
    /// other key-retrieval mechanism.
    pub is_correlation_token: bool,
}

impl ColumnSchema {
    fn new(name: impl Into<String>, db_type: DbType) -> Self {
        Self {
            name: name.into(),
            db_type,
            is_id: false,
            id_writable: false,
            pk_order: None,
            non_insertable: false,
            non_updateable: false,
            is_version: false,
            audit_role: None,
            enum_repr: None,
            is_json: false,
            sequence: None,
            is_correlation_token: false,
        }
    }

    /// Whether the column participates in INSERT column lists.
    /// The id is included only when client-writable; audit and version
    /// columns are always written by the gateway.
    pub fn is_insertable(&self) -> bool {
        if self.non_insertable {
            return false;
        }
        !self.is_id || self.id_writable
    }

    /// Whether the column participates in UPDATE SET lists. Creation-side
    /// audit columns never change after insert.
    pub fn is_updatable(&self) -> bool {
        if self.non_updateable || self.is_id || self.pk_order.is_some() || self.is_version {
            return false;
        }
        !matches!(
            self.audit_role,
            Some(AuditRole::CreatedBy) | Some(AuditRole::CreatedOn)
        )
    }
}

/// Chained configuration for one column inside the schema builder.
pub struct ColumnBuilder {
    column: ColumnSchema,
}

impl ColumnBuilder {
    /// Mark as the surrogate id, server-generated.
    pub fn id(mut self) -> Self {
        self.column.is_id = true;
        self.column.id_writable = false;
        self
    }

    /// Mark as a client-assigned id.
    pub fn id_writable(mut self) -> Self {
        self.column.is_id = true;
        self.column.id_writable = true;
        self
    }

    /// Include in the business key at the given position.
    pub fn primary_key(mut self, order: u32) -> Self {
        self.column.pk_order = Some(order);
        self
    }

    /// Optimistic-concurrency version counter.
    pub fn version(mut self) -> Self {
        self.column.is_version = true;
        self
    }

    pub fn audit(mut self, role: AuditRole) -> Self {
        self.column.audit_role = Some(role);
        self
    }

    pub fn non_insertable(mut self) -> Self {
        self.column.non_insertable = true;
        self
    }

    pub fn non_updateable(mut self) -> Self {
        self.column.non_updateable = true;
        self
    }

    /// Enum stored by variant name; forces a string column type.
    pub fn enum_as_name(mut self) -> Self {
        self.column.enum_repr = Some(EnumRepr::Name);
        self.column.db_type = DbType::Text;
        self
    }

    /// Enum stored by ordinal; forces a numeric column type.
    pub fn enum_as_ordinal(mut self) -> Self {
        self.column.enum_repr = Some(EnumRepr::Ordinal);
        self.column.db_type = DbType::Int32;
        self
    }

    /// Serialized to/from JSON text through the entity's accessors.
    pub fn json(mut self) -> Self {
        self.column.is_json = true;
        self.column.db_type = DbType::Json;
        self
    }

    /// Name the sequence backing this id for prefetch key plans.
    pub fn sequence(mut self, name: impl Into<String>) -> Self {
        self.column.sequence = Some(name.into());
        self
    }

    /// Mark as the correlation token column (unique, client-generated).
    pub fn correlation_token(mut self) -> Self {
        self.column.is_correlation_token = true;
        self.column.db_type = DbType::Guid;
        self
    }
}

/// Immutable table metadata for one entity type.
#[derive(Debug, Clone)]
pub struct TableSchema {
    schema: Option<String>,
    table: String,
    columns: Vec<ColumnSchema>,
    id_index: Option<usize>,
    pk_indices: Vec<usize>,
    version_index: Option<usize>,
}

impl TableSchema {
    pub fn builder(table: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder::new(table)
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Qualified name in declaration form (`schema.table`), unquoted.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", s, self.table),
            None => self.table.clone(),
        }
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn id(&self) -> Option<&ColumnSchema> {
        self.id_index.map(|i| &self.columns[i])
    }

    /// Business key columns in declared order. May be empty or composite.
    pub fn primary_keys(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.pk_indices.iter().map(|&i| &self.columns[i])
    }

    pub fn has_primary_key(&self) -> bool {
        !self.pk_indices.is_empty()
    }

    pub fn version(&self) -> Option<&ColumnSchema> {
        self.version_index.map(|i| &self.columns[i])
    }

    pub fn audit_column(&self, role: AuditRole) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.audit_role == Some(role))
    }

    pub fn correlation_token_column(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.is_correlation_token)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn insertable_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_insertable())
    }

    pub fn updatable_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_updatable())
    }
}

/// Declarative schema construction, the metadata surface entities use in
/// place of runtime attributes.
pub struct TableSchemaBuilder {
    schema: Option<String>,
    table: String,
    columns: Vec<ColumnSchema>,
}

impl TableSchemaBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a column, configuring it through the closure.
    pub fn column(
        mut self,
        name: impl Into<String>,
        db_type: DbType,
        configure: impl FnOnce(ColumnBuilder) -> ColumnBuilder,
    ) -> Self {
        let builder = configure(ColumnBuilder {
            column: ColumnSchema::new(name, db_type),
        });
        self.columns.push(builder.column);
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<TableSchema, DbError> {
        if self.table.trim().is_empty() {
            return Err(DbError::configuration("entity table name is required"));
        }
        if self.columns.is_empty() {
            return Err(DbError::configuration(format!(
                "entity table {:?} maps no columns",
                self.table
            )));
        }
        if self.columns.len() > MAX_MAPPED_COLUMNS {
            return Err(DbError::configuration(format!(
                "entity table {:?} maps {} columns; limit is {MAX_MAPPED_COLUMNS}",
                self.table,
                self.columns.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for c in &self.columns {
            if !seen.insert(c.name.as_str()) {
                return Err(DbError::configuration(format!(
                    "duplicate column {:?} on table {:?}",
                    c.name, self.table
                )));
            }
        }

        let id_indices: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_id)
            .map(|(i, _)| i)
            .collect();
        if id_indices.len() > 1 {
            return Err(DbError::configuration(format!(
                "table {:?} declares {} id columns; at most one is allowed",
                self.table,
                id_indices.len()
            )));
        }

        // Surrogate id and business key are distinct concepts and must
        // never share a column.
        if let Some(conflict) = self
            .columns
            .iter()
            .find(|c| c.is_id && c.pk_order.is_some())
        {
            return Err(DbError::configuration(format!(
                "column {:?} is both id and primary key",
                conflict.name
            )));
        }

        let version_indices: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_version)
            .map(|(i, _)| i)
            .collect();
        if version_indices.len() > 1 {
            return Err(DbError::configuration(format!(
                "table {:?} declares more than one version column",
                self.table
            )));
        }

        // Business key in declared order; stable for equal orders.
        let mut pk_indices: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pk_order.is_some())
            .map(|(i, _)| i)
            .collect();
        pk_indices.sort_by_key(|&i| self.columns[i].pk_order);

        Ok(TableSchema {
            schema: self.schema,
            table: self.table,
            id_index: id_indices.first().copied(),
            pk_indices,
            version_index: version_indices.first().copied(),
            columns: self.columns,
        })
    }
}

/// A mapped entity.
///
/// The schema is authored with [`TableSchemaBuilder`]; `get`/`set` move
/// values between the entity and its mapped columns. Enum and JSON columns
/// convert inside these accessors: an enum column yields/accepts its name
/// (string columns) or ordinal (numeric columns), a JSON column
/// yields/accepts serialized text.
pub trait Entity: Default + Send + Sync + 'static {
    fn table_schema() -> Result<TableSchema, DbError>;

    /// Read the value mapped to `column`.
    fn get(&self, column: &str) -> Value;

    /// Write the value mapped to `column`. The value has already been
    /// coerced to the column's `DbType`.
    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError>;
}

type SchemaCache = RwLock<HashMap<TypeId, Arc<TableSchema>>>;

fn schema_cache() -> &'static SchemaCache {
    static CACHE: OnceLock<SchemaCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Process-wide entity metadata cache.
///
/// Registration is idempotent; the first successful build is published and
/// every later call returns the same `Arc`. Immutable after publish, safe
/// for concurrent readers.
pub struct TypeMapRegistry;

impl TypeMapRegistry {
    pub fn table_for<E: Entity>() -> Result<Arc<TableSchema>, DbError> {
        let key = TypeId::of::<E>();
        if let Some(schema) = schema_cache()
            .read()
            .expect("schema cache poisoned")
            .get(&key)
        {
            return Ok(schema.clone());
        }

        let built = Arc::new(E::table_schema()?);
        let mut cache = schema_cache().write().expect("schema cache poisoned");
        // A racing registration may have published first; keep that one.
        Ok(cache.entry(key).or_insert(built).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableSchemaBuilder {
        TableSchema::builder("users")
            .schema("public")
            .column("id", DbType::Int64, |c| c.id())
            .column("username", DbType::Text, |c| c.primary_key(0))
            .column("email", DbType::Text, |c| c)
    }

    #[test]
    fn builds_and_indexes() {
        let schema = users_schema()
            .column("version", DbType::Int64, |c| c.version())
            .build()
            .unwrap();

        assert_eq!(schema.table(), "users");
        assert_eq!(schema.qualified_name(), "public.users");
        assert_eq!(schema.id().unwrap().name, "id");
        assert_eq!(
            schema.primary_keys().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["username"]
        );
        assert_eq!(schema.version().unwrap().name, "version");
    }

    #[test]
    fn rejects_two_ids() {
        let result = TableSchema::builder("t")
            .column("a", DbType::Int64, |c| c.id())
            .column("b", DbType::Int64, |c| c.id())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_id_overlapping_primary_key() {
        let result = TableSchema::builder("t")
            .column("a", DbType::Int64, |c| c.id().primary_key(0))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_and_duplicate_columns() {
        assert!(TableSchema::builder("t").build().is_err());
        assert!(
            TableSchema::builder("t")
                .column("a", DbType::Int64, |c| c)
                .column("a", DbType::Text, |c| c)
                .build()
                .is_err()
        );
    }

    #[test]
    fn primary_key_order_is_stable() {
        let schema = TableSchema::builder("t")
            .column("c", DbType::Text, |c| c.primary_key(1))
            .column("a", DbType::Text, |c| c.primary_key(0))
            .column("b", DbType::Text, |c| c.primary_key(1))
            .build()
            .unwrap();
        let keys: Vec<_> = schema.primary_keys().map(|c| c.name.as_str()).collect();
        // Declaration order breaks the tie between equal orders.
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn server_generated_id_is_not_insertable() {
        let schema = users_schema().build().unwrap();
        let insertable: Vec<_> = schema.insertable_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(insertable, vec!["username", "email"]);
    }

    #[test]
    fn created_audit_is_not_updatable() {
        let schema = TableSchema::builder("t")
            .column("id", DbType::Int64, |c| c.id())
            .column("name", DbType::Text, |c| c)
            .column("created_on", DbType::DateTime, |c| c.audit(AuditRole::CreatedOn))
            .column("updated_on", DbType::DateTime, |c| c.audit(AuditRole::UpdatedOn))
            .build()
            .unwrap();
        let updatable: Vec<_> = schema.updatable_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(updatable, vec!["name", "updated_on"]);
    }

    #[test]
    fn enum_columns_force_types() {
        let schema = TableSchema::builder("t")
            .column("status_name", DbType::Text, |c| c.enum_as_name())
            .column("status_ord", DbType::Text, |c| c.enum_as_ordinal())
            .build()
            .unwrap();
        assert_eq!(schema.column("status_name").unwrap().db_type, DbType::Text);
        assert_eq!(schema.column("status_ord").unwrap().db_type, DbType::Int32);
    }
}
