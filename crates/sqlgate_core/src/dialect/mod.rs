use std::sync::Arc;

use bitflags::bitflags;

use crate::error::DbError;
use crate::modes::{
    ExecutionType, GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle,
    UpsertShape,
};
use crate::params::Parameter;
use crate::product::{ProductVersion, SupportedDatabase};
use crate::value::{DbType, Value};

mod duckdb;
mod firebird;
mod mysql;
mod oracle;
mod postgres;
mod sql_server;
mod sqlite;

pub use duckdb::DuckDbDialect;
pub use firebird::FirebirdDialect;
pub use mysql::MySqlDialect;
pub use oracle::OracleDialect;
pub use postgres::PostgresDialect;
pub use sql_server::SqlServerDialect;
pub use sqlite::SqliteDialect;

bitflags! {
    /// SQL surface features a backend may support.
    ///
    /// Every flag is queried by at least one code path; unknown backends
    /// keep all of them disabled so the fallback dialect never emits a
    /// statement the server cannot parse.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DialectFeatures: u32 {
        /// `MERGE INTO ... WHEN MATCHED ...`
        const MERGE = 1 << 0;

        /// `INSERT ... ON CONFLICT (...) DO UPDATE`
        const INSERT_ON_CONFLICT = 1 << 1;

        /// `INSERT ... ON DUPLICATE KEY UPDATE`
        const ON_DUPLICATE_KEY = 1 << 2;

        /// MERGE statements may carry a RETURNING/OUTPUT clause.
        const MERGE_RETURNING = 1 << 3;

        /// `RETURNING <cols>` on INSERT/UPDATE/DELETE.
        const RETURNING = 1 << 4;

        /// `OUTPUT INSERTED.<col>` clause (SQL Server).
        const OUTPUT_INSERTED = 1 << 5;

        /// `SAVEPOINT` / `ROLLBACK TO SAVEPOINT`.
        const SAVEPOINTS = 1 << 6;

        const WINDOW_FUNCTIONS = 1 << 7;

        const COMMON_TABLE_EXPRESSIONS = 1 << 8;

        const JSON_TYPES = 1 << 9;

        const ARRAY_TYPES = 1 << 10;

        const XML_TYPES = 1 << 11;

        /// System-versioned / temporal tables.
        const TEMPORAL_TABLES = 1 << 12;

        /// The driver reports unique violations distinguishably
        /// (error code or SQLSTATE) so the engine can classify them.
        const UNIQUE_VIOLATION_DETECTION = 1 << 13;

        /// Multi-row `INSERT ... VALUES (...),(...)` syntax.
        const MULTI_ROW_INSERT = 1 << 14;

        /// Sequences with a prefetchable NEXTVAL.
        const SEQUENCES = 1 << 15;

        /// Read-committed reads are snapshot-based and never block writers.
        const READ_COMMITTED_SNAPSHOT = 1 << 16;
    }
}

/// Capability era of the backend's SQL surface, coarse-grained so feature
/// gates can compare eras instead of individual version numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SqlFeatureTier {
    /// Pre-standard or unknown surface; assume nothing.
    Minimal,
    /// Entry-level SQL-92.
    Sql92,
    /// Window functions, CTEs.
    Sql2008,
    /// JSON, temporal.
    Sql2016,
    /// Current-generation surface.
    Modern,
}

/// Static capability table for one backend at one version.
#[derive(Debug, Clone)]
pub struct DialectCapabilities {
    /// Marker prefix for named parameters (`@`, `:`, `$`). Ignored when
    /// named parameters are unsupported.
    pub parameter_marker: &'static str,
    pub supports_named_parameters: bool,
    /// Hard provider cap on parameters per statement. Containers enforce
    /// a 0.9x budget below this.
    pub max_parameters: usize,
    pub name_max_len: usize,
    /// Pattern every generated parameter name must satisfy.
    pub name_pattern: &'static str,
    pub quote_prefix: &'static str,
    pub quote_suffix: &'static str,
    pub composite_separator: char,
    pub prepare_statements: bool,
    pub proc_wrapping_style: ProcWrappingStyle,
    pub features: DialectFeatures,
    pub feature_tier: SqlFeatureTier,
    /// Session-scoped last-inserted-id query, where the product has one.
    pub last_insert_id_query: Option<&'static str>,
    pub supported_isolation: &'static [IsolationLevel],
}

impl DialectCapabilities {
    /// The enforced per-statement parameter budget: 0.9x of the provider
    /// cap, leaving headroom for driver-internal parameters.
    pub fn parameter_budget(&self) -> usize {
        (self.max_parameters * 9) / 10
    }

    /// Whether `name` is a legal parameter name for this backend.
    pub fn name_is_legal(&self, name: &str) -> bool {
        if name.is_empty() || name.len() > self.name_max_len {
            return false;
        }
        compiled_pattern(self.name_pattern).is_match(name)
    }

    pub fn supports(&self, feature: DialectFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn supports_isolation(&self, level: IsolationLevel) -> bool {
        self.supported_isolation.contains(&level)
    }
}

/// How the session preamble for a product is obtained.
///
/// Pure data: the tracked connection interprets the plan on first open so
/// dialects stay free of I/O.
#[derive(Debug, Clone)]
pub enum PreamblePlan {
    /// Nothing to apply.
    None,
    /// Fixed SET-statement batch.
    Static(String),
    /// Run `probe`, compare observed options against `required`, and emit
    /// `SET <name> <value>` only for options that diverge (SQL Server's
    /// DBCC USEROPTIONS discipline).
    DivergenceProbe {
        probe: &'static str,
        required: &'static [(&'static str, &'static str)],
    },
}

impl PreamblePlan {
    pub fn is_none(&self) -> bool {
        matches!(self, PreamblePlan::None)
    }
}

/// Per-backend capability table plus SQL shaping.
///
/// Everything provider-specific funnels through this trait so the rest of
/// the engine stays uniform. Default methods implement the portable parts;
/// backends override only where their surface diverges.
pub trait Dialect: Send + Sync {
    fn product(&self) -> SupportedDatabase;

    fn version(&self) -> ProductVersion;

    fn capabilities(&self) -> &DialectCapabilities;

    /// Whether this dialect was produced by failed detection and carries
    /// conservative capabilities.
    fn is_fallback(&self) -> bool {
        false
    }

    /// Statement that returns the product's version banner as a scalar.
    fn version_probe(&self) -> &'static str;

    /// Quote one identifier, splitting on the composite separator and
    /// stripping any existing quote characters first so wrapping is
    /// idempotent.
    fn wrap_identifier(&self, name: &str) -> String {
        let caps = self.capabilities();
        let mut out = String::with_capacity(name.len() + 8);
        for (i, segment) in name.split(caps.composite_separator).enumerate() {
            if i > 0 {
                out.push(caps.composite_separator);
            }
            let stripped: String = segment
                .chars()
                .filter(|c| {
                    !caps.quote_prefix.contains(*c) && !caps.quote_suffix.contains(*c)
                })
                .collect();
            out.push_str(caps.quote_prefix);
            out.push_str(stripped.trim());
            out.push_str(caps.quote_suffix);
        }
        out
    }

    /// Render the marker for the parameter at `ordinal` with base `name`.
    ///
    /// `?` when named parameters are unsupported; positional dialects
    /// (PostgreSQL's `$N`) override this.
    fn parameter_marker_at(&self, ordinal: usize, name: &str) -> String {
        let caps = self.capabilities();
        let _ = ordinal;
        if caps.supports_named_parameters {
            format!("{}{}", caps.parameter_marker, name)
        } else {
            "?".to_string()
        }
    }

    /// Build a parameter, generating a name when the caller omitted one:
    /// a random identifier (first char alphabetic) for named dialects, a
    /// positional `pN` otherwise.
    fn make_parameter(
        &self,
        name: Option<&str>,
        db_type: DbType,
        value: Value,
        ordinal: usize,
    ) -> Parameter {
        let caps = self.capabilities();
        let name = match name {
            Some(n) => n.to_string(),
            None if caps.supports_named_parameters => random_parameter_name(caps.name_max_len),
            None => format!("p{ordinal}"),
        };
        Parameter::new(name, db_type, value)
    }

    /// Session preamble applied exactly once per physical connection.
    fn session_preamble_plan(&self, _read_only: bool) -> PreamblePlan {
        PreamblePlan::None
    }

    /// Preferred strategy for fetching a server-assigned id after INSERT.
    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        let caps = self.capabilities();
        if caps.supports(DialectFeatures::OUTPUT_INSERTED) {
            GeneratedKeyPlan::OutputInserted
        } else if caps.supports(DialectFeatures::RETURNING) {
            GeneratedKeyPlan::Returning
        } else if caps.last_insert_id_query.is_some() {
            GeneratedKeyPlan::SessionScopedFunction
        } else if caps.supports(DialectFeatures::SEQUENCES) {
            GeneratedKeyPlan::PrefetchSequence
        } else {
            GeneratedKeyPlan::None
        }
    }

    /// Upsert statement family for this backend.
    fn upsert_shape(&self) -> UpsertShape {
        let caps = self.capabilities();
        if caps.supports(DialectFeatures::INSERT_ON_CONFLICT) {
            UpsertShape::OnConflictDoUpdate
        } else if caps.supports(DialectFeatures::ON_DUPLICATE_KEY) {
            UpsertShape::OnDuplicateKeyUpdate
        } else if caps.supports(DialectFeatures::MERGE) {
            UpsertShape::MergeStatement
        } else {
            UpsertShape::PerRowFallback
        }
    }

    /// Wrap a stored procedure invocation in the product's call syntax.
    /// PostgreSQL distinguishes set-returning functions (read) from
    /// procedures (write); everyone else ignores the execution type.
    fn wrap_procedure_call(
        &self,
        name: &str,
        args: &[String],
        execution: ExecutionType,
    ) -> Result<String, DbError> {
        let wrapped = self.wrap_identifier(name);
        let arg_list = args.join(", ");
        match self.capabilities().proc_wrapping_style {
            ProcWrappingStyle::PostgreSqlCall if !execution.is_write() => {
                Ok(format!("SELECT * FROM {wrapped}({arg_list})"))
            }
            ProcWrappingStyle::Call | ProcWrappingStyle::PostgreSqlCall => {
                Ok(format!("CALL {wrapped}({arg_list})"))
            }
            ProcWrappingStyle::Exec => {
                if args.is_empty() {
                    Ok(format!("EXEC {wrapped}"))
                } else {
                    Ok(format!("EXEC {wrapped} {arg_list}"))
                }
            }
            ProcWrappingStyle::ExecuteProcedure => {
                Ok(format!("EXECUTE PROCEDURE {wrapped}({arg_list})"))
            }
            ProcWrappingStyle::OracleBlock => {
                Ok(format!("BEGIN {wrapped}({arg_list}); END;"))
            }
            ProcWrappingStyle::None => Err(DbError::not_supported(format!(
                "{} does not support stored procedure calls",
                self.product().display_name()
            ))),
        }
    }

    /// Classify a driver error as a unique-constraint violation.
    fn is_unique_violation(&self, error: &DbError) -> bool {
        let _ = error;
        false
    }

    /// Resolve an intent profile to a concrete isolation level, failing
    /// when the product has no non-surprising mapping.
    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError>;

    /// Validate an explicitly requested level against the capability table.
    fn validate_isolation(&self, level: IsolationLevel) -> Result<IsolationLevel, DbError> {
        if self.capabilities().supports_isolation(level) {
            Ok(level)
        } else {
            Err(DbError::UnsupportedIsolation {
                product: self.product(),
                level,
                detail: None,
            })
        }
    }

    /// Savepoint statement. Portable syntax; SQL Server overrides.
    fn create_savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", self.wrap_identifier(name))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.wrap_identifier(name))
    }

    fn release_savepoint_sql(&self, name: &str) -> Option<String> {
        Some(format!("RELEASE SAVEPOINT {}", self.wrap_identifier(name)))
    }

    /// Sequence-prefetch statement for `PrefetchSequence` plans.
    fn next_sequence_value_sql(&self, _sequence: &str) -> Option<String> {
        None
    }

    /// Escape a string for use inside a single-quoted literal.
    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Render a value as an inline SQL literal.
    ///
    /// Diagnostics only (statement previews in logs); execution always
    /// binds parameters.
    fn value_to_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_finite() {
                    f.to_string()
                } else {
                    format!("'{f}'")
                }
            }
            Value::Decimal(s) => s.clone(),
            Value::Text(s) | Value::Json(s) => format!("'{}'", self.escape_string(s)),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                format!("X'{hex}'")
            }
            Value::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
            Value::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
            Value::Guid(g) => format!("'{g}'"),
        }
    }

    /// FROM clause fragment for a single-row source subquery, for products
    /// whose SELECT requires a table (` FROM DUAL`). Empty by default.
    fn dual_clause(&self) -> &'static str {
        ""
    }

    /// Terminator required after a MERGE statement. SQL Server insists on
    /// one; everyone else rejects it.
    fn merge_terminator(&self) -> &'static str {
        ""
    }
}

/// Process-wide cache of compiled name patterns. The pattern set is tiny
/// (one or two per backend family) and immutable after first use.
fn compiled_pattern(pattern: &'static str) -> Arc<regex::Regex> {
    use std::collections::HashMap;
    use std::sync::{OnceLock, RwLock};

    static CACHE: OnceLock<RwLock<HashMap<&'static str, Arc<regex::Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(re) = cache.read().expect("pattern cache poisoned").get(pattern) {
        return re.clone();
    }
    let re = Arc::new(regex::Regex::new(pattern).expect("dialect name_pattern must compile"));
    cache
        .write()
        .expect("pattern cache poisoned")
        .insert(pattern, re.clone());
    re
}

/// Generate a random parameter name: 2..=name_max_len chars (capped at a
/// practical 12), first char alphabetic, remainder hex.
pub(crate) fn random_parameter_name(name_max_len: usize) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    let len = name_max_len.clamp(2, 12);
    let mut out = String::with_capacity(len);
    for (i, c) in raw.chars().take(len).enumerate() {
        if i == 0 && c.is_ascii_digit() {
            // Map a leading digit onto a letter to keep the name legal.
            out.push((b'g' + (c as u8 - b'0')) as char);
        } else {
            out.push(c);
        }
    }
    out
}

/// Build the dialect for a detected product and version.
///
/// Unrecognized products receive the conservative fallback dialect.
pub fn dialect_for(product: SupportedDatabase, version: ProductVersion) -> Arc<dyn Dialect> {
    match product {
        SupportedDatabase::SqlServer => Arc::new(SqlServerDialect::new(version)),
        SupportedDatabase::PostgreSql => Arc::new(PostgresDialect::new(version)),
        SupportedDatabase::CockroachDb => Arc::new(PostgresDialect::cockroach(version)),
        SupportedDatabase::Oracle => Arc::new(OracleDialect::new(version)),
        SupportedDatabase::MySql => Arc::new(MySqlDialect::new(version)),
        SupportedDatabase::MariaDb => Arc::new(MySqlDialect::mariadb(version)),
        SupportedDatabase::Sqlite => Arc::new(SqliteDialect::new(version)),
        SupportedDatabase::Firebird => Arc::new(FirebirdDialect::new(version)),
        SupportedDatabase::DuckDb => Arc::new(DuckDbDialect::new(version)),
        SupportedDatabase::Unknown => Arc::new(FallbackDialect::new(version)),
    }
}

static FALLBACK_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "@",
    supports_named_parameters: false,
    max_parameters: 999,
    name_max_len: 30,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: false,
    proc_wrapping_style: ProcWrappingStyle::None,
    features: DialectFeatures::empty(),
    feature_tier: SqlFeatureTier::Minimal,
    last_insert_id_query: None,
    supported_isolation: &[IsolationLevel::ReadCommitted],
};

/// Conservative dialect used when detection returns unrecognized data.
///
/// Every optional capability is disabled; generated keys fall back to the
/// correlation-token plan because no preceding option is available.
pub struct FallbackDialect {
    version: ProductVersion,
}

impl FallbackDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }
}

impl Dialect for FallbackDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::Unknown
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &FALLBACK_CAPS
    }

    fn is_fallback(&self) -> bool {
        true
    }

    fn version_probe(&self) -> &'static str {
        "SELECT 1"
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::CorrelationToken
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            IsolationProfile::FastWithRisks => Ok(IsolationLevel::ReadCommitted),
            other => Err(DbError::UnsupportedIsolation {
                product: SupportedDatabase::Unknown,
                level: IsolationLevel::ReadCommitted,
                detail: Some(format!(
                    "profile {other:?} has no mapping on an undetected product"
                )),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_is_idempotent_after_strip() {
        let d = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        let once = d.wrap_identifier("public.users");
        let twice = d.wrap_identifier(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "\"public\".\"users\"");
    }

    #[test]
    fn random_names_start_alphabetic() {
        for _ in 0..64 {
            let name = random_parameter_name(12);
            let first = name.chars().next().unwrap();
            assert!(first.is_ascii_alphabetic(), "bad name {name}");
            assert!(name.len() >= 2 && name.len() <= 12);
        }
    }

    #[test]
    fn fallback_disables_everything() {
        let d = FallbackDialect::new(ProductVersion::default());
        assert!(d.is_fallback());
        assert!(d.capabilities().features.is_empty());
        assert_eq!(d.upsert_shape(), UpsertShape::PerRowFallback);
        assert_eq!(d.generated_key_plan(), GeneratedKeyPlan::CorrelationToken);
        assert!(
            d.wrap_procedure_call("p", &[], ExecutionType::Write)
                .is_err()
        );
    }

    #[test]
    fn fallback_isolation_profiles() {
        let d = FallbackDialect::new(ProductVersion::default());
        assert!(d.resolve_isolation(IsolationProfile::SafeNonBlockingReads).is_err());
        assert_eq!(
            d.resolve_isolation(IsolationProfile::FastWithRisks).unwrap(),
            IsolationLevel::ReadCommitted
        );
    }

    #[test]
    fn parameter_budget_is_ninety_percent() {
        assert_eq!(FALLBACK_CAPS.parameter_budget(), 899);
    }

    #[test]
    fn literals_escape_quotes() {
        let d = PostgresDialect::new(ProductVersion::new(16, 0, 0));
        assert_eq!(d.value_to_literal(&Value::Text("o'neil".into())), "'o''neil'");
        assert_eq!(d.value_to_literal(&Value::Null), "NULL");
        assert_eq!(d.value_to_literal(&Value::Bool(true)), "TRUE");
        assert_eq!(d.value_to_literal(&Value::Bytes(vec![0xde, 0xad])), "X'dead'");
    }

    #[test]
    fn mysql_literals_escape_backslashes() {
        let d = MySqlDialect::new(ProductVersion::new(8, 0, 36));
        assert_eq!(
            d.value_to_literal(&Value::Text("c:\\temp".into())),
            "'c:\\\\temp'"
        );
    }

    #[test]
    fn generated_names_satisfy_every_dialect_pattern() {
        use crate::product::SupportedDatabase::*;
        for product in [
            SqlServer, PostgreSql, Oracle, MySql, MariaDb, Sqlite, Firebird, CockroachDb, DuckDb,
            Unknown,
        ] {
            let dialect = dialect_for(product, ProductVersion::new(99, 0, 0));
            let caps = dialect.capabilities();
            for _ in 0..16 {
                let name = random_parameter_name(caps.name_max_len);
                assert!(caps.name_is_legal(&name), "{product:?} rejected {name}");
            }
            assert!(caps.name_is_legal("i0"));
            assert!(!caps.name_is_legal("0abc"));
            assert!(!caps.name_is_legal(""));
        }
    }
}
