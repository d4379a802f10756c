use super::{Dialect, DialectCapabilities, DialectFeatures, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static DUCKDB_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "?",
    supports_named_parameters: false,
    max_parameters: 65_535,
    name_max_len: 255,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::None,
    features: DialectFeatures::INSERT_ON_CONFLICT
        .union(DialectFeatures::RETURNING)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::ARRAY_TYPES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT)
        .union(DialectFeatures::SEQUENCES)
        .union(DialectFeatures::READ_COMMITTED_SNAPSHOT),
    feature_tier: SqlFeatureTier::Modern,
    last_insert_id_query: None,
    supported_isolation: &[IsolationLevel::Snapshot],
};

/// DuckDB: single-writer embedded analytics engine with a PostgreSQL-like
/// surface. Every transaction runs under snapshot isolation.
pub struct DuckDbDialect {
    version: ProductVersion,
}

impl DuckDbDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }
}

impl Dialect for DuckDbDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::DuckDb
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &DUCKDB_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT version()"
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::Returning
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        error
            .driver_error()
            .is_some_and(|e| e.message.contains("Constraint Error") || e.message.contains("Duplicate key"))
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        // Snapshot is the only level; every profile lands there.
        let _ = profile;
        Ok(IsolationLevel::Snapshot)
    }

    fn next_sequence_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT nextval('{sequence}')"))
    }
}
