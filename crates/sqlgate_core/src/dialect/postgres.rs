use super::{Dialect, DialectCapabilities, DialectFeatures, PreamblePlan, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static POSTGRES_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "$",
    // Parameters are strictly positional ($1, $2, ...).
    supports_named_parameters: false,
    max_parameters: 65_535,
    name_max_len: 63,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::PostgreSqlCall,
    features: DialectFeatures::INSERT_ON_CONFLICT
        .union(DialectFeatures::RETURNING)
        .union(DialectFeatures::MERGE)
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::ARRAY_TYPES)
        .union(DialectFeatures::XML_TYPES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT)
        .union(DialectFeatures::SEQUENCES),
    feature_tier: SqlFeatureTier::Modern,
    last_insert_id_query: None,
    supported_isolation: &[
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ],
};

/// PostgreSQL dialect; also serves CockroachDB, whose SQL surface is the
/// PostgreSQL wire dialect with snapshot-based serializable reads.
pub struct PostgresDialect {
    product: SupportedDatabase,
    version: ProductVersion,
    search_path: Option<String>,
    rcsi_enabled: bool,
}

impl PostgresDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self {
            product: SupportedDatabase::PostgreSql,
            version,
            search_path: None,
            rcsi_enabled: false,
        }
    }

    pub fn cockroach(version: ProductVersion) -> Self {
        Self {
            product: SupportedDatabase::CockroachDb,
            version,
            search_path: None,
            // CockroachDB reads are always snapshot-based.
            rcsi_enabled: true,
        }
    }

    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Mark read-committed snapshot behaviour as verified for this data
    /// source, unlocking the `SafeNonBlockingReads` profile.
    pub fn with_rcsi(mut self, enabled: bool) -> Self {
        self.rcsi_enabled = enabled;
        self
    }
}

impl Dialect for PostgresDialect {
    fn product(&self) -> SupportedDatabase {
        self.product
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &POSTGRES_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT version()"
    }

    fn parameter_marker_at(&self, ordinal: usize, _name: &str) -> String {
        format!("${}", ordinal + 1)
    }

    fn session_preamble_plan(&self, read_only: bool) -> PreamblePlan {
        let mut sql = String::from(
            "SET standard_conforming_strings = on;\nSET client_min_messages = warning;",
        );
        if let Some(path) = &self.search_path {
            sql.push_str(&format!("\nSET search_path = {path};"));
        }
        if read_only {
            sql.push_str("\nSET default_transaction_read_only = on;");
        }
        PreamblePlan::Static(sql)
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::Returning
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        error
            .driver_error()
            .and_then(|e| e.sqlstate.as_deref())
            .is_some_and(|state| state == "23505")
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            IsolationProfile::SafeNonBlockingReads => {
                if self.rcsi_enabled {
                    Ok(IsolationLevel::ReadCommitted)
                } else {
                    // Must not silently degrade to blocking read-committed.
                    Err(DbError::UnsupportedIsolation {
                        product: self.product,
                        level: IsolationLevel::ReadCommitted,
                        detail: Some("RcsiNotEnabled".to_string()),
                    })
                }
            }
            IsolationProfile::StrictConsistency => Ok(IsolationLevel::Serializable),
            IsolationProfile::FastWithRisks => Ok(IsolationLevel::ReadCommitted),
        }
    }

    fn next_sequence_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT nextval('{sequence}')"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> PostgresDialect {
        PostgresDialect::new(ProductVersion::new(16, 2, 0))
    }

    #[test]
    fn positional_dollar_markers() {
        let d = pg();
        assert_eq!(d.parameter_marker_at(0, "i0"), "$1");
        assert_eq!(d.parameter_marker_at(4, "w2"), "$5");
    }

    #[test]
    fn double_quote_wrapping() {
        assert_eq!(pg().wrap_identifier("users"), "\"users\"");
        assert_eq!(pg().wrap_identifier("\"users\""), "\"users\"");
    }

    #[test]
    fn unique_violation_by_sqlstate() {
        let d = pg();
        let dup = DbError::Driver(
            crate::error::DriverError::new("duplicate key value").with_sqlstate("23505"),
        );
        let other = DbError::Driver(
            crate::error::DriverError::new("deadlock detected").with_sqlstate("40P01"),
        );
        assert!(d.is_unique_violation(&dup));
        assert!(!d.is_unique_violation(&other));
    }

    #[test]
    fn safe_profile_requires_rcsi() {
        let err = pg()
            .resolve_isolation(IsolationProfile::SafeNonBlockingReads)
            .unwrap_err();
        match err {
            DbError::UnsupportedIsolation { detail, .. } => {
                assert_eq!(detail.as_deref(), Some("RcsiNotEnabled"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let d = pg().with_rcsi(true);
        assert_eq!(
            d.resolve_isolation(IsolationProfile::SafeNonBlockingReads).unwrap(),
            IsolationLevel::ReadCommitted
        );
    }

    #[test]
    fn cockroach_allows_safe_reads() {
        let d = PostgresDialect::cockroach(ProductVersion::new(23, 1, 0));
        assert_eq!(d.product(), SupportedDatabase::CockroachDb);
        assert!(d.resolve_isolation(IsolationProfile::SafeNonBlockingReads).is_ok());
    }

    #[test]
    fn preamble_includes_read_only_flag() {
        match pg().session_preamble_plan(true) {
            PreamblePlan::Static(sql) => {
                assert!(sql.contains("standard_conforming_strings"));
                assert!(sql.contains("default_transaction_read_only"));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
