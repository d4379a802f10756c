use super::{Dialect, DialectCapabilities, DialectFeatures, PreamblePlan, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static SQLITE_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "?",
    supports_named_parameters: false,
    max_parameters: 999,
    name_max_len: 255,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::None,
    features: DialectFeatures::INSERT_ON_CONFLICT
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT)
        .union(DialectFeatures::RETURNING),
    feature_tier: SqlFeatureTier::Sql2016,
    last_insert_id_query: Some("SELECT last_insert_rowid()"),
    supported_isolation: &[IsolationLevel::ReadUncommitted, IsolationLevel::Serializable],
};

/// Capabilities for SQLite builds older than 3.35 (no RETURNING).
static SQLITE_LEGACY_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "?",
    supports_named_parameters: false,
    max_parameters: 999,
    name_max_len: 255,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::None,
    features: DialectFeatures::INSERT_ON_CONFLICT
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT),
    feature_tier: SqlFeatureTier::Sql2008,
    last_insert_id_query: Some("SELECT last_insert_rowid()"),
    supported_isolation: &[IsolationLevel::ReadUncommitted, IsolationLevel::Serializable],
};

pub struct SqliteDialect {
    version: ProductVersion,
}

impl SqliteDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }

    fn has_returning(&self) -> bool {
        self.version.at_least(3, 35)
    }
}

impl Dialect for SqliteDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::Sqlite
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        if self.has_returning() {
            &SQLITE_CAPS
        } else {
            &SQLITE_LEGACY_CAPS
        }
    }

    fn version_probe(&self) -> &'static str {
        "SELECT sqlite_version()"
    }

    fn session_preamble_plan(&self, _read_only: bool) -> PreamblePlan {
        PreamblePlan::Static("PRAGMA foreign_keys = ON;".to_string())
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        if self.has_returning() {
            GeneratedKeyPlan::Returning
        } else {
            GeneratedKeyPlan::SessionScopedFunction
        }
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        let Some(e) = error.driver_error() else {
            return false;
        };
        // 2067 = SQLITE_CONSTRAINT_UNIQUE, 1555 = SQLITE_CONSTRAINT_PRIMARYKEY.
        e.code.as_deref() == Some("2067")
            || e.code.as_deref() == Some("1555")
            || e.message.contains("UNIQUE constraint failed")
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            // WAL readers see a stable snapshot; everything is serializable.
            IsolationProfile::SafeNonBlockingReads | IsolationProfile::StrictConsistency => {
                Ok(IsolationLevel::Serializable)
            }
            IsolationProfile::FastWithRisks => Ok(IsolationLevel::ReadUncommitted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_gated_on_version() {
        let modern = SqliteDialect::new(ProductVersion::new(3, 45, 0));
        let legacy = SqliteDialect::new(ProductVersion::new(3, 31, 0));
        assert_eq!(modern.generated_key_plan(), GeneratedKeyPlan::Returning);
        assert_eq!(
            legacy.generated_key_plan(),
            GeneratedKeyPlan::SessionScopedFunction
        );
        assert!(!legacy.capabilities().supports(DialectFeatures::RETURNING));
    }

    #[test]
    fn parameter_cap_is_999() {
        let d = SqliteDialect::new(ProductVersion::new(3, 45, 0));
        assert_eq!(d.capabilities().max_parameters, 999);
        assert_eq!(d.capabilities().parameter_budget(), 899);
    }

    #[test]
    fn unique_violation_by_message() {
        let d = SqliteDialect::new(ProductVersion::new(3, 45, 0));
        let err = DbError::Driver(crate::error::DriverError::new(
            "UNIQUE constraint failed: users.username",
        ));
        assert!(d.is_unique_violation(&err));
    }

    #[test]
    fn foreign_keys_pragma_preamble() {
        let d = SqliteDialect::new(ProductVersion::new(3, 45, 0));
        match d.session_preamble_plan(false) {
            PreamblePlan::Static(sql) => assert_eq!(sql, "PRAGMA foreign_keys = ON;"),
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
