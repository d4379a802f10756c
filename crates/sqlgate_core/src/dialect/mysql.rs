use super::{Dialect, DialectCapabilities, DialectFeatures, PreamblePlan, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static MYSQL_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "?",
    supports_named_parameters: false,
    max_parameters: 65_535,
    name_max_len: 64,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "`",
    quote_suffix: "`",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::Call,
    features: DialectFeatures::ON_DUPLICATE_KEY
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT),
    feature_tier: SqlFeatureTier::Sql2016,
    last_insert_id_query: Some("SELECT LAST_INSERT_ID()"),
    supported_isolation: &[
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ],
};

/// MySQL dialect; also serves MariaDB, which shares the wire surface and
/// the strict-mode preamble.
pub struct MySqlDialect {
    product: SupportedDatabase,
    version: ProductVersion,
}

impl MySqlDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self {
            product: SupportedDatabase::MySql,
            version,
        }
    }

    pub fn mariadb(version: ProductVersion) -> Self {
        Self {
            product: SupportedDatabase::MariaDb,
            version,
        }
    }
}

impl Dialect for MySqlDialect {
    fn product(&self) -> SupportedDatabase {
        self.product
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &MYSQL_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT VERSION()"
    }

    fn session_preamble_plan(&self, _read_only: bool) -> PreamblePlan {
        // ANSI_QUOTES keeps double-quoted identifiers portable; strict mode
        // turns silent truncation into errors.
        PreamblePlan::Static(
            "SET SESSION sql_mode = 'STRICT_ALL_TABLES,ANSI_QUOTES,NO_ENGINE_SUBSTITUTION';"
                .to_string(),
        )
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::SessionScopedFunction
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        let Some(e) = error.driver_error() else {
            return false;
        };
        e.code.as_deref() == Some("1062")
            || (e.sqlstate.as_deref() == Some("23000") && e.message.contains("Duplicate entry"))
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            // InnoDB consistent reads are snapshot-based at READ COMMITTED.
            IsolationProfile::SafeNonBlockingReads => Ok(IsolationLevel::ReadCommitted),
            IsolationProfile::StrictConsistency => Ok(IsolationLevel::Serializable),
            IsolationProfile::FastWithRisks => Ok(IsolationLevel::ReadUncommitted),
        }
    }

    // Backslash is an escape character even inside single quotes unless
    // NO_BACKSLASH_ESCAPES is active; double both.
    fn escape_string(&self, s: &str) -> String {
        s.replace('\\', "\\\\").replace('\'', "''")
    }
}
