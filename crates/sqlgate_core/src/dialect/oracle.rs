use super::{Dialect, DialectCapabilities, DialectFeatures, PreamblePlan, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static ORACLE_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: ":",
    supports_named_parameters: true,
    max_parameters: 32_767,
    name_max_len: 30,
    name_pattern: "^[A-Za-z][A-Za-z0-9_#$]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::OracleBlock,
    features: DialectFeatures::MERGE
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::XML_TYPES)
        .union(DialectFeatures::TEMPORAL_TABLES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::SEQUENCES)
        .union(DialectFeatures::READ_COMMITTED_SNAPSHOT),
    feature_tier: SqlFeatureTier::Modern,
    last_insert_id_query: None,
    supported_isolation: &[IsolationLevel::ReadCommitted, IsolationLevel::Serializable],
};

pub struct OracleDialect {
    version: ProductVersion,
}

impl OracleDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }
}

impl Dialect for OracleDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::Oracle
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &ORACLE_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT banner FROM v$version WHERE ROWNUM = 1"
    }

    fn session_preamble_plan(&self, _read_only: bool) -> PreamblePlan {
        PreamblePlan::Static(
            "ALTER SESSION SET NLS_DATE_FORMAT = 'YYYY-MM-DD'".to_string(),
        )
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::PrefetchSequence
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        let Some(e) = error.driver_error() else {
            return false;
        };
        e.code.as_deref() == Some("1") || e.message.contains("ORA-00001")
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            // Oracle readers never block; READ COMMITTED is already
            // statement-level snapshot.
            IsolationProfile::SafeNonBlockingReads | IsolationProfile::FastWithRisks => {
                Ok(IsolationLevel::ReadCommitted)
            }
            IsolationProfile::StrictConsistency => Ok(IsolationLevel::Serializable),
        }
    }

    fn release_savepoint_sql(&self, _name: &str) -> Option<String> {
        // Savepoints vanish at commit; Oracle has no RELEASE statement.
        None
    }

    fn next_sequence_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT {sequence}.NEXTVAL FROM DUAL"))
    }

    fn dual_clause(&self) -> &'static str {
        " FROM DUAL"
    }
}
