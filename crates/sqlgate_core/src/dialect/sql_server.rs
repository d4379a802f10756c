use super::{Dialect, DialectCapabilities, DialectFeatures, PreamblePlan, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static SQL_SERVER_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "@",
    supports_named_parameters: true,
    max_parameters: 2_100,
    name_max_len: 128,
    name_pattern: "^[A-Za-z][A-Za-z0-9_]*$",
    quote_prefix: "[",
    quote_suffix: "]",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::Exec,
    features: DialectFeatures::MERGE
        .union(DialectFeatures::OUTPUT_INSERTED)
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::JSON_TYPES)
        .union(DialectFeatures::XML_TYPES)
        .union(DialectFeatures::TEMPORAL_TABLES)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::MULTI_ROW_INSERT)
        .union(DialectFeatures::SEQUENCES)
        .union(DialectFeatures::READ_COMMITTED_SNAPSHOT),
    feature_tier: SqlFeatureTier::Modern,
    last_insert_id_query: Some("SELECT SCOPE_IDENTITY()"),
    supported_isolation: &[
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ],
};

/// Session options the engine requires, in the order DBCC USEROPTIONS
/// reports them. Only diverging options are SET on first open.
static REQUIRED_SESSION_OPTIONS: &[(&str, &str)] = &[
    ("ANSI_NULLS", "ON"),
    ("ANSI_PADDING", "ON"),
    ("ANSI_WARNINGS", "ON"),
    ("ARITHABORT", "ON"),
    ("CONCAT_NULL_YIELDS_NULL", "ON"),
    ("QUOTED_IDENTIFIER", "ON"),
    ("NUMERIC_ROUNDABORT", "OFF"),
];

pub struct SqlServerDialect {
    version: ProductVersion,
}

impl SqlServerDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }
}

impl Dialect for SqlServerDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::SqlServer
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &SQL_SERVER_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT @@VERSION"
    }

    fn session_preamble_plan(&self, _read_only: bool) -> PreamblePlan {
        PreamblePlan::DivergenceProbe {
            probe: "DBCC USEROPTIONS",
            required: REQUIRED_SESSION_OPTIONS,
        }
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::OutputInserted
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        error
            .driver_error()
            .and_then(|e| e.code.as_deref())
            .is_some_and(|code| code == "2627" || code == "2601")
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            IsolationProfile::SafeNonBlockingReads => Ok(IsolationLevel::Snapshot),
            IsolationProfile::StrictConsistency => Ok(IsolationLevel::Serializable),
            IsolationProfile::FastWithRisks => Ok(IsolationLevel::ReadUncommitted),
        }
    }

    // T-SQL savepoints have their own verbs and no RELEASE.
    fn create_savepoint_sql(&self, name: &str) -> String {
        format!("SAVE TRANSACTION {}", self.wrap_identifier(name))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TRANSACTION {}", self.wrap_identifier(name))
    }

    fn release_savepoint_sql(&self, _name: &str) -> Option<String> {
        None
    }

    fn next_sequence_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT NEXT VALUE FOR {sequence}"))
    }

    fn merge_terminator(&self) -> &'static str {
        ";"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mssql() -> SqlServerDialect {
        SqlServerDialect::new(ProductVersion::new(16, 0, 0))
    }

    #[test]
    fn bracket_quoting() {
        assert_eq!(mssql().wrap_identifier("dbo.t"), "[dbo].[t]");
        assert_eq!(mssql().wrap_identifier("[dbo].[t]"), "[dbo].[t]");
    }

    #[test]
    fn named_at_markers() {
        assert_eq!(mssql().parameter_marker_at(0, "i0"), "@i0");
    }

    #[test]
    fn preamble_is_divergence_probe() {
        match mssql().session_preamble_plan(false) {
            PreamblePlan::DivergenceProbe { probe, required } => {
                assert_eq!(probe, "DBCC USEROPTIONS");
                assert!(required.contains(&("ARITHABORT", "ON")));
                assert!(required.contains(&("NUMERIC_ROUNDABORT", "OFF")));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn unique_violation_codes() {
        let d = mssql();
        for code in ["2627", "2601"] {
            let err = DbError::Driver(
                crate::error::DriverError::new("Violation of UNIQUE KEY constraint")
                    .with_code(code),
            );
            assert!(d.is_unique_violation(&err));
        }
    }

    #[test]
    fn exec_wrapping() {
        let sql = mssql()
            .wrap_procedure_call(
                "dbo.sync_users",
                &["@p0".into(), "@p1".into()],
                crate::modes::ExecutionType::Write,
            )
            .unwrap();
        assert_eq!(sql, "EXEC [dbo].[sync_users] @p0, @p1");
    }

    #[test]
    fn snapshot_for_safe_reads() {
        assert_eq!(
            mssql()
                .resolve_isolation(IsolationProfile::SafeNonBlockingReads)
                .unwrap(),
            IsolationLevel::Snapshot
        );
    }
}
