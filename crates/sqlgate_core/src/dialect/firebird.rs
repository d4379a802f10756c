use super::{Dialect, DialectCapabilities, DialectFeatures, SqlFeatureTier};
use crate::error::DbError;
use crate::modes::{GeneratedKeyPlan, IsolationLevel, IsolationProfile, ProcWrappingStyle};
use crate::product::{ProductVersion, SupportedDatabase};

static FIREBIRD_CAPS: DialectCapabilities = DialectCapabilities {
    parameter_marker: "?",
    supports_named_parameters: false,
    max_parameters: 1_499,
    name_max_len: 31,
    name_pattern: "^[A-Za-z][A-Za-z0-9_$]*$",
    quote_prefix: "\"",
    quote_suffix: "\"",
    composite_separator: '.',
    prepare_statements: true,
    proc_wrapping_style: ProcWrappingStyle::ExecuteProcedure,
    features: DialectFeatures::MERGE
        .union(DialectFeatures::RETURNING)
        .union(DialectFeatures::SAVEPOINTS)
        .union(DialectFeatures::WINDOW_FUNCTIONS)
        .union(DialectFeatures::COMMON_TABLE_EXPRESSIONS)
        .union(DialectFeatures::UNIQUE_VIOLATION_DETECTION)
        .union(DialectFeatures::SEQUENCES),
    feature_tier: SqlFeatureTier::Sql2008,
    last_insert_id_query: None,
    supported_isolation: &[
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ],
};

pub struct FirebirdDialect {
    version: ProductVersion,
}

impl FirebirdDialect {
    pub fn new(version: ProductVersion) -> Self {
        Self { version }
    }
}

impl Dialect for FirebirdDialect {
    fn product(&self) -> SupportedDatabase {
        SupportedDatabase::Firebird
    }

    fn version(&self) -> ProductVersion {
        self.version
    }

    fn capabilities(&self) -> &DialectCapabilities {
        &FIREBIRD_CAPS
    }

    fn version_probe(&self) -> &'static str {
        "SELECT rdb$get_context('SYSTEM', 'ENGINE_VERSION') FROM rdb$database"
    }

    fn generated_key_plan(&self) -> GeneratedKeyPlan {
        GeneratedKeyPlan::Returning
    }

    fn is_unique_violation(&self, error: &DbError) -> bool {
        let Some(e) = error.driver_error() else {
            return false;
        };
        // 335544665 = unique_key_violation gdscode.
        e.code.as_deref() == Some("335544665")
            || e.message.contains("violation of PRIMARY or UNIQUE KEY constraint")
    }

    fn resolve_isolation(&self, profile: IsolationProfile) -> Result<IsolationLevel, DbError> {
        match profile {
            // Multi-generational architecture: readers never block.
            IsolationProfile::SafeNonBlockingReads | IsolationProfile::FastWithRisks => {
                Ok(IsolationLevel::ReadCommitted)
            }
            IsolationProfile::StrictConsistency => Ok(IsolationLevel::Serializable),
        }
    }

    fn next_sequence_value_sql(&self, sequence: &str) -> Option<String> {
        Some(format!("SELECT NEXT VALUE FOR {sequence} FROM rdb$database"))
    }

    fn dual_clause(&self) -> &'static str {
        " FROM rdb$database"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_plan() {
        let d = FirebirdDialect::new(ProductVersion::new(4, 0, 0));
        assert_eq!(d.generated_key_plan(), GeneratedKeyPlan::Returning);
    }

    #[test]
    fn execute_procedure_wrapping() {
        let d = FirebirdDialect::new(ProductVersion::new(4, 0, 0));
        let sql = d
            .wrap_procedure_call(
                "sync_users",
                &["?".into()],
                crate::modes::ExecutionType::Write,
            )
            .unwrap();
        assert_eq!(sql, "EXECUTE PROCEDURE \"sync_users\"(?)");
    }

    #[test]
    fn gdscode_classification() {
        let d = FirebirdDialect::new(ProductVersion::new(4, 0, 0));
        let err = DbError::Driver(
            crate::error::DriverError::new("violation of PRIMARY or UNIQUE KEY constraint"),
        );
        assert!(d.is_unique_violation(&err));
    }
}
