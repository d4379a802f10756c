use std::sync::Arc;

use log::{debug, info, warn};

use crate::dialect::{Dialect, dialect_for};
use crate::driver::{DriverConnection, Statement, query_scalar};
use crate::error::DbError;
use crate::product::{ProductInfo, ProductVersion, SupportedDatabase};
use crate::value::Value;

/// Detected identity of a data source plus the dialect built for it.
///
/// Built once per context from a probe on the first opened connection;
/// immutable afterwards and shared by every component that needs
/// product-specific decisions.
#[derive(Clone)]
pub struct DataSourceInfo {
    info: ProductInfo,
    dialect: Arc<dyn Dialect>,
}

impl DataSourceInfo {
    pub fn product(&self) -> SupportedDatabase {
        self.info.product
    }

    pub fn version(&self) -> ProductVersion {
        self.info.version
    }

    pub fn raw_banner(&self) -> &str {
        &self.info.raw_banner
    }

    pub fn is_fallback(&self) -> bool {
        self.info.is_fallback
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    /// Construct without probing, for callers that already know the
    /// product (tests, fixed deployments).
    pub fn fixed(product: SupportedDatabase, version: ProductVersion) -> Self {
        Self {
            info: ProductInfo {
                product,
                version,
                raw_banner: String::new(),
                is_fallback: product == SupportedDatabase::Unknown,
            },
            dialect: dialect_for(product, version),
        }
    }

    /// Probe the connection and derive `(product, version, dialect)`.
    ///
    /// `declared` is the product implied by the configured provider name;
    /// the probe can still override it (a PostgreSQL wire connection may
    /// turn out to be CockroachDB). Fails with `DialectDetection` only when
    /// the probe itself throws; unrecognized banners yield the fallback
    /// dialect marked `is_fallback`.
    pub async fn detect(
        conn: &dyn DriverConnection,
        declared: SupportedDatabase,
    ) -> Result<Self, DbError> {
        let banner = match probe_banner(conn, declared).await {
            Ok(b) => b,
            Err(e) => {
                return Err(DbError::DialectDetection(
                    e.driver_error().cloned().unwrap_or_else(|| {
                        crate::error::DriverError::new(e.to_string())
                    }),
                ));
            }
        };

        let Some(banner) = banner else {
            warn!("version probe returned no rows; using fallback dialect");
            return Ok(Self::from_info(ProductInfo::unknown(String::new())));
        };

        let product = match classify_banner(&banner) {
            SupportedDatabase::Unknown => declared,
            classified => classified,
        };
        let version = ProductVersion::parse_banner(&banner).unwrap_or_default();

        if product == SupportedDatabase::Unknown {
            warn!("unrecognized version banner {banner:?}; using fallback dialect");
            return Ok(Self::from_info(ProductInfo::unknown(banner)));
        }

        if product != declared && declared != SupportedDatabase::Unknown {
            info!(
                "provider declared {} but probe identified {}",
                declared.display_name(),
                product.display_name()
            );
        }
        debug!(
            "detected {} {} from banner {:?}",
            product.display_name(),
            version,
            banner
        );

        Ok(Self::from_info(ProductInfo {
            product,
            version,
            raw_banner: banner,
            is_fallback: false,
        }))
    }

    fn from_info(info: ProductInfo) -> Self {
        let dialect = dialect_for(info.product, info.version);
        Self { info, dialect }
    }
}

async fn probe_banner(
    conn: &dyn DriverConnection,
    declared: SupportedDatabase,
) -> Result<Option<String>, DbError> {
    if let Some(hint) = conn.server_version_hint() {
        return Ok(Some(hint));
    }

    let probe = dialect_for(declared, ProductVersion::default()).version_probe();
    let statement = Statement::new(probe);
    match query_scalar(conn, &statement).await? {
        Some(Value::Text(banner)) => Ok(Some(banner)),
        Some(other) => Ok(Some(other.as_display_string())),
        None => Ok(None),
    }
}

/// Classify a version banner by its vendor fingerprint.
fn classify_banner(banner: &str) -> SupportedDatabase {
    // CockroachDB banners embed "PostgreSQL" for wire compatibility, so
    // the more specific fingerprints come first.
    if banner.contains("CockroachDB") {
        SupportedDatabase::CockroachDb
    } else if banner.contains("PostgreSQL") {
        SupportedDatabase::PostgreSql
    } else if banner.contains("Microsoft SQL Server") {
        SupportedDatabase::SqlServer
    } else if banner.contains("MariaDB") {
        SupportedDatabase::MariaDb
    } else if banner.contains("MySQL") {
        SupportedDatabase::MySql
    } else if banner.contains("Oracle") {
        SupportedDatabase::Oracle
    } else if banner.contains("DuckDB") || banner.starts_with('v') {
        SupportedDatabase::DuckDb
    } else if banner.contains("Firebird") {
        SupportedDatabase::Firebird
    } else if looks_like_sqlite_version(banner) {
        SupportedDatabase::Sqlite
    } else {
        SupportedDatabase::Unknown
    }
}

/// SQLite's probe returns a bare dotted version such as `3.45.1`.
fn looks_like_sqlite_version(banner: &str) -> bool {
    let trimmed = banner.trim();
    trimmed.starts_with("3.") && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_vendor_banners() {
        assert_eq!(
            classify_banner("PostgreSQL 16.2 on x86_64-pc-linux-gnu"),
            SupportedDatabase::PostgreSql
        );
        assert_eq!(
            classify_banner("CockroachDB CCL v23.1.11 (PostgreSQL 13 compatible)"),
            SupportedDatabase::CockroachDb
        );
        assert_eq!(
            classify_banner("10.11.6-MariaDB-log"),
            SupportedDatabase::MariaDb
        );
        assert_eq!(classify_banner("3.45.1"), SupportedDatabase::Sqlite);
        assert_eq!(classify_banner("v1.2.0 5f5512b827"), SupportedDatabase::DuckDb);
        assert_eq!(classify_banner("gibberish"), SupportedDatabase::Unknown);
    }

    #[test]
    fn fixed_info_skips_probe() {
        let info = DataSourceInfo::fixed(
            SupportedDatabase::Sqlite,
            ProductVersion::new(3, 45, 0),
        );
        assert_eq!(info.product(), SupportedDatabase::Sqlite);
        assert!(!info.is_fallback());
        assert_eq!(info.dialect().capabilities().max_parameters, 999);
    }
}
