use serde::{Deserialize, Serialize};

/// Relational products the engine can speak to.
///
/// `Unknown` is a first-class member: detection that returns unrecognized
/// but well-formed data maps to it, and the fallback dialect keeps every
/// optional capability disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportedDatabase {
    SqlServer,
    PostgreSql,
    Oracle,
    MySql,
    MariaDb,
    Sqlite,
    Firebird,
    CockroachDb,
    DuckDb,
    Unknown,
}

impl SupportedDatabase {
    pub fn display_name(&self) -> &'static str {
        match self {
            SupportedDatabase::SqlServer => "SQL Server",
            SupportedDatabase::PostgreSql => "PostgreSQL",
            SupportedDatabase::Oracle => "Oracle",
            SupportedDatabase::MySql => "MySQL",
            SupportedDatabase::MariaDb => "MariaDB",
            SupportedDatabase::Sqlite => "SQLite",
            SupportedDatabase::Firebird => "Firebird",
            SupportedDatabase::CockroachDb => "CockroachDB",
            SupportedDatabase::DuckDb => "DuckDB",
            SupportedDatabase::Unknown => "Unknown",
        }
    }

    /// Map a provider invariant name (driver key) to a product.
    ///
    /// Matching is substring-based and case-insensitive because provider
    /// names in the wild carry versions and vendor prefixes
    /// (`Npgsql`, `MySql.Data`, `Microsoft.Data.SqlClient`, ...).
    pub fn from_provider_name(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        // Order matters: "mariadb" contains no "mysql", but cockroach
        // connection strings often mention postgres wire compat.
        if lowered.contains("cockroach") {
            SupportedDatabase::CockroachDb
        } else if lowered.contains("sqlserver")
            || lowered.contains("sqlclient")
            || lowered.contains("mssql")
        {
            SupportedDatabase::SqlServer
        } else if lowered.contains("npgsql") || lowered.contains("postgres") {
            SupportedDatabase::PostgreSql
        } else if lowered.contains("oracle") {
            SupportedDatabase::Oracle
        } else if lowered.contains("mariadb") {
            SupportedDatabase::MariaDb
        } else if lowered.contains("mysql") {
            SupportedDatabase::MySql
        } else if lowered.contains("sqlite") {
            SupportedDatabase::Sqlite
        } else if lowered.contains("firebird") || lowered.contains("fbclient") {
            SupportedDatabase::Firebird
        } else if lowered.contains("duckdb") {
            SupportedDatabase::DuckDb
        } else {
            SupportedDatabase::Unknown
        }
    }
}

/// Parsed product version, zero-filled when components are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProductVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract the first dotted version triplet from free-form banner text.
    ///
    /// Version probes return strings like
    /// `PostgreSQL 16.2 on x86_64-pc-linux-gnu` or
    /// `Microsoft SQL Server 2022 (RTM) - 16.0.1000.6`; this scans for the
    /// first digit run and consumes up to three dot-separated components.
    pub fn parse_banner(banner: &str) -> Option<Self> {
        let start = banner.find(|c: char| c.is_ascii_digit())?;
        let tail = &banner[start..];

        let mut parts = [0u32; 3];
        let mut idx = 0;
        let mut current = String::new();

        for c in tail.chars() {
            if c.is_ascii_digit() {
                current.push(c);
            } else if c == '.' && !current.is_empty() && idx < 2 {
                parts[idx] = current.parse().ok()?;
                current.clear();
                idx += 1;
            } else {
                break;
            }
        }
        if !current.is_empty() {
            parts[idx] = current.parse().ok()?;
        } else if idx == 0 {
            return None;
        }

        Some(Self::new(parts[0], parts[1], parts[2]))
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome of product detection: what we connected to, as reported by the
/// probe, plus whether the resulting dialect is a conservative fallback.
#[derive(Debug, Clone)]
pub struct ProductInfo {
    pub product: SupportedDatabase,
    pub version: ProductVersion,
    pub raw_banner: String,
    pub is_fallback: bool,
}

impl ProductInfo {
    pub fn unknown(banner: impl Into<String>) -> Self {
        Self {
            product: SupportedDatabase::Unknown,
            version: ProductVersion::default(),
            raw_banner: banner.into(),
            is_fallback: true,
        }
    }
}
