use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Logical database type of a bound parameter or mapped column.
///
/// Mirrors the portable subset of provider type systems; each dialect maps
/// these onto its native types when rendering DDL-adjacent SQL or sizing
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DbType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float64,
    Decimal,
    #[default]
    Text,
    Binary,
    DateTime,
    Date,
    Time,
    Guid,
    Json,
}

impl DbType {
    /// Whether parameters of this type carry an explicit size on providers
    /// that require one (string and binary payloads).
    pub fn wants_explicit_size(&self) -> bool {
        matches!(self, DbType::Text | DbType::Binary | DbType::Json)
    }

    pub fn is_string_kind(&self) -> bool {
        matches!(self, DbType::Text | DbType::Json)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DbType::Int16 | DbType::Int32 | DbType::Int64 | DbType::Float64 | DbType::Decimal
        )
    }
}

/// Engine value type.
///
/// Custom enum instead of `serde_json::Value` so coercion, ordering, and
/// parameter binding stay type-aware without JSON round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// JSON stored as text for exact round-trip preservation.
    Json(String),
    /// Decimal stored as text to preserve exact precision.
    Decimal(String),
    /// Timestamp, always UTC.
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Guid(Uuid),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The natural `DbType` of this value, `Text` for null.
    pub fn natural_db_type(&self) -> DbType {
        match self {
            Value::Null | Value::Text(_) => DbType::Text,
            Value::Bool(_) => DbType::Boolean,
            Value::Int(_) => DbType::Int64,
            Value::Float(_) => DbType::Float64,
            Value::Bytes(_) => DbType::Binary,
            Value::Json(_) => DbType::Json,
            Value::Decimal(_) => DbType::Decimal,
            Value::DateTime(_) => DbType::DateTime,
            Value::Date(_) => DbType::Date,
            Value::Time(_) => DbType::Time,
            Value::Guid(_) => DbType::Guid,
        }
    }

    /// Byte length used when a dialect needs an explicit parameter size.
    /// Strings never report zero; drivers reject zero-sized parameters.
    pub fn declared_size(&self) -> usize {
        match self {
            Value::Text(s) | Value::Json(s) | Value::Decimal(s) => s.len().max(1),
            Value::Bytes(b) => b.len().max(1),
            _ => 0,
        }
    }

    pub fn as_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) | Value::Json(s) | Value::Decimal(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Guid(g) => g.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl Value {
    fn type_order(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Decimal(_) => 3,
            Value::Text(_) => 4,
            Value::Json(_) => 5,
            Value::DateTime(_) => 6,
            Value::Date(_) => 7,
            Value::Time(_) => 8,
            Value::Guid(_) => 9,
            Value::Bytes(_) => 10,
            Value::Null => 11,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;

        match (self, other) {
            // Nulls last (SQL standard behavior)
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Json(a), Json(b)) => a.cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (Guid(a), Guid(b)) => a.cmp(b),

            // Cross-type numeric promotion
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),

            _ => self.type_order().cmp(&other.type_order()),
        }
    }
}

impl Eq for Value {}
