use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::value::{DbType, Value};

/// Normalize a driver-sourced value into the representation a target
/// `DbType` expects. Pure; no I/O.
///
/// Null is universal: any source null maps to null regardless of target.
pub fn coerce(value: Value, target: DbType) -> Result<Value, DbError> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match target {
        DbType::Boolean => coerce_bool(value).map(Value::Bool),
        DbType::Int16 | DbType::Int32 | DbType::Int64 => coerce_int(value).map(Value::Int),
        DbType::Float64 => coerce_float(value).map(Value::Float),
        DbType::Decimal => match value {
            Value::Decimal(_) => Ok(value),
            Value::Int(i) => Ok(Value::Decimal(i.to_string())),
            Value::Float(f) => Ok(Value::Decimal(f.to_string())),
            Value::Text(s) => Ok(Value::Decimal(s)),
            other => Err(invalid(&other, "decimal")),
        },
        DbType::Text => match value {
            Value::Text(_) => Ok(value),
            other => Ok(Value::Text(other.as_display_string())),
        },
        DbType::Binary => match value {
            Value::Bytes(_) => Ok(value),
            other => Err(invalid(&other, "binary")),
        },
        DbType::DateTime => coerce_datetime(value).map(Value::DateTime),
        DbType::Date => coerce_date(value).map(Value::Date),
        DbType::Time => coerce_time(value).map(Value::Time),
        DbType::Guid => coerce_guid(value).map(Value::Guid),
        DbType::Json => match value {
            Value::Json(_) => Ok(value),
            Value::Text(s) => Ok(Value::Json(s)),
            other => Err(invalid(&other, "json")),
        },
    }
}

fn invalid(value: &Value, target: &str) -> DbError {
    DbError::invalid_value(format!(
        "cannot convert {value:?} to {target}"
    ))
}

/// Booleans accept native bools, 0/1 integers, and the strings
/// {"true","1"} / {"false","0"} case-insensitively. Anything else fails.
fn coerce_bool(value: Value) -> Result<bool, DbError> {
    match value {
        Value::Bool(b) => Ok(b),
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(DbError::invalid_value(format!(
                "cannot convert string {s:?} to boolean"
            ))),
        },
        other => Err(invalid(&other, "boolean")),
    }
}

fn coerce_int(value: Value) -> Result<i64, DbError> {
    match value {
        Value::Int(i) => Ok(i),
        Value::Bool(b) => Ok(b as i64),
        Value::Float(f) if f.fract() == 0.0 => Ok(f as i64),
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| DbError::invalid_value(format!("cannot convert string {s:?} to integer"))),
        Value::Decimal(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| DbError::invalid_value(format!("cannot convert decimal {s:?} to integer"))),
        other => Err(invalid(&other, "integer")),
    }
}

fn coerce_float(value: Value) -> Result<f64, DbError> {
    match value {
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        Value::Text(s) | Value::Decimal(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| DbError::invalid_value(format!("cannot convert string {s:?} to float"))),
        other => Err(invalid(&other, "float")),
    }
}

/// DateTimes parse from ISO-8601 text; the result is always UTC.
fn coerce_datetime(value: Value) -> Result<DateTime<Utc>, DbError> {
    match value {
        Value::DateTime(dt) => Ok(dt),
        Value::Text(s) => {
            let trimmed = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Ok(dt.with_timezone(&Utc));
            }
            // Timestamps without an offset are taken as UTC.
            if let Ok(naive) =
                chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            {
                return Ok(naive.and_utc());
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
            {
                return Ok(naive.and_utc());
            }
            Err(DbError::invalid_value(format!(
                "cannot parse {trimmed:?} as an ISO-8601 timestamp"
            )))
        }
        other => Err(invalid(&other, "datetime")),
    }
}

fn coerce_date(value: Value) -> Result<NaiveDate, DbError> {
    match value {
        Value::Date(d) => Ok(d),
        Value::DateTime(dt) => Ok(dt.date_naive()),
        Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| DbError::invalid_value(format!("cannot parse {s:?} as a date"))),
        other => Err(invalid(&other, "date")),
    }
}

fn coerce_time(value: Value) -> Result<NaiveTime, DbError> {
    match value {
        Value::Time(t) => Ok(t),
        Value::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
            .map_err(|_| DbError::invalid_value(format!("cannot parse {s:?} as a time"))),
        other => Err(invalid(&other, "time")),
    }
}

/// GUIDs accept 16-byte binary and canonical/hyphenless text.
fn coerce_guid(value: Value) -> Result<Uuid, DbError> {
    match value {
        Value::Guid(g) => Ok(g),
        Value::Bytes(b) => {
            let bytes: [u8; 16] = b.as_slice().try_into().map_err(|_| {
                DbError::invalid_value(format!("guid binary must be 16 bytes, got {}", b.len()))
            })?;
            Ok(Uuid::from_bytes(bytes))
        }
        Value::Text(s) => Uuid::parse_str(s.trim())
            .map_err(|_| DbError::invalid_value(format!("cannot parse {s:?} as a guid"))),
        other => Err(invalid(&other, "guid")),
    }
}

/// Typed extraction from an engine value, used by scalar execution.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, DbError>;
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        coerce_int(value)
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        let wide = coerce_int(value)?;
        i32::try_from(wide)
            .map_err(|_| DbError::invalid_value(format!("{wide} does not fit in i32")))
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        let wide = coerce_int(value)?;
        u64::try_from(wide)
            .map_err(|_| DbError::invalid_value(format!("{wide} does not fit in u64")))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        coerce_float(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, DbError> {
        coerce_bool(value)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Null => Err(DbError::invalid_value("null cannot convert to String")),
            other => Ok(other.as_display_string()),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Result<Self, DbError> {
        coerce_guid(value)
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        coerce_datetime(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
