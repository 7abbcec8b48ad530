//! SQL type definitions and type-specific equality.

use crate::value::{Value, normalize_decimal};
use serde::{Deserialize, Serialize};

/// SQL data types understood by the mapping layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    VarChar(u32),
    Text,

    // Binary
    Blob,

    // Date/time types
    Date,
    Timestamp,

    // UUID
    Uuid,

    // JSON
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integral(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }

    /// Check if this type is text-based.
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::VarChar(_) | SqlType::Text)
    }

    /// Whether `value` can be stored in a column of this type.
    ///
    /// NULL is accepted everywhere; nullability is a mapping concern.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => value.as_i64().is_some(),
            SqlType::Double => value.as_f64().is_some(),
            SqlType::Decimal { .. } => {
                matches!(value, Value::Decimal(_)) || value.as_f64().is_some()
            }
            SqlType::Boolean => matches!(value, Value::Bool(_)),
            SqlType::VarChar(_) | SqlType::Text => matches!(value, Value::Text(_)),
            SqlType::Blob => matches!(value, Value::Bytes(_)),
            SqlType::Date => matches!(value, Value::Date(_)),
            SqlType::Timestamp => matches!(value, Value::Timestamp(_)),
            SqlType::Uuid => matches!(value, Value::Uuid(_)),
            SqlType::Json => matches!(value, Value::Json(_)),
        }
    }

    /// Compare two values the way this column type defines equality.
    ///
    /// Integers compare numerically regardless of width, decimals compare by
    /// canonical form (`1.50 == 1.5`), doubles treat NaN as equal to NaN, and
    /// JSON compares structurally.
    pub fn is_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => return true,
            (Value::Null, _) | (_, Value::Null) => return false,
            _ => {}
        }
        match self {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => {
                match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => a == b,
                }
            }
            SqlType::Double => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
                _ => a == b,
            },
            SqlType::Decimal { .. } => decimal_text(a)
                .zip(decimal_text(b))
                .map_or_else(|| a == b, |(x, y)| x == y),
            SqlType::Boolean => match (a.as_bool(), b.as_bool()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            SqlType::VarChar(_) | SqlType::Text => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            SqlType::Blob | SqlType::Uuid => match (a.as_bytes(), b.as_bytes()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            SqlType::Date | SqlType::Timestamp | SqlType::Json => a == b,
        }
    }
}

fn decimal_text(value: &Value) -> Option<String> {
    match value {
        Value::Decimal(s) => Some(normalize_decimal(s)),
        Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            value.as_i64().map(|v| v.to_string())
        }
        Value::Double(v) => Some(normalize_decimal(&v.to_string())),
        _ => None,
    }
}
