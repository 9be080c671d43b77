//! Mapping between JSON payload values and SQLite storage values.
//!
//! # Invariants
//! - Booleans are stored as `0`/`1`.
//! - Datetimes are stored as UTC RFC 3339 text with millisecond precision, so
//!   text comparison orders them chronologically.

use crate::schema::field::ScalarType;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{Number, Value};

/// Converts one payload value into its stored form.
pub fn to_sql(ty: &ScalarType, value: &Value) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let mismatch = || format!("expected a {} value", ty.name());
    match ty {
        ScalarType::Int => value.as_i64().map(SqlValue::Integer).ok_or_else(mismatch),
        ScalarType::Float => value.as_f64().map(SqlValue::Real).ok_or_else(mismatch),
        ScalarType::Bool => value
            .as_bool()
            .map(|flag| SqlValue::Integer(i64::from(flag)))
            .ok_or_else(mismatch),
        ScalarType::DateTime => {
            let text = value.as_str().ok_or_else(mismatch)?;
            Ok(SqlValue::Text(normalize_datetime(text)?))
        }
        ScalarType::Str
        | ScalarType::Text
        | ScalarType::Enum(_)
        | ScalarType::Date
        | ScalarType::Uuid => value
            .as_str()
            .map(|text| SqlValue::Text(text.to_string()))
            .ok_or_else(mismatch),
    }
}

/// Decodes one stored value using the declared column type.
pub fn from_sql(ty: &ScalarType, value: SqlValue) -> Result<Value, String> {
    match (ty, value) {
        (_, SqlValue::Null) => Ok(Value::Null),
        (ScalarType::Int, SqlValue::Integer(number)) => Ok(Value::from(number)),
        (ScalarType::Float, SqlValue::Real(number)) => Number::from_f64(number)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite float `{number}`")),
        (ScalarType::Float, SqlValue::Integer(number)) => Number::from_f64(number as f64)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite float `{number}`")),
        (ScalarType::Bool, SqlValue::Integer(0)) => Ok(Value::Bool(false)),
        (ScalarType::Bool, SqlValue::Integer(1)) => Ok(Value::Bool(true)),
        (ty, SqlValue::Text(text)) if ty.is_textual() => Ok(Value::String(text)),
        (ty, other) => Err(format!(
            "stored {:?} does not decode as {}",
            other.data_type(),
            ty.name()
        )),
    }
}

/// Canonical textual form of a key, used in synthetic keys and error messages.
pub fn key_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Compares two payload values the way storage would.
pub fn same_value(ty: &ScalarType, left: &Value, right: &Value, case_insensitive: bool) -> bool {
    match (to_sql(ty, left), to_sql(ty, right)) {
        (Ok(SqlValue::Text(left)), Ok(SqlValue::Text(right))) if case_insensitive => {
            left.to_lowercase() == right.to_lowercase()
        }
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

/// Current time in the stored datetime form.
pub fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn normalize_datetime(text: &str) -> Result<String, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|moment| {
            moment
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        })
        .map_err(|err| format!("invalid datetime `{text}`: {err}"))
}
