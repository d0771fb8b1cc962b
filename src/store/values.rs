//! Conversion between JSON field values and stored SQL values
//!
//! Datetimes are stored as milliseconds since the Unix epoch. RFC 3339
//! strings and plain `YYYY-MM-DD` dates are accepted on the way in and
//! come back out as RFC 3339 UTC strings.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

use crate::schema::FieldType;

/// Convert a field value to the value stored in its column
pub fn to_sql_value(field_type: FieldType, value: &Value) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    match field_type {
        FieldType::Int => to_integer(value).map(SqlValue::Integer),
        FieldType::Bool => match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            other => to_integer(other).map(|i| SqlValue::Integer(i64::from(i != 0))),
        },
        FieldType::Datetime => match value {
            Value::String(s) => parse_datetime(s).map(SqlValue::Integer),
            other => to_integer(other).map(SqlValue::Integer),
        },
        FieldType::String
        | FieldType::Attachment
        | FieldType::Userid
        | FieldType::Reference => Ok(SqlValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    }
}

/// Convert a stored value back to a field value
pub fn from_sql_value(field_type: Option<FieldType>, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match field_type {
            Some(FieldType::Bool) => Value::Bool(i != 0),
            Some(FieldType::Datetime) => format_datetime(i),
            _ => Value::from(i),
        },
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn to_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{} is not an integer", n)),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("{} is not an integer", other)),
    }
}

fn parse_datetime(s: &str) -> Result<i64, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp_millis());
        }
    }
    s.trim()
        .parse::<i64>()
        .map_err(|_| format!("'{}' is not a datetime", s))
}

fn format_datetime(millis: i64) -> Value {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => Value::from(millis),
    }
}
