//! Mapping between [`Value`]s and SQLite storage.
//!
//! | Value       | Stored as                                 |
//! |-------------|-------------------------------------------|
//! | `Bool`      | `INTEGER` 0 / 1                           |
//! | `Int`       | `INTEGER`                                 |
//! | `Float`     | `REAL`                                    |
//! | `Text`      | `TEXT`                                    |
//! | `Uuid`      | `TEXT`, hyphenated                        |
//! | `Date`      | `TEXT`, RFC 3339 UTC with microseconds    |
//! | `Json`      | `TEXT`, JSON                              |
//! | `Array`     | `TEXT`, JSON array                        |

use chrono::{DateTime, Utc};
use quire_data::value::format_date;
use quire_data::{DataError, FieldDef, FieldKind, Record, Statement, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use uuid::Uuid;

use crate::error::SqlxErrorExt;

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Prepare `statement` with all of its parameters bound.
pub(crate) fn bind_statement(statement: &Statement) -> SqliteQuery<'_> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_value)
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Uuid(u) => query.bind(u.to_string()),
        Value::Date(d) => query.bind(format_date(d)),
        Value::Json(j) => query.bind(j.to_string()),
        Value::Array(_) => query.bind(value.to_json().to_string()),
    }
}

/// Decode the columns of `row` starting at `offset` into a record keyed by
/// field name.
pub(crate) fn decode_row(
    row: &SqliteRow,
    fields: &[&FieldDef],
    offset: usize,
) -> Result<Record, DataError> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let value = decode_value(row, offset + idx, field)?;
            Ok((field.name().to_string(), value))
        })
        .collect()
}

/// Decode one column according to the kind of `field`.
pub(crate) fn decode_value(row: &SqliteRow, idx: usize, field: &FieldDef) -> Result<Value, DataError> {
    let text = |row: &SqliteRow| -> Result<Option<String>, DataError> {
        row.try_get::<Option<String>, _>(idx)
            .map_err(SqlxErrorExt::into_data_error)
    };

    let value = match field.kind() {
        FieldKind::String => text(row)?.map(Value::Text),
        FieldKind::Integer => row
            .try_get::<Option<i64>, _>(idx)
            .map_err(SqlxErrorExt::into_data_error)?
            .map(Value::Int),
        FieldKind::Number => match row.try_get::<Option<f64>, _>(idx) {
            Ok(v) => v.map(Value::Float),
            Err(_) => row
                .try_get::<Option<i64>, _>(idx)
                .map_err(SqlxErrorExt::into_data_error)?
                .map(|i| Value::Float(i as f64)),
        },
        FieldKind::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .map_err(SqlxErrorExt::into_data_error)?
            .map(Value::Bool),
        FieldKind::Date => match text(row)? {
            Some(s) => Some(Value::Date(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(DataError::database)?
                    .with_timezone(&Utc),
            )),
            None => None,
        },
        FieldKind::Uuid => match text(row)? {
            Some(s) => Some(Value::Uuid(Uuid::parse_str(&s).map_err(DataError::database)?)),
            None => None,
        },
        FieldKind::Object => match text(row)? {
            Some(s) => Some(Value::Json(
                serde_json::from_str(&s).map_err(DataError::database)?,
            )),
            None => None,
        },
        FieldKind::Array => match text(row)? {
            Some(s) => {
                let json: serde_json::Value = serde_json::from_str(&s).map_err(DataError::database)?;
                Some(array_items(field, Value::from_json(json)))
            }
            None => None,
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Narrow decoded array items to the declared item kind, e.g. text back to
/// uuids. Items that do not coerce are kept as decoded.
fn array_items(field: &FieldDef, value: Value) -> Value {
    match (field.descriptor().item_kind(), value) {
        (Some(kind), Value::Array(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| kind.coerce(item.clone()).unwrap_or(item))
                .collect(),
        ),
        (_, value) => value,
    }
}
