//! Engine-native bind parameters.
//!
//! `EngineParam` is what the marshaller's encode pass produces: a value already
//! converted to the shape the engine should receive, including typed NULLs.
//! The `bind_*_param` functions attach it to a sqlx query for one engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};
use uuid::Uuid;

use crate::models::TypeCode;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineParam {
    /// NULL carrying the type the engine should see
    Null(TypeCode),
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
    IntArray(Vec<Option<i64>>),
    FloatArray(Vec<Option<f64>>),
    TextArray(Vec<Option<String>>),
    BoolArray(Vec<Option<bool>>),
}

impl EngineParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// JSON rendering of array parameters for engines without array types.
    fn array_json(&self) -> Option<String> {
        let value = match self {
            Self::IntArray(v) => serde_json::to_value(v),
            Self::FloatArray(v) => serde_json::to_value(v),
            Self::TextArray(v) => serde_json::to_value(v),
            Self::BoolArray(v) => serde_json::to_value(v),
            _ => return None,
        };
        value.ok().map(|v| v.to_string())
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q EngineParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        EngineParam::Null(code) => match code {
            TypeCode::Boolean => query.bind(None::<bool>),
            TypeCode::SmallInt | TypeCode::Integer | TypeCode::BigInt => query.bind(None::<i64>),
            TypeCode::Real | TypeCode::Double => query.bind(None::<f64>),
            TypeCode::Decimal => query.bind(None::<Decimal>),
            TypeCode::Binary | TypeCode::Blob => query.bind(None::<Vec<u8>>),
            TypeCode::Date => query.bind(None::<NaiveDate>),
            TypeCode::Time => query.bind(None::<NaiveTime>),
            TypeCode::Timestamp | TypeCode::TimestampTz => query.bind(None::<NaiveDateTime>),
            _ => query.bind(None::<String>),
        },
        EngineParam::Bool(v) => query.bind(*v),
        EngineParam::Int(v) => query.bind(*v),
        EngineParam::Float(v) => query.bind(*v),
        EngineParam::Decimal(v) => query.bind(*v),
        EngineParam::Text(v) => query.bind(v.as_str()),
        EngineParam::Bytes(v) => query.bind(v.as_slice()),
        EngineParam::Date(v) => query.bind(*v),
        EngineParam::Time(v) => query.bind(*v),
        EngineParam::Timestamp(v) => query.bind(*v),
        EngineParam::TimestampTz(v) => query.bind(*v),
        EngineParam::Uuid(v) => query.bind(v.hyphenated().to_string()),
        EngineParam::Json(v) => query.bind(sqlx::types::Json(v)),
        array => query.bind(array.array_json()),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q EngineParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        EngineParam::Null(code) => match code {
            TypeCode::Boolean | TypeCode::Bit => query.bind(None::<bool>),
            TypeCode::SmallInt => query.bind(None::<i16>),
            TypeCode::Integer => query.bind(None::<i32>),
            TypeCode::BigInt => query.bind(None::<i64>),
            TypeCode::Real => query.bind(None::<f32>),
            TypeCode::Double => query.bind(None::<f64>),
            TypeCode::Decimal => query.bind(None::<Decimal>),
            TypeCode::Binary | TypeCode::Blob => query.bind(None::<Vec<u8>>),
            TypeCode::Date => query.bind(None::<NaiveDate>),
            TypeCode::Time => query.bind(None::<NaiveTime>),
            TypeCode::Timestamp => query.bind(None::<NaiveDateTime>),
            TypeCode::TimestampTz => query.bind(None::<DateTime<Utc>>),
            TypeCode::Uuid => query.bind(None::<Uuid>),
            TypeCode::Json | TypeCode::Struct => query.bind(None::<JsonValue>),
            _ => query.bind(None::<String>),
        },
        EngineParam::Bool(v) => query.bind(*v),
        EngineParam::Int(v) => query.bind(*v),
        EngineParam::Float(v) => query.bind(*v),
        EngineParam::Decimal(v) => query.bind(*v),
        EngineParam::Text(v) => query.bind(v.as_str()),
        EngineParam::Bytes(v) => query.bind(v.as_slice()),
        EngineParam::Date(v) => query.bind(*v),
        EngineParam::Time(v) => query.bind(*v),
        EngineParam::Timestamp(v) => query.bind(*v),
        EngineParam::TimestampTz(v) => query.bind(*v),
        EngineParam::Uuid(v) => query.bind(*v),
        EngineParam::Json(v) => query.bind(sqlx::types::Json(v)),
        EngineParam::IntArray(v) => query.bind(v.as_slice()),
        EngineParam::FloatArray(v) => query.bind(v.as_slice()),
        EngineParam::TextArray(v) => query.bind(v.as_slice()),
        EngineParam::BoolArray(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q EngineParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        EngineParam::Null(code) => match code {
            TypeCode::SmallInt | TypeCode::Integer | TypeCode::BigInt | TypeCode::Boolean => {
                query.bind(None::<i64>)
            }
            TypeCode::Real | TypeCode::Double => query.bind(None::<f64>),
            TypeCode::Binary | TypeCode::Blob => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        },
        EngineParam::Bool(v) => query.bind(*v),
        EngineParam::Int(v) => query.bind(*v),
        EngineParam::Float(v) => query.bind(*v),
        // SQLite has no decimal type, keep the exact digits as text
        EngineParam::Decimal(v) => query.bind(v.to_string()),
        EngineParam::Text(v) => query.bind(v.as_str()),
        EngineParam::Bytes(v) => query.bind(v.as_slice()),
        EngineParam::Date(v) => query.bind(*v),
        EngineParam::Time(v) => query.bind(*v),
        EngineParam::Timestamp(v) => query.bind(*v),
        EngineParam::TimestampTz(v) => query.bind(*v),
        EngineParam::Uuid(v) => query.bind(v.hyphenated().to_string()),
        EngineParam::Json(v) => query.bind(v.to_string()),
        array => query.bind(array.array_json()),
    }
}
