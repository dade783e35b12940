//! Host value model and relational type codes.
//!
//! `HostValue` is the small value model every engine column decodes into and every
//! bind parameter encodes from. `TypeCode` is the closed set of wire-level type
//! codes; `TypeCategory` groups them for the marshaller's dispatch.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// =============================================================================
// Type Codes
// =============================================================================

/// Relational type code of a column or bind parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCode {
    Binary,
    Blob,
    Char,
    Clob,
    Varchar,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Boolean,
    Bit,
    Struct,
    Json,
    Xml,
    Array,
    Uuid,
    Null,
    /// Engine-specific type with no dedicated decoder.
    Other,
}

/// Decode/encode category a type code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    Binary,
    Character,
    Integer,
    BigInteger,
    Float,
    Decimal,
    Date,
    Time,
    Timestamp,
    Boolean,
    Structured,
    Array,
    Null,
    Opaque,
    Text,
}

impl TypeCode {
    /// Classify a database type name (as reported by the driver or declared by the
    /// caller) into a type code.
    ///
    /// Length/precision suffixes (`varchar(30)`, `numeric(10,2)`) are ignored.
    pub fn from_type_name(type_name: &str) -> Self {
        let lower = type_name.trim().to_lowercase();

        if lower.ends_with("[]") || (lower.starts_with('_') && lower.len() > 1) {
            return Self::Array;
        }

        let base = match lower.find('(') {
            Some(idx) => {
                // keep modifiers that follow the parenthesis, e.g. "timestamp(3) with time zone"
                let tail = lower[idx..]
                    .find(')')
                    .map(|end| lower[idx + end + 1..].trim())
                    .unwrap_or("");
                let head = lower[..idx].trim();
                if tail.is_empty() {
                    head.to_string()
                } else {
                    format!("{} {}", head, tail)
                }
            }
            None => lower,
        };
        let base = base.trim_end_matches(" unsigned").trim();

        match base {
            "" | "null" => return Self::Null,
            "bool" | "boolean" => return Self::Boolean,
            "bit" | "varbit" | "bit varying" => return Self::Bit,
            "date" => return Self::Date,
            "time" | "timetz" | "time without time zone" | "time with time zone" => {
                return Self::Time;
            }
            "timestamptz" | "timestamp with time zone" => return Self::TimestampTz,
            "timestamp" | "datetime" | "timestamp without time zone" | "smalldatetime" => {
                return Self::Timestamp;
            }
            "json" | "jsonb" => return Self::Json,
            "xml" => return Self::Xml,
            "uuid" => return Self::Uuid,
            "real" | "float4" => return Self::Real,
            "float" | "float8" | "double" | "double precision" => return Self::Double,
            "bigint" | "int8" | "bigserial" | "serial8" | "unsigned big int" => {
                return Self::BigInt;
            }
            "smallint" | "int2" | "tinyint" | "smallserial" | "serial2" => return Self::SmallInt,
            "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" => return Self::Blob,
            "binary" | "varbinary" | "binary varying" => return Self::Binary,
            "clob" | "text" | "tinytext" | "mediumtext" | "longtext" | "nclob" => {
                return Self::Clob;
            }
            "char" | "character" | "bpchar" | "nchar" => return Self::Char,
            "varchar" | "character varying" | "nvarchar" | "string" | "name" | "citext"
            | "enum" | "set" => return Self::Varchar,
            "record" | "struct" | "row" => return Self::Struct,
            _ => {}
        }

        if base.contains("decimal") || base.contains("numeric") || base == "money" {
            return Self::Decimal;
        }
        if base.contains("interval") || base.contains("point") {
            return Self::Other;
        }
        if base.contains("int") || base.contains("serial") {
            return Self::Integer;
        }
        if base.contains("char") || base.contains("text") {
            return Self::Varchar;
        }
        if base.contains("blob") || base.contains("binary") {
            return Self::Blob;
        }

        Self::Other
    }

    /// The decode/encode category for this type code.
    pub fn category(self) -> TypeCategory {
        match self {
            Self::Binary | Self::Blob => TypeCategory::Binary,
            Self::Char | Self::Clob => TypeCategory::Character,
            Self::SmallInt | Self::Integer => TypeCategory::Integer,
            Self::BigInt => TypeCategory::BigInteger,
            Self::Real | Self::Double => TypeCategory::Float,
            Self::Decimal => TypeCategory::Decimal,
            Self::Date => TypeCategory::Date,
            Self::Time => TypeCategory::Time,
            Self::Timestamp | Self::TimestampTz => TypeCategory::Timestamp,
            Self::Boolean | Self::Bit => TypeCategory::Boolean,
            Self::Struct | Self::Json | Self::Xml => TypeCategory::Structured,
            Self::Array => TypeCategory::Array,
            Self::Null => TypeCategory::Null,
            Self::Uuid | Self::Other => TypeCategory::Opaque,
            Self::Varchar => TypeCategory::Text,
        }
    }
}

// =============================================================================
// Host Values
// =============================================================================

/// Infinity sentinel for temporal columns (PostgreSQL `infinity` / `-infinity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Infinity {
    Positive,
    Negative,
}

impl std::fmt::Display for Infinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "infinity"),
            Self::Negative => write!(f, "-infinity"),
        }
    }
}

/// A host-side value decoded from, or bound to, an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers outside the 64-bit range
    BigInteger(i128),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Infinite(Infinity),
    Uuid(Uuid),
    Json(JsonValue),
    Array(Vec<HostValue>),
}

impl HostValue {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name for display purposes
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::BigInteger(_) => "big_integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Infinite(_) => "infinity",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::Array(_) => "array",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::BigInteger(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Build an integer value, keeping 64-bit values in the narrow variant.
    pub fn integer(value: i128) -> Self {
        match i64::try_from(value) {
            Ok(v) => Self::Integer(v),
            Err(_) => Self::BigInteger(value),
        }
    }

    /// Render the value as JSON.
    ///
    /// Binary data is base64 encoded, decimals and out-of-range integers are strings
    /// so no precision is lost.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Integer(v) => JsonValue::Number((*v).into()),
            Self::BigInteger(v) => JsonValue::String(v.to_string()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Decimal(d) => JsonValue::String(d.to_string()),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Bytes(bytes) => JsonValue::String(STANDARD.encode(bytes)),
            Self::Date(d) => JsonValue::String(d.to_string()),
            Self::Time(t) => JsonValue::String(t.to_string()),
            Self::Timestamp(ts) => JsonValue::String(ts.to_string()),
            Self::TimestampTz(ts) => JsonValue::String(ts.to_rfc3339()),
            Self::Infinite(inf) => JsonValue::String(inf.to_string()),
            Self::Uuid(u) => JsonValue::String(u.to_string()),
            Self::Json(v) => v.clone(),
            Self::Array(items) => JsonValue::Array(items.iter().map(HostValue::to_json).collect()),
        }
    }
}

impl std::fmt::Display for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Text(s) => write!(f, "{}", s),
            Self::Json(v) => write!(f, "{}", v),
            Self::Array(_) => write!(f, "{}", self.to_json()),
            other => match other.to_json() {
                JsonValue::String(s) => write!(f, "{}", s),
                json => write!(f, "{}", json),
            },
        }
    }
}

impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

macro_rules! impl_from_host {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for HostValue {
                fn from(value: $ty) -> Self {
                    HostValue::$variant(value.into())
                }
            }
        )+
    };
}

impl_from_host!(
    bool => Bool,
    i16 => Integer,
    i32 => Integer,
    i64 => Integer,
    u32 => Integer,
    f32 => Float,
    f64 => Float,
    Decimal => Decimal,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    Uuid => Uuid,
    JsonValue => Json,
);

impl From<i128> for HostValue {
    fn from(value: i128) -> Self {
        HostValue::integer(value)
    }
}

impl From<u64> for HostValue {
    fn from(value: u64) -> Self {
        HostValue::integer(value as i128)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(HostValue::Null)
    }
}

// =============================================================================
// Bind Parameters
// =============================================================================

/// A positional bind parameter.
///
/// The type code is resolved from `type_code`, then from `declared_type`, and only
/// then inferred from the host value (see `TypeMarshaller::resolve_type_code`).
#[derive(Debug, Clone, PartialEq)]
pub struct BindParameter {
    pub type_code: Option<TypeCode>,
    pub value: HostValue,
    /// Raw declared type (e.g. `int4[]`, `numeric(10,2)`) for dialect-specific encoding
    pub declared_type: Option<String>,
}

impl BindParameter {
    /// Create a parameter whose type is inferred from the value.
    pub fn new(value: impl Into<HostValue>) -> Self {
        Self {
            type_code: None,
            value: value.into(),
            declared_type: None,
        }
    }

    /// Create a parameter with an explicit type code.
    pub fn typed(value: impl Into<HostValue>, type_code: TypeCode) -> Self {
        Self {
            type_code: Some(type_code),
            value: value.into(),
            declared_type: None,
        }
    }

    /// Create a parameter with a declared database type name.
    pub fn declared(value: impl Into<HostValue>, declared_type: impl Into<String>) -> Self {
        Self {
            type_code: None,
            value: value.into(),
            declared_type: Some(declared_type.into()),
        }
    }

    /// Typed NULL.
    pub fn null(type_code: TypeCode) -> Self {
        Self::typed(HostValue::Null, type_code)
    }
}

impl<T: Into<HostValue>> From<T> for BindParameter {
    fn from(value: T) -> Self {
        BindParameter::new(value)
    }
}
