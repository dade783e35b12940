//! Bidirectional value marshalling.
//!
//! Decoding dispatches on the `TypeCategory` of a column's type code and reads
//! the value through `ColumnReader`; encoding dispatches on the type code
//! resolved for a `BindParameter` and produces an `EngineParam`. A dialect hook,
//! when present, gets the first look at every column or parameter and hands it
//! back (`None`) when it has nothing special to do.

use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::{ConnectionSettings, TimeZoneSetting};
use crate::db::connection::{ColumnMeta, ColumnReader};
use crate::db::dialect::Dialect;
use crate::db::params::EngineParam;
use crate::error::{DbError, DbResult};
use crate::models::{
    BindParameter, ColumnDescriptor, DefaultValue, HostValue, Infinity, TypeCategory, TypeCode,
};

/// Per-handle marshalling switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarshalOptions {
    /// Return date/time columns as their text form
    pub raw_dates: bool,
    /// Return boolean/bit columns as their text form
    pub raw_booleans: bool,
    /// Return array columns as their `{a,b}` literal
    pub raw_arrays: bool,
    pub application_tz: TimeZoneSetting,
    pub database_tz: TimeZoneSetting,
}

impl MarshalOptions {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            raw_dates: settings.raw_dates,
            raw_booleans: settings.raw_booleans,
            raw_arrays: settings.raw_arrays,
            application_tz: settings.application_timezone,
            database_tz: settings.database_timezone,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TypeMarshaller {
    dialect: Dialect,
    options: MarshalOptions,
}

impl TypeMarshaller {
    pub fn new(dialect: Dialect, options: MarshalOptions) -> Self {
        Self { dialect, options }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn options(&self) -> &MarshalOptions {
        &self.options
    }

    // =========================================================================
    // Decode
    // =========================================================================

    /// Column descriptors for result columns, labels folded for display.
    pub fn describe(&self, columns: &[ColumnMeta]) -> Vec<ColumnDescriptor> {
        columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                ColumnDescriptor::new(
                    self.dialect.display_name(&column.label),
                    idx + 1,
                    column.type_name.as_str(),
                )
            })
            .collect()
    }

    /// Decode every column of a row.
    pub fn decode_row(
        &self,
        reader: &dyn ColumnReader,
        columns: &[ColumnDescriptor],
    ) -> DbResult<Vec<HostValue>> {
        columns
            .iter()
            .enumerate()
            .map(|(idx, column)| self.decode(reader, idx, column))
            .collect()
    }

    /// Decode one column into a host value.
    pub fn decode(
        &self,
        reader: &dyn ColumnReader,
        idx: usize,
        column: &ColumnDescriptor,
    ) -> DbResult<HostValue> {
        if let Some(hook) = self.dialect.decode_hook {
            if let Some(result) = hook(reader, idx, column, &self.options) {
                return result;
            }
        }
        self.decode_shared(reader, idx, column.type_code)
    }

    fn decode_shared(
        &self,
        reader: &dyn ColumnReader,
        idx: usize,
        code: TypeCode,
    ) -> DbResult<HostValue> {
        match code.category() {
            TypeCategory::Binary => {
                let bytes = reader.read_bytes(idx)?;
                if reader.is_null(idx) {
                    return Ok(HostValue::Null);
                }
                Ok(HostValue::Bytes(bytes.unwrap_or_default()))
            }
            TypeCategory::Character => {
                let text = reader.read_text(idx)?;
                if reader.is_null(idx) {
                    return Ok(HostValue::Null);
                }
                Ok(HostValue::Text(text.unwrap_or_default()))
            }
            TypeCategory::Text => Ok(reader.read_text(idx)?.into()),
            TypeCategory::Integer => Ok(reader.read_integer(idx)?.into()),
            TypeCategory::BigInteger => match reader.read_integer_text(idx)? {
                Some(text) => parse_big_integer(&text),
                None => Ok(HostValue::Null),
            },
            TypeCategory::Float => Ok(reader.read_float(idx)?.into()),
            TypeCategory::Decimal => Ok(reader.read_decimal(idx)?.into()),
            TypeCategory::Date | TypeCategory::Time | TypeCategory::Timestamp => {
                match reader.read_temporal_text(idx)? {
                    Some(text) if self.options.raw_dates => Ok(HostValue::Text(text)),
                    Some(text) => self.parse_temporal(&text, code),
                    None => Ok(HostValue::Null),
                }
            }
            TypeCategory::Boolean => self.decode_boolean(reader, idx, code),
            TypeCategory::Structured => match code {
                TypeCode::Xml => Ok(reader.read_text(idx)?.into()),
                _ => match reader.read_json(idx) {
                    Ok(value) => Ok(value.into()),
                    Err(_) => Ok(reader.read_text(idx)?.into()),
                },
            },
            TypeCategory::Array => match reader.read_array(idx) {
                Ok(Some(items)) if self.options.raw_arrays => {
                    Ok(HostValue::Text(array_literal(&items)))
                }
                Ok(items) => Ok(items.map(HostValue::Array).unwrap_or(HostValue::Null)),
                // engines without array types hand back their text form
                Err(_) => Ok(reader.read_text(idx)?.into()),
            },
            TypeCategory::Null => self.decode_dynamic(reader, idx),
            TypeCategory::Opaque => {
                if code == TypeCode::Uuid {
                    if let Ok(value) = reader.read_uuid(idx) {
                        return Ok(value.into());
                    }
                }
                match reader.read_text(idx) {
                    Ok(value) => Ok(value.into()),
                    Err(_) => Ok(reader.read_bytes(idx)?.into()),
                }
            }
        }
    }

    /// Columns typed `NULL` by the driver (untyped expressions) take the shape of
    /// whatever the row holds.
    fn decode_dynamic(&self, reader: &dyn ColumnReader, idx: usize) -> DbResult<HostValue> {
        if reader.is_null(idx) {
            return Ok(HostValue::Null);
        }
        if let Ok(Some(v)) = reader.read_integer(idx) {
            return Ok(HostValue::Integer(v));
        }
        if let Ok(Some(v)) = reader.read_float(idx) {
            return Ok(HostValue::Float(v));
        }
        match reader.read_text(idx) {
            Ok(value) => Ok(value.into()),
            Err(_) => Ok(reader.read_bytes(idx)?.into()),
        }
    }

    fn decode_boolean(
        &self,
        reader: &dyn ColumnReader,
        idx: usize,
        code: TypeCode,
    ) -> DbResult<HostValue> {
        if code == TypeCode::Bit {
            return match reader.read_bits(idx)? {
                None => Ok(HostValue::Null),
                Some(bits) if self.options.raw_booleans || bits.len() > 1 => {
                    Ok(HostValue::Text(bits))
                }
                Some(bits) => Ok(HostValue::Bool(bits == "1")),
            };
        }
        match reader.read_bool(idx)? {
            None => Ok(HostValue::Null),
            Some(v) if self.options.raw_booleans => Ok(HostValue::Text(v.to_string())),
            Some(v) => Ok(HostValue::Bool(v)),
        }
    }

    /// Parse the canonical text of a temporal column.
    pub fn parse_temporal(&self, text: &str, code: TypeCode) -> DbResult<HostValue> {
        let trimmed = text.trim();
        match trimmed {
            "infinity" | "+infinity" => return Ok(HostValue::Infinite(Infinity::Positive)),
            "-infinity" => return Ok(HostValue::Infinite(Infinity::Negative)),
            _ => {}
        }
        let invalid = || DbError::marshal(format!("invalid {:?} value '{}'", code, text));
        match code {
            TypeCode::Date => parse_date(trimmed)
                .map(HostValue::Date)
                .ok_or_else(invalid),
            TypeCode::Time => parse_time(trimmed)
                .map(HostValue::Time)
                .ok_or_else(invalid),
            TypeCode::TimestampTz => match parse_timestamp(trimmed).ok_or_else(invalid)? {
                Stamp::Zoned(dt) => Ok(HostValue::TimestampTz(self.to_application_zone(dt))),
                Stamp::Naive(ts) => Ok(HostValue::TimestampTz(
                    self.zoned(ts, self.options.database_tz)
                        .map(|dt| self.to_application_zone(dt))
                        .ok_or_else(invalid)?,
                )),
            },
            _ => match parse_timestamp(trimmed).ok_or_else(invalid)? {
                Stamp::Naive(ts) => Ok(HostValue::Timestamp(shift(
                    ts,
                    self.options.database_tz,
                    self.options.application_tz,
                ))),
                Stamp::Zoned(dt) => Ok(HostValue::Timestamp(naive_in(
                    dt,
                    self.options.application_tz,
                ))),
            },
        }
    }

    fn zoned(&self, ts: NaiveDateTime, zone: TimeZoneSetting) -> Option<DateTime<FixedOffset>> {
        match zone {
            TimeZoneSetting::Utc => Some(Utc.from_utc_datetime(&ts).fixed_offset()),
            TimeZoneSetting::Local => Local
                .from_local_datetime(&ts)
                .earliest()
                .map(|dt| dt.fixed_offset()),
        }
    }

    fn to_application_zone(&self, dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self.options.application_tz {
            TimeZoneSetting::Utc => dt.with_timezone(&Utc).fixed_offset(),
            TimeZoneSetting::Local => dt.with_timezone(&Local).fixed_offset(),
        }
    }

    // =========================================================================
    // Encode
    // =========================================================================

    /// Type code for a parameter: explicit code, then declared type, then value kind.
    pub fn resolve_type_code(&self, param: &BindParameter) -> TypeCode {
        if let Some(code) = param.type_code {
            return code;
        }
        if let Some(declared) = &param.declared_type {
            return TypeCode::from_type_name(declared);
        }
        match &param.value {
            HostValue::Null => TypeCode::Null,
            HostValue::Integer(_) => TypeCode::Integer,
            HostValue::BigInteger(_) => TypeCode::BigInt,
            HostValue::Float(_) => TypeCode::Double,
            HostValue::Decimal(_) => TypeCode::Decimal,
            HostValue::Date(_) => TypeCode::Date,
            HostValue::Time(_) => TypeCode::Time,
            HostValue::Timestamp(_) | HostValue::Infinite(_) => TypeCode::Timestamp,
            HostValue::TimestampTz(_) => TypeCode::TimestampTz,
            HostValue::Bool(_) => TypeCode::Boolean,
            HostValue::Bytes(_) => TypeCode::Blob,
            HostValue::Json(_) => TypeCode::Json,
            HostValue::Uuid(_) => TypeCode::Uuid,
            HostValue::Array(_) => TypeCode::Array,
            HostValue::Text(_) => TypeCode::Varchar,
        }
    }

    pub fn encode_all(&self, params: &[BindParameter]) -> DbResult<Vec<EngineParam>> {
        params.iter().map(|p| self.encode(p)).collect()
    }

    /// Encode one bind parameter.
    pub fn encode(&self, param: &BindParameter) -> DbResult<EngineParam> {
        let code = self.resolve_type_code(param);
        if param.value.is_null() {
            return Ok(EngineParam::Null(code));
        }
        if let Some(hook) = self.dialect.encode_hook {
            if let Some(result) = hook(param, code, &self.options) {
                return result;
            }
        }
        self.encode_shared(&param.value, code)
    }

    fn encode_shared(&self, value: &HostValue, code: TypeCode) -> DbResult<EngineParam> {
        let mismatch = || {
            DbError::marshal(format!(
                "cannot bind {} value as {:?}",
                value.type_name(),
                code
            ))
        };
        match code.category() {
            TypeCategory::Integer | TypeCategory::BigInteger => {
                encode_integer(value).ok_or_else(mismatch)
            }
            TypeCategory::Float => encode_float(value).ok_or_else(mismatch),
            TypeCategory::Decimal => encode_decimal(value)
                .map(EngineParam::Decimal)
                .ok_or_else(mismatch),
            TypeCategory::Date => match value {
                HostValue::Date(d) => Ok(EngineParam::Date(*d)),
                HostValue::Timestamp(ts) => Ok(EngineParam::Date(ts.date())),
                HostValue::TimestampTz(dt) => Ok(EngineParam::Date(dt.date_naive())),
                HostValue::Text(s) => parse_date(s.trim())
                    .map(EngineParam::Date)
                    .ok_or_else(mismatch),
                HostValue::Infinite(inf) => Ok(EngineParam::Text(inf.to_string())),
                _ => Err(mismatch()),
            },
            TypeCategory::Time => match value {
                HostValue::Time(t) => Ok(EngineParam::Time(*t)),
                HostValue::Timestamp(ts) => Ok(EngineParam::Time(ts.time())),
                HostValue::Text(s) => parse_time(s.trim())
                    .map(EngineParam::Time)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            TypeCategory::Timestamp => self.encode_timestamp(value, code).ok_or_else(mismatch),
            TypeCategory::Boolean => encode_bool(value)
                .map(EngineParam::Bool)
                .ok_or_else(mismatch),
            TypeCategory::Binary => match value {
                HostValue::Bytes(b) => Ok(EngineParam::Bytes(b.clone())),
                HostValue::Text(s) => Ok(EngineParam::Bytes(s.clone().into_bytes())),
                _ => Err(mismatch()),
            },
            TypeCategory::Character | TypeCategory::Text => Ok(EngineParam::Text(value.to_string())),
            TypeCategory::Structured => match (code, value) {
                (TypeCode::Xml, v) => Ok(EngineParam::Text(v.to_string())),
                (_, HostValue::Json(j)) => Ok(EngineParam::Json(j.clone())),
                (_, HostValue::Text(s)) => serde_json::from_str(s)
                    .map(EngineParam::Json)
                    .map_err(|e| DbError::marshal(format!("invalid JSON parameter: {}", e))),
                (_, v) => Ok(EngineParam::Json(v.to_json())),
            },
            TypeCategory::Array => match value {
                HostValue::Array(_) => Ok(EngineParam::Text(value.to_json().to_string())),
                HostValue::Text(s) => Ok(EngineParam::Text(s.clone())),
                _ => Err(mismatch()),
            },
            TypeCategory::Opaque => match value {
                HostValue::Uuid(u) => Ok(EngineParam::Uuid(*u)),
                HostValue::Text(s) if code == TypeCode::Uuid => Uuid::parse_str(s.trim())
                    .map(EngineParam::Uuid)
                    .map_err(|e| DbError::marshal(format!("invalid UUID parameter: {}", e))),
                HostValue::Bytes(b) => Ok(EngineParam::Bytes(b.clone())),
                other => Ok(EngineParam::Text(other.to_string())),
            },
            // typed as NULL but carrying a value: bind by what it is
            TypeCategory::Null => {
                let inferred = self.resolve_type_code(&BindParameter::new(value.clone()));
                self.encode_shared(value, inferred)
            }
        }
    }

    /// Timestamps are shifted from the application zone to the database zone.
    fn encode_timestamp(&self, value: &HostValue, code: TypeCode) -> Option<EngineParam> {
        let with_zone = code == TypeCode::TimestampTz;
        let naive = match value {
            HostValue::TimestampTz(dt) if with_zone => {
                return Some(EngineParam::TimestampTz(dt.with_timezone(&Utc)));
            }
            HostValue::TimestampTz(dt) => {
                return Some(EngineParam::Timestamp(naive_in(*dt, self.options.database_tz)));
            }
            HostValue::Timestamp(ts) => *ts,
            HostValue::Date(d) => d.and_time(NaiveTime::MIN),
            HostValue::Text(s) => match parse_timestamp(s.trim())? {
                Stamp::Naive(ts) => ts,
                Stamp::Zoned(dt) => {
                    return self.encode_timestamp(&HostValue::TimestampTz(dt), code);
                }
            },
            HostValue::Infinite(inf) => return Some(EngineParam::Text(inf.to_string())),
            _ => return None,
        };
        if with_zone {
            let dt = self.zoned(naive, self.options.application_tz)?;
            Some(EngineParam::TimestampTz(dt.with_timezone(&Utc)))
        } else {
            Some(EngineParam::Timestamp(shift(
                naive,
                self.options.application_tz,
                self.options.database_tz,
            )))
        }
    }

    // =========================================================================
    // Column defaults
    // =========================================================================

    /// Decode a column default from catalog metadata.
    ///
    /// Quoted literals and bare numbers become values typed after the column;
    /// anything else (`CURRENT_TIMESTAMP`, `nextval('seq'::regclass)`) stays an
    /// expression.
    pub fn decode_default(&self, raw: Option<&str>, data_type: &str) -> Option<DefaultValue> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        let code = TypeCode::from_type_name(data_type);
        let literal = strip_cast(raw);
        let unwrapped = strip_parens(literal);

        if unwrapped.eq_ignore_ascii_case("null") {
            return Some(DefaultValue::Value(HostValue::Null));
        }
        if let Some(text) = unquote(unwrapped) {
            return Some(DefaultValue::Value(coerce_literal(&text, code)));
        }
        if unwrapped.eq_ignore_ascii_case("true") || unwrapped.eq_ignore_ascii_case("false") {
            return Some(DefaultValue::Value(coerce_literal(unwrapped, TypeCode::Boolean)));
        }
        if let Ok(v) = unwrapped.parse::<i64>() {
            return Some(DefaultValue::Value(match code.category() {
                TypeCategory::Boolean => HostValue::Bool(v != 0),
                TypeCategory::Float => HostValue::Float(v as f64),
                TypeCategory::Decimal => HostValue::Decimal(Decimal::from(v)),
                _ => HostValue::Integer(v),
            }));
        }
        if let Ok(d) = Decimal::from_str(unwrapped) {
            return Some(DefaultValue::Value(match code.category() {
                TypeCategory::Float => unwrapped
                    .parse::<f64>()
                    .map(HostValue::Float)
                    .unwrap_or(HostValue::Decimal(d)),
                _ => HostValue::Decimal(d),
            }));
        }
        Some(DefaultValue::Expression(raw.to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

enum Stamp {
    Naive(NaiveDateTime),
    Zoned(DateTime<FixedOffset>),
}

fn parse_big_integer(text: &str) -> DbResult<HostValue> {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<i128>() {
        return Ok(HostValue::integer(v));
    }
    Decimal::from_str(trimmed)
        .map(HostValue::Decimal)
        .map_err(|_| DbError::marshal(format!("invalid integer '{}'", text)))
}

/// Split a trailing ` BC` marker off.
fn split_era(text: &str) -> (&str, bool) {
    match text.strip_suffix(" BC") {
        Some(rest) => (rest.trim_end(), true),
        None => (text, false),
    }
}

/// Year `n` BC is proleptic year `1 - n`.
fn to_bc(date: NaiveDate) -> Option<NaiveDate> {
    use chrono::Datelike;
    date.with_year(1 - date.year())
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let (body, bc) = split_era(text);
    let date = NaiveDate::parse_from_str(body, "%Y-%m-%d")
        .ok()
        .or_else(|| match parse_timestamp(body)? {
            Stamp::Naive(ts) => Some(ts.date()),
            Stamp::Zoned(dt) => Some(dt.date_naive()),
        })?;
    if bc { to_bc(date) } else { Some(date) }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    // drop a TIMETZ offset, the value is a time of day
    let body = match text.rfind(['+', '-']) {
        Some(idx) if idx >= 8 => &text[..idx],
        _ => text,
    };
    NaiveTime::parse_from_str(body, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(body, "%H:%M"))
        .ok()
}

fn parse_timestamp(text: &str) -> Option<Stamp> {
    let (body, bc) = split_era(text);
    let body = body.replacen('T', " ", 1);
    let body = match body.strip_suffix('Z') {
        Some(rest) => format!("{}+00:00", rest),
        None => body,
    };

    let stamp = if let Ok(dt) = DateTime::parse_from_str(&body, "%Y-%m-%d %H:%M:%S%.f%#z") {
        Stamp::Zoned(dt)
    } else if let Ok(ts) = NaiveDateTime::parse_from_str(&body, "%Y-%m-%d %H:%M:%S%.f") {
        Stamp::Naive(ts)
    } else if let Ok(ts) = NaiveDateTime::parse_from_str(&body, "%Y-%m-%d %H:%M") {
        Stamp::Naive(ts)
    } else {
        Stamp::Naive(NaiveDate::parse_from_str(&body, "%Y-%m-%d").ok()?.and_time(NaiveTime::MIN))
    };
    if !bc {
        return Some(stamp);
    }
    match stamp {
        Stamp::Naive(ts) => Some(Stamp::Naive(to_bc(ts.date())?.and_time(ts.time()))),
        Stamp::Zoned(dt) => {
            let naive = to_bc(dt.naive_local().date())?.and_time(dt.naive_local().time());
            dt.offset()
                .from_local_datetime(&naive)
                .single()
                .map(Stamp::Zoned)
        }
    }
}

/// Reinterpret a naive timestamp from one zone setting in another.
fn shift(ts: NaiveDateTime, from: TimeZoneSetting, to: TimeZoneSetting) -> NaiveDateTime {
    match (from, to) {
        (TimeZoneSetting::Local, TimeZoneSetting::Utc) => Local
            .from_local_datetime(&ts)
            .earliest()
            .map(|dt| dt.naive_utc())
            .unwrap_or(ts),
        (TimeZoneSetting::Utc, TimeZoneSetting::Local) => {
            Utc.from_utc_datetime(&ts).with_timezone(&Local).naive_local()
        }
        _ => ts,
    }
}

/// Wall-clock time of an instant in a zone setting.
fn naive_in(dt: DateTime<FixedOffset>, zone: TimeZoneSetting) -> NaiveDateTime {
    match zone {
        TimeZoneSetting::Utc => dt.naive_utc(),
        TimeZoneSetting::Local => dt.with_timezone(&Local).naive_local(),
    }
}

fn encode_integer(value: &HostValue) -> Option<EngineParam> {
    match value {
        HostValue::Integer(v) => Some(EngineParam::Int(*v)),
        HostValue::BigInteger(v) => Some(promote_integer(*v)),
        HostValue::Bool(b) => Some(EngineParam::Int(i64::from(*b))),
        HostValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => {
            Some(EngineParam::Int(*f as i64))
        }
        HostValue::Decimal(d) if d.fract().is_zero() => {
            let v = i128::try_from(d.trunc()).ok()?;
            Some(match i64::try_from(v) {
                Ok(v) => EngineParam::Int(v),
                Err(_) => promote_integer(v),
            })
        }
        HostValue::Text(s) => {
            let v = s.trim().parse::<i128>().ok()?;
            Some(match i64::try_from(v) {
                Ok(v) => EngineParam::Int(v),
                Err(_) => promote_integer(v),
            })
        }
        _ => None,
    }
}

/// Beyond 64 bits: bind as an exact decimal, or as text past its 96-bit range.
fn promote_integer(v: i128) -> EngineParam {
    match i64::try_from(v) {
        Ok(v) => EngineParam::Int(v),
        Err(_) => Decimal::try_from_i128_with_scale(v, 0)
            .map(EngineParam::Decimal)
            .unwrap_or_else(|_| EngineParam::Text(v.to_string())),
    }
}

fn encode_float(value: &HostValue) -> Option<EngineParam> {
    match value {
        HostValue::Float(f) => Some(EngineParam::Float(*f)),
        HostValue::Integer(v) => Some(EngineParam::Float(*v as f64)),
        HostValue::BigInteger(v) => Some(EngineParam::Float(*v as f64)),
        HostValue::Decimal(d) => f64::try_from(*d).ok().map(EngineParam::Float),
        HostValue::Text(s) => s.trim().parse().ok().map(EngineParam::Float),
        _ => None,
    }
}

fn encode_decimal(value: &HostValue) -> Option<Decimal> {
    match value {
        HostValue::Decimal(d) => Some(*d),
        HostValue::Integer(v) => Some(Decimal::from(*v)),
        HostValue::BigInteger(v) => Decimal::try_from_i128_with_scale(*v, 0).ok(),
        HostValue::Float(f) => Decimal::try_from(*f).ok(),
        HostValue::Text(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .ok(),
        _ => None,
    }
}

fn encode_bool(value: &HostValue) -> Option<bool> {
    match value {
        HostValue::Bool(b) => Some(*b),
        HostValue::Integer(v) => Some(*v != 0),
        HostValue::Text(s) => parse_bool_text(s),
        _ => None,
    }
}

fn parse_bool_text(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// PostgreSQL array literal, e.g. `{1,NULL,"a b"}`.
fn array_literal(items: &[HostValue]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            HostValue::Null => "NULL".to_string(),
            HostValue::Array(inner) => array_literal(inner),
            other => {
                let text = other.to_string();
                let plain = !text.is_empty()
                    && !text.eq_ignore_ascii_case("null")
                    && !text.contains([',', '{', '}', '"', '\\', ' ']);
                if plain {
                    text
                } else {
                    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
                }
            }
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// `'abc'::character varying` -> `'abc'`
fn strip_cast(raw: &str) -> &str {
    let mut in_quote = false;
    let bytes = raw.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'\'' => in_quote = !in_quote,
            b':' if !in_quote && bytes.get(i + 1) == Some(&b':') => return raw[..i].trim(),
            _ => {}
        }
    }
    raw
}

/// `((0))` -> `0`
fn strip_parens(raw: &str) -> &str {
    let mut s = raw.trim();
    while s.len() >= 2 && s.starts_with('(') && s.ends_with(')') {
        s = s[1..s.len() - 1].trim();
    }
    s
}

/// `'it''s'` -> `it's`
fn unquote(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('\'')?.strip_suffix('\'')?;
    // a lone quote inside means this was not one literal, e.g. 'a' || 'b'
    if inner.replace("''", "").contains('\'') {
        return None;
    }
    Some(inner.replace("''", "'"))
}

fn coerce_literal(text: &str, code: TypeCode) -> HostValue {
    let parsed = match code.category() {
        TypeCategory::Integer | TypeCategory::BigInteger => {
            text.trim().parse::<i128>().ok().map(HostValue::integer)
        }
        TypeCategory::Float => text.trim().parse::<f64>().ok().map(HostValue::Float),
        TypeCategory::Decimal => Decimal::from_str(text.trim()).ok().map(HostValue::Decimal),
        TypeCategory::Boolean => parse_bool_text(text).map(HostValue::Bool),
        TypeCategory::Date => parse_date(text.trim()).map(HostValue::Date),
        TypeCategory::Time => parse_time(text.trim()).map(HostValue::Time),
        TypeCategory::Timestamp => match parse_timestamp(text.trim()) {
            Some(Stamp::Naive(ts)) => Some(HostValue::Timestamp(ts)),
            Some(Stamp::Zoned(dt)) => Some(HostValue::TimestampTz(dt)),
            None => None,
        },
        TypeCategory::Structured if code == TypeCode::Json => {
            serde_json::from_str::<JsonValue>(text).ok().map(HostValue::Json)
        }
        _ => None,
    };
    parsed.unwrap_or_else(|| HostValue::Text(text.to_string()))
}
