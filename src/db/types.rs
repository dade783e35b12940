//! Row access for the sqlx engines.
//!
//! This module implements `ColumnReader` for MySQL, PostgreSQL and SQLite rows.
//!
//! # Architecture
//!
//! Each `read_*` tries a short chain of sqlx decodes (`try_get::<Option<T>>`)
//! and returns the first that succeeds. NULL short-circuits the chain because
//! sqlx skips the compatibility check for NULL values. Shapes sqlx has no
//! decoder for (temporal text with infinity/BC, bit strings, arbitrary raw
//! payloads) use the small custom `Decode` impls below.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo, ValueRef};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::connection::ColumnReader;
use crate::error::{DbError, DbResult};
use crate::models::HostValue;

/// A fetched row from any sqlx engine.
pub enum EngineRow {
    MySql(MySqlRow),
    Postgres(PgRow),
    SQLite(SqliteRow),
}

impl std::fmt::Debug for EngineRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = match self {
            EngineRow::MySql(_) => "MySql",
            EngineRow::Postgres(_) => "Postgres",
            EngineRow::SQLite(_) => "SQLite",
        };
        f.debug_struct("EngineRow")
            .field("engine", &engine)
            .field("columns", &self.column_meta())
            .finish()
    }
}

fn decode_error(idx: usize, err: Option<sqlx::Error>) -> DbError {
    match err {
        Some(e) => DbError::marshal(format!("column {}: {}", idx, e)),
        None => DbError::marshal(format!("column {}: no decoder", idx)),
    }
}

/// Try each decode in order, returning the first that succeeds.
macro_rules! decode_first {
    ($row:expr, $idx:expr, $($ty:ty => $map:expr),+ $(,)?) => {{
        #[allow(unused_assignments)]
        let mut last_err = None;
        $(
            match $row.try_get::<Option<$ty>, _>($idx) {
                Ok(v) => return Ok(v.map($map)),
                Err(e) => last_err = Some(e),
            }
        )+
        Err(decode_error($idx, last_err))
    }};
}

/// Column metadata shared by every sqlx row type.
macro_rules! row_metadata {
    () => {
        fn column_count(&self) -> usize {
            self.columns().len()
        }

        fn column_label(&self, idx: usize) -> &str {
            self.columns().get(idx).map(|c| c.name()).unwrap_or_default()
        }

        fn column_type_name(&self, idx: usize) -> &str {
            self.columns()
                .get(idx)
                .map(|c| c.type_info().name())
                .unwrap_or_default()
        }

        fn is_null(&self, idx: usize) -> bool {
            self.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
        }
    };
}

fn id<T>(v: T) -> T {
    v
}

fn bits_of_bytes(bytes: &[u8], len: Option<usize>) -> String {
    let mut bits: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
    if let Some(len) = len {
        bits.truncate(len);
    }
    bits
}

/// Bit string of an unsigned value, zero-padded to the declared width.
fn padded_bits(value: u64, width: Option<usize>) -> String {
    format!("{:0width$b}", value, width = width.unwrap_or(1))
}

/// Declared width M of a MySQL `BIT(M)` column.
///
/// `MySqlTypeInfo` keeps M private; its `Debug` output is the only place it
/// surfaces.
fn mysql_bit_width(ty: &MySqlTypeInfo) -> Option<usize> {
    let debug = format!("{:?}", ty);
    let rest = debug.split("max_size: Some(").nth(1)?;
    rest.split(')').next()?.trim().parse().ok()
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M:%S%.f").to_string()
}

// =============================================================================
// Engine Dispatch
// =============================================================================

impl ColumnReader for EngineRow {
    fn column_count(&self) -> usize {
        crate::db_dispatch_all!(self, EngineRow, r => r.column_count())
    }

    fn column_label(&self, idx: usize) -> &str {
        crate::db_dispatch_all!(self, EngineRow, r => r.column_label(idx))
    }

    fn column_type_name(&self, idx: usize) -> &str {
        crate::db_dispatch_all!(self, EngineRow, r => r.column_type_name(idx))
    }

    fn is_null(&self, idx: usize) -> bool {
        crate::db_dispatch_all!(self, EngineRow, r => ColumnReader::is_null(r, idx))
    }

    fn read_integer(&self, idx: usize) -> DbResult<Option<i64>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_integer(idx))
    }

    fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_integer_text(idx))
    }

    fn read_float(&self, idx: usize) -> DbResult<Option<f64>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_float(idx))
    }

    fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_decimal(idx))
    }

    fn read_text(&self, idx: usize) -> DbResult<Option<String>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_text(idx))
    }

    fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_bytes(idx))
    }

    fn read_bool(&self, idx: usize) -> DbResult<Option<bool>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_bool(idx))
    }

    fn read_bits(&self, idx: usize) -> DbResult<Option<String>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_bits(idx))
    }

    fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_temporal_text(idx))
    }

    fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_json(idx))
    }

    fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_uuid(idx))
    }

    fn read_array(&self, idx: usize) -> DbResult<Option<Vec<HostValue>>> {
        crate::db_dispatch_all!(self, EngineRow, r => r.read_array(idx))
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL values as strings.
/// MySQL sends DECIMAL as text in both protocols.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// PostgreSQL Wire Decoders
// =============================================================================

/// Any PostgreSQL value as its raw payload.
#[derive(Debug)]
pub struct PgRawValue {
    pub text_format: bool,
    pub bytes: Vec<u8>,
}

impl Type<Postgres> for PgRawValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("text")
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, Postgres> for PgRawValue {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self {
            text_format: matches!(value.format(), PgValueFormat::Text),
            bytes: value.as_bytes()?.to_vec(),
        })
    }
}

/// BIT / VARBIT as a `0`/`1` string.
#[derive(Debug)]
pub struct PgBits(pub String);

impl Type<Postgres> for PgBits {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("varbit")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        matches!(ty.name(), "BIT" | "VARBIT")
    }
}

impl<'r> Decode<'r, Postgres> for PgBits {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        if matches!(value.format(), PgValueFormat::Text) {
            return Ok(Self(value.as_str()?.to_string()));
        }
        // int4 bit length, then the bits packed big-endian
        let bytes = value.as_bytes()?;
        let (len, data) = split_i32(bytes)?;
        Ok(Self(bits_of_bytes(data, Some(len.max(0) as usize))))
    }
}

/// Date/time values rendered the way the server prints them.
///
/// Keeps `infinity` / `-infinity` and BC years that chrono's sqlx decoders reject.
#[derive(Debug)]
pub struct PgTemporalText(pub String);

impl Type<Postgres> for PgTemporalText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("timestamp")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        matches!(
            ty.name(),
            "DATE" | "TIME" | "TIMETZ" | "TIMESTAMP" | "TIMESTAMPTZ"
        )
    }
}

impl<'r> Decode<'r, Postgres> for PgTemporalText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        if matches!(value.format(), PgValueFormat::Text) {
            return Ok(Self(value.as_str()?.to_string()));
        }
        let type_name = value.type_info().name().to_string();
        let bytes = value.as_bytes()?;
        let text = match type_name.as_str() {
            "DATE" => pg_date_text(split_i32(bytes)?.0)?,
            "TIME" => pg_time_text(split_i64(bytes)?.0)?,
            "TIMETZ" => {
                let (micros, rest) = split_i64(bytes)?;
                let (west_secs, _) = split_i32(rest)?;
                format!("{}{}", pg_time_text(micros)?, offset_text(-west_secs))
            }
            "TIMESTAMP" => pg_timestamp_text(split_i64(bytes)?.0, None)?,
            "TIMESTAMPTZ" => pg_timestamp_text(split_i64(bytes)?.0, Some("+00"))?,
            other => return Err(format!("unsupported temporal type {}", other).into()),
        };
        Ok(Self(text))
    }
}

fn split_i32(bytes: &[u8]) -> Result<(i32, &[u8]), BoxDynError> {
    let (head, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or("expected 4 bytes")?;
    Ok((i32::from_be_bytes(*head), rest))
}

fn split_i64(bytes: &[u8]) -> Result<(i64, &[u8]), BoxDynError> {
    let (head, rest) = bytes
        .split_first_chunk::<8>()
        .ok_or("expected 8 bytes")?;
    Ok((i64::from_be_bytes(*head), rest))
}

fn pg_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// `YYYY-MM-DD`, with ` BC` for years before 1 AD.
fn bc_date_text(date: NaiveDate) -> (String, bool) {
    use chrono::Datelike;
    let year = date.year();
    if year <= 0 {
        (
            format!("{:04}-{:02}-{:02}", 1 - year, date.month(), date.day()),
            true,
        )
    } else {
        (date.format("%Y-%m-%d").to_string(), false)
    }
}

fn pg_date_text(days: i32) -> Result<String, BoxDynError> {
    match days {
        i32::MAX => Ok("infinity".to_string()),
        i32::MIN => Ok("-infinity".to_string()),
        _ => {
            let date = pg_epoch()
                .date()
                .checked_add_signed(Duration::days(days as i64))
                .ok_or("date out of range")?;
            Ok(match bc_date_text(date) {
                (text, true) => format!("{} BC", text),
                (text, false) => text,
            })
        }
    }
}

fn pg_time_text(micros: i64) -> Result<String, BoxDynError> {
    // 24:00:00 is a valid TIME value
    if micros == 86_400_000_000 {
        return Ok("24:00:00".to_string());
    }
    let secs = u32::try_from(micros.div_euclid(1_000_000))?;
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1000)?;
    let time =
        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or("time out of range")?;
    Ok(format_time(time))
}

fn pg_timestamp_text(micros: i64, zone: Option<&str>) -> Result<String, BoxDynError> {
    match micros {
        i64::MAX => return Ok("infinity".to_string()),
        i64::MIN => return Ok("-infinity".to_string()),
        _ => {}
    }
    let ts = pg_epoch()
        .checked_add_signed(Duration::microseconds(micros))
        .ok_or("timestamp out of range")?;
    let (date, bc) = bc_date_text(ts.date());
    let mut text = format!("{} {}", date, format_time(ts.time()));
    if let Some(zone) = zone {
        text.push_str(zone);
    }
    if bc {
        text.push_str(" BC");
    }
    Ok(text)
}

/// `+HH:MM` from seconds east of UTC.
fn offset_text(east_secs: i32) -> String {
    let sign = if east_secs < 0 { '-' } else { '+' };
    let abs = east_secs.unsigned_abs();
    format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

fn interval_text(interval: &sqlx::postgres::types::PgInterval) -> String {
    let mut parts = Vec::new();
    let (years, months) = (interval.months / 12, interval.months % 12);
    if years != 0 {
        parts.push(format!("{} year{}", years, if years.abs() == 1 { "" } else { "s" }));
    }
    if months != 0 {
        parts.push(format!("{} mon{}", months, if months.abs() == 1 { "" } else { "s" }));
    }
    if interval.days != 0 {
        let days = interval.days;
        parts.push(format!("{} day{}", days, if days.abs() == 1 { "" } else { "s" }));
    }
    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        let mut clock = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        );
        if frac != 0 {
            clock.push_str(format!(".{:06}", frac).trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

// =============================================================================
// Database-Specific Readers
// =============================================================================

mod mysql {
    use super::*;

    impl ColumnReader for MySqlRow {
        row_metadata!();

        fn read_integer(&self, idx: usize) -> DbResult<Option<i64>> {
            if let Ok(Some(v)) = self.try_get::<Option<u64>, _>(idx) {
                return i64::try_from(v)
                    .map(Some)
                    .map_err(|_| DbError::marshal(format!("column {}: {} exceeds i64", idx, v)));
            }
            decode_first!(self, idx,
                i64 => id,
                i32 => i64::from,
                i16 => i64::from,
                i8 => i64::from,
                u32 => i64::from,
                u16 => i64::from,
                u8 => i64::from,
                bool => i64::from,
            )
        }

        fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                i64 => |v: i64| v.to_string(),
                u64 => |v: u64| v.to_string(),
                RawDecimal => |v: RawDecimal| v.0,
            )
        }

        fn read_float(&self, idx: usize) -> DbResult<Option<f64>> {
            decode_first!(self, idx,
                f64 => id,
                f32 => f64::from,
                i64 => |v: i64| v as f64,
            )
        }

        fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>> {
            if let Ok(v) = self.try_get::<Option<Decimal>, _>(idx) {
                return Ok(v);
            }
            match self.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(Some(raw)) => Decimal::from_str(&raw.0)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                Ok(None) => Ok(None),
                Err(e) => Err(decode_error(idx, Some(e))),
            }
        }

        fn read_text(&self, idx: usize) -> DbResult<Option<String>> {
            if let Ok(v) = self.try_get::<Option<String>, _>(idx) {
                return Ok(v);
            }
            // binary-collated text comes back as VARBINARY
            match self.try_get::<Option<Vec<u8>>, _>(idx) {
                Ok(Some(bytes)) => String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                Ok(None) => Ok(None),
                Err(e) => Err(decode_error(idx, Some(e))),
            }
        }

        fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>> {
            decode_first!(self, idx,
                Vec<u8> => id,
                String => String::into_bytes,
            )
        }

        fn read_bool(&self, idx: usize) -> DbResult<Option<bool>> {
            decode_first!(self, idx,
                bool => id,
                i64 => |v: i64| v != 0,
                u64 => |v: u64| v != 0,
            )
        }

        fn read_bits(&self, idx: usize) -> DbResult<Option<String>> {
            let width = self
                .columns()
                .get(idx)
                .and_then(|c| mysql_bit_width(c.type_info()));
            decode_first!(self, idx,
                u64 => |v: u64| padded_bits(v, width),
                Vec<u8> => |v: Vec<u8>| {
                    let bits = bits_of_bytes(&v, None);
                    match width {
                        Some(w) if bits.len() > w => bits[bits.len() - w..].to_string(),
                        _ => bits,
                    }
                },
            )
        }

        fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                NaiveDateTime => format_timestamp,
                NaiveDate => |d: NaiveDate| d.format("%Y-%m-%d").to_string(),
                NaiveTime => format_time,
                String => id,
            )
        }

        fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>> {
            if let Ok(v) = self.try_get::<Option<JsonValue>, _>(idx) {
                return Ok(v);
            }
            match self.read_text(idx)? {
                Some(text) => serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                None => Ok(None),
            }
        }

        fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>> {
            if let Ok(Some(text)) = self.try_get::<Option<String>, _>(idx) {
                return Uuid::parse_str(text.trim())
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e)));
            }
            decode_first!(self, idx, Uuid => id)
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::postgres::types::{Oid, PgInterval, PgMoney};

    impl ColumnReader for PgRow {
        row_metadata!();

        fn read_integer(&self, idx: usize) -> DbResult<Option<i64>> {
            decode_first!(self, idx,
                i64 => id,
                i32 => i64::from,
                i16 => i64::from,
                i8 => i64::from,
                Oid => |v: Oid| i64::from(v.0),
            )
        }

        fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>> {
            if let Ok(v) = self.read_integer(idx) {
                return Ok(v.map(|v| v.to_string()));
            }
            decode_first!(self, idx, Decimal => |d: Decimal| d.trunc().to_string())
        }

        fn read_float(&self, idx: usize) -> DbResult<Option<f64>> {
            decode_first!(self, idx, f64 => id, f32 => f64::from)
        }

        fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>> {
            decode_first!(self, idx,
                Decimal => id,
                PgMoney => |m: PgMoney| m.to_decimal(2),
            )
        }

        fn read_text(&self, idx: usize) -> DbResult<Option<String>> {
            if let Ok(v) = self.try_get::<Option<String>, _>(idx) {
                return Ok(v);
            }
            if let Ok(v) = self.try_get::<Option<PgInterval>, _>(idx) {
                return Ok(v.as_ref().map(interval_text));
            }
            match self.try_get::<Option<PgRawValue>, _>(idx) {
                Ok(Some(raw)) => match String::from_utf8(raw.bytes) {
                    Ok(text) => Ok(Some(text)),
                    Err(_) if !raw.text_format => Err(DbError::marshal(format!(
                        "column {} ({}) has no text form",
                        idx,
                        self.column_type_name(idx)
                    ))),
                    Err(e) => Err(DbError::marshal(format!("column {}: {}", idx, e))),
                },
                Ok(None) => Ok(None),
                Err(e) => Err(decode_error(idx, Some(e))),
            }
        }

        fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>> {
            decode_first!(self, idx,
                Vec<u8> => id,
                PgRawValue => |raw: PgRawValue| raw.bytes,
            )
        }

        fn read_bool(&self, idx: usize) -> DbResult<Option<bool>> {
            decode_first!(self, idx, bool => id)
        }

        fn read_bits(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx, PgBits => |b: PgBits| b.0, String => id)
        }

        fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                PgTemporalText => |t: PgTemporalText| t.0,
                String => id,
            )
        }

        fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>> {
            decode_first!(self, idx, JsonValue => id)
        }

        fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>> {
            decode_first!(self, idx, Uuid => id)
        }

        fn read_array(&self, idx: usize) -> DbResult<Option<Vec<HostValue>>> {
            fn items<T: Into<HostValue>>(v: Vec<Option<T>>) -> Vec<HostValue> {
                v.into_iter().map(HostValue::from).collect()
            }
            decode_first!(self, idx,
                Vec<Option<i64>> => items,
                Vec<Option<i32>> => items,
                Vec<Option<i16>> => items,
                Vec<Option<f64>> => items,
                Vec<Option<f32>> => items,
                Vec<Option<bool>> => items,
                Vec<Option<Decimal>> => items,
                Vec<Option<Uuid>> => items,
                Vec<Option<String>> => items,
            )
        }
    }
}

mod sqlite {
    use super::*;

    impl ColumnReader for SqliteRow {
        row_metadata!();

        fn read_integer(&self, idx: usize) -> DbResult<Option<i64>> {
            decode_first!(self, idx, i64 => id, i32 => i64::from, bool => i64::from)
        }

        fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                i64 => |v: i64| v.to_string(),
                String => |v: String| v.trim().to_string(),
            )
        }

        fn read_float(&self, idx: usize) -> DbResult<Option<f64>> {
            decode_first!(self, idx, f64 => id, i64 => |v: i64| v as f64)
        }

        fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>> {
            if let Ok(Some(text)) = self.try_get::<Option<String>, _>(idx) {
                return Decimal::from_str(text.trim())
                    .or_else(|_| Decimal::from_scientific(text.trim()))
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e)));
            }
            if let Ok(v) = self.try_get::<Option<i64>, _>(idx) {
                return Ok(v.map(Decimal::from));
            }
            match self.try_get::<Option<f64>, _>(idx) {
                Ok(Some(f)) => Decimal::try_from(f)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                Ok(None) => Ok(None),
                Err(e) => Err(decode_error(idx, Some(e))),
            }
        }

        fn read_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                String => id,
                i64 => |v: i64| v.to_string(),
                f64 => |v: f64| v.to_string(),
            )
        }

        fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>> {
            decode_first!(self, idx, Vec<u8> => id, String => String::into_bytes)
        }

        fn read_bool(&self, idx: usize) -> DbResult<Option<bool>> {
            decode_first!(self, idx, bool => id, i64 => |v: i64| v != 0)
        }

        // SQLite has no declared bit width, so integers are not accepted here:
        // their leading zeros cannot be recovered.
        fn read_bits(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                String => id,
                Vec<u8> => |v: Vec<u8>| bits_of_bytes(&v, None),
            )
        }

        fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>> {
            decode_first!(self, idx,
                String => id,
                NaiveDateTime => format_timestamp,
            )
        }

        fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>> {
            match self.try_get::<Option<String>, _>(idx) {
                Ok(Some(text)) => serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                Ok(None) => Ok(None),
                Err(_) => decode_first!(self, idx, JsonValue => id),
            }
        }

        fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>> {
            if let Ok(Some(text)) = self.try_get::<Option<String>, _>(idx) {
                return Uuid::parse_str(text.trim())
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e)));
            }
            match self.try_get::<Option<Vec<u8>>, _>(idx) {
                Ok(Some(bytes)) => Uuid::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| DbError::marshal(format!("column {}: {}", idx, e))),
                Ok(None) => Ok(None),
                Err(e) => Err(decode_error(idx, Some(e))),
            }
        }
    }
}
