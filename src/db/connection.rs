//! Engine-independent connection and row seams.
//!
//! `RawConnection` is what a `ConnectionHandle` owns and drives; `ColumnReader`
//! is one fetched row as seen by the marshaller. The sqlx-backed implementations
//! live in `db::engine` and `db::types`.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::params::EngineParam;
use crate::error::{DbError, DbResult};
use crate::models::HostValue;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "read uncommitted" | "uncommitted" => Ok(Self::ReadUncommitted),
            "read committed" | "committed" => Ok(Self::ReadCommitted),
            "repeatable read" | "repeatable" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(DbError::isolation_unsupported(s, "unknown isolation level")),
        }
    }
}

/// Per-statement preparation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementOptions {
    /// Keep the prepared statement in the connection's statement cache
    pub persistent: bool,
}

impl Default for StatementOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// Summary of a non-query statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_affected: u64,
    /// Engine-assigned id of the last inserted row, when the engine reports one
    pub last_insert_id: Option<i64>,
}

/// Native savepoint handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointToken {
    pub name: String,
    /// Creation order on the owning connection
    pub seq: u64,
}

/// One item of a raw multi-statement result stream.
#[derive(Debug)]
pub enum Step<R> {
    Row(R),
    Done { rows_affected: u64 },
}

/// Label and engine type name of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub label: String,
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(label: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            type_name: type_name.into(),
        }
    }
}

/// An open query result: the statement's columns plus the row stream.
///
/// `columns` comes from the prepared statement, so it is filled in even when
/// the query matches no rows. Dropping `rows` releases the cursor.
pub struct Cursor<'a, R> {
    pub columns: Vec<ColumnMeta>,
    pub rows: BoxStream<'a, DbResult<R>>,
}

impl<'a, R> Cursor<'a, R> {
    pub fn new(columns: Vec<ColumnMeta>, rows: BoxStream<'a, DbResult<R>>) -> Self {
        Self { columns, rows }
    }
}

/// Read access to the columns of one fetched row.
///
/// Every `read_*` returns `Ok(None)` for SQL NULL. An `Err` means the column could
/// not be read as the requested shape.
pub trait ColumnReader: Send {
    fn column_count(&self) -> usize;

    /// Label as reported by the engine, before case folding.
    fn column_label(&self, idx: usize) -> &str;

    /// Engine type name, e.g. `INT4` or `VARCHAR`.
    fn column_type_name(&self, idx: usize) -> &str;

    /// Labels and type names of every column of this row.
    fn column_meta(&self) -> Vec<ColumnMeta> {
        (0..self.column_count())
            .map(|idx| ColumnMeta::new(self.column_label(idx), self.column_type_name(idx)))
            .collect()
    }

    fn is_null(&self, idx: usize) -> bool;

    fn read_integer(&self, idx: usize) -> DbResult<Option<i64>>;

    /// Canonical decimal string of an integer column, for values that may not fit i64.
    fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>>;

    fn read_float(&self, idx: usize) -> DbResult<Option<f64>>;

    fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>>;

    fn read_text(&self, idx: usize) -> DbResult<Option<String>>;

    fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>>;

    fn read_bool(&self, idx: usize) -> DbResult<Option<bool>>;

    /// Bit string, one `0`/`1` per bit.
    fn read_bits(&self, idx: usize) -> DbResult<Option<String>>;

    /// Canonical text form of a date, time or timestamp column.
    ///
    /// Infinity sentinels come back as `infinity` / `-infinity` and BC dates
    /// carry a ` BC` suffix.
    fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>>;

    fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>>;

    fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>>;

    fn read_array(&self, idx: usize) -> DbResult<Option<Vec<HostValue>>> {
        Err(DbError::marshal(format!(
            "column {} ({}) cannot be read as an array",
            idx,
            self.column_type_name(idx)
        )))
    }
}

/// A live engine connection owned by exactly one `ConnectionHandle`.
///
/// Auto-commit follows the usual driver contract: while it is off, the first
/// statement opens a transaction that stays open until `commit` / `rollback`.
#[async_trait]
pub trait RawConnection: Send + 'static {
    type Row: ColumnReader + 'static;

    /// Run a query and return its cursor.
    async fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [EngineParam],
        options: StatementOptions,
    ) -> DbResult<Cursor<'a, Self::Row>>;

    async fn execute(
        &mut self,
        sql: &str,
        params: &[EngineParam],
        options: StatementOptions,
    ) -> DbResult<ExecSummary>;

    /// Run unprepared SQL, possibly several statements, yielding rows and
    /// per-statement completions in order.
    async fn execute_raw<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> DbResult<BoxStream<'a, DbResult<Step<Self::Row>>>>;

    /// Native validity check.
    async fn ping(&mut self) -> DbResult<()>;

    fn auto_commit(&self) -> bool;

    async fn set_auto_commit(&mut self, enabled: bool) -> DbResult<()>;

    async fn set_isolation(&mut self, level: IsolationLevel) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Create a savepoint, generating a name when none is given.
    async fn savepoint(&mut self, name: Option<&str>) -> DbResult<SavepointToken>;

    async fn rollback_to(&mut self, token: &SavepointToken) -> DbResult<()>;

    async fn release(&mut self, token: &SavepointToken) -> DbResult<()>;

    async fn server_version(&mut self) -> DbResult<Option<String>>;

    async fn close(self) -> DbResult<()>
    where
        Self: Sized;
}

/// Validate a savepoint name before it is spliced into SQL.
pub(crate) fn check_savepoint_name(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_identifier(
            name,
            "savepoint names may only contain letters, digits, '_' and '$'",
        ))
    }
}

/// Name for a savepoint created without one.
pub(crate) fn generated_savepoint_name(seq: u64) -> String {
    format!("SAVEPOINT_{}", seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
    }

    #[test]
    fn test_savepoint_name_validation() {
        assert!(check_savepoint_name("sp_1").is_ok());
        assert!(check_savepoint_name("SAVEPOINT_3").is_ok());
        assert!(check_savepoint_name("").is_err());
        assert!(check_savepoint_name("a\"; DROP TABLE t; --").is_err());
    }

    #[test]
    fn test_generated_savepoint_name() {
        assert_eq!(generated_savepoint_name(1), "SAVEPOINT_1");
    }
}
