//! Result-related data models.
//!
//! This module defines the shapes query results are materialized into.

use serde::Serialize;
use serde_json::Value as JsonValue;

use super::value::{HostValue, TypeCode};

/// Metadata for one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Display name, already case-folded for the dialect
    pub name: String,
    /// 1-based
    pub ordinal: usize,
    pub type_code: TypeCode,
    /// Engine type name as reported by the driver
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, ordinal: usize, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            ordinal,
            type_code: TypeCode::from_type_name(&type_name),
            type_name,
            precision: None,
            scale: None,
            nullable: None,
        }
    }

    pub fn with_type_code(mut self, type_code: TypeCode) -> Self {
        self.type_code = type_code;
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }
}

/// A fully buffered query result.
///
/// Every row holds exactly one value per column, in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<HostValue>>,
    /// Whether rows were dropped because of `max_rows`
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl ResultTable {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            truncated: false,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Position of a column by display name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Value at `row`, column `name`.
    pub fn get(&self, row: usize, name: &str) -> Option<&HostValue> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Rows as JSON arrays.
    pub fn rows_json(&self) -> JsonValue {
        JsonValue::Array(
            self.rows
                .iter()
                .map(|row| JsonValue::Array(row.iter().map(HostValue::to_json).collect()))
                .collect(),
        )
    }

    /// Rows as JSON objects keyed by column name.
    pub fn records_json(&self) -> Vec<serde_json::Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Outcome of running raw SQL through `execute`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    RowsAffected { rows_affected: u64 },
    Table(ResultTable),
}

impl ExecuteOutcome {
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Self::RowsAffected { rows_affected } => Some(*rows_affected),
            Self::Table(_) => None,
        }
    }

    pub fn into_table(self) -> Option<ResultTable> {
        match self {
            Self::Table(t) => Some(t),
            Self::RowsAffected { .. } => None,
        }
    }
}

/// Keys generated by an insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GeneratedKey {
    /// No key was produced, or retrieval is disabled for the dialect
    None,
    Single(HostValue),
    Multiple(Vec<HostValue>),
}

impl GeneratedKey {
    /// Collapse a list of keys: empty is `None`, one is `Single`.
    pub fn from_keys(mut keys: Vec<HostValue>) -> Self {
        match keys.len() {
            0 => Self::None,
            1 => Self::Single(keys.remove(0)),
            _ => Self::Multiple(keys),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_single(&self) -> Option<&HostValue> {
        match self {
            Self::Single(v) => Some(v),
            _ => None,
        }
    }
}
