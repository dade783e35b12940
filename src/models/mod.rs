//! Data models for the connectivity core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod result;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use result::{ColumnDescriptor, ExecuteOutcome, GeneratedKey, ResultTable};
pub use schema::{
    ColumnDefinition, DefaultValue, ForeignKey, ForeignKeyAction, IndexInfo, PrimaryKeyColumn,
    TableInfo, TableName, TableSchema, TableType,
};
pub use value::{BindParameter, HostValue, Infinity, TypeCategory, TypeCode};
