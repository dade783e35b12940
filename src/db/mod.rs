//! Database connectivity layer.
//!
//! This module provides:
//! - Connection factories (direct driver, pooled datasource, directory lookup)
//! - The `ConnectionHandle` that owns one connection with retry, transactions
//!   and savepoints
//! - Type marshalling between engine values and host values
//! - Result materialization (buffered and streaming)
//! - Per-engine dialect hooks and schema introspection
//! - Engine dispatch macros for reducing code duplication

pub mod connection;
pub mod dialect;
pub mod engine;
pub mod escape;
pub mod factory;
pub mod handle;
#[macro_use]
pub mod macros;
pub mod marshal;
pub mod materialize;
pub mod params;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{
    ColumnMeta, ColumnReader, Cursor, ExecSummary, IsolationLevel, RawConnection, SavepointToken,
    StatementOptions, Step,
};
pub use dialect::{
    DefaultSchema, Dialect, DialectKind, GeneratedKeys, IdentifierCase, KeyStrategy,
};
pub use engine::{EngineConnection, EngineLink, Link};
pub use factory::{
    Binding, ConnectionFactory, DataSource, DirectDriverFactory, Directory, Driver, FactoryKind,
    InMemoryDirectory, LookupDataSourceFactory, PooledDataSourceFactory, SqlxDriver,
    SqlxPoolDataSource, factory_for_settings,
};
pub use handle::ConnectionHandle;
pub use marshal::{MarshalOptions, TypeMarshaller};
pub use materialize::ResultMaterializer;
pub use params::EngineParam;
pub use pool::{DbPool, connect, create_pool};
pub use schema::SchemaIntrospector;
pub use types::EngineRow;
