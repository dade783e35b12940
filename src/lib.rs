//! unidb Library
//!
//! A relational connectivity core over SQLite, PostgreSQL and MySQL: connection
//! factories, a retrying connection handle with transactions and savepoints,
//! type marshalling, result materialization, per-engine dialect hooks and
//! schema introspection.

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod models;

pub use config::{Config, ConnectionSettings};
pub use db::{ConnectionHandle, Dialect, SchemaIntrospector};
pub use error::{DbError, DbResult};
