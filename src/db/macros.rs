//! Engine dispatch macros for reducing code duplication.
//!
//! The sqlx-backed types (`EngineRow`, `EngineLink`) are enums with one variant
//! per engine. These macros generate the match arms so each method stays a
//! single readable line.

/// Generate per-engine match arms for an engine enum living in `crate::db`.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(link, EngineLink, {
///     MySql(c) => mysql_version(c).await,
///     Postgres(c) => pg_version(c).await,
///     SQLite(c) => sqlite_version(c).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($target:expr, $enum:ident, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $target {
            $(
                $crate::db::$enum::$variant($p) => $body,
            )+
        }
    };
}

/// Same body for every engine.
///
/// The body is expanded once per arm, so it may use methods whose signatures
/// differ between engines.
#[macro_export]
macro_rules! db_dispatch_all {
    ($target:expr, $enum:ident, $p:ident => $body:expr) => {
        $crate::impl_db_dispatch!($target, $enum, {
            MySql($p) => $body,
            Postgres($p) => $body,
            SQLite($p) => $body,
        })
    };
}
