//! Per-engine dialects.
//!
//! A `Dialect` is a small record of hooks consumed by the marshaller, the
//! materializer, the handle and the introspector. Everything not overridden by a
//! hook runs the shared implementation.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::config::{ConnectionSettings, TimeZoneSetting};
use crate::db::connection::ColumnReader;
use crate::db::marshal::MarshalOptions;
use crate::db::params::EngineParam;
use crate::error::{DbError, DbResult};
use crate::models::{BindParameter, ColumnDescriptor, HostValue, TypeCode};

/// Engine family a dialect belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectKind {
    Postgres,
    MySql,
    Sqlite,
    Derby,
    H2,
    Generic,
}

impl DialectKind {
    /// Resolve from a driver name or URL scheme.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Self::Postgres,
            "mysql" | "mariadb" | "mysql2" => Self::MySql,
            "sqlite" | "sqlite3" => Self::Sqlite,
            "derby" => Self::Derby,
            "h2" => Self::H2,
            _ => Self::Generic,
        }
    }

    /// Resolve from a connection URL such as `postgres://...` or `sqlite:file.db`.
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split(':').next().unwrap_or_default();
        // jdbc:derby:... style URLs carry the engine in the second segment
        if scheme.eq_ignore_ascii_case("jdbc") {
            return url.split(':').nth(1).map(Self::from_name).unwrap_or(Self::Generic);
        }
        Self::from_name(scheme)
    }

    /// Explicit driver name first, then the URL scheme.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        if let Some(driver) = &settings.driver {
            return Self::from_name(driver);
        }
        settings
            .url
            .as_deref()
            .map(Self::from_url)
            .unwrap_or(Self::Generic)
    }
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::MySql => write!(f, "mysql"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Derby => write!(f, "derby"),
            Self::H2 => write!(f, "h2"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// How the engine stores unquoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    Upper,
    Lower,
    Preserve,
}

fn has_upper(s: &str) -> bool {
    s.chars().any(char::is_uppercase)
}

fn has_lower(s: &str) -> bool {
    s.chars().any(char::is_lowercase)
}

impl IdentifierCase {
    /// Fold a stored identifier for display.
    ///
    /// An uppercase-storing engine reports `ID` as `id`; mixed-case names such as
    /// `Id` were quoted on creation and are left alone.
    pub fn to_display(&self, stored: &str) -> String {
        match self {
            Self::Upper if has_upper(stored) && !has_lower(stored) => stored.to_lowercase(),
            _ => stored.to_string(),
        }
    }

    /// Fold a caller-supplied identifier into the engine's storage case.
    pub fn to_storage(&self, ident: &str) -> String {
        match self {
            Self::Upper if has_lower(ident) && !has_upper(ident) => ident.to_uppercase(),
            Self::Lower if has_upper(ident) && !has_lower(ident) => ident.to_lowercase(),
            _ => ident.to_string(),
        }
    }
}

/// How generated keys are obtained after an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Append `RETURNING *` and read the first column
    Returning,
    /// Read the id the engine reports with the statement result
    LastInsertId,
}

/// Generated-key retrieval capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedKeys {
    Supported(KeyStrategy),
    /// The driver supports it but is known to misreport; retrieval stays disabled
    KnownBuggy { reason: &'static str },
    Unsupported,
}

impl GeneratedKeys {
    pub fn strategy(&self) -> Option<KeyStrategy> {
        match self {
            Self::Supported(strategy) => Some(*strategy),
            _ => None,
        }
    }
}

/// Schema used when the caller supplies none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultSchema {
    Named(&'static str),
    /// The database the connection is attached to
    CurrentDatabase,
    None,
}

/// Column decode override. `None` hands the column back to the shared decoder.
pub type DecodeHook = fn(
    &dyn ColumnReader,
    usize,
    &ColumnDescriptor,
    &MarshalOptions,
) -> Option<DbResult<HostValue>>;

/// Parameter encode override. `None` hands the parameter back to the shared encoder.
pub type EncodeHook =
    fn(&BindParameter, TypeCode, &MarshalOptions) -> Option<DbResult<EngineParam>>;

/// Statements run right after a connection is established.
pub type PostConnectHook = fn(&ConnectionSettings) -> Vec<String>;

#[derive(Clone, Copy)]
pub struct Dialect {
    pub kind: DialectKind,
    pub identifier_case: IdentifierCase,
    pub default_schema: DefaultSchema,
    pub generated_keys: GeneratedKeys,
    /// Rewrite `{fn ...}`-style escapes unless the settings say otherwise
    pub escape_processing: bool,
    pub decode_hook: Option<DecodeHook>,
    pub encode_hook: Option<EncodeHook>,
    pub post_connect: PostConnectHook,
}

impl std::fmt::Debug for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialect")
            .field("kind", &self.kind)
            .field("identifier_case", &self.identifier_case)
            .field("default_schema", &self.default_schema)
            .field("generated_keys", &self.generated_keys)
            .field("escape_processing", &self.escape_processing)
            .field("decode_hook", &self.decode_hook.is_some())
            .field("encode_hook", &self.encode_hook.is_some())
            .finish()
    }
}

fn no_setup(_: &ConnectionSettings) -> Vec<String> {
    Vec::new()
}

impl Dialect {
    /// Shared behavior with no overrides.
    pub fn generic() -> Self {
        Self {
            kind: DialectKind::Generic,
            identifier_case: IdentifierCase::Preserve,
            default_schema: DefaultSchema::None,
            generated_keys: GeneratedKeys::Unsupported,
            escape_processing: false,
            decode_hook: None,
            encode_hook: None,
            post_connect: no_setup,
        }
    }

    pub fn postgres() -> Self {
        Self {
            kind: DialectKind::Postgres,
            identifier_case: IdentifierCase::Lower,
            default_schema: DefaultSchema::Named("public"),
            generated_keys: GeneratedKeys::Supported(KeyStrategy::Returning),
            encode_hook: Some(postgres::encode_array),
            post_connect: postgres::post_connect,
            ..Self::generic()
        }
    }

    pub fn mysql() -> Self {
        Self {
            kind: DialectKind::MySql,
            default_schema: DefaultSchema::CurrentDatabase,
            generated_keys: GeneratedKeys::Supported(KeyStrategy::LastInsertId),
            decode_hook: Some(mysql::decode_tinyint_bool),
            post_connect: mysql::post_connect,
            ..Self::generic()
        }
    }

    pub fn sqlite() -> Self {
        Self {
            kind: DialectKind::Sqlite,
            default_schema: DefaultSchema::Named("main"),
            generated_keys: GeneratedKeys::Supported(KeyStrategy::LastInsertId),
            decode_hook: Some(sqlite::decode_decimal),
            post_connect: sqlite::post_connect,
            ..Self::generic()
        }
    }

    pub fn derby() -> Self {
        Self {
            kind: DialectKind::Derby,
            identifier_case: IdentifierCase::Upper,
            default_schema: DefaultSchema::Named("APP"),
            generated_keys: GeneratedKeys::KnownBuggy {
                reason: "the driver returns all inserted rows instead of none for tables \
                         without a generated key column",
            },
            ..Self::generic()
        }
    }

    pub fn h2() -> Self {
        Self {
            kind: DialectKind::H2,
            identifier_case: IdentifierCase::Upper,
            default_schema: DefaultSchema::Named("PUBLIC"),
            generated_keys: GeneratedKeys::Supported(KeyStrategy::LastInsertId),
            ..Self::generic()
        }
    }

    pub fn for_kind(kind: DialectKind) -> Self {
        match kind {
            DialectKind::Postgres => Self::postgres(),
            DialectKind::MySql => Self::mysql(),
            DialectKind::Sqlite => Self::sqlite(),
            DialectKind::Derby => Self::derby(),
            DialectKind::H2 => Self::h2(),
            DialectKind::Generic => Self::generic(),
        }
    }

    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::for_kind(DialectKind::from_settings(settings))
    }

    pub fn with_identifier_case(mut self, case: IdentifierCase) -> Self {
        self.identifier_case = case;
        self
    }

    pub fn with_generated_keys(mut self, keys: GeneratedKeys) -> Self {
        self.generated_keys = keys;
        self
    }

    pub fn with_decode_hook(mut self, hook: DecodeHook) -> Self {
        self.decode_hook = Some(hook);
        self
    }

    pub fn with_encode_hook(mut self, hook: EncodeHook) -> Self {
        self.encode_hook = Some(hook);
        self
    }

    pub fn with_post_connect(mut self, hook: PostConnectHook) -> Self {
        self.post_connect = hook;
        self
    }

    /// Column label as shown to callers.
    pub fn display_name(&self, label: &str) -> String {
        self.identifier_case.to_display(label)
    }

    /// Identifier as the engine stores it, for catalog lookups.
    pub fn storage_name(&self, ident: &str) -> String {
        self.identifier_case.to_storage(ident)
    }

    pub fn post_connect_statements(&self, settings: &ConnectionSettings) -> Vec<String> {
        (self.post_connect)(settings)
    }

    /// Whether escape clauses are rewritten for this handle.
    pub fn escape_processing(&self, settings: &ConnectionSettings) -> bool {
        settings
            .statement_escape_processing
            .unwrap_or(self.escape_processing)
    }

    /// Quote an identifier for splicing into SQL text.
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self.kind {
            DialectKind::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// =============================================================================
// Engine Hooks
// =============================================================================

mod postgres {
    use super::*;

    pub fn post_connect(settings: &ConnectionSettings) -> Vec<String> {
        let mut statements = vec!["SET DateStyle = 'ISO, MDY'".to_string()];
        if settings.database_timezone == TimeZoneSetting::Utc {
            statements.push("SET TIME ZONE 'UTC'".to_string());
        }
        statements
    }

    /// Bind arrays as native typed arrays instead of JSON text.
    pub fn encode_array(
        param: &BindParameter,
        code: TypeCode,
        _options: &MarshalOptions,
    ) -> Option<DbResult<EngineParam>> {
        if code != TypeCode::Array {
            return None;
        }
        let HostValue::Array(items) = &param.value else {
            return None;
        };
        let element = param
            .declared_type
            .as_deref()
            .map(element_type_code)
            .unwrap_or_else(|| infer_element(items));
        Some(build_array(items, element))
    }

    fn element_type_code(declared: &str) -> TypeCode {
        let trimmed = declared.trim();
        let base = trimmed
            .strip_suffix("[]")
            .or_else(|| trimmed.strip_prefix('_'))
            .unwrap_or(trimmed);
        TypeCode::from_type_name(base)
    }

    fn infer_element(items: &[HostValue]) -> TypeCode {
        items
            .iter()
            .find(|v| !v.is_null())
            .map(|v| match v {
                HostValue::Integer(_) | HostValue::BigInteger(_) => TypeCode::BigInt,
                HostValue::Float(_) | HostValue::Decimal(_) => TypeCode::Double,
                HostValue::Bool(_) => TypeCode::Boolean,
                _ => TypeCode::Varchar,
            })
            .unwrap_or(TypeCode::Varchar)
    }

    fn build_array(items: &[HostValue], element: TypeCode) -> DbResult<EngineParam> {
        let mismatch = |v: &HostValue| {
            DbError::marshal(format!(
                "array element {} does not match element type {:?}",
                v.type_name(),
                element
            ))
        };
        match element {
            TypeCode::SmallInt | TypeCode::Integer | TypeCode::BigInt => items
                .iter()
                .map(|v| match v {
                    HostValue::Null => Ok(None),
                    other => other.as_i64().map(Some).ok_or_else(|| mismatch(other)),
                })
                .collect::<DbResult<Vec<_>>>()
                .map(EngineParam::IntArray),
            TypeCode::Real | TypeCode::Double | TypeCode::Decimal => items
                .iter()
                .map(|v| match v {
                    HostValue::Null => Ok(None),
                    HostValue::Float(f) => Ok(Some(*f)),
                    HostValue::Integer(i) => Ok(Some(*i as f64)),
                    HostValue::Decimal(d) => d.to_string().parse().map(Some).map_err(|_| mismatch(v)),
                    other => Err(mismatch(other)),
                })
                .collect::<DbResult<Vec<_>>>()
                .map(EngineParam::FloatArray),
            TypeCode::Boolean | TypeCode::Bit => items
                .iter()
                .map(|v| match v {
                    HostValue::Null => Ok(None),
                    other => other.as_bool().map(Some).ok_or_else(|| mismatch(other)),
                })
                .collect::<DbResult<Vec<_>>>()
                .map(EngineParam::BoolArray),
            _ => Ok(EngineParam::TextArray(
                items
                    .iter()
                    .map(|v| (!v.is_null()).then(|| v.to_string()))
                    .collect(),
            )),
        }
    }
}

mod mysql {
    use super::*;

    pub fn post_connect(settings: &ConnectionSettings) -> Vec<String> {
        match settings.database_timezone {
            TimeZoneSetting::Utc => vec!["SET time_zone = '+00:00'".to_string()],
            TimeZoneSetting::Local => Vec::new(),
        }
    }

    /// `TINYINT(1)` is MySQL's boolean; the driver reports it as `BOOLEAN`.
    pub fn decode_tinyint_bool(
        reader: &dyn ColumnReader,
        idx: usize,
        column: &ColumnDescriptor,
        options: &MarshalOptions,
    ) -> Option<DbResult<HostValue>> {
        if !column.type_name.eq_ignore_ascii_case("BOOLEAN") {
            return None;
        }
        let value = reader.read_integer(idx).map(|raw| {
            if reader.is_null(idx) {
                return HostValue::Null;
            }
            let v = raw.unwrap_or_default();
            if options.raw_booleans {
                HostValue::Text(v.to_string())
            } else {
                HostValue::Bool(v != 0)
            }
        });
        Some(value)
    }
}

mod sqlite {
    use super::*;

    pub fn post_connect(_settings: &ConnectionSettings) -> Vec<String> {
        vec!["PRAGMA foreign_keys = ON".to_string()]
    }

    /// SQLite keeps decimals as TEXT, REAL or INTEGER depending on the value.
    pub fn decode_decimal(
        reader: &dyn ColumnReader,
        idx: usize,
        column: &ColumnDescriptor,
        _options: &MarshalOptions,
    ) -> Option<DbResult<HostValue>> {
        if column.type_code != TypeCode::Decimal {
            return None;
        }
        Some(read_decimal(reader, idx))
    }

    fn read_decimal(reader: &dyn ColumnReader, idx: usize) -> DbResult<HostValue> {
        if reader.is_null(idx) {
            return Ok(HostValue::Null);
        }
        if let Ok(Some(text)) = reader.read_text(idx) {
            let text = text.trim();
            return Decimal::from_str(text)
                .or_else(|_| Decimal::from_scientific(text))
                .map(HostValue::Decimal)
                .map_err(|e| DbError::marshal(format!("invalid decimal '{}': {}", text, e)));
        }
        if let Ok(Some(v)) = reader.read_integer(idx) {
            return Ok(HostValue::Decimal(Decimal::from(v)));
        }
        match reader.read_float(idx)? {
            Some(f) => Decimal::try_from(f)
                .map(HostValue::Decimal)
                .map_err(|e| DbError::marshal(format!("invalid decimal {}: {}", f, e))),
            None => Ok(HostValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_case_display_folding() {
        let case = IdentifierCase::Upper;
        assert_eq!(case.to_display("ID"), "id");
        assert_eq!(case.to_display("FIRST_NAME"), "first_name");
        assert_eq!(case.to_display("Id"), "Id");
        assert_eq!(case.to_display("id"), "id");
        assert_eq!(case.to_display("_1"), "_1");
    }

    #[test]
    fn test_storage_folding() {
        assert_eq!(IdentifierCase::Upper.to_storage("users"), "USERS");
        assert_eq!(IdentifierCase::Upper.to_storage("Users"), "Users");
        assert_eq!(IdentifierCase::Lower.to_storage("USERS"), "users");
        assert_eq!(IdentifierCase::Lower.to_storage("Users"), "Users");
        assert_eq!(IdentifierCase::Preserve.to_storage("USERS"), "USERS");
    }

    #[test]
    fn test_lower_and_preserve_display_unchanged() {
        assert_eq!(IdentifierCase::Lower.to_display("ID"), "ID");
        assert_eq!(IdentifierCase::Preserve.to_display("ID"), "ID");
    }

    #[test]
    fn test_kind_from_url() {
        assert_eq!(DialectKind::from_url("postgres://h/db"), DialectKind::Postgres);
        assert_eq!(DialectKind::from_url("postgresql://h/db"), DialectKind::Postgres);
        assert_eq!(DialectKind::from_url("mariadb://h/db"), DialectKind::MySql);
        assert_eq!(DialectKind::from_url("sqlite::memory:"), DialectKind::Sqlite);
        assert_eq!(DialectKind::from_url("jdbc:derby:memory:db"), DialectKind::Derby);
        assert_eq!(DialectKind::from_url("h2:mem:test"), DialectKind::H2);
        assert_eq!(DialectKind::from_url("oracle://h"), DialectKind::Generic);
    }

    #[test]
    fn test_driver_overrides_scheme() {
        let mut settings = ConnectionSettings::new("postgres://h/db");
        settings.driver = Some("mysql".into());
        assert_eq!(DialectKind::from_settings(&settings), DialectKind::MySql);
    }

    #[test]
    fn test_dialect_capabilities() {
        assert_eq!(
            Dialect::postgres().generated_keys.strategy(),
            Some(KeyStrategy::Returning)
        );
        assert!(matches!(
            Dialect::derby().generated_keys,
            GeneratedKeys::KnownBuggy { .. }
        ));
        assert_eq!(Dialect::generic().generated_keys.strategy(), None);
        assert_eq!(Dialect::derby().default_schema, DefaultSchema::Named("APP"));
        assert_eq!(
            Dialect::mysql().default_schema,
            DefaultSchema::CurrentDatabase
        );
    }

    #[test]
    fn test_escape_processing_defaults_off() {
        let settings = ConnectionSettings::default();
        for kind in [
            DialectKind::Postgres,
            DialectKind::MySql,
            DialectKind::Sqlite,
            DialectKind::Derby,
            DialectKind::H2,
            DialectKind::Generic,
        ] {
            assert!(!Dialect::for_kind(kind).escape_processing(&settings));
        }
        let settings = ConnectionSettings {
            statement_escape_processing: Some(true),
            ..ConnectionSettings::default()
        };
        assert!(Dialect::sqlite().escape_processing(&settings));
    }

    #[test]
    fn test_override_keeps_other_hooks() {
        let dialect = Dialect::sqlite().with_identifier_case(IdentifierCase::Upper);
        assert!(dialect.decode_hook.is_some());
        assert_eq!(dialect.display_name("NAME"), "name");
        assert_eq!(
            dialect.generated_keys,
            GeneratedKeys::Supported(KeyStrategy::LastInsertId)
        );
    }

    #[test]
    fn test_post_connect_statements() {
        let mut settings = ConnectionSettings::default();
        assert_eq!(
            Dialect::sqlite().post_connect_statements(&settings),
            vec!["PRAGMA foreign_keys = ON"]
        );
        assert!(Dialect::mysql().post_connect_statements(&settings).is_empty());
        settings.database_timezone = TimeZoneSetting::Utc;
        assert_eq!(Dialect::mysql().post_connect_statements(&settings).len(), 1);
        assert_eq!(Dialect::postgres().post_connect_statements(&settings).len(), 2);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(Dialect::mysql().quote_identifier("a`b"), "`a``b`");
        assert_eq!(Dialect::postgres().quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_postgres_array_encoding() {
        let options = MarshalOptions::default();
        let param = BindParameter::declared(
            HostValue::Array(vec![HostValue::Integer(1), HostValue::Null]),
            "int4[]",
        );
        let encoded = postgres::encode_array(&param, TypeCode::Array, &options)
            .unwrap()
            .unwrap();
        assert_eq!(encoded, EngineParam::IntArray(vec![Some(1), None]));

        let param = BindParameter::new(HostValue::Array(vec![HostValue::Text("a".into())]));
        let encoded = postgres::encode_array(&param, TypeCode::Array, &options)
            .unwrap()
            .unwrap();
        assert_eq!(encoded, EngineParam::TextArray(vec![Some("a".into())]));

        let param = BindParameter::new(1i64);
        assert!(postgres::encode_array(&param, TypeCode::Integer, &options).is_none());
    }

    #[test]
    fn test_postgres_array_element_mismatch() {
        let options = MarshalOptions::default();
        let param = BindParameter::declared(
            HostValue::Array(vec![HostValue::Text("x".into())]),
            "_int8",
        );
        let result = postgres::encode_array(&param, TypeCode::Array, &options).unwrap();
        assert!(result.is_err());
    }
}
