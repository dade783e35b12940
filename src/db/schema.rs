//! Schema introspection.
//!
//! Every listing issues one metadata query through the owning
//! `ConnectionHandle`, so it shares the handle's retry policy and type
//! marshalling. Requested identifiers are folded into the engine's storage case
//! before querying; names coming back are folded for display the same way result
//! labels are.
//!
//! # Architecture
//!
//! SQL lives in the `queries` submodule, one set per catalog family. Each query
//! returns a fixed positional column layout, so rows map to descriptors the same
//! way for every engine.

use tracing::debug;

use crate::db::connection::RawConnection;
use crate::db::dialect::{DefaultSchema, Dialect, DialectKind, quote_literal};
use crate::db::engine::EngineConnection;
use crate::db::handle::ConnectionHandle;
use crate::error::{DbError, DbResult};
use crate::models::{
    BindParameter, ColumnDefinition, ForeignKey, ForeignKeyAction, HostValue,
    IndexInfo, PrimaryKeyColumn, TableInfo, TableName, TableSchema, TableType, TypeCode,
};

// =============================================================================
// SQL Query Templates
// =============================================================================
//
// Column layouts shared by every family:
//   tables        name, type, schema
//   columns       name, data type, nullable, default, primary key, ordinal, extra
//   primary keys  column, key sequence, constraint
//   foreign keys  constraint, column, referenced table, referenced column,
//                 delete rule, update rule
//   indexes       name, columns (comma separated), unique, primary

mod queries {
    pub mod postgres {
        pub const TABLES: &str = r#"
            SELECT
                t.table_name::text,
                t.table_type::text,
                t.table_schema::text
            FROM information_schema.tables t
            WHERE t.table_schema::text = $1
            AND t.table_type IN ('BASE TABLE', 'VIEW')
            AND t.table_name::text = COALESCE($2::text, t.table_name::text)
            ORDER BY t.table_name
            "#;

        pub const COLUMNS: &str = r#"
        SELECT
            c.column_name::text,
            format_type(a.atttypid, a.atttypmod) AS data_type,
            (c.is_nullable::text = 'YES') AS is_nullable,
            c.column_default::text,
            (pk.column_name IS NOT NULL) AS is_primary_key,
            c.ordinal_position::int8,
            NULL::text AS extra
        FROM information_schema.columns c
        JOIN pg_class t ON t.relname = c.table_name
        JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        LEFT JOIN (
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_schema::text = $1
            AND tc.table_name::text = $2
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_schema::text = $1 AND c.table_name::text = $2
        ORDER BY c.ordinal_position
        "#;

        pub const PRIMARY_KEYS: &str = r#"
        SELECT
            kcu.column_name::text,
            kcu.ordinal_position::int8,
            tc.constraint_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
            AND tc.table_name = kcu.table_name
        WHERE tc.table_schema::text = $1
        AND tc.table_name::text = $2
        AND tc.constraint_type = 'PRIMARY KEY'
        ORDER BY kcu.ordinal_position
        "#;

        pub const FOREIGN_KEYS: &str = r#"
        SELECT
            tc.constraint_name::text,
            kcu.column_name::text,
            ccu.table_name::text AS foreign_table_name,
            ccu.column_name::text AS foreign_column_name,
            rc.delete_rule::text,
            rc.update_rule::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage ccu
            ON ccu.constraint_name = tc.constraint_name
            AND ccu.table_schema = tc.table_schema
        JOIN information_schema.referential_constraints rc
            ON rc.constraint_name = tc.constraint_name
            AND rc.constraint_schema = tc.table_schema
        WHERE tc.table_schema::text = $1
        AND tc.table_name::text = $2
        AND tc.constraint_type = 'FOREIGN KEY'
        ORDER BY tc.constraint_name, kcu.ordinal_position
        "#;

        pub const INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey, a.attnum)) AS column_names,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname::text = $1 AND t.relname::text = $2
        GROUP BY i.relname, ix.indisunique, ix.indisprimary
        ORDER BY i.relname
        "#;
    }

    pub mod mysql {
        pub const TABLES: &str = r#"
            SELECT
                CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
                CONVERT(TABLE_TYPE USING utf8) AS TABLE_TYPE,
                CONVERT(TABLE_SCHEMA USING utf8) AS TABLE_SCHEMA
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND TABLE_TYPE IN ('BASE TABLE', 'VIEW')
            AND TABLE_NAME = COALESCE(?, TABLE_NAME)
            ORDER BY TABLE_NAME
            "#;

        pub const COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8) AS COLUMN_TYPE,
            IS_NULLABLE = 'YES' AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8) AS COLUMN_DEFAULT,
            COLUMN_KEY = 'PRI' AS IS_PRIMARY_KEY,
            ORDINAL_POSITION,
            CONVERT(EXTRA USING utf8) AS EXTRA
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION
        "#;

        pub const PRIMARY_KEYS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            ORDINAL_POSITION,
            CONVERT(CONSTRAINT_NAME USING utf8) AS CONSTRAINT_NAME
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
        AND TABLE_NAME = ?
        AND CONSTRAINT_NAME = 'PRIMARY'
        ORDER BY ORDINAL_POSITION
        "#;

        pub const FOREIGN_KEYS: &str = r#"
        SELECT
            CONVERT(k.CONSTRAINT_NAME USING utf8) AS CONSTRAINT_NAME,
            CONVERT(k.COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(k.REFERENCED_TABLE_NAME USING utf8) AS REFERENCED_TABLE_NAME,
            CONVERT(k.REFERENCED_COLUMN_NAME USING utf8) AS REFERENCED_COLUMN_NAME,
            CONVERT(rc.DELETE_RULE USING utf8) AS DELETE_RULE,
            CONVERT(rc.UPDATE_RULE USING utf8) AS UPDATE_RULE
        FROM information_schema.KEY_COLUMN_USAGE k
        JOIN information_schema.REFERENTIAL_CONSTRAINTS rc
            ON rc.CONSTRAINT_SCHEMA = k.TABLE_SCHEMA
            AND rc.CONSTRAINT_NAME = k.CONSTRAINT_NAME
            AND rc.TABLE_NAME = k.TABLE_NAME
        WHERE k.TABLE_SCHEMA = COALESCE(?, DATABASE())
        AND k.TABLE_NAME = ?
        AND k.REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;

        pub const INDEXES: &str = r#"
        SELECT
            CONVERT(INDEX_NAME USING utf8) AS INDEX_NAME,
            CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) USING utf8) AS COLUMN_NAMES,
            NOT NON_UNIQUE AS IS_UNIQUE,
            INDEX_NAME = 'PRIMARY' AS IS_PRIMARY
        FROM information_schema.STATISTICS
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
        GROUP BY INDEX_NAME, NON_UNIQUE
        ORDER BY INDEX_NAME
        "#;
    }

    pub mod sqlite {
        /// `{schema}` is replaced with the quoted schema name.
        pub const TABLES: &str = r#"
            SELECT name, type, NULL
            FROM {schema}.sqlite_master
            WHERE type IN ('table', 'view')
            AND name NOT LIKE 'sqlite_%'
            AND name = COALESCE(?, name)
            ORDER BY name
            "#;

        pub const COLUMNS: &str = r#"
        SELECT name, type, "notnull" = 0, dflt_value, pk > 0, cid + 1, NULL
        FROM pragma_table_info(?, ?)
        ORDER BY cid
        "#;

        pub const PRIMARY_KEYS: &str = r#"
        SELECT name, pk, NULL
        FROM pragma_table_info(?, ?)
        WHERE pk > 0
        ORDER BY pk
        "#;

        pub const FOREIGN_KEYS: &str = r#"
        SELECT NULL, "from", "table", "to", on_delete, on_update
        FROM pragma_foreign_key_list(?, ?)
        ORDER BY id, seq
        "#;

        /// One row per indexed column.
        pub const INDEXES: &str = r#"
        SELECT il.name, ii.name, il."unique", il.origin = 'pk'
        FROM pragma_index_list(?, ?) AS il, pragma_index_info(il.name, ?) AS ii
        ORDER BY il.seq, ii.seqno
        "#;
    }

    /// `INFORMATION_SCHEMA` as the SQL standard defines it.
    pub mod standard {
        pub const TABLES: &str = r#"
            SELECT TABLE_NAME, TABLE_TYPE, TABLE_SCHEMA
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, TABLE_SCHEMA)
            AND TABLE_TYPE IN ('BASE TABLE', 'TABLE', 'VIEW')
            AND TABLE_NAME = COALESCE(?, TABLE_NAME)
            ORDER BY TABLE_SCHEMA, TABLE_NAME
            "#;

        pub const COLUMNS: &str = r#"
        SELECT
            c.COLUMN_NAME,
            c.DATA_TYPE,
            c.IS_NULLABLE,
            c.COLUMN_DEFAULT,
            CASE WHEN k.COLUMN_NAME IS NULL THEN 0 ELSE 1 END,
            c.ORDINAL_POSITION,
            NULL
        FROM INFORMATION_SCHEMA.COLUMNS c
        LEFT JOIN INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            ON tc.TABLE_SCHEMA = c.TABLE_SCHEMA
            AND tc.TABLE_NAME = c.TABLE_NAME
            AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
        LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            ON k.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA
            AND k.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
            AND k.COLUMN_NAME = c.COLUMN_NAME
        WHERE c.TABLE_SCHEMA = COALESCE(?, c.TABLE_SCHEMA) AND c.TABLE_NAME = ?
        ORDER BY c.ORDINAL_POSITION
        "#;

        pub const PRIMARY_KEYS: &str = r#"
        SELECT k.COLUMN_NAME, k.ORDINAL_POSITION, tc.CONSTRAINT_NAME
        FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
        JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            ON k.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA
            AND k.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
        WHERE tc.TABLE_SCHEMA = COALESCE(?, tc.TABLE_SCHEMA)
        AND tc.TABLE_NAME = ?
        AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
        ORDER BY k.ORDINAL_POSITION
        "#;

        pub const FOREIGN_KEYS: &str = r#"
        SELECT
            rc.CONSTRAINT_NAME,
            k.COLUMN_NAME,
            r.TABLE_NAME,
            r.COLUMN_NAME,
            rc.DELETE_RULE,
            rc.UPDATE_RULE
        FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
        JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            ON k.CONSTRAINT_SCHEMA = rc.CONSTRAINT_SCHEMA
            AND k.CONSTRAINT_NAME = rc.CONSTRAINT_NAME
        JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE r
            ON r.CONSTRAINT_SCHEMA = rc.UNIQUE_CONSTRAINT_SCHEMA
            AND r.CONSTRAINT_NAME = rc.UNIQUE_CONSTRAINT_NAME
            AND r.ORDINAL_POSITION = k.POSITION_IN_UNIQUE_CONSTRAINT
        WHERE k.TABLE_SCHEMA = COALESCE(?, k.TABLE_SCHEMA) AND k.TABLE_NAME = ?
        ORDER BY rc.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;

        /// Primary key and unique constraints, one row per column.
        pub const INDEXES: &str = r#"
        SELECT
            tc.CONSTRAINT_NAME,
            k.COLUMN_NAME,
            1,
            CASE WHEN tc.CONSTRAINT_TYPE = 'PRIMARY KEY' THEN 1 ELSE 0 END
        FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
        JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            ON k.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA
            AND k.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
        WHERE tc.TABLE_SCHEMA = COALESCE(?, tc.TABLE_SCHEMA)
        AND tc.TABLE_NAME = ?
        AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE')
        ORDER BY tc.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;
    }
}

// =============================================================================
// Query Building
// =============================================================================

/// Which catalog a dialect is introspected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Catalog {
    Postgres,
    MySql,
    Sqlite,
    Standard,
}

impl Catalog {
    fn for_dialect(dialect: &Dialect) -> Self {
        match dialect.kind {
            DialectKind::Postgres => Self::Postgres,
            DialectKind::MySql => Self::MySql,
            DialectKind::Sqlite => Self::Sqlite,
            DialectKind::Derby | DialectKind::H2 | DialectKind::Generic => Self::Standard,
        }
    }
}

/// A table reference folded into storage case, with the schema resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    schema: Option<String>,
    table: String,
}

#[derive(Debug)]
struct MetaQuery {
    sql: String,
    binds: Vec<BindParameter>,
}

fn text_bind(value: Option<&str>) -> BindParameter {
    match value {
        Some(v) => BindParameter::typed(v, TypeCode::Varchar),
        None => BindParameter::null(TypeCode::Varchar),
    }
}

fn sqlite_schema(schema: Option<&str>) -> &str {
    schema.unwrap_or("main")
}

fn tables_query(
    catalog: Catalog,
    dialect: &Dialect,
    schema: Option<&str>,
    name: Option<&str>,
) -> MetaQuery {
    match catalog {
        Catalog::Postgres => MetaQuery {
            sql: queries::postgres::TABLES.to_string(),
            binds: vec![text_bind(Some(schema.unwrap_or("public"))), text_bind(name)],
        },
        Catalog::MySql => MetaQuery {
            sql: queries::mysql::TABLES.to_string(),
            binds: vec![text_bind(schema), text_bind(name)],
        },
        Catalog::Sqlite => MetaQuery {
            sql: queries::sqlite::TABLES
                .replace("{schema}", &dialect.quote_identifier(sqlite_schema(schema))),
            binds: vec![text_bind(name)],
        },
        Catalog::Standard => MetaQuery {
            sql: queries::standard::TABLES.to_string(),
            binds: vec![text_bind(schema), text_bind(name)],
        },
    }
}

/// Per-table query: `(schema, table)` binds, except SQLite's pragma functions
/// which take `(table, schema)`.
fn table_query(catalog: Catalog, kind: TableQuery, target: &Target) -> MetaQuery {
    let schema = target.schema.as_deref();
    let table = Some(target.table.as_str());
    let sql = match catalog {
        Catalog::Postgres => kind.pick(
            queries::postgres::COLUMNS,
            queries::postgres::PRIMARY_KEYS,
            queries::postgres::FOREIGN_KEYS,
            queries::postgres::INDEXES,
        ),
        Catalog::MySql => kind.pick(
            queries::mysql::COLUMNS,
            queries::mysql::PRIMARY_KEYS,
            queries::mysql::FOREIGN_KEYS,
            queries::mysql::INDEXES,
        ),
        Catalog::Sqlite => kind.pick(
            queries::sqlite::COLUMNS,
            queries::sqlite::PRIMARY_KEYS,
            queries::sqlite::FOREIGN_KEYS,
            queries::sqlite::INDEXES,
        ),
        Catalog::Standard => kind.pick(
            queries::standard::COLUMNS,
            queries::standard::PRIMARY_KEYS,
            queries::standard::FOREIGN_KEYS,
            queries::standard::INDEXES,
        ),
    };
    let binds = match catalog {
        Catalog::Postgres => vec![text_bind(Some(schema.unwrap_or("public"))), text_bind(table)],
        Catalog::Sqlite => {
            let schema = Some(sqlite_schema(schema));
            let mut binds = vec![text_bind(table), text_bind(schema)];
            if kind == TableQuery::Indexes {
                binds.push(text_bind(schema));
            }
            binds
        }
        Catalog::MySql | Catalog::Standard => vec![text_bind(schema), text_bind(table)],
    };
    MetaQuery {
        sql: sql.to_string(),
        binds,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableQuery {
    Columns,
    PrimaryKeys,
    ForeignKeys,
    Indexes,
}

impl TableQuery {
    fn pick(
        self,
        columns: &'static str,
        primary_keys: &'static str,
        foreign_keys: &'static str,
        indexes: &'static str,
    ) -> &'static str {
        match self {
            Self::Columns => columns,
            Self::PrimaryKeys => primary_keys,
            Self::ForeignKeys => foreign_keys,
            Self::Indexes => indexes,
        }
    }
}

// =============================================================================
// Row Access
// =============================================================================

/// Positional, type-tolerant access to one metadata row.
///
/// Catalogs disagree on how they report flags and numbers (booleans, 0/1,
/// `YES`/`NO`), so reads accept every shape.
struct Record<'r>(&'r [HostValue]);

impl Record<'_> {
    fn text(&self, idx: usize) -> Option<String> {
        match self.0.get(idx)? {
            HostValue::Null => None,
            HostValue::Text(s) => Some(s.clone()),
            HostValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            other => Some(other.to_string()),
        }
    }

    fn int(&self, idx: usize) -> Option<i64> {
        match self.0.get(idx)? {
            HostValue::Integer(v) => Some(*v),
            HostValue::BigInteger(v) => i64::try_from(*v).ok(),
            HostValue::Decimal(d) => d.trunc().to_string().parse().ok(),
            HostValue::Float(f) => Some(*f as i64),
            HostValue::Bool(b) => Some(i64::from(*b)),
            HostValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn flag(&self, idx: usize) -> bool {
        match self.0.get(idx) {
            Some(HostValue::Bool(b)) => *b,
            Some(HostValue::Text(s)) => {
                matches!(s.trim().to_uppercase().as_str(), "YES" | "Y" | "TRUE" | "T" | "1")
            }
            Some(_) => self.int(idx).is_some_and(|v| v != 0),
            None => false,
        }
    }
}

// =============================================================================
// Introspector
// =============================================================================

/// Table, column, key and index listing over a `ConnectionHandle`.
pub struct SchemaIntrospector<'h, C: RawConnection = EngineConnection> {
    handle: &'h ConnectionHandle<C>,
    catalog: Catalog,
}

impl<'h, C: RawConnection> SchemaIntrospector<'h, C> {
    pub fn new(handle: &'h ConnectionHandle<C>) -> Self {
        Self {
            catalog: Catalog::for_dialect(handle.dialect()),
            handle,
        }
    }

    fn dialect(&self) -> &Dialect {
        self.handle.dialect()
    }

    fn display(&self, stored: &str) -> String {
        self.dialect().display_name(stored)
    }

    /// Fold an optional schema name, falling back to the dialect default.
    fn resolve_schema(&self, schema: Option<&str>) -> Option<String> {
        match schema {
            Some(schema) => Some(self.dialect().storage_name(schema)),
            None => match self.dialect().default_schema {
                DefaultSchema::Named(name) => Some(name.to_string()),
                DefaultSchema::CurrentDatabase | DefaultSchema::None => None,
            },
        }
    }

    fn resolve(&self, name: &str) -> DbResult<Target> {
        let parsed = TableName::parse(name)?;
        if let Some(catalog) = &parsed.catalog {
            debug!(catalog = %catalog, "Catalog part ignored for introspection");
        }
        Ok(Target {
            schema: self.resolve_schema(parsed.schema.as_deref()),
            table: self.dialect().storage_name(&parsed.table),
        })
    }

    async fn run(&self, query: MetaQuery) -> DbResult<Vec<Vec<HostValue>>> {
        let table = self
            .handle
            .execute_query(&query.sql, &query.binds, None)
            .await?;
        Ok(table.rows)
    }

    /// Whether a table or view with this (possibly dotted) name exists.
    pub async fn table_exists(&self, name: &str) -> DbResult<bool> {
        let target = self.resolve(name)?;
        let query = tables_query(
            self.catalog,
            self.dialect(),
            target.schema.as_deref(),
            Some(&target.table),
        );
        let exists = !self.run(query).await?.is_empty();
        debug!(table = name, exists, "Checked table existence");
        Ok(exists)
    }

    /// Tables and views in `schema`, or in the default schema.
    pub async fn tables(&self, schema: Option<&str>) -> DbResult<Vec<TableInfo>> {
        let schema = self.resolve_schema(schema);
        let query = tables_query(self.catalog, self.dialect(), schema.as_deref(), None);
        let rows = self.run(query).await?;

        let tables: Vec<TableInfo> = rows
            .iter()
            .filter_map(|row| {
                let row = Record(row);
                let name = row.text(0).filter(|n| !n.is_empty())?;
                let table_type = TableType::parse(&row.text(1).unwrap_or_default());
                let mut info = TableInfo::new(self.display(&name), table_type);
                if let Some(schema) = row.text(2).or_else(|| schema.clone()) {
                    info = info.with_schema(self.display(&schema));
                }
                Some(info)
            })
            .collect();

        debug!(count = tables.len(), schema = ?schema, "Listed tables");
        Ok(tables)
    }

    /// Columns of a table in ordinal order.
    pub async fn columns(&self, table: &str) -> DbResult<Vec<ColumnDefinition>> {
        let target = self.resolve(table)?;
        let rows = self
            .run(table_query(self.catalog, TableQuery::Columns, &target))
            .await?;
        let quote_defaults = self.catalog == Catalog::MySql && !self.is_mariadb().await;

        let columns: Vec<ColumnDefinition> = rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| {
                let row = Record(row);
                let name = row.text(0)?;
                let data_type = row.text(1).unwrap_or_default();
                let ordinal = row
                    .int(5)
                    .and_then(|o| usize::try_from(o).ok())
                    .unwrap_or(idx + 1);
                let mut column =
                    ColumnDefinition::new(self.display(&name), ordinal, &data_type, row.flag(2))
                        .with_primary_key(row.flag(4));

                let mut raw_default = row.text(3);
                if quote_defaults {
                    raw_default = raw_default.map(|raw| {
                        mysql_default_literal(raw, row.text(6).as_deref().unwrap_or(""))
                    });
                }
                if let Some(default) = self
                    .handle
                    .marshaller()
                    .decode_default(raw_default.as_deref(), &data_type)
                {
                    column = column.with_default(default);
                }
                Some(column)
            })
            .collect();

        debug!(count = columns.len(), table = %target.table, "Listed columns");
        Ok(columns)
    }

    /// Primary key columns in key order.
    pub async fn primary_keys(&self, table: &str) -> DbResult<Vec<PrimaryKeyColumn>> {
        let target = self.resolve(table)?;
        let rows = self
            .run(table_query(self.catalog, TableQuery::PrimaryKeys, &target))
            .await?;

        let keys: Vec<PrimaryKeyColumn> = rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| {
                let row = Record(row);
                Some(PrimaryKeyColumn {
                    column: self.display(&row.text(0)?),
                    key_sequence: row
                        .int(1)
                        .and_then(|s| usize::try_from(s).ok())
                        .unwrap_or(idx + 1),
                    constraint_name: row.text(2),
                })
            })
            .collect();

        debug!(count = keys.len(), table = %target.table, "Listed primary key columns");
        Ok(keys)
    }

    /// Foreign keys, one entry per referencing column.
    pub async fn foreign_keys(&self, table: &str) -> DbResult<Vec<ForeignKey>> {
        let target = self.resolve(table)?;
        let rows = self
            .run(table_query(self.catalog, TableQuery::ForeignKeys, &target))
            .await?;

        let keys: Vec<ForeignKey> = rows
            .iter()
            .filter_map(|row| {
                let row = Record(row);
                let column = row.text(1)?;
                let references_table = row.text(2)?;
                let mut fk = ForeignKey::new(
                    self.display(&column),
                    self.display(&references_table),
                    self.display(&row.text(3).unwrap_or_default()),
                );
                if let Some(name) = row.text(0) {
                    fk = fk.with_name(self.display(&name));
                }
                if let Some(rule) = row.text(4) {
                    fk = fk.with_on_delete(ForeignKeyAction::parse(&rule));
                }
                if let Some(rule) = row.text(5) {
                    fk = fk.with_on_update(ForeignKeyAction::parse(&rule));
                }
                Some(fk)
            })
            .collect();

        debug!(count = keys.len(), table = %target.table, "Listed foreign keys");
        Ok(keys)
    }

    /// Indexes of a table. Consecutive rows of the same index are merged.
    pub async fn indexes(&self, table: &str) -> DbResult<Vec<IndexInfo>> {
        let target = self.resolve(table)?;
        let rows = self
            .run(table_query(self.catalog, TableQuery::Indexes, &target))
            .await?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &rows {
            let row = Record(row);
            let Some(name) = row.text(0) else { continue };
            let name = self.display(&name);
            let columns: Vec<String> = row
                .text(1)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(|c| self.display(c))
                .collect();

            match indexes.last_mut() {
                Some(last) if last.name == name => last.columns.extend(columns),
                _ => indexes.push(
                    IndexInfo::new(name, columns)
                        .with_unique(row.flag(2))
                        .with_primary(row.flag(3)),
                ),
            }
        }

        debug!(count = indexes.len(), table = %target.table, "Listed indexes");
        Ok(indexes)
    }

    /// Columns, keys and indexes of one table.
    ///
    /// Fails with `InvalidIdentifier` when the table has no columns, which is
    /// how every catalog reports a missing table.
    pub async fn describe_table(&self, table: &str) -> DbResult<TableSchema> {
        let target = self.resolve(table)?;
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Err(DbError::invalid_identifier(table, "no such table"));
        }

        let mut name = TableName::new(self.display(&target.table));
        if let Some(schema) = &target.schema {
            name = name.with_schema(self.display(schema));
        }
        let mut schema = TableSchema::new(name);
        schema.columns = columns;
        schema.primary_key = self.primary_keys(table).await?;
        schema.foreign_keys = self.foreign_keys(table).await?;
        schema.indexes = self.indexes(table).await?;

        debug!(
            table = %schema.qualified_name(),
            columns = schema.columns.len(),
            indexes = schema.indexes.len(),
            "Described table"
        );
        Ok(schema)
    }

    async fn is_mariadb(&self) -> bool {
        self.handle
            .server_version()
            .await
            .is_some_and(|v| v.to_lowercase().contains("mariadb"))
    }
}

/// MySQL reports literal defaults unquoted; expressions are flagged in `EXTRA`.
fn mysql_default_literal(raw: String, extra: &str) -> String {
    let generated = extra.to_uppercase().contains("DEFAULT_GENERATED");
    let looks_like_expression = raw.to_uppercase().starts_with("CURRENT_TIMESTAMP");
    if generated || looks_like_expression || raw.starts_with('\'') {
        raw
    } else {
        quote_literal(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::db::dialect::IdentifierCase;
    use crate::db::mock::{MockCell, MockConnection, MockFactory, MockShared};
    use crate::db::params::EngineParam;
    use crate::models::DefaultValue;
    use std::sync::Arc;

    async fn handle(shared: &Arc<MockShared>, dialect: Dialect) -> ConnectionHandle<MockConnection> {
        let settings = ConnectionSettings {
            configure_connection: false,
            ..ConnectionSettings::default()
        };
        ConnectionHandle::initialize(MockFactory::new(shared.clone()), settings, dialect)
            .await
            .unwrap()
    }

    fn text(s: &str) -> MockCell {
        MockCell::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_table_exists_folds_identifier() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("TABLE_NAME", "VARCHAR"), ("TABLE_TYPE", "VARCHAR"), ("TABLE_SCHEMA", "VARCHAR")],
            vec![vec![text("USERS"), text("BASE TABLE"), text("APP")]],
        );
        let h = handle(&shared, Dialect::derby()).await;
        assert!(h.introspector().table_exists("users").await.unwrap());
        assert_eq!(
            shared.binds().last().unwrap(),
            &vec![
                EngineParam::Text("APP".into()),
                EngineParam::Text("USERS".into())
            ]
        );

        h.introspector().table_exists("Sales.Orders").await.unwrap();
        assert_eq!(
            shared.binds().last().unwrap(),
            &vec![
                EngineParam::Text("Sales".into()),
                EngineParam::Text("Orders".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_table_exists_false_on_empty() {
        let shared = MockShared::new();
        let h = handle(&shared, Dialect::sqlite()).await;
        assert!(!h.introspector().table_exists("missing").await.unwrap());
        assert!(shared.log().last().unwrap().contains("\"main\".sqlite_master"));
    }

    #[tokio::test]
    async fn test_invalid_dotted_name() {
        let shared = MockShared::new();
        let h = handle(&shared, Dialect::generic()).await;
        let err = h.introspector().columns("a.b.c.d").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier { .. }));
        assert_eq!(shared.opened(), 1);
        assert!(shared.log().is_empty());
    }

    #[tokio::test]
    async fn test_tables_display_names() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("TABLE_NAME", "VARCHAR"), ("TABLE_TYPE", "VARCHAR"), ("TABLE_SCHEMA", "VARCHAR")],
            vec![
                vec![text("ORDERS"), text("TABLE"), text("PUBLIC")],
                vec![text("MixedCase"), text("VIEW"), text("PUBLIC")],
            ],
        );
        let h = handle(&shared, Dialect::h2()).await;
        let tables = h.introspector().tables(None).await.unwrap();
        assert_eq!(tables[0].name, "orders");
        assert_eq!(tables[0].table_type, TableType::Table);
        assert_eq!(tables[0].schema.as_deref(), Some("public"));
        assert_eq!(tables[1].name, "MixedCase");
        assert_eq!(tables[1].table_type, TableType::View);
    }

    #[tokio::test]
    async fn test_sqlite_columns_with_defaults() {
        let shared = MockShared::new();
        shared.set_result(
            vec![
                ("name", "TEXT"),
                ("type", "TEXT"),
                ("nullable", "INTEGER"),
                ("dflt_value", "NULL"),
                ("pk", "INTEGER"),
                ("ordinal", "INTEGER"),
                ("extra", "NULL"),
            ],
            vec![
                vec![text("id"), text("INTEGER"), MockCell::Int(0), MockCell::Null, MockCell::Int(1), MockCell::Int(1), MockCell::Null],
                vec![text("name"), text("TEXT"), MockCell::Int(1), text("'anon'"), MockCell::Int(0), MockCell::Int(2), MockCell::Null],
                vec![text("score"), text("INTEGER"), MockCell::Int(1), text("42"), MockCell::Int(0), MockCell::Int(3), MockCell::Null],
                vec![text("created"), text("TIMESTAMP"), MockCell::Int(1), text("CURRENT_TIMESTAMP"), MockCell::Int(0), MockCell::Int(4), MockCell::Null],
            ],
        );
        let h = handle(&shared, Dialect::sqlite()).await;
        let columns = h.introspector().columns("users").await.unwrap();
        assert_eq!(columns.len(), 4);

        assert_eq!(columns[0].name, "id");
        assert!(columns[0].is_primary_key);
        assert!(!columns[0].nullable);
        assert_eq!(columns[0].type_code, TypeCode::Integer);
        assert!(columns[0].default_value.is_none());

        assert!(columns[1].nullable);
        assert_eq!(
            columns[1].default_value,
            Some(DefaultValue::Value(HostValue::Text("anon".into())))
        );
        assert_eq!(
            columns[2].default_value,
            Some(DefaultValue::Value(HostValue::Integer(42)))
        );
        assert_eq!(
            columns[3].default_value,
            Some(DefaultValue::Expression("CURRENT_TIMESTAMP".into()))
        );
        assert_eq!(columns[3].ordinal, 4);

        assert_eq!(
            shared.binds().last().unwrap(),
            &vec![
                EngineParam::Text("users".into()),
                EngineParam::Text("main".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_mysql_unquoted_defaults() {
        let shared = MockShared::new();
        shared.set_result(
            vec![
                ("COLUMN_NAME", "VARCHAR"),
                ("COLUMN_TYPE", "VARCHAR"),
                ("IS_NULLABLE", "BIGINT"),
                ("COLUMN_DEFAULT", "VARCHAR"),
                ("IS_PRIMARY_KEY", "BIGINT"),
                ("ORDINAL_POSITION", "BIGINT"),
                ("EXTRA", "VARCHAR"),
            ],
            vec![
                vec![text("status"), text("varchar(10)"), MockCell::Int(1), text("active"), MockCell::Int(0), MockCell::Int(1), text("")],
                vec![text("updated"), text("datetime"), MockCell::Int(1), text("now()"), MockCell::Int(0), MockCell::Int(2), text("DEFAULT_GENERATED")],
            ],
        );
        let h = handle(&shared, Dialect::mysql()).await;
        let columns = h.introspector().columns("t").await.unwrap();
        assert_eq!(
            columns[0].default_value,
            Some(DefaultValue::Value(HostValue::Text("active".into())))
        );
        assert_eq!(
            columns[1].default_value,
            Some(DefaultValue::Expression("now()".into()))
        );
        // current database is resolved server-side
        assert_eq!(
            shared.binds().last().unwrap(),
            &vec![EngineParam::Null(TypeCode::Varchar), EngineParam::Text("t".into())]
        );
    }

    #[tokio::test]
    async fn test_primary_keys_in_order() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("column", "VARCHAR"), ("seq", "BIGINT"), ("constraint", "VARCHAR")],
            vec![
                vec![text("a"), MockCell::Int(1), text("pk_t")],
                vec![text("b"), MockCell::Int(2), text("pk_t")],
            ],
        );
        let h = handle(&shared, Dialect::postgres()).await;
        let keys = h.introspector().primary_keys("public.t").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].column, "b");
        assert_eq!(keys[1].key_sequence, 2);
        assert_eq!(keys[0].constraint_name.as_deref(), Some("pk_t"));
    }

    #[tokio::test]
    async fn test_foreign_keys_actions() {
        let shared = MockShared::new();
        shared.set_result(
            vec![
                ("name", "NULL"),
                ("from", "TEXT"),
                ("table", "TEXT"),
                ("to", "TEXT"),
                ("on_delete", "TEXT"),
                ("on_update", "TEXT"),
            ],
            vec![vec![
                MockCell::Null,
                text("user_id"),
                text("users"),
                text("id"),
                text("CASCADE"),
                text("NO ACTION"),
            ]],
        );
        let h = handle(&shared, Dialect::sqlite()).await;
        let fks = h.introspector().foreign_keys("orders").await.unwrap();
        assert_eq!(fks.len(), 1);
        assert!(fks[0].name.is_none());
        assert_eq!(fks[0].column, "user_id");
        assert_eq!(fks[0].references_table, "users");
        assert_eq!(fks[0].on_delete, ForeignKeyAction::Cascade);
        assert_eq!(fks[0].on_update, ForeignKeyAction::NoAction);
    }

    #[tokio::test]
    async fn test_indexes_merge_per_column_rows() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("name", "TEXT"), ("column", "TEXT"), ("unique", "INTEGER"), ("primary", "INTEGER")],
            vec![
                vec![text("idx_ab"), text("a"), MockCell::Int(0), MockCell::Int(0)],
                vec![text("idx_ab"), text("b"), MockCell::Int(0), MockCell::Int(0)],
                vec![text("uq_c"), text("c"), MockCell::Int(1), MockCell::Int(0)],
            ],
        );
        let h = handle(&shared, Dialect::sqlite()).await;
        let indexes = h.introspector().indexes("t").await.unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].columns, vec!["a", "b"]);
        assert!(!indexes[0].is_unique);
        assert!(indexes[1].is_unique);
        assert_eq!(shared.binds().last().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_indexes_comma_separated() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("index_name", "TEXT"), ("column_names", "TEXT"), ("is_unique", "BOOL"), ("is_primary", "BOOL")],
            vec![vec![text("t_pkey"), text("id,tenant"), MockCell::Bool(true), MockCell::Bool(true)]],
        );
        let h = handle(&shared, Dialect::postgres()).await;
        let indexes = h.introspector().indexes("t").await.unwrap();
        assert_eq!(indexes[0].columns, vec!["id", "tenant"]);
        assert!(indexes[0].is_primary);
    }

    #[tokio::test]
    async fn test_describe_missing_table() {
        let shared = MockShared::new();
        let h = handle(&shared, Dialect::postgres()).await;
        let err = h.introspector().describe_table("nope").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn test_describe_upper_case_table() {
        let shared = MockShared::new();
        shared.set_result(
            vec![
                ("COLUMN_NAME", "VARCHAR"),
                ("DATA_TYPE", "VARCHAR"),
                ("IS_NULLABLE", "VARCHAR"),
                ("COLUMN_DEFAULT", "VARCHAR"),
                ("PK", "INTEGER"),
                ("ORDINAL_POSITION", "INTEGER"),
                ("EXTRA", "NULL"),
            ],
            vec![vec![
                text("ID"),
                text("INTEGER"),
                text("NO"),
                MockCell::Null,
                MockCell::Int(1),
                MockCell::Int(1),
                MockCell::Null,
            ]],
        );
        let dialect = Dialect::generic().with_identifier_case(IdentifierCase::Upper);
        let h = handle(&shared, dialect).await;
        let schema = h.introspector().describe_table("accounts").await.unwrap();
        assert_eq!(schema.qualified_name(), "accounts");
        assert_eq!(schema.columns[0].name, "id");
        assert!(!schema.columns[0].nullable);
        // the same canned rows answer every follow-up query
        assert_eq!(schema.primary_key.len(), 1);
        assert_eq!(shared.log().len(), 4);
    }

    #[test]
    fn test_mysql_default_literal() {
        assert_eq!(mysql_default_literal("abc".into(), ""), "'abc'");
        assert_eq!(mysql_default_literal("it's".into(), ""), "'it''s'");
        assert_eq!(mysql_default_literal("'abc'".into(), ""), "'abc'");
        assert_eq!(
            mysql_default_literal("CURRENT_TIMESTAMP(3)".into(), ""),
            "CURRENT_TIMESTAMP(3)"
        );
        assert_eq!(
            mysql_default_literal("(uuid())".into(), "DEFAULT_GENERATED"),
            "(uuid())"
        );
    }

    #[test]
    fn test_record_flags() {
        let row = vec![
            HostValue::Text("YES".into()),
            HostValue::Integer(0),
            HostValue::Bool(true),
            HostValue::Null,
        ];
        let r = Record(&row);
        assert!(r.flag(0));
        assert!(!r.flag(1));
        assert!(r.flag(2));
        assert!(!r.flag(3));
        assert!(r.text(3).is_none());
        assert_eq!(r.int(1), Some(0));
    }
}
