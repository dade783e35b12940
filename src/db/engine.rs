//! sqlx-backed `RawConnection`.
//!
//! An `EngineConnection` wraps one MySQL, PostgreSQL or SQLite connection, either
//! owned outright or checked out of a sqlx pool, and layers driver-style
//! auto-commit on top: with auto-commit off the first statement issues `BEGIN`
//! and the transaction stays open until `commit` or `rollback`.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::pool::PoolConnection;
use sqlx::{
    Column, Connection, Database, Either, Executor, MySql, Postgres, Row, Sqlite, Statement,
    TypeInfo,
};
use tracing::{debug, warn};

use crate::db::connection::{
    ColumnMeta, Cursor, ExecSummary, IsolationLevel, RawConnection, SavepointToken,
    StatementOptions, Step, check_savepoint_name, generated_savepoint_name,
};
use crate::db::dialect::DialectKind;
use crate::db::params::{EngineParam, bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::types::EngineRow;
use crate::error::{DbError, DbResult};

/// A connection owned directly or borrowed from a pool.
pub enum Link<DB: Database> {
    Direct(DB::Connection),
    Pooled(PoolConnection<DB>),
}

impl<DB: Database> Link<DB> {
    fn conn(&mut self) -> &mut DB::Connection {
        match self {
            Link::Direct(conn) => conn,
            Link::Pooled(conn) => &mut **conn,
        }
    }

    async fn close(self) -> DbResult<()> {
        match self {
            Link::Direct(conn) => conn.close().await.map_err(DbError::from),
            // Back to the pool
            Link::Pooled(conn) => {
                drop(conn);
                Ok(())
            }
        }
    }

    fn is_pooled(&self) -> bool {
        matches!(self, Link::Pooled(_))
    }
}

/// Labels and type names of a prepared statement's result columns.
fn column_meta<C: Column>(columns: &[C]) -> Vec<ColumnMeta> {
    columns
        .iter()
        .map(|c| ColumnMeta::new(c.name(), c.type_info().name()))
        .collect()
}

/// Engine-specific link.
pub enum EngineLink {
    MySql(Link<MySql>),
    Postgres(Link<Postgres>),
    SQLite(Link<Sqlite>),
}

impl EngineLink {
    pub fn kind(&self) -> DialectKind {
        match self {
            EngineLink::MySql(_) => DialectKind::MySql,
            EngineLink::Postgres(_) => DialectKind::Postgres,
            EngineLink::SQLite(_) => DialectKind::Sqlite,
        }
    }
}

pub struct EngineConnection {
    link: EngineLink,
    auto_commit: bool,
    tx_open: bool,
    savepoint_seq: u64,
}

impl std::fmt::Debug for EngineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConnection")
            .field("kind", &self.link.kind())
            .field("pooled", &self.is_pooled())
            .field("auto_commit", &self.auto_commit)
            .field("tx_open", &self.tx_open)
            .finish()
    }
}

impl EngineConnection {
    pub fn new(link: EngineLink) -> Self {
        Self {
            link,
            auto_commit: true,
            tx_open: false,
            savepoint_seq: 0,
        }
    }

    pub fn kind(&self) -> DialectKind {
        self.link.kind()
    }

    pub fn is_pooled(&self) -> bool {
        crate::db_dispatch_all!(&self.link, EngineLink, l => l.is_pooled())
    }

    /// Run a control statement (`BEGIN`, `SAVEPOINT`, `SET ...`) unprepared.
    async fn control(&mut self, sql: &str) -> DbResult<()> {
        debug!(sql = %sql, "control statement");
        crate::db_dispatch_all!(&mut self.link, EngineLink, l => {
            l.conn().execute(sqlx::raw_sql(sql)).await?;
        });
        Ok(())
    }

    /// Open the implicit transaction when auto-commit is off.
    async fn ensure_tx(&mut self) -> DbResult<()> {
        if !self.auto_commit && !self.tx_open {
            self.control("BEGIN").await?;
            self.tx_open = true;
        }
        Ok(())
    }

    fn quote(&self, name: &str) -> String {
        match self.link {
            EngineLink::MySql(_) => format!("`{}`", name),
            _ => format!("\"{}\"", name),
        }
    }
}

#[async_trait]
impl RawConnection for EngineConnection {
    type Row = EngineRow;

    async fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [EngineParam],
        options: StatementOptions,
    ) -> DbResult<Cursor<'a, EngineRow>> {
        self.ensure_tx().await?;
        let cursor = crate::impl_db_dispatch!(&mut self.link, EngineLink, {
            MySql(l) => {
                let columns = column_meta(l.conn().prepare(sql).await?.columns());
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_mysql_param);
                let rows = l
                    .conn()
                    .fetch(query)
                    .map(|r| r.map(EngineRow::MySql).map_err(DbError::from))
                    .boxed();
                Cursor::new(columns, rows)
            },
            Postgres(l) => {
                let columns = column_meta(l.conn().prepare(sql).await?.columns());
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_postgres_param);
                let rows = l
                    .conn()
                    .fetch(query)
                    .map(|r| r.map(EngineRow::Postgres).map_err(DbError::from))
                    .boxed();
                Cursor::new(columns, rows)
            },
            SQLite(l) => {
                let columns = column_meta(l.conn().prepare(sql).await?.columns());
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_sqlite_param);
                let rows = l
                    .conn()
                    .fetch(query)
                    .map(|r| r.map(EngineRow::SQLite).map_err(DbError::from))
                    .boxed();
                Cursor::new(columns, rows)
            },
        });
        Ok(cursor)
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[EngineParam],
        options: StatementOptions,
    ) -> DbResult<ExecSummary> {
        self.ensure_tx().await?;
        let summary = crate::impl_db_dispatch!(&mut self.link, EngineLink, {
            MySql(l) => {
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_mysql_param);
                let result = l.conn().execute(query).await?;
                ExecSummary {
                    rows_affected: result.rows_affected(),
                    // 0 means the statement generated no id
                    last_insert_id: Some(result.last_insert_id())
                        .filter(|id| *id != 0)
                        .and_then(|id| i64::try_from(id).ok()),
                }
            },
            Postgres(l) => {
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_postgres_param);
                let result = l.conn().execute(query).await?;
                ExecSummary {
                    rows_affected: result.rows_affected(),
                    last_insert_id: None,
                }
            },
            SQLite(l) => {
                let query = params
                    .iter()
                    .fold(sqlx::query(sql).persistent(options.persistent), bind_sqlite_param);
                let result = l.conn().execute(query).await?;
                ExecSummary {
                    rows_affected: result.rows_affected(),
                    last_insert_id: (result.rows_affected() > 0)
                        .then(|| result.last_insert_rowid()),
                }
            },
        });
        Ok(summary)
    }

    async fn execute_raw<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> DbResult<BoxStream<'a, DbResult<Step<EngineRow>>>> {
        self.ensure_tx().await?;
        let stream = crate::db_dispatch_all!(&mut self.link, EngineLink, l => {
            sqlx::raw_sql(sql)
                .fetch_many(l.conn())
                .map(|item| -> DbResult<Step<EngineRow>> {
                    match item? {
                        Either::Left(done) => Ok(Step::Done {
                            rows_affected: done.rows_affected(),
                        }),
                        Either::Right(row) => Ok(Step::Row(EngineRow::from(row))),
                    }
                })
                .boxed()
        });
        Ok(stream)
    }

    async fn ping(&mut self) -> DbResult<()> {
        crate::db_dispatch_all!(&mut self.link, EngineLink, l => l.conn().ping().await?);
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> DbResult<()> {
        if enabled && self.tx_open {
            self.commit().await?;
        }
        self.auto_commit = enabled;
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> DbResult<()> {
        let sql = match self.link {
            EngineLink::Postgres(_) => format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ),
            EngineLink::MySql(_) => {
                format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql())
            }
            EngineLink::SQLite(_) => match level {
                IsolationLevel::Serializable => "PRAGMA read_uncommitted = 0".to_string(),
                IsolationLevel::ReadUncommitted => "PRAGMA read_uncommitted = 1".to_string(),
                other => {
                    return Err(DbError::isolation_unsupported(
                        other.as_sql(),
                        "SQLite supports SERIALIZABLE and READ UNCOMMITTED only",
                    ));
                }
            },
        };
        self.control(&sql).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.tx_open {
            // Closed either way; a failed COMMIT leaves nothing to roll back
            self.tx_open = false;
            self.control("COMMIT").await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.tx_open {
            self.tx_open = false;
            self.control("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn savepoint(&mut self, name: Option<&str>) -> DbResult<SavepointToken> {
        self.savepoint_seq += 1;
        let name = match name {
            Some(name) => name.to_string(),
            None => generated_savepoint_name(self.savepoint_seq),
        };
        check_savepoint_name(&name)?;
        self.ensure_tx().await?;
        let sql = format!("SAVEPOINT {}", self.quote(&name));
        self.control(&sql).await?;
        Ok(SavepointToken {
            name,
            seq: self.savepoint_seq,
        })
    }

    async fn rollback_to(&mut self, token: &SavepointToken) -> DbResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", self.quote(&token.name));
        self.control(&sql).await
    }

    async fn release(&mut self, token: &SavepointToken) -> DbResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", self.quote(&token.name));
        self.control(&sql).await
    }

    async fn server_version(&mut self) -> DbResult<Option<String>> {
        let sql = match self.link {
            EngineLink::SQLite(_) => "SELECT sqlite_version()",
            _ => "SELECT version()",
        };
        let version = crate::db_dispatch_all!(&mut self.link, EngineLink, l => {
            match l.conn().fetch_optional(sqlx::query(sql)).await? {
                Some(row) => Some(row.try_get::<String, _>(0)?),
                None => None,
            }
        });
        Ok(version)
    }

    async fn close(mut self) -> DbResult<()> {
        let rollback = if self.tx_open {
            self.rollback().await
        } else {
            Ok(())
        };
        if let Err(e) = &rollback {
            warn!(error = %e, "Rollback on close failed");
        }
        crate::db_dispatch_all!(self.link, EngineLink, l => l.close().await)?;
        rollback
    }
}

impl From<sqlx::mysql::MySqlRow> for EngineRow {
    fn from(row: sqlx::mysql::MySqlRow) -> Self {
        EngineRow::MySql(row)
    }
}

impl From<sqlx::postgres::PgRow> for EngineRow {
    fn from(row: sqlx::postgres::PgRow) -> Self {
        EngineRow::Postgres(row)
    }
}

impl From<sqlx::sqlite::SqliteRow> for EngineRow {
    fn from(row: sqlx::sqlite::SqliteRow) -> Self {
        EngineRow::SQLite(row)
    }
}
