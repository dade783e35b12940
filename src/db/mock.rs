//! Scripted in-memory connection for unit tests.
//!
//! Every `MockConnection` opened from the same `MockShared` gets the next
//! generation number. Generations listed in `broken` fail every statement and
//! every validity check, which is how tests simulate a dropped connection that
//! a reconnect heals.

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::db::connection::{
    ColumnMeta, ColumnReader, Cursor, ExecSummary, IsolationLevel, RawConnection, SavepointToken,
    StatementOptions, Step, check_savepoint_name, generated_savepoint_name,
};
use crate::db::factory::{ConnectionFactory, FactoryKind};
use crate::db::params::EngineParam;
use crate::error::{DbError, DbResult};
use crate::models::HostValue;

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MockCell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Json(JsonValue),
    Array(Vec<HostValue>),
    /// Unreadable in every shape
    Fail,
}

impl MockCell {
    /// The cell an engine would hand back after storing `param`.
    pub fn from_param(param: &EngineParam) -> Self {
        match param {
            EngineParam::Null(_) => Self::Null,
            EngineParam::Bool(b) => Self::Bool(*b),
            EngineParam::Int(v) => Self::Int(*v),
            EngineParam::Float(f) => Self::Float(*f),
            EngineParam::Decimal(d) => Self::Text(d.to_string()),
            EngineParam::Text(s) => Self::Text(s.clone()),
            EngineParam::Bytes(b) => Self::Bytes(b.clone()),
            EngineParam::Date(d) => Self::Text(d.format("%Y-%m-%d").to_string()),
            EngineParam::Time(t) => Self::Text(t.format("%H:%M:%S%.f").to_string()),
            EngineParam::Timestamp(ts) => Self::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            EngineParam::TimestampTz(dt) => {
                Self::Text(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            EngineParam::Uuid(u) => Self::Text(u.to_string()),
            EngineParam::Json(j) => Self::Json(j.clone()),
            EngineParam::IntArray(v) => Self::Array(v.iter().map(|x| (*x).into()).collect()),
            EngineParam::FloatArray(v) => Self::Array(v.iter().map(|x| (*x).into()).collect()),
            EngineParam::TextArray(v) => Self::Array(v.iter().map(|x| x.clone().into()).collect()),
            EngineParam::BoolArray(v) => Self::Array(v.iter().map(|x| (*x).into()).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockRow {
    columns: Vec<(String, String)>,
    cells: Vec<MockCell>,
}

impl MockRow {
    /// `columns` are `(label, type name)` pairs.
    pub fn new(columns: Vec<(&str, &str)>, cells: Vec<MockCell>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(l, t)| (l.to_string(), t.to_string()))
                .collect(),
            cells,
        }
    }

    fn cell(&self, idx: usize) -> DbResult<&MockCell> {
        match self.cells.get(idx) {
            Some(MockCell::Fail) | None => {
                Err(DbError::marshal(format!("column {} is unreadable", idx)))
            }
            Some(cell) => Ok(cell),
        }
    }

    fn read<T>(&self, idx: usize, f: impl FnOnce(&MockCell) -> Option<T>) -> DbResult<Option<T>> {
        match self.cell(idx)? {
            MockCell::Null => Ok(None),
            cell => f(cell).map(Some).ok_or_else(|| {
                DbError::marshal(format!("column {} has the wrong shape: {:?}", idx, cell))
            }),
        }
    }
}

impl ColumnReader for MockRow {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_label(&self, idx: usize) -> &str {
        self.columns.get(idx).map(|c| c.0.as_str()).unwrap_or("")
    }

    fn column_type_name(&self, idx: usize) -> &str {
        self.columns.get(idx).map(|c| c.1.as_str()).unwrap_or("")
    }

    fn is_null(&self, idx: usize) -> bool {
        matches!(self.cells.get(idx), Some(MockCell::Null))
    }

    fn read_integer(&self, idx: usize) -> DbResult<Option<i64>> {
        self.read(idx, |c| match c {
            MockCell::Int(v) => Some(*v),
            MockCell::Bool(b) => Some(i64::from(*b)),
            MockCell::Text(s) => s.parse().ok(),
            _ => None,
        })
    }

    fn read_integer_text(&self, idx: usize) -> DbResult<Option<String>> {
        self.read(idx, |c| match c {
            MockCell::Int(v) => Some(v.to_string()),
            MockCell::Text(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn read_float(&self, idx: usize) -> DbResult<Option<f64>> {
        self.read(idx, |c| match c {
            MockCell::Float(f) => Some(*f),
            MockCell::Int(v) => Some(*v as f64),
            MockCell::Text(s) => s.parse().ok(),
            _ => None,
        })
    }

    fn read_decimal(&self, idx: usize) -> DbResult<Option<Decimal>> {
        self.read(idx, |c| match c {
            MockCell::Text(s) => Decimal::from_str(s).ok(),
            MockCell::Int(v) => Some(Decimal::from(*v)),
            MockCell::Float(f) => Decimal::try_from(*f).ok(),
            _ => None,
        })
    }

    fn read_text(&self, idx: usize) -> DbResult<Option<String>> {
        self.read(idx, |c| match c {
            MockCell::Text(s) => Some(s.clone()),
            MockCell::Int(v) => Some(v.to_string()),
            MockCell::Float(f) => Some(f.to_string()),
            MockCell::Bool(b) => Some(b.to_string()),
            MockCell::Json(j) => Some(j.to_string()),
            _ => None,
        })
    }

    fn read_bytes(&self, idx: usize) -> DbResult<Option<Vec<u8>>> {
        self.read(idx, |c| match c {
            MockCell::Bytes(b) => Some(b.clone()),
            MockCell::Text(s) => Some(s.clone().into_bytes()),
            _ => None,
        })
    }

    fn read_bool(&self, idx: usize) -> DbResult<Option<bool>> {
        self.read(idx, |c| match c {
            MockCell::Bool(b) => Some(*b),
            MockCell::Int(v) => Some(*v != 0),
            _ => None,
        })
    }

    fn read_bits(&self, idx: usize) -> DbResult<Option<String>> {
        self.read(idx, |c| match c {
            MockCell::Text(s) => Some(s.clone()),
            MockCell::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            _ => None,
        })
    }

    fn read_temporal_text(&self, idx: usize) -> DbResult<Option<String>> {
        self.read(idx, |c| match c {
            MockCell::Text(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn read_json(&self, idx: usize) -> DbResult<Option<JsonValue>> {
        self.read(idx, |c| match c {
            MockCell::Json(j) => Some(j.clone()),
            MockCell::Text(s) => serde_json::from_str(s).ok(),
            _ => None,
        })
    }

    fn read_uuid(&self, idx: usize) -> DbResult<Option<Uuid>> {
        self.read(idx, |c| match c {
            MockCell::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        })
    }

    fn read_array(&self, idx: usize) -> DbResult<Option<Vec<HostValue>>> {
        self.read(idx, |c| match c {
            MockCell::Array(items) => Some(items.clone()),
            _ => None,
        })
    }
}

/// Counts open cursors; the count drops when the guard does.
pub struct CursorGuard(Arc<AtomicUsize>);

impl CursorGuard {
    pub fn open(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Connections
// =============================================================================

/// State shared by every connection of one test.
#[derive(Default)]
pub struct MockShared {
    opened: AtomicUsize,
    pub closed: AtomicUsize,
    broken: Mutex<HashSet<usize>>,
    pub fail_connect: AtomicBool,
    pub fail_commit: AtomicBool,
    statement_error: Mutex<Option<String>>,
    pub open_cursors: Arc<AtomicUsize>,
    log: Mutex<Vec<String>>,
    binds: Mutex<Vec<Vec<EngineParam>>>,
    result: Mutex<(Vec<(String, String)>, Vec<Vec<MockCell>>)>,
    last_insert_id: Mutex<Option<i64>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Mark connection generations (1-based) as broken.
    pub fn break_generations(&self, generations: impl IntoIterator<Item = usize>) {
        lock(&self.broken).extend(generations);
    }

    /// Fail statements on live connections with a statement error.
    pub fn fail_statements(&self, message: Option<&str>) {
        *lock(&self.statement_error) = message.map(str::to_string);
    }

    pub fn set_result(&self, columns: Vec<(&str, &str)>, rows: Vec<Vec<MockCell>>) {
        *lock(&self.result) = (
            columns
                .into_iter()
                .map(|(l, t)| (l.to_string(), t.to_string()))
                .collect(),
            rows,
        );
    }

    pub fn set_last_insert_id(&self, id: Option<i64>) {
        *lock(&self.last_insert_id) = id;
    }

    /// Every statement and control command seen, in order.
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Parameters of every `fetch` and `execute`, in order.
    pub fn binds(&self) -> Vec<Vec<EngineParam>> {
        lock(&self.binds).clone()
    }

    fn record(&self, entry: impl Into<String>) {
        lock(&self.log).push(entry.into());
    }

    fn rows(&self) -> Vec<MockRow> {
        let result = lock(&self.result);
        result
            .1
            .iter()
            .map(|cells| MockRow {
                columns: result.0.clone(),
                cells: cells.clone(),
            })
            .collect()
    }
}

pub struct MockConnection {
    shared: Arc<MockShared>,
    generation: usize,
    auto_commit: bool,
    tx_open: bool,
    savepoint_seq: u64,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("generation", &self.generation)
            .field("auto_commit", &self.auto_commit)
            .field("tx_open", &self.tx_open)
            .field("savepoint_seq", &self.savepoint_seq)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    pub fn open(shared: Arc<MockShared>) -> Self {
        let generation = shared.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            shared,
            generation,
            auto_commit: true,
            tx_open: false,
            savepoint_seq: 0,
        }
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    fn broken(&self) -> bool {
        lock(&self.shared.broken).contains(&self.generation)
    }

    /// Common statement preamble: failure injection, then the implicit BEGIN.
    fn run(&mut self, sql: &str) -> DbResult<()> {
        if self.broken() {
            return Err(DbError::statement("I/O error: connection reset by peer", None));
        }
        if let Some(message) = lock(&self.shared.statement_error).clone() {
            return Err(DbError::statement(message, Some("42000".into())));
        }
        if !self.auto_commit && !self.tx_open {
            self.shared.record("BEGIN");
            self.tx_open = true;
        }
        self.shared.record(sql);
        Ok(())
    }
}

#[async_trait]
impl RawConnection for MockConnection {
    type Row = MockRow;

    async fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [EngineParam],
        _options: StatementOptions,
    ) -> DbResult<Cursor<'a, MockRow>> {
        self.run(sql)?;
        lock(&self.shared.binds).push(params.to_vec());
        let guard = CursorGuard::open(self.shared.open_cursors.clone());
        let columns = lock(&self.shared.result)
            .0
            .iter()
            .map(|(label, type_name)| ColumnMeta::new(label.as_str(), type_name.as_str()))
            .collect();
        let rows: Vec<DbResult<MockRow>> = self.shared.rows().into_iter().map(Ok).collect();
        let rows = stream::iter(rows)
            .map(move |row| {
                let _cursor = &guard;
                row
            })
            .boxed();
        Ok(Cursor::new(columns, rows))
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[EngineParam],
        _options: StatementOptions,
    ) -> DbResult<ExecSummary> {
        self.run(sql)?;
        lock(&self.shared.binds).push(params.to_vec());
        Ok(ExecSummary {
            rows_affected: 1,
            last_insert_id: *lock(&self.shared.last_insert_id),
        })
    }

    async fn execute_raw<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> DbResult<BoxStream<'a, DbResult<Step<MockRow>>>> {
        self.run(sql)?;
        let rows = self.shared.rows();
        let done = Step::Done {
            rows_affected: if rows.is_empty() { 1 } else { 0 },
        };
        let steps: Vec<DbResult<Step<MockRow>>> = rows
            .into_iter()
            .map(|row| Ok(Step::Row(row)))
            .chain(std::iter::once(Ok(done)))
            .collect();
        Ok(stream::iter(steps).boxed())
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.broken() {
            return Err(DbError::connectivity("connection is closed"));
        }
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
        if level == IsolationLevel::ReadUncommitted {
            return Err(DbError::statement("isolation level not supported", None));
        }
        self.shared.record(format!("ISOLATION {}", level));
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::statement("commit failed", None));
        }
        if self.tx_open {
            self.shared.record("COMMIT");
            self.tx_open = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.tx_open {
            self.shared.record("ROLLBACK");
            self.tx_open = false;
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
        self.run(&format!("SAVEPOINT {}", name))?;
        Ok(SavepointToken {
            name,
            seq: self.savepoint_seq,
        })
    }

    async fn rollback_to(&mut self, token: &SavepointToken) -> DbResult<()> {
        self.run(&format!("ROLLBACK TO SAVEPOINT {}", token.name))
    }

    async fn release(&mut self, token: &SavepointToken) -> DbResult<()> {
        self.run(&format!("RELEASE SAVEPOINT {}", token.name))
    }

    async fn server_version(&mut self) -> DbResult<Option<String>> {
        Ok(Some(format!("mock {}", self.generation)))
    }

    async fn close(self) -> DbResult<()> {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory over a `MockShared`.
pub struct MockFactory {
    pub shared: Arc<MockShared>,
    pub kind: FactoryKind,
}

impl MockFactory {
    pub fn new(shared: Arc<MockShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            kind: FactoryKind::Direct,
        })
    }

    pub fn with_kind(shared: Arc<MockShared>, kind: FactoryKind) -> Arc<Self> {
        Arc::new(Self { shared, kind })
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn new_connection(&self) -> DbResult<MockConnection> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::not_established("connection refused"));
        }
        Ok(MockConnection::open(self.shared.clone()))
    }

    fn kind(&self) -> FactoryKind {
        self.kind
    }
}
