//! Connection handle.
//!
//! A `ConnectionHandle` owns at most one raw connection and drives everything
//! that happens on it: connect/disconnect/reconnect, the unit-of-work retry
//! policy, transactions and savepoints. All of that state lives behind one async
//! mutex, so a lifecycle change and a unit of work never interleave, and a
//! reconnect is complete before the next unit of work sees the new connection.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::db::connection::{
    ExecSummary, IsolationLevel, RawConnection, SavepointToken, StatementOptions,
};
use crate::db::dialect::{Dialect, GeneratedKeys, KeyStrategy};
use crate::db::engine::EngineConnection;
use crate::db::escape;
use crate::db::factory::{ConnectionFactory, FactoryKind, factory_for_settings};
use crate::db::marshal::{MarshalOptions, TypeMarshaller};
use crate::db::materialize::ResultMaterializer;
use crate::db::retry::{self, Decision, FailureKind};
use crate::db::schema::SchemaIntrospector;
use crate::error::{DbError, DbResult};
use crate::models::{
    BindParameter, ColumnDescriptor, ExecuteOutcome, GeneratedKey, HostValue, ResultTable,
};

/// Maximum SQL length echoed into logs.
const LOGGED_SQL_LEN: usize = 200;

struct HandleState<C> {
    conn: Option<C>,
    connected: bool,
    savepoints: BTreeMap<String, SavepointToken>,
    server_version: Option<String>,
}

impl<C> Default for HandleState<C> {
    fn default() -> Self {
        Self {
            conn: None,
            connected: false,
            savepoints: BTreeMap::new(),
            server_version: None,
        }
    }
}

/// Run `$body` against a live connection, retrying it per the retry policy.
///
/// `$body` sees the connection as `$conn` and must evaluate to a `DbResult`
/// whose value does not borrow the connection.
macro_rules! retrying {
    ($handle:expr, $state:ident, |$conn:ident| $body:expr) => {{
        let mut attempt = 0u32;
        loop {
            let $conn = $handle.live_connection(&mut $state).await?;
            let auto_commit = $conn.auto_commit();
            match $body {
                Ok(value) => break DbResult::Ok(value),
                Err(err) => {
                    $handle
                        .after_failure(&mut $state, attempt, auto_commit, err)
                        .await?;
                    attempt += 1;
                }
            }
        }
    }};
}

/// One logical session against one database.
pub struct ConnectionHandle<C: RawConnection = EngineConnection> {
    factory: Arc<dyn ConnectionFactory<Connection = C>>,
    settings: ConnectionSettings,
    dialect: Dialect,
    marshaller: TypeMarshaller,
    lazy: bool,
    escape_processing: bool,
    state: Mutex<HandleState<C>>,
}

impl<C: RawConnection> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("dialect", &self.dialect.kind)
            .field("factory", &self.factory.kind())
            .field("lazy", &self.lazy)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle<EngineConnection> {
    /// Handle over the factory and dialect the settings describe.
    pub async fn open(settings: ConnectionSettings) -> DbResult<Self> {
        let factory = factory_for_settings(&settings, None)?;
        let dialect = Dialect::from_settings(&settings);
        Self::initialize(factory, settings, dialect).await
    }
}

impl<C: RawConnection> ConnectionHandle<C> {
    /// Build a handle and, unless it is lazy, connect it.
    ///
    /// Lookup factories are lazy by default; the `lazy` setting overrides that.
    pub async fn initialize(
        factory: Arc<dyn ConnectionFactory<Connection = C>>,
        settings: ConnectionSettings,
        dialect: Dialect,
    ) -> DbResult<Self> {
        let lazy = settings.lazy.unwrap_or(factory.kind().default_lazy());
        let marshaller = TypeMarshaller::new(dialect, MarshalOptions::from_settings(&settings));
        let handle = Self {
            escape_processing: dialect.escape_processing(&settings),
            factory,
            settings,
            dialect,
            marshaller,
            lazy,
            state: Mutex::new(HandleState::default()),
        };
        info!(
            dialect = %handle.dialect.kind,
            factory = ?handle.factory.kind(),
            lazy,
            "Connection handle initialized"
        );
        if !lazy {
            handle.connect().await?;
        }
        Ok(handle)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn marshaller(&self) -> &TypeMarshaller {
        &self.marshaller
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn uses_lookup_factory(&self) -> bool {
        self.factory.kind() == FactoryKind::Lookup
    }

    /// Schema introspection over this handle.
    pub fn introspector(&self) -> SchemaIntrospector<'_, C> {
        SchemaIntrospector::new(self)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a connection, replacing (and closing) any current one.
    pub async fn connect(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await
    }

    /// Close the current connection. Close failures are logged, never returned.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state).await;
    }

    pub async fn reconnect(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    /// Validity check. Never fails: any error means "not alive".
    pub async fn is_active(&self) -> bool {
        let mut state = self.state.lock().await;
        self.check_alive_locked(&mut state).await
    }

    async fn connect_locked(&self, state: &mut HandleState<C>) -> DbResult<()> {
        self.disconnect_locked(state).await;

        let mut conn = self.factory.new_connection().await.map_err(|e| {
            warn!(error = %e, "Connection failed");
            DbError::not_established_by(e)
        })?;

        if self.settings.configure_connection {
            for sql in self.dialect.post_connect_statements(&self.settings) {
                debug!(sql = %sql, "Post-connect setup");
                if let Err(e) = conn.execute(&sql, &[], self.statement_options()).await {
                    if let Err(close_err) = conn.close().await {
                        warn!(error = %close_err, "Failed to close connection after setup error");
                    }
                    return Err(DbError::not_established_by(e));
                }
            }
        }

        state.server_version = match conn.server_version().await {
            Ok(version) => version,
            Err(e) => {
                debug!(error = %e, "Server version unavailable");
                None
            }
        };
        state.conn = Some(conn);
        state.connected = true;
        info!(
            dialect = %self.dialect.kind,
            version = state.server_version.as_deref().unwrap_or("unknown"),
            "Connected"
        );
        Ok(())
    }

    async fn disconnect_locked(&self, state: &mut HandleState<C>) {
        state.savepoints.clear();
        state.connected = false;
        if let Some(conn) = state.conn.take() {
            match conn.close().await {
                Ok(()) => debug!("Connection closed"),
                Err(e) => warn!(error = %e, "Failed to close connection"),
            }
        }
    }

    async fn reconnect_locked(&self, state: &mut HandleState<C>) -> DbResult<()> {
        info!("Reconnecting");
        self.disconnect_locked(state).await;
        self.connect_locked(state).await
    }

    async fn check_alive_locked(&self, state: &mut HandleState<C>) -> bool {
        let Some(conn) = state.conn.as_mut() else {
            return false;
        };
        let options = self.statement_options();
        let alive_sql = self.settings.connection_alive_sql.as_deref();
        let check = async {
            match alive_sql {
                Some(sql) => conn.execute(sql, &[], options).await.map(|_| ()),
                None => conn.ping().await,
            }
        };
        let outcome = match self.settings.alive_timeout() {
            Some(limit) => match tokio::time::timeout(limit, check).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout("validity check", limit.as_secs())),
            },
            None => check.await,
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Validity check failed");
                false
            }
        }
    }

    /// The owned connection, connecting first when there is none.
    async fn live_connection<'s>(&self, state: &'s mut HandleState<C>) -> DbResult<&'s mut C> {
        if state.conn.is_none() {
            self.connect_locked(state).await?;
        }
        state
            .conn
            .as_mut()
            .ok_or_else(|| DbError::not_established("no connection after connect"))
    }

    /// Apply the retry policy to a failed unit of work.
    ///
    /// `Ok(())` means the connection was replaced and the work should run again.
    async fn after_failure(
        &self,
        state: &mut HandleState<C>,
        attempt: u32,
        auto_commit: bool,
        err: DbError,
    ) -> DbResult<()> {
        if !auto_commit {
            debug!(error = %err, "Failure inside a transaction, not retrying");
            return Err(err);
        }
        let failure = if self.check_alive_locked(state).await {
            FailureKind::ConnectionAlive
        } else {
            FailureKind::ConnectionBroken
        };
        let budget = self.settings.retry_count;
        match (retry::decide(attempt, budget, failure, auto_commit), failure) {
            (Decision::Retry, _) => {
                warn!(attempt = attempt + 1, budget, error = %err, "Connection broken, retrying");
                self.reconnect_locked(state).await?;
                Ok(())
            }
            (Decision::Surface, FailureKind::ConnectionAlive) => Err(err),
            (Decision::Surface, FailureKind::ConnectionBroken) => {
                warn!(attempts = attempt + 1, error = %err, "Connection broken, giving up");
                Err(err.into_connectivity())
            }
        }
    }

    // =========================================================================
    // Units of work
    // =========================================================================

    fn statement_options(&self) -> StatementOptions {
        StatementOptions {
            persistent: self.settings.prepared_statement_cache,
        }
    }

    fn prepare_sql<'q>(&self, sql: &'q str) -> Cow<'q, str> {
        let sql = if self.escape_processing {
            Cow::Owned(escape::rewrite(sql))
        } else {
            Cow::Borrowed(sql)
        };
        debug!(sql = %truncate_sql(&sql), "Executing");
        sql
    }

    /// Run raw SQL, possibly several statements.
    ///
    /// Returns the last result set when any statement produced rows, otherwise
    /// the total number of affected rows.
    pub async fn execute(&self, sql: &str) -> DbResult<ExecuteOutcome> {
        let sql = self.prepare_sql(sql);
        let materializer = ResultMaterializer::new(&self.marshaller);
        let mut state = self.state.lock().await;
        retrying!(self, state, |conn| async {
            let steps = conn.execute_raw(&sql).await?;
            materializer.steps(steps).await
        }
        .await)
    }

    /// Run a query and buffer its result, keeping at most `max_rows` rows.
    pub async fn execute_query(
        &self,
        sql: &str,
        binds: &[BindParameter],
        max_rows: Option<usize>,
    ) -> DbResult<ResultTable> {
        let sql = self.prepare_sql(sql);
        let params = self.marshaller.encode_all(binds)?;
        let options = self.statement_options();
        let materializer = ResultMaterializer::new(&self.marshaller);
        let mut state = self.state.lock().await;
        retrying!(self, state, |conn| async {
            let cursor = conn.fetch(&sql, &params, options).await?;
            materializer.buffered(cursor, max_rows).await
        }
        .await)
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute_update(&self, sql: &str, binds: &[BindParameter]) -> DbResult<u64> {
        let sql = self.prepare_sql(sql);
        let params = self.marshaller.encode_all(binds)?;
        let options = self.statement_options();
        let mut state = self.state.lock().await;
        let summary: ExecSummary = retrying!(self, state, |conn| conn
            .execute(&sql, &params, options)
            .await)?;
        Ok(summary.rows_affected)
    }

    /// Run an insert and return the keys the engine generated for it.
    ///
    /// Dialects whose key retrieval is unsupported or known to be unreliable
    /// return `GeneratedKey::None` without asking the engine.
    pub async fn execute_insert(
        &self,
        sql: &str,
        binds: &[BindParameter],
    ) -> DbResult<GeneratedKey> {
        match self.dialect.generated_keys {
            GeneratedKeys::Supported(KeyStrategy::Returning) => {
                let sql = with_returning(sql);
                let table = self.execute_query(&sql, binds, None).await?;
                Ok(GeneratedKey::from_keys(
                    table
                        .rows
                        .into_iter()
                        .filter_map(|row| row.into_iter().next())
                        .collect(),
                ))
            }
            GeneratedKeys::Supported(KeyStrategy::LastInsertId) => {
                let sql = self.prepare_sql(sql);
                let params = self.marshaller.encode_all(binds)?;
                let options = self.statement_options();
                let mut state = self.state.lock().await;
                let summary: ExecSummary = retrying!(self, state, |conn| conn
                    .execute(&sql, &params, options)
                    .await)?;
                Ok(match summary.last_insert_id {
                    Some(id) if summary.rows_affected > 0 => {
                        GeneratedKey::Single(HostValue::Integer(id))
                    }
                    _ => GeneratedKey::None,
                })
            }
            GeneratedKeys::KnownBuggy { reason } => {
                debug!(reason, "Generated key retrieval disabled");
                self.execute_update(sql, binds).await?;
                Ok(GeneratedKey::None)
            }
            GeneratedKeys::Unsupported => {
                self.execute_update(sql, binds).await?;
                Ok(GeneratedKey::None)
            }
        }
    }

    /// Stream a query's rows to `on_row` without buffering them.
    ///
    /// A failure after the first row was delivered is never retried, so rows
    /// are seen at most once. Returns the number of rows delivered.
    pub async fn query_each<F>(
        &self,
        sql: &str,
        binds: &[BindParameter],
        mut on_row: F,
    ) -> DbResult<u64>
    where
        F: FnMut(&[ColumnDescriptor], Vec<HostValue>) -> DbResult<()>,
    {
        let sql = self.prepare_sql(sql);
        let params = self.marshaller.encode_all(binds)?;
        let options = self.statement_options();
        let materializer = ResultMaterializer::new(&self.marshaller);
        let mut state = self.state.lock().await;
        let mut attempt = 0u32;
        loop {
            let conn = self.live_connection(&mut state).await?;
            let auto_commit = conn.auto_commit();
            let mut delivered = 0u64;
            let result = async {
                let cursor = conn.fetch(&sql, &params, options).await?;
                materializer
                    .streaming(cursor, |columns, values| {
                        delivered += 1;
                        on_row(columns, values)
                    })
                    .await
            }
            .await;
            match result {
                Ok(count) => return Ok(count),
                Err(err) if delivered > 0 => return Err(err),
                Err(err) => {
                    self.after_failure(&mut state, attempt, auto_commit, err)
                        .await?;
                    attempt += 1;
                }
            }
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start an explicit transaction.
    pub async fn begin(&self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let conn = self.live_connection(&mut state).await?;
        if let Some(level) = isolation {
            conn.set_isolation(level).await.map_err(|e| match e {
                DbError::Statement { message, .. } => {
                    DbError::isolation_unsupported(level.to_string(), message)
                }
                other => other,
            })?;
        }
        if conn.auto_commit() {
            conn.set_auto_commit(false).await?;
        }
        debug!(isolation = ?isolation, "Transaction started");
        Ok(())
    }

    /// Commit. Auto-commit is re-enabled and savepoints forgotten even on failure.
    pub async fn commit(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let result = match state.conn.as_mut() {
            Some(conn) => conn.commit().await,
            None => Err(DbError::not_established("no connection to commit")),
        };
        self.end_transaction(&mut state, result.is_err()).await;
        debug!(ok = result.is_ok(), "Transaction committed");
        result
    }

    /// Roll back. Auto-commit is re-enabled and savepoints forgotten even on failure.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let result = match state.conn.as_mut() {
            Some(conn) => conn.rollback().await,
            None => Err(DbError::not_established("no connection to roll back")),
        };
        self.end_transaction(&mut state, result.is_err()).await;
        debug!(ok = result.is_ok(), "Transaction rolled back");
        result
    }

    async fn end_transaction(&self, state: &mut HandleState<C>, failed: bool) {
        state.savepoints.clear();
        let Some(conn) = state.conn.as_mut() else {
            return;
        };
        if failed {
            // re-enabling auto-commit would commit whatever is left open
            if let Err(e) = conn.rollback().await {
                warn!(error = %e, "Rollback after failed transaction end failed");
            }
        }
        if !conn.auto_commit() {
            if let Err(e) = conn.set_auto_commit(true).await {
                warn!(error = %e, "Failed to restore auto-commit");
            }
        }
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&self, isolation: Option<IsolationLevel>, f: F) -> DbResult<T>
    where
        F: AsyncFnOnce(&Self) -> DbResult<T>,
    {
        self.begin(isolation).await?;
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Savepoints
    // =========================================================================

    /// Create a savepoint and return its name; a name is generated when none is given.
    pub async fn create_savepoint(&self, name: Option<&str>) -> DbResult<String> {
        let mut state = self.state.lock().await;
        let conn = self.live_connection(&mut state).await?;
        if conn.auto_commit() {
            conn.set_auto_commit(false).await?;
        }
        let token = conn.savepoint(name).await?;
        let name = token.name.clone();
        debug!(savepoint = %name, "Savepoint created");
        state.savepoints.insert(name.clone(), token);
        Ok(name)
    }

    /// Roll back to a savepoint. It stays usable; later savepoints are gone.
    pub async fn rollback_savepoint(&self, name: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let token = state
            .savepoints
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::savepoint_not_found(name))?;
        let conn = state
            .conn
            .as_mut()
            .ok_or_else(|| DbError::not_established("no connection for savepoint"))?;
        conn.rollback_to(&token).await?;
        state.savepoints.retain(|_, t| t.seq <= token.seq);
        Ok(())
    }

    /// Release a savepoint along with every savepoint created after it.
    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let token = state
            .savepoints
            .remove(name)
            .ok_or_else(|| DbError::savepoint_not_found(name))?;
        state.savepoints.retain(|_, t| t.seq < token.seq);
        let conn = state
            .conn
            .as_mut()
            .ok_or_else(|| DbError::not_established("no connection for savepoint"))?;
        conn.release(&token).await
    }

    /// Recorded savepoint names, oldest first.
    pub async fn savepoint_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut tokens: Vec<&SavepointToken> = state.savepoints.values().collect();
        tokens.sort_by_key(|t| t.seq);
        tokens.into_iter().map(|t| t.name.clone()).collect()
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Server version reported at the last successful connect.
    pub async fn server_version(&self) -> Option<String> {
        self.state.lock().await.server_version.clone()
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.connected && state.conn.is_some()
    }

    /// Whether auto-commit is off on the current connection.
    pub async fn in_transaction(&self) -> bool {
        let state = self.state.lock().await;
        state.conn.as_ref().is_some_and(|c| !c.auto_commit())
    }
}

/// Append `RETURNING *` unless the statement already has a RETURNING clause.
fn with_returning(sql: &str) -> String {
    let trimmed = sql.trim_end().trim_end_matches(';');
    let has_returning = trimmed
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case("returning"));
    if has_returning {
        trimmed.to_string()
    } else {
        format!("{} RETURNING *", trimmed)
    }
}

fn truncate_sql(sql: &str) -> &str {
    match sql.char_indices().nth(LOGGED_SQL_LEN) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::IdentifierCase;
    use crate::db::mock::{MockCell, MockConnection, MockFactory, MockShared};
    use std::sync::atomic::Ordering;

    fn settings(retry_count: u32) -> ConnectionSettings {
        ConnectionSettings {
            retry_count,
            ..ConnectionSettings::default()
        }
    }

    async fn handle_with(
        shared: &Arc<MockShared>,
        settings: ConnectionSettings,
        dialect: Dialect,
    ) -> ConnectionHandle<MockConnection> {
        ConnectionHandle::initialize(MockFactory::new(shared.clone()), settings, dialect)
            .await
            .unwrap()
    }

    fn one_row(shared: &MockShared) {
        shared.set_result(
            vec![("id", "INTEGER"), ("name", "VARCHAR")],
            vec![
                vec![MockCell::Int(1), MockCell::Text("a".into())],
                vec![MockCell::Int(2), MockCell::Null],
            ],
        );
    }

    #[tokio::test]
    async fn test_eager_and_lazy_connect() {
        let shared = MockShared::new();
        let eager = handle_with(&shared, settings(0), Dialect::generic()).await;
        assert!(eager.is_connected().await);
        assert_eq!(shared.opened(), 1);
        assert_eq!(eager.server_version().await.as_deref(), Some("mock 1"));

        let lazy_shared = MockShared::new();
        let factory = MockFactory::with_kind(lazy_shared.clone(), FactoryKind::Lookup);
        let lazy = ConnectionHandle::initialize(factory, settings(0), Dialect::generic())
            .await
            .unwrap();
        assert!(lazy.is_lazy());
        assert!(lazy.uses_lookup_factory());
        assert!(!lazy.is_connected().await);
        assert_eq!(lazy_shared.opened(), 0);

        lazy.execute_update("UPDATE t SET a = 1", &[]).await.unwrap();
        assert!(lazy.is_connected().await);
        assert_eq!(lazy_shared.opened(), 1);
    }

    #[tokio::test]
    async fn test_lazy_setting_overrides_factory_kind() {
        let shared = MockShared::new();
        let mut s = settings(0);
        s.lazy = Some(true);
        let handle = handle_with(&shared, s, Dialect::generic()).await;
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_closes_previous_connection() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle.connect().await.unwrap();
        handle.reconnect().await.unwrap();
        assert_eq!(shared.opened(), 3);
        assert_eq!(shared.closed.load(Ordering::SeqCst), 2);

        handle.disconnect().await;
        assert!(!handle.is_connected().await);
        assert!(!handle.is_active().await);
        assert_eq!(shared.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_established() {
        let shared = MockShared::new();
        shared.fail_connect.store(true, Ordering::SeqCst);
        let err = ConnectionHandle::initialize(
            MockFactory::new(shared.clone()),
            settings(0),
            Dialect::generic(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::ConnectionNotEstablished { .. }));
    }

    #[tokio::test]
    async fn test_post_connect_setup_runs_when_configured() {
        let shared = MockShared::new();
        let _handle = handle_with(&shared, settings(0), Dialect::sqlite()).await;
        assert_eq!(shared.log(), vec!["PRAGMA foreign_keys = ON"]);

        let quiet = MockShared::new();
        let mut s = settings(0);
        s.configure_connection = false;
        let _handle = handle_with(&quiet, s, Dialect::sqlite()).await;
        assert!(quiet.log().is_empty());
    }

    #[tokio::test]
    async fn test_is_active_uses_alive_sql() {
        let shared = MockShared::new();
        let mut s = settings(0);
        s.connection_alive_sql = Some("SELECT 1".into());
        s.connection_alive_timeout = Some(1);
        let handle = handle_with(&shared, s, Dialect::generic()).await;
        assert!(handle.is_active().await);
        assert_eq!(shared.log(), vec!["SELECT 1"]);

        shared.break_generations([1]);
        assert!(!handle.is_active().await);
    }

    #[tokio::test]
    async fn test_query_example_table() {
        let shared = MockShared::new();
        one_row(&shared);
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        let table = handle
            .execute_query("SELECT id, name FROM t", &[], None)
            .await
            .unwrap();
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(
            table.rows,
            vec![
                vec![HostValue::Integer(1), HostValue::Text("a".into())],
                vec![HostValue::Integer(2), HostValue::Null],
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        for n in 1..=3usize {
            let shared = MockShared::new();
            one_row(&shared);
            shared.break_generations(1..=n);
            let handle = handle_with(&shared, settings(n as u32), Dialect::generic()).await;
            let table = handle
                .execute_query("SELECT id, name FROM t", &[], None)
                .await
                .unwrap();
            assert_eq!(table.row_count(), 2);
            assert_eq!(shared.opened(), n + 1);
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_surfaces() {
        for n in 1..=3usize {
            let shared = MockShared::new();
            shared.break_generations(1..=n);
            let handle = handle_with(&shared, settings(n as u32 - 1), Dialect::generic()).await;
            let err = handle
                .execute_update("UPDATE t SET a = 1", &[])
                .await
                .unwrap_err();
            assert!(err.is_connectivity(), "{:?}", err);
            assert!(err.to_string().contains("connection reset"), "{}", err);
            assert_eq!(shared.opened(), n);
        }
    }

    #[tokio::test]
    async fn test_statement_error_never_retried() {
        let shared = MockShared::new();
        shared.fail_statements(Some("syntax error at or near \"SELEC\""));
        let handle = handle_with(&shared, settings(5), Dialect::generic()).await;
        let err = handle.execute_query("SELEC 1", &[], None).await.unwrap_err();
        assert!(matches!(err, DbError::Statement { .. }));
        assert_eq!(err.sql_state(), Some("42000"));
        assert_eq!(shared.opened(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_inside_transaction() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(5), Dialect::generic()).await;
        handle.begin(None).await.unwrap();
        shared.break_generations([1]);
        let err = handle
            .execute_update("UPDATE t SET a = 1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Statement { .. }));
        assert_eq!(shared.opened(), 1);
    }

    #[tokio::test]
    async fn test_begin_commit_restores_auto_commit() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle
            .begin(Some(IsolationLevel::Serializable))
            .await
            .unwrap();
        assert!(handle.in_transaction().await);
        handle.execute_update("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        handle.commit().await.unwrap();
        assert!(!handle.in_transaction().await);
        assert_eq!(
            shared.log(),
            vec![
                "ISOLATION SERIALIZABLE",
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "COMMIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_unsupported_isolation() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        let err = handle
            .begin(Some(IsolationLevel::ReadUncommitted))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::IsolationUnsupported { .. }));
        assert!(!handle.in_transaction().await);
    }

    #[tokio::test]
    async fn test_failed_commit_still_cleans_up() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle.create_savepoint(Some("a")).await.unwrap();
        shared.fail_commit.store(true, Ordering::SeqCst);
        assert!(handle.commit().await.is_err());
        assert!(!handle.in_transaction().await);
        assert!(handle.savepoint_names().await.is_empty());
        assert_eq!(shared.log().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_transaction_closure() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;

        let value = handle
            .transaction(None, async |h| -> DbResult<i32> {
                h.execute_update("INSERT INTO t VALUES (1)", &[]).await?;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(shared.log().last().map(String::as_str), Some("COMMIT"));

        let err = handle
            .transaction(None, async |h| -> DbResult<()> {
                h.execute_update("INSERT INTO t VALUES (2)", &[]).await?;
                Err(DbError::internal("abort"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
        assert_eq!(shared.log().last().map(String::as_str), Some("ROLLBACK"));
        assert!(!handle.in_transaction().await);
    }

    #[tokio::test]
    async fn test_generated_savepoint_names_are_deterministic() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        let first = handle.create_savepoint(None).await.unwrap();
        let second = handle.create_savepoint(None).await.unwrap();
        assert_eq!(first, "SAVEPOINT_1");
        assert_eq!(second, "SAVEPOINT_2");
        assert!(handle.in_transaction().await);
        assert_eq!(handle.savepoint_names().await, vec![first, second]);
    }

    #[tokio::test]
    async fn test_unknown_savepoint_fails() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle.create_savepoint(Some("known")).await.unwrap();
        let err = handle.rollback_savepoint("missing").await.unwrap_err();
        assert!(matches!(err, DbError::SavepointNotFound { .. }));
        let err = handle.release_savepoint("missing").await.unwrap_err();
        assert!(matches!(err, DbError::SavepointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_and_release() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle.create_savepoint(Some("a")).await.unwrap();
        handle.create_savepoint(Some("b")).await.unwrap();
        handle.create_savepoint(Some("c")).await.unwrap();

        handle.rollback_savepoint("b").await.unwrap();
        assert_eq!(handle.savepoint_names().await, vec!["a", "b"]);
        handle.release_savepoint("a").await.unwrap();
        assert!(handle.savepoint_names().await.is_empty());
        assert!(shared.log().contains(&"ROLLBACK TO SAVEPOINT b".to_string()));
        assert!(shared.log().contains(&"RELEASE SAVEPOINT a".to_string()));
    }

    #[tokio::test]
    async fn test_commit_and_rollback_clear_savepoints() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        handle.create_savepoint(None).await.unwrap();
        handle.commit().await.unwrap();
        assert!(handle.savepoint_names().await.is_empty());

        handle.create_savepoint(None).await.unwrap();
        handle.rollback().await.unwrap();
        assert!(handle.savepoint_names().await.is_empty());
        let err = handle.release_savepoint("SAVEPOINT_2").await.unwrap_err();
        assert!(matches!(err, DbError::SavepointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_known_buggy_generated_keys_return_none() {
        let shared = MockShared::new();
        shared.set_last_insert_id(Some(42));
        let handle = handle_with(&shared, settings(0), Dialect::derby()).await;
        let key = handle
            .execute_insert("INSERT INTO no_key_table VALUES (1)", &[])
            .await
            .unwrap();
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_last_insert_id_key() {
        let shared = MockShared::new();
        shared.set_last_insert_id(Some(42));
        let handle = handle_with(&shared, settings(0), Dialect::sqlite()).await;
        let key = handle
            .execute_insert("INSERT INTO t (name) VALUES ('x')", &[])
            .await
            .unwrap();
        assert_eq!(key.as_single(), Some(&HostValue::Integer(42)));
    }

    #[tokio::test]
    async fn test_returning_keys() {
        let shared = MockShared::new();
        shared.set_result(vec![("id", "INT4")], vec![vec![MockCell::Int(5)]]);
        let mut s = settings(0);
        s.configure_connection = false;
        let handle = handle_with(&shared, s, Dialect::postgres()).await;
        let key = handle
            .execute_insert("INSERT INTO t (name) VALUES ('x');", &[])
            .await
            .unwrap();
        assert_eq!(key.as_single(), Some(&HostValue::Integer(5)));
        assert_eq!(
            shared.log().last().map(String::as_str),
            Some("INSERT INTO t (name) VALUES ('x') RETURNING *")
        );
    }

    #[tokio::test]
    async fn test_upper_case_dialect_folds_labels() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("ID", "INTEGER"), ("Id", "INTEGER")],
            vec![vec![MockCell::Int(1), MockCell::Int(2)]],
        );
        let dialect = Dialect::generic().with_identifier_case(IdentifierCase::Upper);
        let handle = handle_with(&shared, settings(0), dialect).await;
        let table = handle.execute_query("SELECT 1", &[], None).await.unwrap();
        assert_eq!(table.column_names(), vec!["id", "Id"]);
    }

    #[tokio::test]
    async fn test_empty_query_keeps_columns() {
        let shared = MockShared::new();
        shared.set_result(vec![("ID", "INTEGER"), ("NAME", "VARCHAR")], vec![]);
        let dialect = Dialect::generic().with_identifier_case(IdentifierCase::Upper);
        let handle = handle_with(&shared, settings(0), dialect).await;
        let table = handle
            .execute_query("SELECT id, name FROM t WHERE 1 = 0", &[], None)
            .await
            .unwrap();
        assert!(table.is_empty());
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(shared.open_cursors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_outcomes() {
        let shared = MockShared::new();
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        let outcome = handle.execute("DELETE FROM t").await.unwrap();
        assert_eq!(outcome.rows_affected(), Some(1));

        one_row(&shared);
        let table = handle
            .execute("SELECT id, name FROM t")
            .await
            .unwrap()
            .into_table()
            .unwrap();
        assert_eq!(table.row_count(), 2);
    }

    #[tokio::test]
    async fn test_escape_processing() {
        let shared = MockShared::new();
        let mut s = settings(0);
        s.statement_escape_processing = Some(true);
        let handle = handle_with(&shared, s, Dialect::generic()).await;
        handle
            .execute_update("DELETE FROM t WHERE d < {d '2024-01-01'}", &[])
            .await
            .unwrap();
        assert_eq!(
            shared.log().last().map(String::as_str),
            Some("DELETE FROM t WHERE d < DATE '2024-01-01'")
        );
    }

    #[tokio::test]
    async fn test_query_each_streams_and_releases_cursor() {
        let shared = MockShared::new();
        one_row(&shared);
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        let mut names = Vec::new();
        let count = handle
            .query_each("SELECT id, name FROM t", &[], |columns, values| {
                assert_eq!(columns[1].name, "name");
                names.push(values[1].clone());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(names, vec![HostValue::Text("a".into()), HostValue::Null]);
        assert_eq!(shared.open_cursors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_decode_releases_cursor() {
        let shared = MockShared::new();
        shared.set_result(
            vec![("id", "INTEGER")],
            vec![vec![MockCell::Int(1)], vec![MockCell::Fail]],
        );
        let handle = handle_with(&shared, settings(0), Dialect::generic()).await;
        for _ in 0..3 {
            let err = handle.execute_query("SELECT id FROM t", &[], None).await;
            assert!(err.is_err());
        }
        assert_eq!(shared.open_cursors.load(Ordering::SeqCst), 0);
        assert_eq!(shared.opened(), 1);
    }

    #[test]
    fn test_with_returning() {
        assert_eq!(
            with_returning("INSERT INTO t VALUES (1);"),
            "INSERT INTO t VALUES (1) RETURNING *"
        );
        assert_eq!(
            with_returning("INSERT INTO t VALUES (1) RETURNING id"),
            "INSERT INTO t VALUES (1) RETURNING id"
        );
    }

    #[test]
    fn test_with_returning_any_whitespace() {
        assert_eq!(
            with_returning("INSERT INTO t VALUES (1)\nRETURNING id"),
            "INSERT INTO t VALUES (1)\nRETURNING id"
        );
        assert_eq!(
            with_returning("INSERT INTO t VALUES (1) returning\tid;"),
            "INSERT INTO t VALUES (1) returning\tid"
        );
        assert_eq!(
            with_returning("INSERT INTO t (returning_flag) VALUES (1)"),
            "INSERT INTO t (returning_flag) VALUES (1) RETURNING *"
        );
    }

    #[test]
    fn test_truncate_sql() {
        let long = "x".repeat(500);
        assert_eq!(truncate_sql(&long).len(), LOGGED_SQL_LEN);
        assert_eq!(truncate_sql("SELECT 1"), "SELECT 1");
    }
}
