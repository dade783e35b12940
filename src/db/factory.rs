//! Connection factories.
//!
//! A `ConnectionFactory` produces one raw connection per call. Three flavors:
//! - `DirectDriverFactory`: opens a connection from the configured URL through a
//!   `Driver` (the sqlx driver unless an instance is supplied).
//! - `PooledDataSourceFactory`: checks connections out of a `DataSource`, given
//!   directly or resolved by name from a `Directory`.
//! - `LookupDataSourceFactory`: resolves a `DataSource` by name on demand and
//!   re-resolves it when a checkout fails.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::db::connection::RawConnection;
use crate::db::engine::EngineConnection;
use crate::db::pool::{self, DbPool};
use crate::error::{DbError, DbResult};

/// How a factory obtains connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryKind {
    Direct,
    Pooled,
    Lookup,
}

impl FactoryKind {
    /// Lookup-based factories connect lazily unless told otherwise.
    pub fn default_lazy(&self) -> bool {
        matches!(self, Self::Lookup)
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: RawConnection;

    async fn new_connection(&self) -> DbResult<Self::Connection>;

    fn kind(&self) -> FactoryKind;
}

/// Opens connections from settings.
#[async_trait]
pub trait Driver: Send + Sync {
    type Connection: RawConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> DbResult<Self::Connection>;
}

/// A source of pooled connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    type Connection: RawConnection;

    async fn get_connection(&self) -> DbResult<Self::Connection>;
}

/// What a directory name is bound to.
pub enum Binding<C: RawConnection> {
    DataSource(Arc<dyn DataSource<Connection = C>>),
    /// Bound, but not to a datasource
    Other { type_name: String },
}

impl<C: RawConnection> Clone for Binding<C> {
    fn clone(&self) -> Self {
        match self {
            Self::DataSource(ds) => Self::DataSource(ds.clone()),
            Self::Other { type_name } => Self::Other {
                type_name: type_name.clone(),
            },
        }
    }
}

/// Name service for datasources.
#[async_trait]
pub trait Directory: Send + Sync {
    type Connection: RawConnection;

    /// `Ok(None)` when nothing is bound under `name`.
    async fn lookup(&self, name: &str) -> DbResult<Option<Binding<Self::Connection>>>;
}

// =============================================================================
// sqlx-backed implementations
// =============================================================================

/// The built-in driver for PostgreSQL, MySQL and SQLite URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxDriver;

#[async_trait]
impl Driver for SqlxDriver {
    type Connection = EngineConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> DbResult<EngineConnection> {
        pool::connect(settings).await
    }
}

/// A sqlx pool as a datasource.
#[derive(Debug, Clone)]
pub struct SqlxPoolDataSource {
    pool: DbPool,
}

impl SqlxPoolDataSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Build the pool for `settings`.
    pub async fn connect(settings: &ConnectionSettings) -> DbResult<Self> {
        Ok(Self::new(pool::create_pool(settings).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for SqlxPoolDataSource {
    type Connection = EngineConnection;

    async fn get_connection(&self) -> DbResult<EngineConnection> {
        self.pool.acquire().await
    }
}

/// A directory held in memory, for wiring datasources by name.
pub struct InMemoryDirectory<C: RawConnection> {
    bindings: Mutex<HashMap<String, Binding<C>>>,
}

impl<C: RawConnection> Default for InMemoryDirectory<C> {
    fn default() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: RawConnection> InMemoryDirectory<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, name: impl Into<String>, binding: Binding<C>) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), binding);
    }

    pub fn bind_data_source(
        &self,
        name: impl Into<String>,
        source: Arc<dyn DataSource<Connection = C>>,
    ) {
        self.bind(name, Binding::DataSource(source));
    }

    pub fn unbind(&self, name: &str) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

#[async_trait]
impl<C: RawConnection> Directory for InMemoryDirectory<C> {
    type Connection = C;

    async fn lookup(&self, name: &str) -> DbResult<Option<Binding<C>>> {
        Ok(self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Opens connections from a URL through a driver.
pub struct DirectDriverFactory<C: RawConnection> {
    settings: ConnectionSettings,
    driver: Arc<dyn Driver<Connection = C>>,
    driver_instance: bool,
}

impl DirectDriverFactory<EngineConnection> {
    /// Factory using the built-in sqlx driver.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            driver: Arc::new(SqlxDriver),
            driver_instance: false,
        }
    }
}

impl<C: RawConnection> DirectDriverFactory<C> {
    /// Factory using a caller-supplied driver instance.
    pub fn with_driver(settings: ConnectionSettings, driver: Arc<dyn Driver<Connection = C>>) -> Self {
        Self {
            settings,
            driver,
            driver_instance: true,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[async_trait]
impl<C: RawConnection> ConnectionFactory for DirectDriverFactory<C> {
    type Connection = C;

    async fn new_connection(&self) -> DbResult<C> {
        if self.settings.url.is_none() && self.settings.driver.is_none() && !self.driver_instance {
            return Err(DbError::configuration(
                "Neither a connection URL nor a driver is configured",
                "Set the 'url' key, the 'driver' key, or supply a driver instance",
            ));
        }
        self.driver
            .connect(&self.settings)
            .await
            .map_err(into_connection_error)
    }

    fn kind(&self) -> FactoryKind {
        FactoryKind::Direct
    }
}

/// Checks connections out of a datasource.
///
/// When the datasource came from a directory lookup, a failed checkout drops the
/// cached reference so the next call resolves the name again.
pub struct PooledDataSourceFactory<C: RawConnection> {
    cached: Mutex<Option<Arc<dyn DataSource<Connection = C>>>>,
    lookup: Option<(Arc<dyn Directory<Connection = C>>, String)>,
}

impl<C: RawConnection> PooledDataSourceFactory<C> {
    pub fn new(source: Arc<dyn DataSource<Connection = C>>) -> Self {
        Self {
            cached: Mutex::new(Some(source)),
            lookup: None,
        }
    }

    /// Resolve `name` in `directory` on first use.
    pub fn by_name(directory: Arc<dyn Directory<Connection = C>>, name: impl Into<String>) -> Self {
        Self {
            cached: Mutex::new(None),
            lookup: Some((directory, name.into())),
        }
    }

    fn cached(&self) -> Option<Arc<dyn DataSource<Connection = C>>> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, source: Option<Arc<dyn DataSource<Connection = C>>>) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = source;
    }

    async fn source(&self) -> DbResult<Arc<dyn DataSource<Connection = C>>> {
        if let Some(source) = self.cached() {
            return Ok(source);
        }
        let Some((directory, name)) = &self.lookup else {
            return Err(DbError::configuration(
                "No datasource configured",
                "Supply a datasource or a directory name",
            ));
        };
        let source = resolve(directory.as_ref(), name).await?;
        self.store(Some(source.clone()));
        Ok(source)
    }
}

#[async_trait]
impl<C: RawConnection> ConnectionFactory for PooledDataSourceFactory<C> {
    type Connection = C;

    async fn new_connection(&self) -> DbResult<C> {
        let source = self.source().await?;
        match source.get_connection().await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                if let Some((_, name)) = &self.lookup {
                    warn!(name = %name, "Checkout failed, dropping cached datasource");
                    self.store(None);
                }
                Err(into_connection_error(err))
            }
        }
    }

    fn kind(&self) -> FactoryKind {
        FactoryKind::Pooled
    }
}

/// Resolves a datasource by name, caching it until a checkout fails.
pub struct LookupDataSourceFactory<C: RawConnection> {
    directory: Arc<dyn Directory<Connection = C>>,
    name: String,
    cached: Mutex<Option<Arc<dyn DataSource<Connection = C>>>>,
}

impl<C: RawConnection> LookupDataSourceFactory<C> {
    pub fn new(directory: Arc<dyn Directory<Connection = C>>, name: impl Into<String>) -> Self {
        Self {
            directory,
            name: name.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn source(&self, fresh: bool) -> DbResult<Arc<dyn DataSource<Connection = C>>> {
        if !fresh {
            let cached = self
                .cached
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(source) = cached {
                return Ok(source);
            }
        }
        let source = resolve(self.directory.as_ref(), &self.name).await?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(source.clone());
        Ok(source)
    }
}

#[async_trait]
impl<C: RawConnection> ConnectionFactory for LookupDataSourceFactory<C> {
    type Connection = C;

    async fn new_connection(&self) -> DbResult<C> {
        match self.source(false).await?.get_connection().await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                debug!(name = %self.name, error = %err, "Checkout failed, resolving again");
                self.source(true)
                    .await?
                    .get_connection()
                    .await
                    .map_err(into_connection_error)
            }
        }
    }

    fn kind(&self) -> FactoryKind {
        FactoryKind::Lookup
    }
}

async fn resolve<C: RawConnection>(
    directory: &dyn Directory<Connection = C>,
    name: &str,
) -> DbResult<Arc<dyn DataSource<Connection = C>>> {
    match directory.lookup(name).await {
        Ok(Some(Binding::DataSource(source))) => {
            debug!(name = %name, "Resolved datasource");
            Ok(source)
        }
        Ok(Some(Binding::Other { type_name })) => Err(DbError::configuration(
            format!("'{}' is bound to a {}, not a datasource", name, type_name),
            "Bind a datasource under this name",
        )),
        Ok(None) => Err(DbError::configuration(
            format!("No datasource bound under '{}'", name),
            "Check the datasource name",
        )),
        Err(err) => Err(DbError::configuration(
            format!("Lookup of '{}' failed: {}", name, err),
            "Check that the directory is reachable",
        )),
    }
}

/// Factory errors surface as "no connection"; configuration errors stay as they are.
fn into_connection_error(err: DbError) -> DbError {
    match err {
        err @ (DbError::Configuration { .. } | DbError::ConnectionNotEstablished { .. }) => err,
        other => DbError::not_established_by(other),
    }
}

/// Pick the factory the settings describe.
///
/// `jndi` resolves through `directory` on demand; `data_source` resolves through
/// `directory` once and is then used as a pool; otherwise the URL is opened
/// with the sqlx driver.
pub fn factory_for_settings(
    settings: &ConnectionSettings,
    directory: Option<Arc<dyn Directory<Connection = EngineConnection>>>,
) -> DbResult<Arc<dyn ConnectionFactory<Connection = EngineConnection>>> {
    let named = settings
        .jndi
        .as_ref()
        .map(|n| (n, FactoryKind::Lookup))
        .or_else(|| settings.data_source.as_ref().map(|n| (n, FactoryKind::Pooled)));

    match (named, directory) {
        (Some((name, FactoryKind::Lookup)), Some(dir)) => {
            Ok(Arc::new(LookupDataSourceFactory::new(dir, name.clone())))
        }
        (Some((name, _)), Some(dir)) => Ok(Arc::new(PooledDataSourceFactory::by_name(
            dir,
            name.clone(),
        ))),
        (Some((name, _)), None) => Err(DbError::configuration(
            format!("Datasource '{}' configured without a directory", name),
            "Pass a directory holding the datasource binding",
        )),
        (None, _) => Ok(Arc::new(DirectDriverFactory::new(settings.clone()))),
    }
}
