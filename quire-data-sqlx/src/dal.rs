use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use quire_data::{DataError, Dialect, Manifest, ModelRegistry, Statement};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Sqlite, SqliteConnection};

use crate::config::DalConfig;
use crate::error::SqlxErrorExt;
use crate::migrate::Migrator;
use crate::model::Model;
use crate::row::bind_statement;
use crate::tx::Tx;

static GENERATION: AtomicU64 = AtomicU64::new(0);

static ACTIVE: RwLock<Option<Dal>> = RwLock::new(None);

/// The data access layer: a bounded connection pool, the model registry
/// and the statement runner every model operation goes through.
///
/// Cloning is cheap; clones share the pool and the registry.
#[derive(Clone)]
pub struct Dal {
    inner: Arc<DalInner>,
}

struct DalInner {
    pool: SqlitePool,
    registry: ModelRegistry,
    config: DalConfig,
    generation: u64,
    statements: AtomicU64,
    closed: AtomicBool,
}

impl Dal {
    /// Open the pool and apply the configured migrations.
    pub async fn connect(config: DalConfig) -> Result<Self, DataError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DataError::Config(format!("invalid database url `{}`: {e}", config.url)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect_with(options)
            .await
            .map_err(SqlxErrorExt::into_data_error)?;

        let dal = Dal {
            inner: Arc::new(DalInner {
                pool,
                registry: ModelRegistry::new(),
                generation: GENERATION.fetch_add(1, Ordering::Relaxed) + 1,
                statements: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                config,
            }),
        };
        tracing::info!(
            generation = dal.generation(),
            max_connections = dal.inner.config.max_connections,
            "data access layer connected"
        );

        if let Some(dir) = dal.inner.config.migrations.clone() {
            Migrator::from_dir(&dir)?.run(&dal).await?;
        }
        Ok(dal)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &DalConfig {
        &self.inner.config
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    /// Process-unique number of this connection; handles cache their model
    /// per generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Number of statements sent to the store so far.
    pub fn statement_count(&self) -> u64 {
        self.inner.statements.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register manifests that may refer to each other, then validate their
    /// relations.
    pub fn register(&self, manifests: &[Arc<Manifest>]) -> Result<(), DataError> {
        for manifest in manifests {
            self.inner.registry.register(manifest.clone())?;
        }
        for manifest in manifests {
            self.inner.registry.validate(manifest)?;
        }
        Ok(())
    }

    /// Register and validate `manifest`, returning its model.
    pub fn model(&self, manifest: Arc<Manifest>) -> Result<Model, DataError> {
        self.register(std::slice::from_ref(&manifest))?;
        Ok(Model::new(self.clone(), manifest))
    }

    /// Model of an already registered table.
    pub fn model_of(&self, table: &str) -> Result<Model, DataError> {
        let manifest = self.inner.registry.get(table).ok_or_else(|| {
            quire_data::ManifestError::invalid(table, "no manifest registered for this table")
        })?;
        Ok(Model::new(self.clone(), manifest))
    }

    pub async fn begin(&self) -> Result<Tx<'static>, DataError> {
        self.ensure_open()?;
        let tx = self.inner.pool.begin().await.map_err(|e| self.map_error(e))?;
        Ok(Tx(tx))
    }

    /// Apply pending migrations, returning the names of those applied.
    pub async fn migrate(&self, migrator: &Migrator) -> Result<Vec<String>, DataError> {
        migrator.run(self).await
    }

    /// Run raw SQL, possibly several statements, outside any model.
    pub async fn execute_raw(&self, sql: &str) -> Result<(), DataError> {
        let mut conn = self.acquire().await?;
        self.execute_raw_on(&mut conn, sql).await
    }

    pub(crate) async fn execute_raw_on(&self, conn: &mut SqliteConnection, sql: &str) -> Result<(), DataError> {
        self.run(sql, 0, sqlx::raw_sql(sql).execute(conn)).await?;
        Ok(())
    }

    /// Make this the process-wide active DAL used by [`ModelHandle`]s.
    ///
    /// [`ModelHandle`]: crate::ModelHandle
    pub fn activate(&self) {
        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        *active = Some(self.clone());
        tracing::debug!(generation = self.generation(), "data access layer activated");
    }

    /// The active DAL, if one is connected.
    pub fn active() -> Result<Dal, DataError> {
        ACTIVE
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|dal| !dal.is_closed())
            .ok_or(DataError::Disconnected)
    }

    /// Close the pool, clear the registry and deactivate this DAL. Further
    /// operations fail with [`DataError::Disconnected`].
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::Release);
        {
            let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().map(Dal::generation) == Some(self.generation()) {
                *active = None;
            }
        }
        self.inner.pool.close().await;
        self.inner.registry.clear();
        tracing::info!(generation = self.generation(), "data access layer disconnected");
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.is_closed() {
            return Err(DataError::Disconnected);
        }
        Ok(())
    }

    fn map_error(&self, err: sqlx::Error) -> DataError {
        match err {
            sqlx::Error::PoolTimedOut => DataError::Timeout(self.inner.config.acquire_timeout()),
            err => err.into_data_error(),
        }
    }

    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, DataError> {
        self.ensure_open()?;
        self.inner.pool.acquire().await.map_err(|e| self.map_error(e))
    }

    /// Run one statement future under the statement timeout.
    async fn run<T>(
        &self,
        sql: &str,
        params: usize,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, DataError> {
        self.ensure_open()?;
        self.inner.statements.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(sql, params, "executing statement");
        let limit: Duration = self.inner.config.statement_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| self.map_error(e)),
            Err(_) => {
                tracing::warn!(sql, timeout_ms = limit.as_millis() as u64, "statement timed out");
                Err(DataError::Timeout(limit))
            }
        }
    }

    pub(crate) async fn fetch_all(
        &self,
        conn: Option<&mut SqliteConnection>,
        statement: &Statement,
    ) -> Result<Vec<SqliteRow>, DataError> {
        let (sql, params) = (&statement.sql, statement.params.len());
        match conn {
            Some(conn) => {
                self.run(sql, params, bind_statement(statement).fetch_all(conn))
                    .await
            }
            None => {
                let mut conn = self.acquire().await?;
                self.run(sql, params, bind_statement(statement).fetch_all(&mut *conn))
                    .await
            }
        }
    }

    /// Execute a statement, returning the number of affected rows.
    pub(crate) async fn execute(
        &self,
        conn: Option<&mut SqliteConnection>,
        statement: &Statement,
    ) -> Result<u64, DataError> {
        let (sql, params) = (&statement.sql, statement.params.len());
        let result = match conn {
            Some(conn) => {
                self.run(sql, params, bind_statement(statement).execute(conn))
                    .await?
            }
            None => {
                let mut conn = self.acquire().await?;
                self.run(sql, params, bind_statement(statement).execute(&mut *conn))
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for Dal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dal")
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .field("registry", &self.inner.registry)
            .finish()
    }
}
