//! Connection manager façade.

use crate::error::{DatabaseError, DbResult};
use crate::executor::{Db, QueryContext, Session, Tx};
use crate::migrate::{Migrator, TableSchema};
use crate::observability::ObservabilityPlugin;
use crate::query::{Model, TableQuery};
use crate::value::{Record, Value};
use conduit_config::{DriverKind, ObservabilityConfig};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Bound on [`ConnectionManager::health`].
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
    pub max_open: u32,
}

/// Uniform handle over one configured backend.
///
/// A manager is either live or closed. A Null-driver manager never opens a
/// backend: metadata calls succeed, I/O calls fail with
/// [`DatabaseError::Unavailable`] and builder entry points return `None`.
pub struct ConnectionManager {
    name: String,
    driver: DriverKind,
    db: RwLock<Option<Db>>,
    max_open: u32,
    plugin: ObservabilityPlugin,
    started: OnceCell<Result<(), String>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("live", &self.is_live())
            .finish()
    }
}

impl ConnectionManager {
    pub(crate) fn live(
        name: &str,
        driver: DriverKind,
        db: Db,
        max_open: u32,
        plugin: ObservabilityPlugin,
    ) -> Self {
        Self {
            name: name.to_string(),
            driver,
            db: RwLock::new(Some(db)),
            max_open,
            plugin,
            started: OnceCell::new(),
        }
    }

    pub(crate) fn null(name: &str, plugin: ObservabilityPlugin) -> Self {
        Self {
            name: name.to_string(),
            driver: DriverKind::None,
            db: RwLock::new(None),
            max_open: 0,
            plugin,
            started: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Whether the manager still holds an open pool.
    pub fn is_live(&self) -> bool {
        self.db.read().is_some()
    }

    pub fn plugin(&self) -> &ObservabilityPlugin {
        &self.plugin
    }

    /// Clone the executor out of the lock so no guard is held across an
    /// await.
    fn live_db(&self) -> DbResult<Db> {
        if self.driver == DriverKind::None {
            return Err(DatabaseError::Unavailable);
        }
        self.db.read().clone().ok_or(DatabaseError::NotInitialized)
    }

    /// Run the startup health probe once. Later and concurrent callers see
    /// the first outcome; a failed start is not retried.
    pub async fn on_start(&self) -> DbResult<()> {
        if self.driver == DriverKind::None {
            return Err(DatabaseError::Unavailable);
        }
        let outcome = self
            .started
            .get_or_init(|| async {
                match self.health().await {
                    Ok(()) => {
                        info!(name = %self.name, driver = %self.driver, "database started");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(name = %self.name, error = %e, "database start failed");
                        Err(e.to_string())
                    }
                }
            })
            .await;
        outcome.clone().map_err(DatabaseError::Start)
    }

    /// Ping bounded by [`HEALTH_TIMEOUT`].
    pub async fn health(&self) -> DbResult<()> {
        let db = self.live_db()?;
        tokio::time::timeout(HEALTH_TIMEOUT, db.ping())
            .await
            .map_err(|_| DatabaseError::Timeout)?
    }

    /// Unbounded ping. Bound it with [`ConnectionManager::with_context`].
    pub async fn ping(&self) -> DbResult<()> {
        self.live_db()?.ping().await
    }

    /// Close the pool. Idempotent; closing a Null-driver manager is a no-op.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn close(&self) -> DbResult<()> {
        let db = self.db.write().take();
        if let Some(db) = db {
            db.close().await;
            info!(driver = %self.driver, "database closed");
        } else {
            debug!("close on a manager without an open pool");
        }
        Ok(())
    }

    pub async fn on_stop(&self) -> DbResult<()> {
        self.close().await
    }

    pub async fn begin(&self) -> DbResult<Tx> {
        self.live_db()?.begin().await
    }

    /// See [`Db::transaction`].
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<DatabaseError> + Send,
    {
        self.live_db()?.transaction(f).await
    }

    /// See [`Db::nested_transaction`].
    pub async fn nested_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<DatabaseError> + Send,
    {
        self.live_db()?.nested_transaction(f).await
    }

    pub async fn exec(&self, sql: &str, args: Vec<Value>) -> DbResult<u64> {
        self.live_db()?.exec(sql, args).await
    }

    pub async fn raw(&self, sql: &str, args: Vec<Value>) -> DbResult<Vec<Record>> {
        self.live_db()?.raw(sql, args).await
    }

    /// Query builder over `name`, or `None` without a live backend.
    pub fn table(&self, name: &str) -> Option<TableQuery<Db>> {
        self.db.read().clone().map(|db| TableQuery::new(db, name))
    }

    /// Query builder over the table backing `M`.
    pub fn model<M: Model>(&self) -> Option<TableQuery<Db>> {
        self.table(&M::schema().name)
    }

    /// Executor bound to `ctx`.
    pub fn with_context(&self, ctx: QueryContext) -> Option<Db> {
        self.db.read().as_ref().map(|db| db.with_context(ctx))
    }

    pub fn db(&self) -> Option<Db> {
        self.db.read().clone()
    }

    pub fn migrator(&self) -> DbResult<Migrator> {
        Ok(Migrator::new(self.live_db()?))
    }

    pub async fn auto_migrate(&self, schemas: &[TableSchema]) -> DbResult<()> {
        self.migrator()?.auto_migrate(schemas).await
    }

    /// Pool occupancy; zero for Null-driver or closed managers.
    pub fn stats(&self) -> PoolStats {
        let guard = self.db.read();
        let Some(db) = guard.as_ref() else {
            return PoolStats::default();
        };
        let pool = db.pool();
        let open_connections = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
        PoolStats {
            open_connections,
            in_use: open_connections.saturating_sub(idle),
            idle,
            max_open: self.max_open,
        }
    }

    /// Replace the observability settings shared by this manager's
    /// executors.
    pub fn set_observability(&self, config: ObservabilityConfig) -> DbResult<()> {
        self.plugin.apply(config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_null_manager_metadata() {
        let manager = ConnectionManager::null("svc", ObservabilityPlugin::default());
        assert_eq!(manager.name(), "svc");
        assert_eq!(manager.driver(), DriverKind::None);
        assert!(!manager.is_live());
        assert_eq!(manager.stats(), PoolStats::default());
        assert!(manager.table("users").is_none());
        assert!(manager.db().is_none());
    }

    #[test]
    fn test_close_is_idempotent_without_a_pool() {
        let manager = ConnectionManager::null("svc", ObservabilityPlugin::default());
        tokio_test::block_on(async {
            manager.close().await.unwrap();
            manager.on_stop().await.unwrap();
        });
        assert_eq!(manager.driver(), DriverKind::None);
        assert_eq!(manager.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_null_manager_start_is_not_cached() {
        let manager = ConnectionManager::null("svc", ObservabilityPlugin::default());
        assert_matches!(manager.on_start().await, Err(DatabaseError::Unavailable));
        assert_matches!(manager.on_start().await, Err(DatabaseError::Unavailable));
        assert!(manager.started.get().is_none());
    }

    #[tokio::test]
    async fn test_set_observability_rejects_bad_rate() {
        let manager = ConnectionManager::null("svc", ObservabilityPlugin::default());
        let err = manager
            .set_observability(ObservabilityConfig {
                sample_rate: 2.0,
                ..Default::default()
            })
            .unwrap_err();
        assert_matches!(err, DatabaseError::Config(_));
        assert_eq!(manager.plugin().config().sample_rate, 1.0);
    }
}
