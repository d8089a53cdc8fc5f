//! Driver adapters.
//!
//! Each adapter validates its [`DriverConfig`], turns the driver's DSN
//! syntax into a connection URL, applies the pool parameters, probes
//! connectivity once and hands back a live [`ConnectionManager`].

mod mysql;
mod null;
mod postgres;
mod sqlite;

pub use mysql::new_mysql_manager;
pub use null::new_null_manager;
pub use postgres::new_postgres_manager;
pub use sqlite::new_sqlite_manager;

use crate::error::{DatabaseError, DbResult};
use crate::executor::Db;
use crate::manager::ConnectionManager;
use crate::observability::ObservabilityPlugin;
use conduit_config::{DriverConfig, DriverKind, PoolParameters};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::{AnyPool, ConnectOptions, Connection};
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on the connectivity probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection ceiling used when `max_open_conns` is 0. sqlx sizes its idle
/// queue up front, so "unbounded" needs a finite stand-in.
pub const UNBOUNDED_MAX_CONNECTIONS: u32 = 10_000;

/// Register the sqlx `Any` backends once per process.
pub(crate) fn install_drivers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

/// Reject configs an adapter cannot use before anything is opened.
pub(crate) fn validate(driver: DriverKind, cfg: &DriverConfig) -> DbResult<()> {
    let key = driver.config_key().unwrap_or("driver_config");
    if cfg.dsn.trim().is_empty() {
        return Err(DatabaseError::InvalidConfig(format!("{}.dsn must not be empty", key)));
    }
    cfg.pool_config.validate(&format!("{}.pool_config", key))?;
    Ok(())
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// Effective connection ceiling for `params`.
pub(crate) fn max_connections(params: &PoolParameters) -> u32 {
    if params.is_unbounded() {
        UNBOUNDED_MAX_CONNECTIONS
    } else {
        params.max_open_conns
    }
}

/// Pool options for `params`. sqlx has no idle-count ceiling, so
/// `max_idle_conns` is validated but not applied.
pub(crate) fn pool_options(params: &PoolParameters) -> AnyPoolOptions {
    AnyPoolOptions::new()
        .min_connections(0)
        .max_connections(max_connections(params))
        .acquire_timeout(params.acquire_timeout)
        .idle_timeout(non_zero(params.conn_max_idle_time))
        .max_lifetime(non_zero(params.conn_max_lifetime))
}

async fn probe(pool: &AnyPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

/// Open a lazy pool on `url`, probe it and wrap it in a manager.
///
/// The pool is closed again if the probe fails.
pub(crate) async fn connect(
    name: &str,
    driver: DriverKind,
    url: &str,
    options: AnyPoolOptions,
    max_open: u32,
    plugin: ObservabilityPlugin,
) -> DbResult<ConnectionManager> {
    install_drivers();

    let connect_options = AnyConnectOptions::from_str(url)
        .map_err(|e| DatabaseError::invalid_dsn(driver, e.to_string()))?
        .disable_statement_logging();

    let pool = options.connect_lazy_with(connect_options);

    debug!(driver = %driver, "probing connectivity");
    match tokio::time::timeout(PROBE_TIMEOUT, probe(&pool)).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            pool.close().await;
            return Err(DatabaseError::Connect { driver, source });
        }
        Err(_) => {
            pool.close().await;
            return Err(DatabaseError::ProbeTimeout(PROBE_TIMEOUT));
        }
    }

    info!(name = %name, driver = %driver, max_open, "database connected");
    Ok(ConnectionManager::live(
        name,
        driver,
        Db::new(pool, driver, plugin.clone()),
        max_open,
        plugin,
    ))
}
