use super::{connect, max_connections, pool_options, validate};
use crate::error::{DatabaseError, DbResult};
use crate::manager::ConnectionManager;
use crate::observability::ObservabilityPlugin;
use conduit_config::{DriverConfig, DriverKind};
use tracing::{debug, instrument, warn};

/// Query parameters the sqlx SQLite driver understands.
const KNOWN_PARAMS: [&str; 4] = ["mode", "cache", "immutable", "vfs"];

/// A SQLite DSN resolved to a sqlx URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SqliteTarget {
    pub url: String,
    pub in_memory: bool,
}

/// Resolve a SQLite DSN.
///
/// Accepts `sqlite:` URLs unchanged, `:memory:` and `file::memory:` as a
/// private in-memory database, and plain or `file:` paths with optional
/// query parameters. File databases are created when missing unless the
/// DSN names a `mode`.
pub(crate) fn sqlite_url(dsn: &str) -> DbResult<SqliteTarget> {
    let dsn = dsn.trim();

    if dsn.starts_with("sqlite:") {
        return Ok(SqliteTarget {
            url: dsn.to_string(),
            in_memory: dsn.contains(":memory:") || dsn.contains("mode=memory"),
        });
    }

    if dsn == ":memory:" || dsn.starts_with("file::memory:") {
        return Ok(SqliteTarget {
            url: "sqlite::memory:".to_string(),
            in_memory: true,
        });
    }

    let rest = dsn.strip_prefix("file:").unwrap_or(dsn);
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    if path.is_empty() {
        return Err(DatabaseError::invalid_dsn(DriverKind::Sqlite, "missing database path"));
    }

    let mut params = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        if KNOWN_PARAMS.contains(&key) {
            params.push(pair.to_string());
        } else {
            debug!(param = %key, "dropping unsupported sqlite dsn parameter");
        }
    }

    let in_memory = params.iter().any(|p| p == "mode=memory");
    if !params.iter().any(|p| p.starts_with("mode=")) {
        params.push("mode=rwc".to_string());
    }

    Ok(SqliteTarget {
        url: format!("sqlite://{}?{}", path, params.join("&")),
        in_memory,
    })
}

/// Open a SQLite-backed manager.
///
/// Every pooled connection enables foreign keys and a 5s busy timeout;
/// file databases also switch to WAL. An in-memory database exists once
/// per connection, so its pool is pinned to one connection that never
/// expires.
#[instrument(skip(cfg, plugin), fields(driver = "sqlite"))]
pub async fn new_sqlite_manager(
    name: &str,
    cfg: &DriverConfig,
    plugin: ObservabilityPlugin,
) -> DbResult<ConnectionManager> {
    validate(DriverKind::Sqlite, cfg)?;
    let target = sqlite_url(&cfg.dsn)?;

    let mut params = cfg.pool_config.clone();
    if target.in_memory {
        if params.max_open_conns != 1 {
            warn!(
                requested = params.max_open_conns,
                "in-memory sqlite is limited to a single connection"
            );
        }
        params.max_open_conns = 1;
        params.max_idle_conns = 1;
        params.conn_max_lifetime = std::time::Duration::ZERO;
        params.conn_max_idle_time = std::time::Duration::ZERO;
    }

    let wal = !target.in_memory;
    let options = pool_options(&params).after_connect(move |conn, _meta| {
        Box::pin(async move {
            sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
            sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
            if wal {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
            }
            Ok(())
        })
    });

    connect(
        name,
        DriverKind::Sqlite,
        &target.url,
        options,
        max_connections(&params),
        plugin,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(":memory:", "sqlite::memory:", true ; "bare memory")]
    #[test_case("file::memory:?cache=shared", "sqlite::memory:", true ; "file memory")]
    #[test_case("sqlite://app.db", "sqlite://app.db", false ; "url passthrough")]
    #[test_case("sqlite::memory:", "sqlite::memory:", true ; "memory url passthrough")]
    #[test_case("app.db", "sqlite://app.db?mode=rwc", false ; "relative path")]
    #[test_case("/var/lib/app.db", "sqlite:///var/lib/app.db?mode=rwc", false ; "absolute path")]
    #[test_case("file:app.db?mode=ro", "sqlite://app.db?mode=ro", false ; "explicit mode kept")]
    #[test_case("file:app.db?cache=shared&_fk=1", "sqlite://app.db?cache=shared&mode=rwc", false ; "unknown params dropped")]
    #[test_case("file:shared?mode=memory", "sqlite://shared?mode=memory", true ; "memory mode")]
    fn test_sqlite_url(dsn: &str, url: &str, in_memory: bool) {
        let target = sqlite_url(dsn).unwrap();
        assert_eq!(target.url, url);
        assert_eq!(target.in_memory, in_memory);
    }

    proptest! {
        #[test]
        fn prop_plain_paths_get_create_mode(path in "[a-zA-Z0-9_/.-]{1,40}") {
            let target = sqlite_url(&path).unwrap();
            prop_assert_eq!(target.url, format!("sqlite://{}?mode=rwc", path));
            prop_assert!(!target.in_memory);
        }
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let err = sqlite_url("file:?mode=rwc").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidDsn { driver: DriverKind::Sqlite, .. }));
    }

    #[tokio::test]
    async fn test_memory_database_connects() {
        let cfg = DriverConfig::new(DriverKind::Sqlite, ":memory:");
        let manager = new_sqlite_manager("mem", &cfg, ObservabilityPlugin::default())
            .await
            .unwrap();
        assert!(manager.is_live());
        assert_eq!(manager.stats().max_open, 1);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unopenable_file_fails_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("nested").join("db.sqlite");
        let cfg = DriverConfig::new(DriverKind::Sqlite, path.to_string_lossy().to_string());
        let err = new_sqlite_manager("bad", &cfg, ObservabilityPlugin::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Connect { driver: DriverKind::Sqlite, .. }));
    }
}
