use conduit_test_utils::EnvGuard;
use serde_json::json;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

use super::*;

#[test]
fn test_full_config_loading_workflow() {
    let env = EnvGuard::new(&[
        env::vars::DATABASE_DRIVER,
        env::vars::DATABASE_DSN,
        "CONDUIT_APP_NAME",
    ]);

    // Host config delivered as a nested map, partially specified.
    let provider = MapProvider::from_value(json!({
        "app": {
            "database": {
                "driver": "mysql",
                "mysql_config": {
                    "dsn": "app:secret@tcp(db:3306)/orders?charset=utf8mb4",
                    "pool_config": {
                        "max_open_conns": 20,
                        "max_idle_conns": 4,
                        "conn_max_lifetime": "30m"
                    }
                },
                "observability_config": { "slow_query_threshold": 0.5 }
            }
        }
    }));

    let config = load_database_config(&provider, "app.database")
        .unwrap()
        .validated()
        .unwrap();

    assert_eq!(config.selected_driver().unwrap(), DriverKind::Mysql);
    let mysql = config.driver_config(DriverKind::Mysql).unwrap();
    assert_eq!(mysql.pool_config.max_open_conns, 20);
    assert_eq!(mysql.pool_config.conn_max_lifetime, Duration::from_secs(1800));
    // Unspecified pool fields keep the driver defaults.
    assert_eq!(mysql.pool_config.conn_max_idle_time, Duration::from_secs(600));
    assert_eq!(
        config.observability_config.slow_query_threshold,
        Duration::from_millis(500)
    );

    // Environment switches the deployment to SQLite without touching the map.
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("orders.db");
    fs::write(dir.path().join(".env"), "CONDUIT_APP_NAME=orders\n").unwrap();

    env.set(env::vars::DATABASE_DRIVER, "sqlite");
    env.set(env::vars::DATABASE_DSN, db_path.to_string_lossy().as_ref());

    let overridden = load_database_config(&provider, "app.database")
        .unwrap()
        .validated()
        .unwrap();
    let sqlite = overridden.driver_config(DriverKind::Sqlite).unwrap();
    assert_eq!(sqlite.dsn, db_path.to_string_lossy());
    assert_eq!(sqlite.pool_config.max_open_conns, 1);

    // `.env` files feed the env provider.
    env.with_current_dir(dir.path(), || {
        let provider = EnvProvider::with_dotenv();
        assert_eq!(provider.get("app.name").unwrap(), json!("orders"));
    });
}

#[test]
fn test_invalid_config_reports_field_path() {
    let provider = MapProvider::from_value(json!({
        "database": {
            "driver": "postgresql",
            "postgresql_config": {
                "dsn": "host=localhost dbname=app",
                "pool_config": { "max_open_conns": 2, "max_idle_conns": 8 }
            }
        }
    }));

    let _env = EnvGuard::new(&[env::vars::DATABASE_DRIVER, env::vars::DATABASE_DSN]);
    let err = load_database_config(&provider, "database")
        .unwrap()
        .validate()
        .unwrap_err();

    assert_eq!(
        err,
        ConfigError::PoolBounds {
            field: "postgresql_config.pool_config".to_string(),
            max_idle: 8,
            max_open: 2,
        }
    );
    assert!(err.to_string().contains("max_idle_conns (8)"));
}
