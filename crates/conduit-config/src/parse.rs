//! Parsing raw key-value configuration into [`DatabaseConfig`].
//!
//! The raw form is the nested map handed over by the host's configuration
//! provider:
//!
//! ```text
//! driver: sqlite | mysql | postgresql | none
//! sqlite_config / mysql_config / postgresql_config:
//!   dsn: string
//!   pool_config:
//!     max_open_conns, max_idle_conns: integer
//!     conn_max_lifetime, conn_max_idle_time, acquire_timeout: duration
//! observability_config:
//!   slow_query_threshold: duration
//!   log_sql: bool
//!   sample_rate: float
//! ```

use crate::duration::{parse_duration, seconds_to_duration};
use crate::error::{ConfigError, ConfigResult};
use crate::types::{DatabaseConfig, DriverConfig, DriverKind, ObservabilityConfig, PoolParameters};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::time::Duration;

type RawMap = Map<String, Value>;

impl DatabaseConfig {
    /// Parse a raw configuration map. Absent sections fall back to defaults;
    /// call [`DatabaseConfig::validate`] on the result before use.
    pub fn parse_from_map(raw: &RawMap) -> ConfigResult<Self> {
        let driver = read_string(raw, "driver", "")?.unwrap_or_default();

        let mut config = Self {
            driver,
            observability_config: match read_section(raw, "observability_config", "")? {
                Some(section) => parse_observability(section)?,
                None => ObservabilityConfig::default(),
            },
            ..Default::default()
        };

        for kind in [DriverKind::Sqlite, DriverKind::Mysql, DriverKind::Postgresql] {
            let Some(key) = kind.config_key() else { continue };
            if let Some(section) = read_section(raw, key, "")? {
                config.set_driver_config(kind, parse_driver_config(section, kind, key)?);
            }
        }

        Ok(config)
    }

    /// Parse from an arbitrary JSON value, which must be an object.
    pub fn from_value(value: &Value) -> ConfigResult<Self> {
        match value {
            Value::Object(map) => Self::parse_from_map(map),
            _ => Err(ConfigError::InvalidType {
                field: "database".to_string(),
                expected: "object",
            }),
        }
    }
}

impl<'de> Deserialize<'de> for DatabaseConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawMap::deserialize(deserializer)?;
        Self::parse_from_map(&raw).map_err(serde::de::Error::custom)
    }
}

fn parse_driver_config(section: &RawMap, kind: DriverKind, path: &str) -> ConfigResult<DriverConfig> {
    let dsn = read_string(section, "dsn", path)?.unwrap_or_default();
    let defaults = kind.default_pool();

    let pool_path = join(path, "pool_config");
    let pool_config = match read_section(section, "pool_config", path)? {
        Some(pool) => parse_pool(pool, defaults, &pool_path)?,
        None => defaults,
    };

    Ok(DriverConfig { dsn, pool_config })
}

fn parse_pool(section: &RawMap, defaults: PoolParameters, path: &str) -> ConfigResult<PoolParameters> {
    Ok(PoolParameters {
        max_open_conns: read_u32(section, "max_open_conns", path)?.unwrap_or(defaults.max_open_conns),
        max_idle_conns: read_u32(section, "max_idle_conns", path)?.unwrap_or(defaults.max_idle_conns),
        conn_max_lifetime: read_duration(section, "conn_max_lifetime", path)?
            .unwrap_or(defaults.conn_max_lifetime),
        conn_max_idle_time: read_duration(section, "conn_max_idle_time", path)?
            .unwrap_or(defaults.conn_max_idle_time),
        acquire_timeout: read_duration(section, "acquire_timeout", path)?
            .unwrap_or(defaults.acquire_timeout),
    })
}

fn parse_observability(section: &RawMap) -> ConfigResult<ObservabilityConfig> {
    let path = "observability_config";
    let defaults = ObservabilityConfig::default();

    Ok(ObservabilityConfig {
        slow_query_threshold: read_duration(section, "slow_query_threshold", path)?
            .unwrap_or(defaults.slow_query_threshold),
        log_sql: read_bool(section, "log_sql", path)?.unwrap_or(defaults.log_sql),
        sample_rate: read_f64(section, "sample_rate", path)?.unwrap_or(defaults.sample_rate),
    })
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn present<'a>(map: &'a RawMap, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

fn read_section<'a>(map: &'a RawMap, key: &str, path: &str) -> ConfigResult<Option<&'a RawMap>> {
    match present(map, key) {
        None => Ok(None),
        Some(Value::Object(section)) => Ok(Some(section)),
        Some(_) => Err(ConfigError::InvalidType {
            field: join(path, key),
            expected: "object",
        }),
    }
}

fn read_string(map: &RawMap, key: &str, path: &str) -> ConfigResult<Option<String>> {
    match present(map, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfigError::InvalidType {
            field: join(path, key),
            expected: "string",
        }),
    }
}

fn read_bool(map: &RawMap, key: &str, path: &str) -> ConfigResult<Option<bool>> {
    match present(map, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ConfigError::InvalidType {
            field: join(path, key),
            expected: "boolean",
        }),
    }
}

fn read_f64(map: &RawMap, key: &str, path: &str) -> ConfigResult<Option<f64>> {
    match present(map, key) {
        None => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| ConfigError::InvalidType {
            field: join(path, key),
            expected: "number",
        }),
        Some(_) => Err(ConfigError::InvalidType {
            field: join(path, key),
            expected: "number",
        }),
    }
}

fn read_u32(map: &RawMap, key: &str, path: &str) -> ConfigResult<Option<u32>> {
    let field = || join(path, key);
    let Some(value) = present(map, key) else {
        return Ok(None);
    };

    let Value::Number(n) = value else {
        return Err(ConfigError::InvalidType {
            field: field(),
            expected: "non-negative integer",
        });
    };

    let as_integer = match (n.as_u64(), n.as_i64(), n.as_f64()) {
        (Some(u), _, _) => Some(u),
        (None, Some(_), _) => None,
        (None, None, Some(f)) if f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
        _ => None,
    };

    match as_integer {
        Some(u) => u32::try_from(u).map(Some).map_err(|_| ConfigError::InvalidValue {
            field: field(),
            message: format!("{} is out of range", u),
        }),
        None => Err(ConfigError::InvalidValue {
            field: field(),
            message: format!("expected a non-negative integer, got {}", n),
        }),
    }
}

fn read_duration(map: &RawMap, key: &str, path: &str) -> ConfigResult<Option<Duration>> {
    let field = || join(path, key);
    let Some(value) = present(map, key) else {
        return Ok(None);
    };

    let parsed = match value {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(secs), _) => Ok(Duration::from_secs(secs)),
            (None, Some(secs)) => seconds_to_duration(secs),
            (None, None) => Err(format!("unsupported number {}", n)),
        },
        Value::String(s) => parse_duration(s),
        _ => {
            return Err(ConfigError::InvalidType {
                field: field(),
                expected: "duration (seconds or string)",
            })
        }
    };

    parsed
        .map(Some)
        .map_err(|message| ConfigError::InvalidDuration { field: field(), message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> RawMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_duration_string_and_seconds_parse_identically() {
        let from_string = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "mysql",
            "mysql_config": {
                "dsn": "root@tcp(localhost:3306)/app",
                "pool_config": { "max_open_conns": 10, "conn_max_lifetime": "1h" }
            }
        })))
        .unwrap();

        let from_seconds = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "mysql",
            "mysql_config": {
                "dsn": "root@tcp(localhost:3306)/app",
                "pool_config": { "max_open_conns": 10, "conn_max_lifetime": 3600 }
            }
        })))
        .unwrap();

        let pool = &from_string.mysql_config.as_ref().unwrap().pool_config;
        assert_eq!(pool.max_open_conns, 10);
        assert_eq!(pool.conn_max_lifetime, Duration::from_secs(3600));
        assert_eq!(from_string, from_seconds);
    }

    #[test]
    fn test_float_seconds_accepted() {
        let config = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "postgresql",
            "postgresql_config": {
                "dsn": "postgres://localhost/app",
                "pool_config": { "conn_max_idle_time": 1.5 }
            }
        })))
        .unwrap();

        let pool = &config.postgresql_config.unwrap().pool_config;
        assert_eq!(pool.conn_max_idle_time, Duration::from_millis(1500));
    }

    #[test]
    fn test_absent_pool_uses_driver_defaults() {
        let config = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "sqlite",
            "sqlite_config": { "dsn": "app.db" },
            "mysql_config": { "dsn": "root@/app" }
        })))
        .unwrap();

        let sqlite = config.sqlite_config.unwrap().pool_config;
        assert_eq!((sqlite.max_open_conns, sqlite.max_idle_conns), (1, 1));

        let mysql = config.mysql_config.unwrap().pool_config;
        assert_eq!((mysql.max_open_conns, mysql.max_idle_conns), (10, 5));
    }

    #[test]
    fn test_partial_pool_merges_with_defaults() {
        let config = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "sqlite",
            "sqlite_config": { "dsn": "app.db", "pool_config": { "max_open_conns": 4 } }
        })))
        .unwrap();

        let pool = config.sqlite_config.unwrap().pool_config;
        assert_eq!(pool.max_open_conns, 4);
        assert_eq!(pool.max_idle_conns, 1);
    }

    #[test]
    fn test_malformed_duration_names_field() {
        let err = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "sqlite",
            "sqlite_config": { "dsn": "app.db", "pool_config": { "conn_max_lifetime": "1 fortnight" } }
        })))
        .unwrap_err();

        assert_eq!(err.field(), Some("sqlite_config.pool_config.conn_max_lifetime"));
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }

    #[test]
    fn test_negative_integer_rejected() {
        let err = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "sqlite",
            "sqlite_config": { "dsn": "app.db", "pool_config": { "max_idle_conns": -1 } }
        })))
        .unwrap_err();

        assert_eq!(err.field(), Some("sqlite_config.pool_config.max_idle_conns"));
    }

    #[test]
    fn test_wrong_section_type_rejected() {
        let err = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "sqlite",
            "sqlite_config": "app.db"
        })))
        .unwrap_err();

        assert_eq!(
            err,
            ConfigError::InvalidType {
                field: "sqlite_config".to_string(),
                expected: "object"
            }
        );
    }

    #[test]
    fn test_observability_section() {
        let config = DatabaseConfig::parse_from_map(&map(json!({
            "driver": "none",
            "observability_config": {
                "slow_query_threshold": "500ms",
                "log_sql": true,
                "sample_rate": 0.25
            }
        })))
        .unwrap();

        let obs = config.observability_config;
        assert_eq!(obs.slow_query_threshold, Duration::from_millis(500));
        assert!(obs.log_sql);
        assert_eq!(obs.sample_rate, 0.25);
    }

    #[test]
    fn test_driver_name_is_kept_verbatim() {
        let config = DatabaseConfig::parse_from_map(&map(json!({ "driver": "SQLite" }))).unwrap();
        assert_eq!(config.driver, "SQLite");
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::UnknownDriver("SQLite".to_string())
        );
    }

    #[test]
    fn test_deserialize_goes_through_map_parser() {
        let config: DatabaseConfig = serde_json::from_value(json!({
            "driver": "sqlite",
            "sqlite_config": { "dsn": ":memory:", "pool_config": { "conn_max_idle_time": "2m" } }
        }))
        .unwrap();

        let pool = config.sqlite_config.unwrap().pool_config;
        assert_eq!(pool.max_open_conns, 1);
        assert_eq!(pool.conn_max_idle_time, Duration::from_secs(120));
    }

    #[test]
    fn test_from_value_requires_object() {
        assert!(DatabaseConfig::from_value(&json!("sqlite")).is_err());
    }
}
