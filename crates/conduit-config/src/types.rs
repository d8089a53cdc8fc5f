//! Configuration types.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// SQLite (file or in-memory).
    Sqlite,
    /// MySQL / MariaDB.
    Mysql,
    /// PostgreSQL.
    Postgresql,
    /// No database configured.
    None,
}

impl DriverKind {
    /// All drivers, in declaration order.
    pub const ALL: [DriverKind; 4] = [Self::Sqlite, Self::Mysql, Self::Postgresql, Self::None];

    /// Canonical driver name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::None => "none",
        }
    }

    /// Key of this driver's sub-configuration in the raw config map.
    pub fn config_key(&self) -> Option<&'static str> {
        match self {
            Self::Sqlite => Some("sqlite_config"),
            Self::Mysql => Some("mysql_config"),
            Self::Postgresql => Some("postgresql_config"),
            Self::None => None,
        }
    }

    /// Pool defaults for this driver.
    pub fn default_pool(&self) -> PoolParameters {
        match self {
            // File-based engines serialize writers; one connection avoids lock churn.
            Self::Sqlite => PoolParameters {
                max_open_conns: 1,
                max_idle_conns: 1,
                conn_max_lifetime: Duration::ZERO,
                conn_max_idle_time: Duration::ZERO,
                acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            },
            Self::Mysql | Self::Postgresql | Self::None => PoolParameters::default(),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    /// Only the canonical, lowercase names are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownDriver(s.to_string()))
    }
}

/// Default time to wait for a pooled connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection pool parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolParameters {
    /// Maximum open connections (0 = unbounded).
    pub max_open_conns: u32,
    /// Maximum idle connections.
    pub max_idle_conns: u32,
    /// Maximum lifetime of a connection (0 = unlimited).
    #[serde(with = "crate::duration")]
    pub conn_max_lifetime: Duration,
    /// Maximum idle time of a connection (0 = unlimited).
    #[serde(with = "crate::duration")]
    pub conn_max_idle_time: Duration,
    /// How long to wait for a connection from the pool.
    #[serde(with = "crate::duration")]
    pub acquire_timeout: Duration,
}

impl Default for PoolParameters {
    fn default() -> Self {
        Self {
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime: Duration::from_secs(3600),
            conn_max_idle_time: Duration::from_secs(600),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolParameters {
    /// Check the bounds invariant. `field` prefixes error messages.
    pub fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.max_open_conns > 0 && self.max_idle_conns > self.max_open_conns {
            return Err(ConfigError::PoolBounds {
                field: field.to_string(),
                max_idle: self.max_idle_conns,
                max_open: self.max_open_conns,
            });
        }

        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.acquire_timeout", field),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Whether the pool has no connection ceiling.
    pub fn is_unbounded(&self) -> bool {
        self.max_open_conns == 0
    }
}

/// Per-driver connection settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverConfig {
    /// Driver-specific data source name.
    pub dsn: String,
    /// Pool parameters.
    pub pool_config: PoolParameters,
}

impl DriverConfig {
    /// Create a config for `driver` with that driver's pool defaults.
    pub fn new(driver: DriverKind, dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            pool_config: driver.default_pool(),
        }
    }

    /// Replace the pool parameters.
    pub fn with_pool(mut self, pool: PoolParameters) -> Self {
        self.pool_config = pool;
        self
    }

    /// Validate DSN and pool parameters. `field` is the sub-config key.
    pub fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.dsn.trim().is_empty() {
            return Err(ConfigError::EmptyDsn {
                field: format!("{}.dsn", field),
            });
        }
        self.pool_config.validate(&format!("{}.pool_config", field))
    }
}

/// Default slow-query threshold.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(200);

/// Instrumentation settings for the observability plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Operations at or above this duration are logged as slow (0 disables).
    #[serde(with = "crate::duration")]
    pub slow_query_threshold: Duration,
    /// Log statement text. Off by default since statements may carry sensitive data.
    pub log_sql: bool,
    /// Fraction of operations that are timed and traced, in `[0, 1]`.
    pub sample_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            log_sql: false,
            sample_rate: 1.0,
        }
    }
}

impl ObservabilityConfig {
    /// Validate the sample rate.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate {
                field: "observability_config.sample_rate".to_string(),
                value: self.sample_rate,
            });
        }
        Ok(())
    }
}

/// Root database configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DatabaseConfig {
    /// Selected driver name.
    pub driver: String,
    /// SQLite settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_config: Option<DriverConfig>,
    /// MySQL settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_config: Option<DriverConfig>,
    /// PostgreSQL settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgresql_config: Option<DriverConfig>,
    /// Instrumentation settings.
    pub observability_config: ObservabilityConfig,
}

impl DatabaseConfig {
    /// Config selecting `driver` with the given DSN and driver defaults.
    pub fn new(driver: DriverKind, dsn: impl Into<String>) -> Self {
        let mut config = Self {
            driver: driver.as_str().to_string(),
            ..Default::default()
        };
        if driver != DriverKind::None {
            config.set_driver_config(driver, DriverConfig::new(driver, dsn));
        }
        config
    }

    /// In-memory SQLite configuration.
    pub fn sqlite_memory() -> Self {
        Self::new(DriverKind::Sqlite, ":memory:")
    }

    /// Config selecting the null driver.
    pub fn none() -> Self {
        Self::new(DriverKind::None, "")
    }

    /// Resolve the selected driver.
    pub fn selected_driver(&self) -> ConfigResult<DriverKind> {
        if self.driver.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "driver".to_string(),
            });
        }
        self.driver.parse()
    }

    /// Sub-config for `driver`, if present.
    pub fn driver_config(&self, driver: DriverKind) -> Option<&DriverConfig> {
        match driver {
            DriverKind::Sqlite => self.sqlite_config.as_ref(),
            DriverKind::Mysql => self.mysql_config.as_ref(),
            DriverKind::Postgresql => self.postgresql_config.as_ref(),
            DriverKind::None => None,
        }
    }

    /// Mutable sub-config for `driver`, if present.
    pub fn driver_config_mut(&mut self, driver: DriverKind) -> Option<&mut DriverConfig> {
        match driver {
            DriverKind::Sqlite => self.sqlite_config.as_mut(),
            DriverKind::Mysql => self.mysql_config.as_mut(),
            DriverKind::Postgresql => self.postgresql_config.as_mut(),
            DriverKind::None => None,
        }
    }

    /// Install a sub-config for `driver`. No-op for the null driver.
    pub fn set_driver_config(&mut self, driver: DriverKind, config: DriverConfig) {
        match driver {
            DriverKind::Sqlite => self.sqlite_config = Some(config),
            DriverKind::Mysql => self.mysql_config = Some(config),
            DriverKind::Postgresql => self.postgresql_config = Some(config),
            DriverKind::None => {}
        }
    }

    /// Validate the configuration without modifying it.
    pub fn validate(&self) -> ConfigResult<()> {
        let driver = self.selected_driver()?;

        if let Some(key) = driver.config_key() {
            let driver_config = self
                .driver_config(driver)
                .ok_or(ConfigError::MissingDriverConfig {
                    driver: driver.to_string(),
                    field: key,
                })?;
            driver_config.validate(key)?;
        }

        self.observability_config.validate()
    }

    /// Validate and return the configuration.
    pub fn validated(self) -> ConfigResult<Self> {
        self.validate()?;
        Ok(self)
    }
}
