//! Configuration providers.
//!
//! The host application owns its configuration; this crate only needs a way
//! to look up a key and get back a JSON-like value.

use crate::env::{self, vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::{DatabaseConfig, DriverConfig};
use serde_json::{Map, Value};
use tracing::debug;

/// Source of raw configuration values.
pub trait ConfigProvider: Send + Sync {
    /// Look up `key`. Missing keys yield [`ConfigError::NotFound`].
    fn get(&self, key: &str) -> ConfigResult<Value>;
}

/// In-memory provider backed by a JSON object.
///
/// Dotted keys walk nested objects, so `database.driver` resolves
/// `{"database": {"driver": ...}}`.
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    root: Map<String, Value>,
}

impl MapProvider {
    pub fn new(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// Build from a JSON value. Non-object values yield an empty provider.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => Self::default(),
        }
    }

    /// Set a top-level key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.root.insert(key.into(), value);
    }
}

impl ConfigProvider for MapProvider {
    fn get(&self, key: &str) -> ConfigResult<Value> {
        let not_found = || ConfigError::NotFound { key: key.to_string() };

        let mut parts = key.split('.');
        let first = parts.next().ok_or_else(not_found)?;
        let mut current = self.root.get(first).ok_or_else(not_found)?;

        for part in parts {
            current = current
                .as_object()
                .and_then(|obj| obj.get(part))
                .ok_or_else(not_found)?;
        }

        Ok(current.clone())
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProvider for &P {
    fn get(&self, key: &str) -> ConfigResult<Value> {
        (**self).get(key)
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProvider for std::sync::Arc<P> {
    fn get(&self, key: &str) -> ConfigResult<Value> {
        (**self).get(key)
    }
}

/// Fetch `key` from `provider`, parse it and apply environment overrides.
///
/// `CONDUIT_DATABASE_DRIVER` replaces the driver name. `CONDUIT_DATABASE_DSN`
/// replaces the DSN of the selected driver, creating its sub-config with
/// driver defaults when absent. The result is not validated.
pub fn load_database_config<P>(provider: &P, key: &str) -> ConfigResult<DatabaseConfig>
where
    P: ConfigProvider + ?Sized,
{
    let raw = provider.get(key)?;
    let mut config = DatabaseConfig::from_value(&raw)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply `CONDUIT_DATABASE_*` overrides to `config`.
pub fn apply_env_overrides(config: &mut DatabaseConfig) -> ConfigResult<()> {
    if let Some(driver) = env::var_non_empty(vars::DATABASE_DRIVER) {
        debug!(driver = %driver, "driver overridden from environment");
        config.driver = driver;
    }

    if let Some(dsn) = env::var_non_empty(vars::DATABASE_DSN) {
        let driver = config.selected_driver()?;
        if driver.config_key().is_none() {
            debug!("ignoring DSN override for the none driver");
            return Ok(());
        }

        match config.driver_config_mut(driver) {
            Some(existing) => existing.dsn = dsn,
            None => config.set_driver_config(driver, DriverConfig::new(driver, dsn)),
        }
        debug!(driver = %driver, "dsn overridden from environment");
    }

    Ok(())
}
