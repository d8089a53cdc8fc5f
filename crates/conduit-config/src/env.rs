//! Environment variable handling.

use crate::error::{ConfigError, ConfigResult};
use crate::provider::ConfigProvider;
use serde_json::Value;
use std::env;

/// Environment variable names.
pub mod vars {
    /// Default prefix for [`super::EnvProvider`].
    pub const PREFIX: &str = "CONDUIT";

    /// Overrides the selected driver.
    pub const DATABASE_DRIVER: &str = "CONDUIT_DATABASE_DRIVER";
    /// Overrides the selected driver's DSN.
    pub const DATABASE_DSN: &str = "CONDUIT_DATABASE_DSN";
}

/// Load `.env` then `.env.local` from the working directory.
///
/// Missing files are ignored; variables already set in the process win.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env");
    let _ = dotenvy::from_filename(".env.local");
}

/// Read a variable, treating empty or whitespace-only values as unset.
pub fn var_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Provider resolving keys from `<PREFIX>_<KEY>` environment variables.
///
/// Key dots become underscores and the name is uppercased, so with the
/// default prefix `database.sqlite_config.dsn` reads
/// `CONDUIT_DATABASE_SQLITE_CONFIG_DSN`. Values come back as JSON strings.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    prefix: String,
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(vars::PREFIX)
    }
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load `.env` files, then build a provider with the default prefix.
    pub fn with_dotenv() -> Self {
        load_dotenv();
        Self::default()
    }

    /// Environment variable consulted for `key`.
    pub fn var_name(&self, key: &str) -> String {
        let key = key.replace(['.', '-'], "_").to_uppercase();
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{}", self.prefix.to_uppercase(), key)
        }
    }
}

impl ConfigProvider for EnvProvider {
    fn get(&self, key: &str) -> ConfigResult<Value> {
        env::var(self.var_name(key))
            .map(Value::String)
            .map_err(|_| ConfigError::NotFound { key: key.to_string() })
    }
}
