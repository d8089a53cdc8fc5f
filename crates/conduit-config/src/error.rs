//! Configuration errors.

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while parsing or validating database configuration.
///
/// Every variant names the offending field so misconfigurations can be
/// traced back to the exact key in the raw configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid type for {field}: expected {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },

    #[error("invalid duration for {field}: {message}")]
    InvalidDuration { field: String, message: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown driver `{0}`: expected one of sqlite, mysql, postgresql, none")]
    UnknownDriver(String),

    #[error("{field} is required when driver is {driver}")]
    MissingDriverConfig {
        driver: String,
        field: &'static str,
    },

    #[error("{field} must not be empty")]
    EmptyDsn { field: String },

    #[error("{field}: max_idle_conns ({max_idle}) must not exceed max_open_conns ({max_open})")]
    PoolBounds {
        field: String,
        max_idle: u32,
        max_open: u32,
    },

    #[error("{field} must be within [0, 1], got {value}")]
    InvalidSampleRate { field: String, value: f64 },

    #[error("config key not found: {key}")]
    NotFound { key: String },
}

impl ConfigError {
    /// Name of the field the error refers to, when there is one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field }
            | Self::InvalidType { field, .. }
            | Self::InvalidDuration { field, .. }
            | Self::InvalidValue { field, .. }
            | Self::EmptyDsn { field }
            | Self::PoolBounds { field, .. }
            | Self::InvalidSampleRate { field, .. } => Some(field),
            Self::MissingDriverConfig { field, .. } => Some(field),
            Self::UnknownDriver(_) => Some("driver"),
            Self::NotFound { key } => Some(key),
        }
    }
}
