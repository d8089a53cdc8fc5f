use conduit_config::{ConfigError, DriverKind};
use std::time::Duration;
use thiserror::Error;

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Message carried by [`DatabaseError::Unavailable`].
pub const UNAVAILABLE_MESSAGE: &str = "database not available (none driver)";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("invalid database configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid database configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid {driver} dsn: {reason}")]
    InvalidDsn { driver: DriverKind, reason: String },

    #[error("failed to connect to {driver}: {source}")]
    Connect {
        driver: DriverKind,
        #[source]
        source: sqlx::Error,
    },

    #[error("connectivity probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("database start failed: {0}")]
    Start(String),

    #[error("database not available (none driver)")]
    Unavailable,

    #[error("database not initialized")]
    NotInitialized,

    #[error("database operation timed out")]
    Timeout,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("failed to decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },

    #[error("refusing to {operation} without conditions")]
    MissingConditions { operation: &'static str },

    #[error("refusing to {operation} without values")]
    MissingValues { operation: &'static str },

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("migration {version} checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        version: i64,
        expected: String,
        found: String,
    },

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl DatabaseError {
    /// Errors caused by the caller's input rather than the backend.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidConfig(_)
                | Self::InvalidDsn { .. }
                | Self::MissingConditions { .. }
                | Self::MissingValues { .. }
        )
    }

    /// Whether this is the null driver sentinel.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Convenience for transaction closures that want to abort with a message.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into())
    }

    pub(crate) fn invalid_dsn(driver: DriverKind, reason: impl Into<String>) -> Self {
        Self::InvalidDsn {
            driver,
            reason: reason.into(),
        }
    }
}
