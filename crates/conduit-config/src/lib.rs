//! Database configuration for Conduit.
//!
//! This crate provides the configuration model consumed by
//! `conduit-database`: driver selection, per-driver DSN and pool
//! parameters, and observability settings, together with the parsing,
//! validation and provider plumbing around them.

pub mod duration;
pub mod env;
pub mod error;
pub mod parse;
pub mod provider;
pub mod types;

#[cfg(test)]
mod integration_test;

pub use env::EnvProvider;
pub use error::{ConfigError, ConfigResult};
pub use provider::{apply_env_overrides, load_database_config, ConfigProvider, MapProvider};
pub use types::*;
