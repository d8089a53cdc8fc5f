//! Multi-driver relational database connection manager.
//!
//! A [`ConnectionManager`] wraps one configured backend (SQLite, MySQL,
//! PostgreSQL or none) behind a uniform async surface: lifecycle, health,
//! transactions, raw SQL, a small query builder and schema migration. Every
//! statement passes through an [`ObservabilityPlugin`] for timing, logging
//! and sampling.
//!
//! Managers come from the driver constructors in [`drivers`] or from a
//! [`ManagerFactory`], which degrades to the Null driver instead of failing.

mod dialect;

pub mod drivers;
pub mod error;
pub mod executor;
pub mod factory;
pub mod manager;
pub mod migrate;
pub mod observability;
pub mod query;
pub mod statement;
pub mod value;

pub use conduit_config;

pub use drivers::{new_mysql_manager, new_null_manager, new_postgres_manager, new_sqlite_manager};
pub use error::{DatabaseError, DbResult, UNAVAILABLE_MESSAGE};
pub use executor::{Db, QueryContext, Session, Tx};
pub use factory::ManagerFactory;
pub use manager::{ConnectionManager, PoolStats};
pub use migrate::{AppliedMigration, ColumnDef, ColumnType, Migration, MigrationResult, Migrator, TableSchema};
pub use observability::{
    Field, ObservabilityPlugin, OperationGuard, QueryLogger, TraceSpan, Tracer, TracingLogger, TracingTracer,
};
pub use query::{Model, TableQuery};
pub use statement::{OperationKind, Statement};
pub use value::{FromValue, Record, Value, ValueTypeError};
