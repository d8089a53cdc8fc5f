//! Schema definitions and migrations.

use crate::dialect;
use crate::error::{DatabaseError, DbResult};
use crate::executor::{Db, Session};
use crate::value::Value;
use chrono::{DateTime, Utc};
use conduit_config::DriverKind;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Portable column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
}

/// One column of a [`TableSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    /// Default expression, inserted verbatim.
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
        }
    }

    /// Integer primary key assigned by the backend.
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer).primary_key().auto_increment()
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    fn type_sql(&self, driver: DriverKind) -> &'static str {
        // MySQL cannot index unbounded TEXT.
        let keyed = self.primary_key || self.unique;
        match (driver, self.ty) {
            (DriverKind::Mysql, ColumnType::Integer) => "BIGINT",
            (DriverKind::Mysql, ColumnType::Real) => "DOUBLE",
            (DriverKind::Mysql, ColumnType::Text) if keyed => "VARCHAR(255)",
            (DriverKind::Mysql, ColumnType::Blob) => "LONGBLOB",
            (DriverKind::Postgresql, ColumnType::Integer) => "BIGINT",
            (DriverKind::Postgresql, ColumnType::Real) => "DOUBLE PRECISION",
            (DriverKind::Postgresql, ColumnType::Blob) => "BYTEA",
            (_, ColumnType::Integer) => "INTEGER",
            (_, ColumnType::Real) => "REAL",
            (_, ColumnType::Text) => "TEXT",
            (_, ColumnType::Boolean) => "BOOLEAN",
            (_, ColumnType::Blob) => "BLOB",
        }
    }

    /// Column definition as it appears in `CREATE TABLE`. `inline_pk` is
    /// false when the table declares a composite key instead.
    pub(crate) fn to_sql(&self, driver: DriverKind, inline_pk: bool) -> String {
        let name = dialect::quote(driver, &self.name);
        let serial = inline_pk && self.primary_key && self.auto_increment && self.ty == ColumnType::Integer;

        if serial {
            return match driver {
                DriverKind::Mysql => format!("{} BIGINT AUTO_INCREMENT PRIMARY KEY", name),
                DriverKind::Postgresql => format!("{} BIGSERIAL PRIMARY KEY", name),
                _ => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
            };
        }

        let mut sql = format!("{} {}", name, self.type_sql(driver));
        if inline_pk && self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.primary_key && c.name == column)
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for `driver`.
    pub fn create_sql(&self, driver: DriverKind) -> String {
        let keys: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.primary_key).collect();
        let composite = keys.len() > 1;

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.to_sql(driver, !composite))
            .collect();

        if composite {
            let names: Vec<String> = keys.iter().map(|c| dialect::quote(driver, &c.name)).collect();
            parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            dialect::quote(driver, &self.name),
            parts.join(", ")
        )
    }
}

const MIGRATIONS_TABLE: &str = "_conduit_migrations";

/// A versioned SQL migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    /// SHA-256 of `up_sql`, hex encoded.
    pub checksum: String,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        let up = up_sql.into();
        let checksum = Self::compute_checksum(&up);
        Self {
            version,
            name: name.into(),
            up_sql: up,
            down_sql: None,
            checksum,
        }
    }

    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        self.down_sql = Some(down_sql.into());
        self
    }

    pub fn compute_checksum(sql: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.up_sql) == self.checksum
    }
}

/// A row of the migrations table.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    pub version: i64,
    pub name: String,
    pub execution_time_ms: i64,
}

/// Schema inspection and migration over a live executor.
#[derive(Debug, Clone)]
pub struct Migrator {
    db: Db,
}

impl Migrator {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn driver(&self) -> DriverKind {
        self.db.driver()
    }

    fn ph(&self, index: usize) -> String {
        dialect::placeholder(self.driver(), index)
    }

    async fn scalar_count(&self, sql: String, args: Vec<Value>) -> DbResult<i64> {
        let rows = self.db.clone().raw(&sql, args).await?;
        match rows.first() {
            Some(row) => row.get::<i64>("n"),
            None => Ok(0),
        }
    }

    pub async fn has_table(&self, table: &str) -> DbResult<bool> {
        let sql = match self.driver() {
            DriverKind::Mysql => format!(
                "SELECT COUNT(*) AS n FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = {}",
                self.ph(1)
            ),
            DriverKind::Postgresql => format!(
                "SELECT COUNT(*) AS n FROM information_schema.tables WHERE table_schema = CURRENT_SCHEMA() AND table_name = {}",
                self.ph(1)
            ),
            _ => "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?".to_string(),
        };
        Ok(self.scalar_count(sql, vec![table.into()]).await? > 0)
    }

    pub async fn has_column(&self, table: &str, column: &str) -> DbResult<bool> {
        let sql = match self.driver() {
            DriverKind::Mysql => format!(
                "SELECT COUNT(*) AS n FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = {} AND column_name = {}",
                self.ph(1),
                self.ph(2)
            ),
            DriverKind::Postgresql => format!(
                "SELECT COUNT(*) AS n FROM information_schema.columns WHERE table_schema = CURRENT_SCHEMA() AND table_name = {} AND column_name = {}",
                self.ph(1),
                self.ph(2)
            ),
            _ => "SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE name = ?".to_string(),
        };
        Ok(self.scalar_count(sql, vec![table.into(), column.into()]).await? > 0)
    }

    pub async fn create_table(&self, schema: &TableSchema) -> DbResult<()> {
        let sql = schema.create_sql(self.driver());
        self.db.clone().exec(&sql, vec![]).await?;
        info!(table = %schema.name, "table created");
        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> DbResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", dialect::quote(self.driver(), table));
        self.db.clone().exec(&sql, vec![]).await?;
        info!(table = %table, "table dropped");
        Ok(())
    }

    pub async fn add_column(&self, table: &str, column: &ColumnDef) -> DbResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            dialect::quote(self.driver(), table),
            column.to_sql(self.driver(), false)
        );
        self.db.clone().exec(&sql, vec![]).await?;
        info!(table = %table, column = %column.name, "column added");
        Ok(())
    }

    /// Create missing tables and add missing columns. Never drops or alters
    /// existing columns.
    pub async fn auto_migrate(&self, schemas: &[TableSchema]) -> DbResult<()> {
        for schema in schemas {
            if !self.has_table(&schema.name).await? {
                self.create_table(schema).await?;
                continue;
            }

            for column in &schema.columns {
                if column.primary_key {
                    continue;
                }
                if !self.has_column(&schema.name, &column.name).await? {
                    self.add_column(&schema.name, column).await?;
                }
            }
            debug!(table = %schema.name, "table up to date");
        }
        Ok(())
    }

    /// Create the migrations table if missing.
    pub async fn init(&self) -> DbResult<()> {
        let schema = TableSchema::new(MIGRATIONS_TABLE)
            .column(ColumnDef::new("version", ColumnType::Integer).primary_key())
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("checksum", ColumnType::Text).not_null())
            .column(ColumnDef::new("applied_at", ColumnType::Text).not_null())
            .column(ColumnDef::new("execution_time_ms", ColumnType::Integer).not_null());
        self.db.clone().exec(&schema.create_sql(self.driver()), vec![]).await?;
        Ok(())
    }

    /// Highest applied version.
    pub async fn current_version(&self) -> DbResult<Option<i64>> {
        self.init().await?;
        let sql = format!(
            "SELECT MAX(version) AS version FROM {}",
            dialect::quote(self.driver(), MIGRATIONS_TABLE)
        );
        let rows = self.db.clone().raw(&sql, vec![]).await?;
        match rows.first() {
            Some(row) => row.get::<Option<i64>>("version"),
            None => Ok(None),
        }
    }

    /// Applied migrations in version order.
    pub async fn applied(&self) -> DbResult<Vec<AppliedMigration>> {
        self.init().await?;
        let sql = format!(
            "SELECT version, name, checksum, applied_at, execution_time_ms FROM {} ORDER BY version",
            dialect::quote(self.driver(), MIGRATIONS_TABLE)
        );

        let rows = self.db.clone().raw(&sql, vec![]).await?;
        rows.iter()
            .map(|row| -> DbResult<AppliedMigration> {
                let applied_at: String = row.get("applied_at")?;
                let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                    .map_err(|e| DatabaseError::Decode {
                        column: "applied_at".to_string(),
                        reason: e.to_string(),
                    })?
                    .with_timezone(&Utc);

                Ok(AppliedMigration {
                    version: row.get("version")?,
                    name: row.get("name")?,
                    checksum: row.get("checksum")?,
                    applied_at,
                    execution_time_ms: row.get("execution_time_ms")?,
                })
            })
            .collect()
    }

    /// Check applied migrations against `migrations`.
    ///
    /// A changed checksum is an error. Applied versions missing from
    /// `migrations` are only logged.
    pub async fn verify(&self, migrations: &[Migration]) -> DbResult<()> {
        let known: HashMap<i64, &Migration> = migrations.iter().map(|m| (m.version, m)).collect();

        for applied in self.applied().await? {
            match known.get(&applied.version) {
                Some(migration) if migration.checksum != applied.checksum => {
                    return Err(DatabaseError::ChecksumMismatch {
                        version: applied.version,
                        expected: migration.checksum.clone(),
                        found: applied.checksum,
                    });
                }
                Some(_) => {}
                None => warn!(version = applied.version, "applied migration is no longer defined"),
            }
        }
        Ok(())
    }

    /// Migrations newer than the current version, in version order.
    pub async fn pending(&self, migrations: &[Migration]) -> DbResult<Vec<Migration>> {
        let current = self.current_version().await?.unwrap_or(0);
        let mut pending: Vec<Migration> = migrations
            .iter()
            .filter(|m| m.version > current)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.version);
        Ok(pending)
    }

    /// Verify, then apply every pending migration, each in its own
    /// transaction. Stops at the first failure.
    pub async fn apply(&self, migrations: &[Migration]) -> DbResult<Vec<MigrationResult>> {
        self.verify(migrations).await?;

        let mut results = Vec::new();
        for migration in self.pending(migrations).await? {
            info!(version = migration.version, name = %migration.name, "applying migration");
            let start = Instant::now();

            let insert = format!(
                "INSERT INTO {} (version, name, checksum, applied_at, execution_time_ms) VALUES ({}, {}, {}, {}, {})",
                dialect::quote(self.driver(), MIGRATIONS_TABLE),
                self.ph(1),
                self.ph(2),
                self.ph(3),
                self.ph(4),
                self.ph(5)
            );
            let up_sql = migration.up_sql.clone();
            let version = migration.version;
            let record = vec![
                Value::Int(migration.version),
                migration.name.clone().into(),
                migration.checksum.clone().into(),
                Utc::now().to_rfc3339().into(),
            ];

            self.db
                .transaction(move |tx| {
                    Box::pin(async move {
                        tx.exec(&up_sql, vec![]).await.map_err(|e| {
                            DatabaseError::Migration(format!("failed to apply migration {}: {}", version, e))
                        })?;
                        let mut args = record;
                        args.push(Value::Int(start.elapsed().as_millis() as i64));
                        tx.exec(&insert, args).await?;
                        Ok::<_, DatabaseError>(())
                    })
                })
                .await?;

            results.push(MigrationResult {
                version: migration.version,
                name: migration.name,
                execution_time_ms: start.elapsed().as_millis() as i64,
            });
        }

        Ok(results)
    }

    /// Roll back the most recently applied migration, if any.
    pub async fn rollback_last(&self, migrations: &[Migration]) -> DbResult<Option<MigrationResult>> {
        let Some(version) = self.current_version().await? else {
            return Ok(None);
        };
        let migration = migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| DatabaseError::Migration(format!("migration {} is not defined", version)))?
            .clone();

        info!(version, name = %migration.name, "rolling back migration");
        let start = Instant::now();
        let delete = format!(
            "DELETE FROM {} WHERE version = {}",
            dialect::quote(self.driver(), MIGRATIONS_TABLE),
            self.ph(1)
        );
        let down_sql = migration.down_sql.clone();

        self.db
            .transaction(move |tx| {
                Box::pin(async move {
                    match down_sql {
                        Some(sql) => {
                            tx.exec(&sql, vec![]).await.map_err(|e| {
                                DatabaseError::Migration(format!("failed to roll back migration {}: {}", version, e))
                            })?;
                        }
                        None => warn!(version, "no rollback SQL, only removing the record"),
                    }
                    tx.exec(&delete, vec![Value::Int(version)]).await?;
                    Ok::<_, DatabaseError>(())
                })
            })
            .await?;

        Ok(Some(MigrationResult {
            version,
            name: migration.name,
            execution_time_ms: start.elapsed().as_millis() as i64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users() -> TableSchema {
        TableSchema::new("users")
            .column(ColumnDef::id("id"))
            .column(ColumnDef::new("email", ColumnType::Text).not_null().unique())
            .column(ColumnDef::new("active", ColumnType::Boolean).default_sql("TRUE"))
            .column(ColumnDef::new("avatar", ColumnType::Blob))
    }

    #[test]
    fn test_create_sql_sqlite() {
        assert_eq!(
            users().create_sql(DriverKind::Sqlite),
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
             \"email\" TEXT NOT NULL UNIQUE, \"active\" BOOLEAN DEFAULT TRUE, \"avatar\" BLOB)"
        );
    }

    #[test]
    fn test_create_sql_mysql() {
        assert_eq!(
            users().create_sql(DriverKind::Mysql),
            "CREATE TABLE IF NOT EXISTS `users` (`id` BIGINT AUTO_INCREMENT PRIMARY KEY, \
             `email` VARCHAR(255) NOT NULL UNIQUE, `active` BOOLEAN DEFAULT TRUE, `avatar` LONGBLOB)"
        );
    }

    #[test]
    fn test_create_sql_postgres() {
        assert_eq!(
            users().create_sql(DriverKind::Postgresql),
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" BIGSERIAL PRIMARY KEY, \
             \"email\" TEXT NOT NULL UNIQUE, \"active\" BOOLEAN DEFAULT TRUE, \"avatar\" BYTEA)"
        );
    }

    #[test]
    fn test_composite_primary_key() {
        let schema = TableSchema::new("memberships")
            .column(ColumnDef::new("user_id", ColumnType::Integer).primary_key())
            .column(ColumnDef::new("team_id", ColumnType::Integer).primary_key());
        assert_eq!(
            schema.create_sql(DriverKind::Postgresql),
            "CREATE TABLE IF NOT EXISTS \"memberships\" (\"user_id\" BIGINT NOT NULL, \
             \"team_id\" BIGINT NOT NULL, PRIMARY KEY (\"user_id\", \"team_id\"))"
        );
    }

    #[test]
    fn test_migration_checksum() {
        let migration = Migration::new(1, "init", "CREATE TABLE t (id INTEGER)");
        assert_eq!(migration.checksum.len(), 64);
        assert!(migration.verify_checksum());

        let mut tampered = migration.clone();
        tampered.up_sql.push(';');
        assert!(!tampered.verify_checksum());
    }
}
