//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use conduit_database::conduit_config::{DriverConfig, DriverKind};
use conduit_database::{
    new_sqlite_manager, ColumnDef, ColumnType, ConnectionManager, DbResult, Model, ObservabilityPlugin, Record,
    TableSchema, Value,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Option<i64>,
    pub name: String,
    pub balance: i64,
}

impl Account {
    pub fn new(name: &str, balance: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            balance,
        }
    }
}

impl Model for Account {
    fn schema() -> TableSchema {
        TableSchema::new("accounts")
            .column(ColumnDef::id("id"))
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("balance", ColumnType::Integer).not_null().default_sql("0"))
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("balance", self.balance.into()),
        ]
    }

    fn from_record(record: &Record) -> DbResult<Self> {
        Ok(Self {
            id: record.get("id")?,
            name: record.get("name")?,
            balance: record.get("balance")?,
        })
    }
}

/// Live in-memory SQLite manager.
pub async fn memory_manager() -> ConnectionManager {
    conduit_test_utils::init_tracing();
    let cfg = DriverConfig::new(DriverKind::Sqlite, ":memory:");
    new_sqlite_manager("test", &cfg, ObservabilityPlugin::default())
        .await
        .expect("in-memory sqlite should open")
}

/// In-memory manager with the `accounts` table in place.
pub async fn accounts_manager() -> ConnectionManager {
    let manager = memory_manager().await;
    manager
        .auto_migrate(&[Account::schema()])
        .await
        .expect("accounts table should be created");
    manager
}

/// Insert `n` accounts named `seed-<i>`.
pub async fn seed_accounts(manager: &ConnectionManager, n: usize) {
    for i in 0..n {
        manager
            .model::<Account>()
            .expect("manager is live")
            .create(&Account::new(&format!("seed-{}", i), 100))
            .await
            .expect("seed insert");
    }
}

pub async fn account_count(manager: &ConnectionManager) -> i64 {
    manager
        .table("accounts")
        .expect("manager is live")
        .count()
        .await
        .expect("count accounts")
}
