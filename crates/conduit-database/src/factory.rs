//! Resolve configuration into a connection manager.

use crate::drivers::{new_mysql_manager, new_postgres_manager, new_sqlite_manager};
use crate::error::{DatabaseError, DbResult};
use crate::manager::ConnectionManager;
use crate::observability::{ObservabilityPlugin, QueryLogger, Tracer, TracingLogger, TracingTracer};
use conduit_config::{
    load_database_config, ConfigError, ConfigProvider, DatabaseConfig, DriverConfig, DriverKind,
    ObservabilityConfig,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Builds managers that share a name and observability collaborators.
#[derive(Clone)]
pub struct ManagerFactory {
    name: String,
    logger: Arc<dyn QueryLogger>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl std::fmt::Debug for ManagerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerFactory")
            .field("name", &self.name)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

fn driver_config(config: &DatabaseConfig, driver: DriverKind) -> DbResult<&DriverConfig> {
    let field = driver.config_key().unwrap_or("driver_config");
    config.driver_config(driver).ok_or_else(|| {
        DatabaseError::Config(ConfigError::MissingDriverConfig {
            driver: driver.to_string(),
            field,
        })
    })
}

impl ManagerFactory {
    /// Factory logging through `tracing` with `tracing` spans.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logger: Arc::new(TracingLogger),
            tracer: Some(Arc::new(TracingTracer)),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Disable span creation.
    pub fn without_tracer(mut self) -> Self {
        self.tracer = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn plugin(&self, config: ObservabilityConfig) -> ObservabilityPlugin {
        ObservabilityPlugin::new(config, self.logger.clone(), self.tracer.clone())
    }

    fn fallback(&self, error: &DatabaseError) -> ConnectionManager {
        warn!(
            name = %self.name,
            error = %error,
            "database unavailable, falling back to the none driver"
        );
        ConnectionManager::null(&self.name, self.plugin(ObservabilityConfig::default()))
    }

    /// Build a manager from a raw configuration map. Never fails: any parse,
    /// validation or connection error yields a Null-driver manager. A
    /// non-empty `driver_name` overrides the map's `driver` field.
    #[instrument(skip(self, raw), fields(name = %self.name))]
    pub async fn build(&self, driver_name: &str, raw: &Map<String, Value>) -> ConnectionManager {
        match self.try_build(driver_name, raw).await {
            Ok(manager) => manager,
            Err(e) => self.fallback(&e),
        }
    }

    async fn try_build(&self, driver_name: &str, raw: &Map<String, Value>) -> DbResult<ConnectionManager> {
        let mut config = DatabaseConfig::parse_from_map(raw)?;
        if !driver_name.trim().is_empty() {
            config.driver = driver_name.to_string();
        }
        self.build_with_config(config).await
    }

    /// Build a manager, returning configuration and connection errors.
    pub async fn build_with_config(&self, config: DatabaseConfig) -> DbResult<ConnectionManager> {
        config.validate()?;
        let driver = config.selected_driver()?;
        let plugin = self.plugin(config.observability_config.clone());

        let manager = match driver {
            DriverKind::Sqlite => {
                new_sqlite_manager(&self.name, driver_config(&config, driver)?, plugin).await?
            }
            DriverKind::Mysql => {
                new_mysql_manager(&self.name, driver_config(&config, driver)?, plugin).await?
            }
            DriverKind::Postgresql => {
                new_postgres_manager(&self.name, driver_config(&config, driver)?, plugin).await?
            }
            DriverKind::None => {
                info!(name = %self.name, "database driver is none, I/O is disabled");
                ConnectionManager::null(&self.name, plugin)
            }
        };
        Ok(manager)
    }

    /// Lenient build from `key` in `provider`, with environment overrides.
    pub async fn build_from_provider<P>(&self, provider: &P, key: &str) -> ConnectionManager
    where
        P: ConfigProvider + ?Sized,
    {
        let config = match load_database_config(provider, key) {
            Ok(config) => config,
            Err(e) => return self.fallback(&DatabaseError::from(e)),
        };
        match self.build_with_config(config).await {
            Ok(manager) => manager,
            Err(e) => self.fallback(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_strict_build_reports_missing_sub_config() {
        let factory = ManagerFactory::new("svc");
        let mut config = DatabaseConfig::none();
        config.driver = "mysql".to_string();
        let err = factory.build_with_config(config).await.unwrap_err();
        assert_matches!(err, DatabaseError::Config(ConfigError::MissingDriverConfig { .. }));
    }

    #[tokio::test]
    async fn test_driver_name_overrides_map() {
        let factory = ManagerFactory::new("svc");
        let manager = factory
            .build("none", &raw(json!({"driver": "sqlite", "sqlite_config": {"dsn": ":memory:"}})))
            .await;
        assert_eq!(manager.driver(), DriverKind::None);

        let manager = factory
            .build("sqlite", &raw(json!({"driver": "none", "sqlite_config": {"dsn": ":memory:"}})))
            .await;
        assert_eq!(manager.driver(), DriverKind::Sqlite);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_observability_config_reaches_plugin() {
        let factory = ManagerFactory::new("svc").without_tracer();
        let manager = factory
            .build(
                "",
                &raw(json!({
                    "driver": "sqlite",
                    "sqlite_config": {"dsn": ":memory:"},
                    "observability_config": {"log_sql": true, "sample_rate": 0.5}
                })),
            )
            .await;
        let config = manager.plugin().config();
        assert!(config.log_sql);
        assert_eq!(config.sample_rate, 0.5);
        manager.close().await.unwrap();
    }
}
