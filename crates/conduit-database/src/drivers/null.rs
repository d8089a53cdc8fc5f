use crate::manager::ConnectionManager;
use crate::observability::ObservabilityPlugin;
use tracing::info;

/// Manager for the `none` driver. Never opens a backend; every I/O call
/// fails with [`crate::DatabaseError::Unavailable`].
pub fn new_null_manager(name: &str) -> ConnectionManager {
    info!(name = %name, "database driver is none, I/O is disabled");
    ConnectionManager::null(name, ObservabilityPlugin::default())
}
