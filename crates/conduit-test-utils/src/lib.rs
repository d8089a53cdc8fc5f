//! Test utilities for Conduit crates.

use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Serializes tests that touch process-global state (env vars, cwd).
static PROCESS_STATE: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

/// Initialize tracing once for the test binary, writing through the test
/// harness so output is captured per test.
pub fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,conduit=debug"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });

    Lazy::force(&INIT);
}

/// Generate a unique name with the given prefix, e.g. for table names.
pub fn unique_name(prefix: &str) -> String {
    let count = NAME_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}_{}_{}", prefix, std::process::id(), count)
}

/// Creates a temporary directory that is cleaned up on drop.
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// A SQLite database file inside a temporary directory.
///
/// The file itself is created by the driver on first connect.
pub struct TempSqlite {
    dir: TempDir,
    path: PathBuf,
}

impl TempSqlite {
    pub fn new() -> Self {
        let dir = temp_dir();
        let path = dir.path().join(format!("{}.db", unique_name("conduit")));
        Self { dir, path }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Plain path DSN, the form most configs use.
    pub fn dsn(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Directory holding the database and its WAL files.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TempSqlite {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment variable isolation.
///
/// Holds a process-wide lock for its lifetime so tests mutating the
/// environment do not interleave. Listed variables are cleared on creation;
/// every touched variable is restored on drop.
pub struct EnvGuard {
    original_vars: RefCell<HashMap<String, Option<String>>>,
    _lock: ReentrantMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Lock the environment and clear `vars`.
    pub fn new(vars: &[&str]) -> Self {
        let guard = Self {
            original_vars: RefCell::new(HashMap::new()),
            _lock: PROCESS_STATE.lock(),
        };
        for var in vars {
            guard.remove(var);
        }
        guard
    }

    fn remember(&self, key: &str) {
        self.original_vars
            .borrow_mut()
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }

    /// Set an environment variable, saving the original value.
    pub fn set(&self, key: &str, value: &str) {
        self.remember(key);
        std::env::set_var(key, value);
    }

    /// Remove an environment variable, saving the original value.
    pub fn remove(&self, key: &str) {
        self.remember(key);
        std::env::remove_var(key);
    }

    /// Run `f` with the working directory set to `dir`, restoring it after.
    pub fn with_current_dir<R>(&self, dir: &Path, f: impl FnOnce() -> R) -> R {
        struct Restore(PathBuf);

        impl Drop for Restore {
            fn drop(&mut self) {
                let _ = std::env::set_current_dir(&self.0);
            }
        }

        let _restore = Restore(std::env::current_dir().expect("Failed to read current dir"));
        std::env::set_current_dir(dir).expect("Failed to change current dir");
        f()
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original_value) in self.original_vars.borrow().iter() {
            match original_value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Macro for async tests with tokio runtime.
#[macro_export]
macro_rules! async_test {
    ($name:ident, $body:expr) => {
        #[tokio::test]
        async fn $name() {
            $crate::init_tracing();
            $body
        }
    };
}

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}

/// Assert that a Result is Err and return the error.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
            Err(e) => e,
        }
    };
}
