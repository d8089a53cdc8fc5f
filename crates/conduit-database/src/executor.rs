//! Executors: pool-bound [`Db`] and transaction-bound [`Tx`].

use crate::error::{DatabaseError, DbResult};
use crate::observability::ObservabilityPlugin;
use crate::query::TableQuery;
use crate::statement::Statement;
use crate::value::{Record, Value};
use async_trait::async_trait;
use conduit_config::DriverKind;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Connection, Executor};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Deadline applied to every statement an executor issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryContext {
    deadline: Option<Instant>,
}

impl QueryContext {
    /// No deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Run `operation` under this context's deadline.
    pub async fn run<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, operation)
                .await
                .map_err(|_| DatabaseError::Timeout)?,
            None => operation.await,
        }
    }
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

fn bind_value<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

fn build_query(statement: &Statement) -> AnyQuery<'_> {
    statement
        .args
        .iter()
        .fold(sqlx::query(&statement.sql), bind_value)
}

async fn execute_on<'c, E>(executor: E, statement: &Statement) -> DbResult<u64>
where
    E: Executor<'c, Database = Any>,
{
    // Argument-free statements run unprepared so scripts with several
    // statements work.
    let result = if statement.args.is_empty() {
        executor.execute(statement.sql.as_str()).await?
    } else {
        build_query(statement).execute(executor).await?
    };
    Ok(result.rows_affected())
}

async fn fetch_on<'c, E>(executor: E, statement: &Statement) -> DbResult<Vec<Record>>
where
    E: Executor<'c, Database = Any>,
{
    let rows = build_query(statement).fetch_all(executor).await?;
    rows.iter().map(Record::from_row).collect()
}

/// Statement execution shared by [`Db`] and [`Tx`].
#[async_trait]
pub trait Session: Send {
    fn driver(&self) -> DriverKind;

    /// Run a statement that returns no rows; yields rows affected.
    async fn execute(&mut self, statement: Statement) -> DbResult<u64>;

    /// Run a statement and collect its rows.
    async fn fetch(&mut self, statement: Statement) -> DbResult<Vec<Record>>;

    /// Raw SQL whose operation kind is inferred from its verb.
    async fn exec(&mut self, sql: &str, args: Vec<Value>) -> DbResult<u64> {
        self.execute(Statement::exec(sql, args)).await
    }

    /// Raw SQL returning rows, reported as a query.
    async fn raw(&mut self, sql: &str, args: Vec<Value>) -> DbResult<Vec<Record>> {
        self.fetch(Statement::raw(sql, args)).await
    }

    /// Query builder over `name` borrowing this session.
    fn table(&mut self, name: &str) -> TableQuery<&mut Self>
    where
        Self: Sized,
    {
        TableQuery::new(self, name)
    }
}

#[async_trait]
impl<S: Session + ?Sized> Session for &mut S {
    fn driver(&self) -> DriverKind {
        (**self).driver()
    }

    async fn execute(&mut self, statement: Statement) -> DbResult<u64> {
        (**self).execute(statement).await
    }

    async fn fetch(&mut self, statement: Statement) -> DbResult<Vec<Record>> {
        (**self).fetch(statement).await
    }
}

/// Pool-bound executor. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: AnyPool,
    driver: DriverKind,
    plugin: ObservabilityPlugin,
    ctx: QueryContext,
}

impl Db {
    pub(crate) fn new(pool: AnyPool, driver: DriverKind, plugin: ObservabilityPlugin) -> Self {
        Self {
            pool,
            driver,
            plugin,
            ctx: QueryContext::background(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn context(&self) -> QueryContext {
        self.ctx
    }

    /// Copy of this executor bound to `ctx`.
    pub fn with_context(&self, ctx: QueryContext) -> Self {
        Self {
            ctx,
            ..self.clone()
        }
    }

    pub fn plugin(&self) -> &ObservabilityPlugin {
        &self.plugin
    }

    /// Acquire a connection and ping it.
    pub async fn ping(&self) -> DbResult<()> {
        self.ctx
            .run(async {
                let mut conn = self.pool.acquire().await?;
                conn.ping().await?;
                Ok(())
            })
            .await
    }

    /// Start a transaction.
    pub async fn begin(&self) -> DbResult<Tx> {
        let inner = self.ctx.run(async { Ok(self.pool.begin().await?) }).await?;
        debug!(driver = %self.driver, "transaction started");
        Ok(Tx {
            inner,
            driver: self.driver,
            plugin: self.plugin.clone(),
            ctx: self.ctx,
            depth: 0,
        })
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`. Rolls back when it returns `Err` or
    /// panics; the panic resumes after the rollback.
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<DatabaseError> + Send,
    {
        let mut tx = self.begin().await?;
        let outcome = AssertUnwindSafe(f(&mut tx)).catch_unwind().await;
        tx.settle(outcome).await
    }

    /// Run `f` in a savepoint inside a fresh transaction.
    ///
    /// A failure inside `f` rolls back to the savepoint and then rolls back
    /// the outer transaction as well.
    pub async fn nested_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<DatabaseError> + Send,
    {
        let mut tx = self.begin().await?;
        let outcome = AssertUnwindSafe(tx.savepoint(f)).catch_unwind().await;
        tx.settle(outcome).await
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Session for Db {
    fn driver(&self) -> DriverKind {
        self.driver
    }

    async fn execute(&mut self, statement: Statement) -> DbResult<u64> {
        let work = self.ctx.run(execute_on(&self.pool, &statement));
        self.plugin.observe(&statement, work).await
    }

    async fn fetch(&mut self, statement: Statement) -> DbResult<Vec<Record>> {
        let work = self.ctx.run(fetch_on(&self.pool, &statement));
        self.plugin.observe(&statement, work).await
    }
}

type PanicPayload = Box<dyn std::any::Any + Send>;

/// Transaction-bound executor.
///
/// Dropping a `Tx` without committing rolls it back.
pub struct Tx {
    inner: sqlx::Transaction<'static, Any>,
    driver: DriverKind,
    plugin: ObservabilityPlugin,
    ctx: QueryContext,
    depth: u32,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("driver", &self.driver)
            .field("depth", &self.depth)
            .finish()
    }
}

impl Tx {
    /// Number of open savepoints.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub async fn commit(self) -> DbResult<()> {
        let ctx = self.ctx;
        ctx.run(async move { Ok(self.inner.commit().await?) }).await
    }

    pub async fn rollback(self) -> DbResult<()> {
        let ctx = self.ctx;
        ctx.run(async move { Ok(self.inner.rollback().await?) }).await
    }

    /// Run `f` inside a savepoint of this transaction.
    ///
    /// Releases the savepoint on success. On error or panic rolls back to
    /// it, leaving earlier work in the transaction intact; a panic resumes
    /// afterwards.
    pub async fn savepoint<F, T, E>(&mut self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<DatabaseError> + Send,
    {
        let name = format!("conduit_sp_{}", self.depth + 1);
        self.control(&format!("SAVEPOINT {}", name)).await?;
        self.depth += 1;

        let outcome = AssertUnwindSafe(f(&mut *self)).catch_unwind().await;
        self.depth -= 1;

        match outcome {
            Ok(Ok(value)) => {
                self.control(&format!("RELEASE SAVEPOINT {}", name)).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback_to(&name).await;
                Err(err)
            }
            Err(panic) => {
                self.rollback_to(&name).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback_to(&mut self, name: &str) {
        if let Err(e) = self.control(&format!("ROLLBACK TO SAVEPOINT {}", name)).await {
            warn!(savepoint = %name, error = %e, "failed to roll back to savepoint");
        }
    }

    /// Transaction control statements bypass the plugin and run unprepared.
    async fn control(&mut self, sql: &str) -> DbResult<()> {
        let ctx = self.ctx;
        let conn = &mut *self.inner;
        ctx.run(async move {
            conn.execute(sql).await?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn settle<T, E>(self, outcome: Result<Result<T, E>, PanicPayload>) -> Result<T, E>
    where
        E: From<DatabaseError>,
    {
        match outcome {
            Ok(Ok(value)) => {
                self.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(e) = self.rollback().await {
                    warn!(error = %e, "rollback after failed transaction did not complete");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(e) = self.rollback().await {
                    warn!(error = %e, "rollback after panic did not complete");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[async_trait]
impl Session for Tx {
    fn driver(&self) -> DriverKind {
        self.driver
    }

    async fn execute(&mut self, statement: Statement) -> DbResult<u64> {
        let work = self.ctx.run(execute_on(&mut *self.inner, &statement));
        self.plugin.observe(&statement, work).await
    }

    async fn fetch(&mut self, statement: Statement) -> DbResult<Vec<Record>> {
        let work = self.ctx.run(fetch_on(&mut *self.inner, &statement));
        self.plugin.observe(&statement, work).await
    }
}
