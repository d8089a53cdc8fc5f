//! Table query builder and the `Model` trait.

use crate::dialect;
use crate::error::{DatabaseError, DbResult};
use crate::executor::Session;
use crate::migrate::TableSchema;
use crate::statement::{OperationKind, Statement};
use crate::value::{Record, Value};
use conduit_config::DriverKind;

/// A type mapped to a table.
pub trait Model: Sized + Send {
    /// Table definition, used for migrations and the table name.
    fn schema() -> TableSchema;

    /// Column values to write. A `Null` primary key is left out of inserts
    /// so the backend assigns it.
    fn values(&self) -> Vec<(&'static str, Value)>;

    fn from_record(record: &Record) -> DbResult<Self>;
}

/// Accumulates SQL text and bind arguments with dialect placeholders.
struct SqlBuilder {
    driver: DriverKind,
    sql: String,
    args: Vec<Value>,
}

impl SqlBuilder {
    fn new(driver: DriverKind, sql: impl Into<String>) -> Self {
        Self {
            driver,
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn push_ident(&mut self, ident: &str) {
        let quoted = dialect::quote(self.driver, ident);
        self.sql.push_str(&quoted);
    }

    /// `NULL` is written inline; some backends cannot infer the type of an
    /// untyped null parameter.
    fn push_value(&mut self, value: Value) {
        if value.is_null() {
            self.sql.push_str("NULL");
        } else {
            self.args.push(value);
            let placeholder = dialect::placeholder(self.driver, self.args.len());
            self.sql.push_str(&placeholder);
        }
    }

    fn finish(self, kind: OperationKind, table: &str) -> Statement {
        Statement::new(kind, table, self.sql, self.args)
    }
}

/// Query builder over one table, bound to a [`Session`].
///
/// Filters are equality conditions joined with `AND`. `update` and `delete`
/// refuse to run without at least one filter.
#[derive(Debug)]
pub struct TableQuery<S> {
    session: S,
    table: String,
    filters: Vec<(String, Value)>,
    order: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl<S: Session> TableQuery<S> {
    pub fn new(session: S, table: impl Into<String>) -> Self {
        Self {
            session,
            table: table.into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), false));
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), true));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn driver(&self) -> DriverKind {
        self.session.driver()
    }

    fn push_where(&self, builder: &mut SqlBuilder) {
        for (i, (column, value)) in self.filters.iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            builder.push_ident(column);
            if value.is_null() {
                builder.push(" IS NULL");
            } else {
                builder.push(" = ");
                builder.push_value(value.clone());
            }
        }
    }

    /// Render the `SELECT` this builder would run.
    pub fn select_statement(&self) -> Statement {
        let mut builder = SqlBuilder::new(self.driver(), "SELECT * FROM ");
        builder.push_ident(&self.table);
        self.push_where(&mut builder);

        for (i, (column, desc)) in self.order.iter().enumerate() {
            builder.push(if i == 0 { " ORDER BY " } else { ", " });
            builder.push_ident(column);
            if *desc {
                builder.push(" DESC");
            }
        }

        builder.push(&dialect::limit_offset(self.driver(), self.limit, self.offset));
        builder.finish(OperationKind::Query, &self.table)
    }

    fn insert_statement<I, K, V>(&self, values: I) -> Statement
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();

        let mut builder = SqlBuilder::new(self.driver(), "INSERT INTO ");
        builder.push_ident(&self.table);

        if columns.is_empty() {
            builder.push(match self.driver() {
                DriverKind::Mysql => " () VALUES ()",
                _ => " DEFAULT VALUES",
            });
        } else {
            builder.push(" (");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_ident(column);
            }
            builder.push(") VALUES (");
            for (i, value) in values.into_iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_value(value);
            }
            builder.push(")");
        }

        builder.finish(OperationKind::Create, &self.table)
    }

    fn update_statement<I, K, V>(&self, values: I) -> DbResult<Statement>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        if self.filters.is_empty() {
            return Err(DatabaseError::MissingConditions { operation: "update" });
        }

        let mut builder = SqlBuilder::new(self.driver(), "UPDATE ");
        builder.push_ident(&self.table);

        let mut any = false;
        for (i, (column, value)) in values.into_iter().enumerate() {
            builder.push(if i == 0 { " SET " } else { ", " });
            builder.push_ident(&column.into());
            builder.push(" = ");
            builder.push_value(value.into());
            any = true;
        }
        if !any {
            return Err(DatabaseError::MissingValues { operation: "update" });
        }

        self.push_where(&mut builder);
        Ok(builder.finish(OperationKind::Update, &self.table))
    }

    fn delete_statement(&self) -> DbResult<Statement> {
        if self.filters.is_empty() {
            return Err(DatabaseError::MissingConditions { operation: "delete" });
        }

        let mut builder = SqlBuilder::new(self.driver(), "DELETE FROM ");
        builder.push_ident(&self.table);
        self.push_where(&mut builder);
        Ok(builder.finish(OperationKind::Delete, &self.table))
    }

    /// Insert one row; returns rows affected.
    pub async fn insert<I, K, V>(mut self, values: I) -> DbResult<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let statement = self.insert_statement(values);
        self.session.execute(statement).await
    }

    /// Insert `model`.
    pub async fn create<M: Model>(self, model: &M) -> DbResult<u64> {
        let schema = M::schema();
        let values = model
            .values()
            .into_iter()
            .filter(|(column, value)| !(value.is_null() && schema.is_primary_key(column)));
        self.insert(values).await
    }

    pub async fn update<I, K, V>(mut self, values: I) -> DbResult<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let statement = self.update_statement(values)?;
        self.session.execute(statement).await
    }

    pub async fn delete(mut self) -> DbResult<u64> {
        let statement = self.delete_statement()?;
        self.session.execute(statement).await
    }

    pub async fn find(mut self) -> DbResult<Vec<Record>> {
        let statement = self.select_statement();
        self.session.fetch(statement).await
    }

    pub async fn first(self) -> DbResult<Option<Record>> {
        let rows = self.limit(1).find().await?;
        Ok(rows.into_iter().next())
    }

    pub async fn count(mut self) -> DbResult<i64> {
        let mut builder = SqlBuilder::new(self.driver(), "SELECT COUNT(*) AS count FROM ");
        builder.push_ident(&self.table);
        self.push_where(&mut builder);
        let statement = builder.finish(OperationKind::Query, &self.table);

        let rows = self.session.fetch(statement).await?;
        match rows.first() {
            Some(row) => row.get::<i64>("count"),
            None => Ok(0),
        }
    }

    pub async fn find_as<M: Model>(self) -> DbResult<Vec<M>> {
        self.find().await?.iter().map(M::from_record).collect()
    }
}
