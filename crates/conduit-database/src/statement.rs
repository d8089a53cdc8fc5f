use crate::value::Value;
use std::fmt;

/// Canonical operation kinds seen by the observability plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Query,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Query => "query",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Infer the kind from the leading SQL verb.
    ///
    /// Leading whitespace, `--` line comments and `/* */` block comments are
    /// skipped. Anything that is not a recognised write verb counts as a query.
    pub fn infer(sql: &str) -> Self {
        let verb = leading_keyword(sql).to_ascii_uppercase();
        match verb.as_str() {
            "INSERT" | "REPLACE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Query,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }

    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// A statement about to run, with the metadata the plugin reports on.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: OperationKind,
    /// Table the statement targets, empty for raw SQL.
    pub table: String,
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(kind: OperationKind, table: impl Into<String>, sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind,
            table: table.into(),
            sql: sql.into(),
            args,
        }
    }

    /// Raw SQL, always reported as a query.
    pub fn raw(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(OperationKind::Query, "", sql, args)
    }

    /// Raw SQL with the kind inferred from its verb.
    pub fn exec(sql: impl Into<String>, args: Vec<Value>) -> Self {
        let sql = sql.into();
        Self::new(OperationKind::infer(&sql), "", sql, args)
    }
}
