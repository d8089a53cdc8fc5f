//! Dynamic values bound to statements and read back from rows.

use crate::error::{DatabaseError, DbResult};
use serde::Serialize;
use sqlx::any::AnyRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::fmt;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "'{}'", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Error converting a [`Value`] into a Rust type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTypeError {
    expected: &'static str,
    found: &'static str,
}

impl fmt::Display for ValueTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl std::error::Error for ValueTypeError {}

fn mismatch(expected: &'static str, found: &Value) -> ValueTypeError {
    ValueTypeError {
        expected,
        found: found.type_name(),
    }
}

/// Conversion from a [`Value`] into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ValueTypeError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Int(i) => Ok(i),
            Value::Bool(b) => Ok(i64::from(b)),
            other => Err(mismatch("integer", &other)),
        }
    }
}

macro_rules! impl_from_value_narrow_int {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            fn from_value(value: Value) -> Result<Self, ValueTypeError> {
                let wide = i64::from_value(value)?;
                <$t>::try_from(wide).map_err(|_| ValueTypeError {
                    expected: stringify!($t),
                    found: "out-of-range integer",
                })
            }
        })*
    };
}

impl_from_value_narrow_int!(i32, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Float(x) => Ok(x),
            Value::Int(i) => Ok(i as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Bool(b) => Ok(b),
            // Engines without a native boolean store 0/1.
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Text(s) => Ok(s),
            // Some engines report text columns as binary.
            Value::Bytes(b) => String::from_utf8(b).map_err(|_| ValueTypeError {
                expected: "text",
                found: "non-utf8 bytes",
            }),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

macro_rules! impl_try_from_value {
    ($($t:ty),*) => {
        $(impl TryFrom<Value> for $t {
            type Error = ValueTypeError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                <$t as FromValue>::from_value(value)
            }
        })*
    };
}

impl_try_from_value!(i64, i32, u32, u64, usize, f64, bool, String, Vec<u8>);

/// A row read back from the database, columns in select order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub(crate) fn from_row(row: &AnyRow) -> DbResult<Self> {
        let columns = row
            .columns()
            .iter()
            .map(|column| {
                let name = column.name().to_string();
                decode_column(row, column.ordinal(), &name).map(|value| (name, value))
            })
            .collect::<DbResult<Vec<_>>>()?;

        Ok(Self { columns })
    }

    /// Raw value of `column`.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Typed value of `column`.
    pub fn get<T: FromValue>(&self, column: &str) -> DbResult<T> {
        let value = self.value(column).ok_or_else(|| DatabaseError::Decode {
            column: column.to_string(),
            reason: "no such column".to_string(),
        })?;

        T::from_value(value.clone()).map_err(|e| DatabaseError::Decode {
            column: column.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// JSON object view of the row, mostly useful for logging and debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.columns
                .iter()
                .map(|(name, value)| {
                    let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                    (name.clone(), json)
                })
                .collect(),
        )
    }
}

fn decode_column(row: &AnyRow, index: usize, name: &str) -> DbResult<Value> {
    // `AnyValueRef::is_null` is hardwired to false; the value kind is only
    // visible through its type name.
    if row.try_get_raw(index)?.type_info().name() == "NULL" {
        return Ok(Value::Null);
    }

    // The Any driver exposes no public type switch; probe the supported
    // representations in order of how common they are.
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(Value::Float(v));
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Ok(Value::Bool(v));
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(Value::Text(v));
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(Value::Bytes(v));
    }

    Err(DatabaseError::Decode {
        column: name.to_string(),
        reason: "unsupported column type".to_string(),
    })
}
