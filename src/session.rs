//! Cluster session abstraction
//!
//! The coordination engine never owns a driver or a connection. Everything it
//! does against the cluster goes through the [`ClusterSession`] trait, which
//! an application implements over its driver of choice. The trait surface is
//! deliberately small: execute a statement at a consistency level and report
//! whether a conditional write was applied, whether the cluster's schema is
//! in agreement, and whether a table exists.

use thiserror::Error;

/// Consistency level requested for a statement.
///
/// Mutations and ledger reads run at `Quorum`. Lock reads run at `Serial`
/// because they gate irreversible schema changes and must observe the
/// outcome of conditional writes linearizably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Quorum,
    Serial,
}

/// A parameter value bound to a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A statement plus its bound parameters and consistency level.
#[derive(Debug, Clone)]
pub struct Statement {
    pub cql: String,
    pub params: Vec<Value>,
    pub consistency: Consistency,
}

impl Statement {
    /// Build a statement executed at `QUORUM`.
    pub fn quorum(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            params: Vec::new(),
            consistency: Consistency::Quorum,
        }
    }

    /// Build a statement executed at `SERIAL`.
    pub fn serial(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            params: Vec::new(),
            consistency: Consistency::Serial,
        }
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// One row of a result set, keyed by column name.
///
/// A missing column and a stored null both read as `None`.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: std::collections::BTreeMap<String, Value>,
}

impl Row {
    #[must_use]
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.columns.insert(column.to_string(), value.into());
        self
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.columns.get(column) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

/// What the cluster reported about one executed statement.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    /// Conditional (lightweight transaction) outcome. Unconditional
    /// statements report `true`.
    pub was_applied: bool,
    /// Rows returned by the statement, if any. For a rejected conditional
    /// write the first row holds the current values of the condition columns.
    pub rows: Vec<Row>,
    /// Whether the cluster reported schema agreement after this statement.
    pub schema_in_agreement: bool,
}

impl ExecutionInfo {
    /// An applied, row-less outcome with schema agreement.
    #[must_use]
    pub fn applied() -> Self {
        Self {
            was_applied: true,
            rows: Vec::new(),
            schema_in_agreement: true,
        }
    }
}

/// Errors surfaced by a session implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// Capability the engine holds against the cluster.
///
/// Implementations must route `Serial` reads through a strongly consistent
/// read path; the lock logic relies on it.
pub trait ClusterSession {
    /// Execute one statement and report its outcome.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the statement could not be executed at the
    /// requested consistency level.
    fn execute(&self, stmt: &Statement) -> Result<ExecutionInfo, SessionError>;

    /// Whether the schema is consistently visible across all live nodes.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if cluster metadata cannot be read.
    fn schema_in_agreement(&self) -> Result<bool, SessionError>;

    /// Whether a table exists in the connected keyspace.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the system tables cannot be read.
    fn table_exists(&self, table: &str) -> Result<bool, SessionError>;
}
