//! Driver contract shared by every backend.
//!
//! A driver executes `(sql, bindings)` pairs produced by a [`Grammar`], normalizes
//! its native errors into [`OrmError`](crate::OrmError), and owns the transaction
//! state for its handle.
//!
//! The query layer never touches a wire protocol directly. Code written against
//! `&impl Driver` runs unchanged on a pooled connection, inside a transaction, or
//! against a recording mock in tests.

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::OrmResult;
use crate::grammar::{Grammar, Statement};
use crate::row::Row;
use crate::value::Value;
use std::future::Future;
use std::sync::Arc;

/// Rows returned by a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// Column names in result order.
    pub fields: Vec<String>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let fields = rows
            .first()
            .map(|r| r.columns().to_vec())
            .unwrap_or_default();
        Self {
            row_count: rows.len(),
            rows,
            fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub affected_rows: u64,
    /// Generated key reported by the backend's last-insert-id channel.
    pub insert_id: Option<Value>,
    /// Rows whose values actually changed (MySQL reports this separately).
    pub changed_rows: Option<u64>,
}

/// Minimal async database contract.
///
/// All methods take `&self`; connection and transaction state live behind
/// interior synchronization so one handle can be shared across tasks.
pub trait Driver: Send + Sync {
    /// Grammar matching this backend's dialect.
    fn grammar(&self) -> Arc<dyn Grammar>;

    fn connect(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn is_connected(&self) -> bool;

    /// Run a statement that returns rows.
    fn query(
        &self,
        sql: &str,
        bindings: &[Value],
    ) -> impl Future<Output = OrmResult<QueryResult>> + Send;

    /// Run a statement that returns an affected-row count.
    fn execute(
        &self,
        sql: &str,
        bindings: &[Value],
    ) -> impl Future<Output = OrmResult<ExecResult>> + Send;

    /// Start a transaction on this handle.
    ///
    /// Fails with [`OrmError::TransactionAlreadyActive`](crate::OrmError::TransactionAlreadyActive)
    /// if one is already active.
    fn begin_transaction(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn commit(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn rollback(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn in_transaction(&self) -> bool;

    /// Run a compiled read statement.
    fn fetch(&self, stmt: &Statement) -> impl Future<Output = OrmResult<QueryResult>> + Send {
        self.query(&stmt.sql, &stmt.bindings)
    }

    /// Run a compiled write statement.
    fn run(&self, stmt: &Statement) -> impl Future<Output = OrmResult<ExecResult>> + Send {
        self.execute(&stmt.sql, &stmt.bindings)
    }
}
