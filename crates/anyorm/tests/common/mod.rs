#![allow(dead_code)]

use anyorm::{
    Dialect, Driver, ExecResult, Grammar, OrmResult, QueryResult, Row, Statement,
    TransactionTracker, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type Handler = Box<dyn Fn(&str, &[Value]) -> Vec<Row> + Send + Sync>;

/// Records every statement and answers reads from a handler.
pub struct MockDriver {
    dialect: Dialect,
    handler: Handler,
    log: Mutex<Vec<Statement>>,
    tx: TransactionTracker,
    connected: AtomicBool,
    fail_commit: AtomicBool,
}

impl MockDriver {
    pub fn new<F>(dialect: Dialect, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Vec<Row> + Send + Sync + 'static,
    {
        Self {
            dialect,
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            tx: TransactionTracker::new(),
            connected: AtomicBool::new(true),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn empty(dialect: Dialect) -> Self {
        Self::new(dialect, |_, _| Vec::new())
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.log.lock().unwrap().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    /// Statements reading from `table`.
    pub fn reads_from(&self, table: &str) -> usize {
        let quoted = self.dialect.grammar().wrap_table(table);
        self.sql()
            .iter()
            .filter(|sql| sql.contains(&format!("FROM {quoted}")))
            .count()
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    fn record(&self, sql: &str, bindings: &[Value]) {
        self.log
            .lock()
            .unwrap()
            .push(Statement::new(sql, bindings.to_vec()));
    }
}

impl Driver for MockDriver {
    fn grammar(&self) -> Arc<dyn Grammar> {
        self.dialect.grammar()
    }

    async fn connect(&self) -> OrmResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> OrmResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn query(&self, sql: &str, bindings: &[Value]) -> OrmResult<QueryResult> {
        self.record(sql, bindings);
        Ok(QueryResult::from_rows((self.handler)(sql, bindings)))
    }

    async fn execute(&self, sql: &str, bindings: &[Value]) -> OrmResult<ExecResult> {
        self.record(sql, bindings);
        Ok(ExecResult {
            affected_rows: 1,
            insert_id: Some(Value::Int(42)),
            changed_rows: None,
        })
    }

    async fn begin_transaction(&self) -> OrmResult<()> {
        self.tx.begin()?;
        self.record("BEGIN", &[]);
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            self.tx.rollback()?;
            return Err(anyorm::OrmError::Query("could not serialize access".into()));
        }
        self.tx.commit()?;
        self.record("COMMIT", &[]);
        Ok(())
    }

    async fn rollback(&self) -> OrmResult<()> {
        self.tx.rollback()?;
        self.record("ROLLBACK", &[]);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_active()
    }
}

/// Flatten bindings, expanding array parameters.
pub fn ids(bindings: &[Value]) -> Vec<i64> {
    bindings
        .iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .filter_map(|v| v.as_i64())
        .collect()
}

pub fn row<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    Row::from_pairs(pairs)
}
