//! Postgres driver on `tokio-postgres` and a `deadpool-postgres` pool.
//!
//! Statements outside a transaction run on a connection checked out for that
//! statement alone. `begin_transaction` pins one pooled connection to the handle
//! and every statement is routed through it until `commit` or `rollback`.

use super::{Driver, ExecResult, QueryResult};
use crate::config::PoolConfig;
use crate::error::{OrmError, OrmResult};
use crate::grammar::{Grammar, PostgresGrammar};
use crate::row::Row;
use crate::transaction::TransactionTracker;
use crate::value::Value;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

/// Longest statement text written to the log, in bytes.
const MAX_LOGGED_SQL: usize = 200;

pub struct PgDriver {
    pool: Pool,
    grammar: Arc<dyn Grammar>,
    tx: TransactionTracker,
    tx_conn: tokio::sync::Mutex<Option<Object>>,
    connected: AtomicBool,
    acquire_timeout: Duration,
    slow_query_threshold: Option<Duration>,
}

impl fmt::Debug for PgDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgDriver")
            .field("pool_status", &self.pool.status())
            .field("transaction", &self.tx.state())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl PgDriver {
    /// Build a pool from `config`. No connection is opened until first use or `connect`.
    pub fn new(config: &PoolConfig) -> OrmResult<Self> {
        let pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e: tokio_postgres::Error| OrmError::Connection(e.to_string()))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .build()
            .map_err(|e| OrmError::Pool(e.to_string()))?;

        Ok(Self::from_pool(pool, config))
    }

    /// Read [`PoolConfig`] from the environment and build the pool.
    pub fn from_env() -> OrmResult<Self> {
        Self::new(&PoolConfig::from_env()?)
    }

    /// Wrap an existing pool (custom TLS or manager tuning).
    pub fn from_pool(pool: Pool, config: &PoolConfig) -> Self {
        Self {
            pool,
            grammar: Arc::new(PostgresGrammar),
            tx: TransactionTracker::new(),
            tx_conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            acquire_timeout: config.acquire_timeout,
            slow_query_threshold: config.slow_query_threshold,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn acquire(&self) -> OrmResult<Object> {
        let object = tokio::time::timeout(self.acquire_timeout, self.pool.get())
            .await
            .map_err(|_| {
                OrmError::Connection(format!(
                    "timed out after {:?} acquiring a pooled connection",
                    self.acquire_timeout
                ))
            })??;
        self.connected.store(true, Ordering::Relaxed);
        Ok(object)
    }

    async fn conn(&self) -> OrmResult<Conn<'_>> {
        if self.tx.is_active() {
            Ok(Conn::Transaction(self.tx_conn.lock().await))
        } else {
            Ok(Conn::Pooled(self.acquire().await?))
        }
    }

    fn log_statement(&self, sql: &str, params: usize, elapsed: Duration) {
        let shown = truncate_sql(sql);
        let elapsed_ms = elapsed.as_millis() as u64;
        match self.slow_query_threshold {
            Some(threshold) if elapsed >= threshold => tracing::warn!(
                target: "anyorm.sql",
                sql = %shown,
                params,
                elapsed_ms,
                "slow statement"
            ),
            _ => tracing::debug!(
                target: "anyorm.sql",
                sql = %shown,
                params,
                elapsed_ms,
                "statement"
            ),
        }
    }
}

/// Connection a statement runs on.
enum Conn<'a> {
    Transaction(tokio::sync::MutexGuard<'a, Option<Object>>),
    Pooled(Object),
}

impl Conn<'_> {
    fn client(&self) -> OrmResult<&Client> {
        match self {
            Conn::Transaction(guard) => match guard.as_ref() {
                Some(object) => Ok(&***object),
                None => Err(OrmError::NoActiveTransaction),
            },
            Conn::Pooled(object) => Ok(&***object),
        }
    }
}

fn params(bindings: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    bindings.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

impl Driver for PgDriver {
    fn grammar(&self) -> Arc<dyn Grammar> {
        self.grammar.clone()
    }

    async fn connect(&self) -> OrmResult<()> {
        let object = self.acquire().await?;
        object
            .simple_query("SELECT 1")
            .await
            .map_err(OrmError::from_db_error)?;
        tracing::debug!(target: "anyorm.sql", status = ?self.pool.status(), "pool connected");
        Ok(())
    }

    async fn disconnect(&self) -> OrmResult<()> {
        self.tx_conn.lock().await.take();
        self.pool.close();
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.pool.is_closed()
    }

    async fn query(&self, sql: &str, bindings: &[Value]) -> OrmResult<QueryResult> {
        let started = Instant::now();
        let conn = self.conn().await?;
        let pg_rows = conn
            .client()?
            .query(sql, &params(bindings))
            .await
            .map_err(OrmError::from_db_error)?;
        self.log_statement(sql, bindings.len(), started.elapsed());

        let fields = pg_rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = pg_rows
            .iter()
            .map(convert_row)
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(QueryResult {
            row_count: rows.len(),
            rows,
            fields,
        })
    }

    async fn execute(&self, sql: &str, bindings: &[Value]) -> OrmResult<ExecResult> {
        let started = Instant::now();
        let conn = self.conn().await?;
        let affected_rows = conn
            .client()?
            .execute(sql, &params(bindings))
            .await
            .map_err(OrmError::from_db_error)?;
        self.log_statement(sql, bindings.len(), started.elapsed());
        Ok(ExecResult {
            affected_rows,
            insert_id: None,
            changed_rows: None,
        })
    }

    async fn begin_transaction(&self) -> OrmResult<()> {
        let mut slot = self.tx_conn.lock().await;
        self.tx.begin()?;

        let object = match self.acquire().await {
            Ok(object) => object,
            Err(err) => {
                self.tx.abort_begin();
                return Err(err);
            }
        };
        if let Err(err) = object.batch_execute("BEGIN").await {
            self.tx.abort_begin();
            return Err(OrmError::from_db_error(err));
        }
        *slot = Some(object);
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> OrmResult<()> {
        self.finish("ROLLBACK").await
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_active()
    }
}

impl PgDriver {
    /// Send `COMMIT`/`ROLLBACK` and release the pinned connection.
    async fn finish(&self, command: &str) -> OrmResult<()> {
        let mut slot = self.tx_conn.lock().await;
        self.tx.ensure_active()?;
        let object = slot.take().ok_or(OrmError::NoActiveTransaction)?;

        match object.batch_execute(command).await {
            Ok(()) if command == "COMMIT" => self.tx.commit(),
            Ok(()) => self.tx.rollback(),
            Err(err) => {
                // The server discards the transaction either way.
                self.tx.rollback()?;
                Err(OrmError::from_db_error(err))
            }
        }
    }
}

fn truncate_sql(sql: &str) -> String {
    if sql.len() <= MAX_LOGGED_SQL {
        return sql.to_string();
    }
    let mut end = MAX_LOGGED_SQL;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}

// ==================== Parameters ====================

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => int_to_sql(*i, ty, out),
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => int_to_sql(s.trim().parse()?, ty, out),
                Type::NUMERIC => s.trim().parse::<Decimal>()?.to_sql(ty, out),
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                Type::TIMESTAMPTZ | Type::TIMESTAMP => {
                    let parsed = DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc);
                    Value::Timestamp(parsed).to_sql(ty, out)
                }
                _ => s.as_str().to_sql(ty, out),
            },
            Value::Decimal(d) => match *ty {
                Type::FLOAT4 | Type::FLOAT8 => {
                    let f = d.to_f64().ok_or("decimal out of float range")?;
                    Value::Float(f).to_sql(ty, out)
                }
                Type::TEXT | Type::VARCHAR => d.to_string().to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
            Value::Uuid(u) => u.to_sql(ty, out),
            Value::Timestamp(t) => match *ty {
                Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
                _ => t.to_sql(ty, out),
            },
            Value::Array(items) => items.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn int_to_sql(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(i).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
        _ => i.to_sql(ty, out),
    }
}

// ==================== Rows ====================

fn convert_row(row: &tokio_postgres::Row) -> OrmResult<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_())
            .map_err(|e| OrmError::decode(column.name(), e.to_string()))?;
        out.push(column.name(), value);
    }
    Ok(out)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Value, tokio_postgres::Error>
where
    T: FromSql<'a> + Into<Value>,
{
    Ok(row.try_get::<usize, Option<T>>(idx)?.into())
}

fn column_value(
    row: &tokio_postgres::Row,
    idx: usize,
    ty: &Type,
) -> Result<Value, tokio_postgres::Error> {
    match *ty {
        Type::BOOL => get::<bool>(row, idx),
        Type::INT2 => get::<i16>(row, idx),
        Type::INT4 => get::<i32>(row, idx),
        Type::INT8 => get::<i64>(row, idx),
        Type::OID => get::<u32>(row, idx),
        Type::FLOAT4 => get::<f32>(row, idx),
        Type::FLOAT8 => get::<f64>(row, idx),
        Type::NUMERIC => get::<Decimal>(row, idx),
        Type::NUMERIC_ARRAY => get::<Vec<Option<Decimal>>>(row, idx),
        Type::BYTEA => Ok(row
            .try_get::<usize, Option<Vec<u8>>>(idx)?
            .map(Value::Bytes)
            .unwrap_or(Value::Null)),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx),
        Type::UUID => get::<Uuid>(row, idx),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx),
        Type::DATE => Ok(row
            .try_get::<usize, Option<NaiveDate>>(idx)?
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null)),
        Type::BOOL_ARRAY => get::<Vec<Option<bool>>>(row, idx),
        Type::INT2_ARRAY => get::<Vec<Option<i16>>>(row, idx),
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx),
        Type::FLOAT8_ARRAY => get::<Vec<Option<f64>>>(row, idx),
        Type::UUID_ARRAY => get::<Vec<Option<Uuid>>>(row, idx),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<Option<String>>>(row, idx),
        _ => get::<String>(row, idx),
    }
}
