//! Execution methods: compile with the builder's grammar, run through a driver.

use super::QueryBuilder;
use crate::cache::{CacheProvider, cache_key};
use crate::driver::{Driver, QueryResult};
use crate::error::{OrmError, OrmResult};
use crate::grammar::Upsert;
use crate::query::Aggregate;
use crate::row::{FromRow, Row};
use crate::value::Value;
use std::time::Duration;

impl QueryBuilder {
    // ==================== Reads ====================

    /// Fetch all matching rows.
    pub async fn get(&self, driver: &impl Driver) -> OrmResult<Vec<Row>> {
        let stmt = self.to_sql()?;
        Ok(driver.fetch(&stmt).await?.rows)
    }

    /// Fetch all matching rows mapped through [`FromRow`].
    pub async fn get_as<T: FromRow>(&self, driver: &impl Driver) -> OrmResult<Vec<T>> {
        self.get(driver).await?.iter().map(T::from_row).collect()
    }

    /// Fetch rows through `cache`, storing misses for `ttl`.
    pub async fn get_cached(
        &self,
        driver: &impl Driver,
        cache: &impl CacheProvider,
        ttl: Duration,
    ) -> OrmResult<Vec<Row>> {
        let stmt = self.to_sql()?;
        let key = cache_key(&stmt);
        if let Some(hit) = cache.get(&key).await {
            tracing::debug!(target: "anyorm.sql", table = %self.table, "cache hit");
            return Ok(hit.rows);
        }
        let result = driver.fetch(&stmt).await?;
        cache.set(&key, result.clone(), ttl).await;
        Ok(result.rows)
    }

    /// First matching row, or `None`.
    pub async fn first(&self, driver: &impl Driver) -> OrmResult<Option<Row>> {
        let rows = self.clone().limit(1).get(driver).await?;
        Ok(rows.into_iter().next())
    }

    /// First matching row; absence becomes [`OrmError::NotFound`].
    pub async fn first_or_fail(&self, driver: &impl Driver) -> OrmResult<Row> {
        self.first(driver)
            .await?
            .ok_or_else(|| OrmError::not_found(format!("no matching row in {}", self.table)))
    }

    /// Find by primary key.
    pub async fn find(&self, driver: &impl Driver, id: impl Into<Value>) -> OrmResult<Option<Row>> {
        let key = self.primary_key.clone();
        self.clone().where_eq(&key, id).first(driver).await
    }

    pub async fn exists(&self, driver: &impl Driver) -> OrmResult<bool> {
        let stmt = self.grammar.compile_exists(&self.to_compiled()?)?;
        let result = driver.fetch(&stmt).await?;
        let exists = result
            .rows
            .first()
            .and_then(|row| row.get("exists"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(exists)
    }

    async fn aggregate(
        &self,
        driver: &impl Driver,
        function: Aggregate,
        column: &str,
    ) -> OrmResult<Value> {
        let stmt = self
            .grammar
            .compile_aggregate(&self.to_compiled()?, function, column)?;
        let result = driver.fetch(&stmt).await?;
        Ok(result
            .rows
            .into_iter()
            .next()
            .and_then(|mut row| row.take("aggregate"))
            .unwrap_or(Value::Null))
    }

    pub async fn count(&self, driver: &impl Driver) -> OrmResult<i64> {
        let v = self.aggregate(driver, Aggregate::Count, "*").await?;
        Ok(v.as_i64().unwrap_or(0))
    }

    /// Sum of `column`; zero when no rows match.
    pub async fn sum(&self, driver: &impl Driver, column: &str) -> OrmResult<f64> {
        let v = self.aggregate(driver, Aggregate::Sum, column).await?;
        Ok(v.as_f64().unwrap_or(0.0))
    }

    pub async fn avg(&self, driver: &impl Driver, column: &str) -> OrmResult<Option<f64>> {
        let v = self.aggregate(driver, Aggregate::Avg, column).await?;
        Ok(v.as_f64())
    }

    pub async fn min(&self, driver: &impl Driver, column: &str) -> OrmResult<Option<Value>> {
        let v = self.aggregate(driver, Aggregate::Min, column).await?;
        Ok((!v.is_null()).then_some(v))
    }

    pub async fn max(&self, driver: &impl Driver, column: &str) -> OrmResult<Option<Value>> {
        let v = self.aggregate(driver, Aggregate::Max, column).await?;
        Ok((!v.is_null()).then_some(v))
    }

    /// Rows as a raw [`QueryResult`] (field names and row count included).
    pub async fn fetch_result(&self, driver: &impl Driver) -> OrmResult<QueryResult> {
        let stmt = self.to_sql()?;
        driver.fetch(&stmt).await
    }

    // ==================== Writes ====================

    /// Insert one row. Returns the affected row count.
    pub async fn insert(&self, driver: &impl Driver, row: Row) -> OrmResult<u64> {
        self.insert_many(driver, vec![row]).await
    }

    /// Insert several rows in one statement. An empty batch performs no I/O.
    pub async fn insert_many(&self, driver: &impl Driver, rows: Vec<Row>) -> OrmResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let stmt = self.grammar.compile_insert(&self.to_compiled()?, &rows)?;
        Ok(driver.run(&stmt).await?.affected_rows)
    }

    /// Insert one row and return the generated primary key.
    pub async fn insert_get_id(&self, driver: &impl Driver, row: Row) -> OrmResult<Value> {
        let query = self.to_compiled()?;
        let stmt = self.grammar.compile_insert_get_id(&query, &row)?;

        if self.grammar.supports_returning() {
            let result = driver.fetch(&stmt).await?;
            return result
                .rows
                .into_iter()
                .next()
                .and_then(|mut r| r.take(&query.primary_key))
                .ok_or_else(|| {
                    OrmError::Query(format!("insert into {} returned no key", query.table))
                });
        }

        driver
            .run(&stmt)
            .await?
            .insert_id
            .ok_or_else(|| OrmError::Query(format!("insert into {} reported no id", query.table)))
    }

    /// Insert rows, resolving conflicts on `unique_by` by overwriting `update`
    /// (or ignoring the row when `update` is empty).
    pub async fn upsert(
        &self,
        driver: &impl Driver,
        rows: Vec<Row>,
        unique_by: &[&str],
        update: &[&str],
    ) -> OrmResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let upsert = Upsert {
            unique_by: unique_by.iter().map(|s| s.to_string()).collect(),
            update: update.iter().map(|s| s.to_string()).collect(),
        };
        let stmt = self
            .grammar
            .compile_upsert(&self.to_compiled()?, &rows, &upsert)?;
        Ok(driver.run(&stmt).await?.affected_rows)
    }

    /// Update matching rows with `values`. Returns the affected row count.
    pub async fn update(&self, driver: &impl Driver, values: Row) -> OrmResult<u64> {
        let values: Vec<(String, Value)> = values.into_iter().collect();
        let stmt = self.grammar.compile_update(&self.to_compiled()?, &values)?;
        Ok(driver.run(&stmt).await?.affected_rows)
    }

    /// Delete matching rows.
    ///
    /// A DELETE without WHERE is rejected; use [`QueryBuilder::truncate`] to clear a table.
    pub async fn delete(&self, driver: &impl Driver) -> OrmResult<u64> {
        let query = self.to_compiled()?;
        if query.wheres.is_empty() {
            return Err(OrmError::validation(format!(
                "DELETE on {} without WHERE; use truncate() to clear the table",
                query.table
            )));
        }
        let stmt = self.grammar.compile_delete(&query)?;
        Ok(driver.run(&stmt).await?.affected_rows)
    }

    pub async fn truncate(&self, driver: &impl Driver) -> OrmResult<()> {
        let stmt = self.grammar.compile_truncate(&self.to_compiled()?);
        driver.run(&stmt).await?;
        Ok(())
    }
}
