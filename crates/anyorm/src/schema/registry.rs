use super::{SchemaIssue, SchemaSnapshot, SchemaSource, SnapshotConfig, TableInfo};
use crate::error::{OrmError, OrmResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Per-table metadata cache in front of a [`SchemaSource`].
#[derive(Debug)]
pub struct SchemaRegistry<S> {
    source: S,
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
    snapshot: Option<SnapshotConfig>,
}

impl<S: SchemaSource> SchemaRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            tables: RwLock::new(HashMap::new()),
            snapshot: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Persist the registry to `config` after every refresh.
    pub fn with_snapshot(mut self, config: SnapshotConfig) -> Self {
        self.snapshot = Some(config);
        self
    }

    /// Warm the cache from the configured snapshot. Returns the number of tables loaded.
    pub fn load_snapshot(&self) -> OrmResult<usize> {
        let Some(config) = &self.snapshot else {
            return Ok(0);
        };
        let Some(snapshot) = SchemaSnapshot::load(config)? else {
            return Ok(0);
        };
        let count = snapshot.tables.len();
        let mut tables = self.write();
        for table in snapshot.tables {
            tables.insert(table.name.clone(), Arc::new(table));
        }
        tracing::info!(
            target: "anyorm.schema",
            tables = count,
            retrieved_at = %snapshot.retrieved_at,
            "schema snapshot loaded"
        );
        Ok(count)
    }

    /// Cached table metadata, loading it from the source on a miss.
    pub async fn get(&self, table: &str) -> OrmResult<Arc<TableInfo>> {
        if let Some(info) = self.cached(table) {
            return Ok(info);
        }
        self.refresh(table).await
    }

    pub fn cached(&self, table: &str) -> Option<Arc<TableInfo>> {
        self.read().get(table).cloned()
    }

    /// Drop one table from the cache; the next `get` reloads it.
    pub fn invalidate(&self, table: &str) {
        self.write().remove(table);
    }

    pub fn invalidate_all(&self) {
        self.write().clear();
    }

    /// Reload one table from the source.
    pub async fn refresh(&self, table: &str) -> OrmResult<Arc<TableInfo>> {
        let loaded = self.source.load_table(table).await?;
        let Some(info) = loaded else {
            self.invalidate(table);
            return Err(OrmError::TableNotFound(table.to_string()));
        };

        let info = Arc::new(info);
        self.write().insert(table.to_string(), info.clone());
        tracing::info!(
            target: "anyorm.schema",
            table,
            columns = info.columns.len(),
            "schema refreshed"
        );
        self.persist();
        Ok(info)
    }

    /// Register metadata without consulting the source.
    pub fn register_table(&self, info: TableInfo) {
        self.write().insert(info.name.clone(), Arc::new(info));
    }

    /// Columns in `expected` that the table does not have.
    pub async fn check_columns(&self, table: &str, expected: &[&str]) -> OrmResult<Vec<SchemaIssue>> {
        let info = self.get(table).await?;
        Ok(expected
            .iter()
            .filter(|column| !info.has_column(column))
            .map(|column| SchemaIssue::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
            .collect())
    }

    /// Run `op`; on a schema mismatch refresh `table` and run it exactly once more.
    pub async fn with_retry<T, F, Fut>(&self, table: &str, mut op: F) -> OrmResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OrmResult<T>>,
    {
        match op().await {
            Err(err) if err.is_schema_mismatch() => {
                tracing::warn!(
                    target: "anyorm.schema",
                    table,
                    error = %err,
                    "schema mismatch, refreshing and retrying once"
                );
                self.refresh(table).await?;
                op().await
            }
            other => other,
        }
    }

    pub fn snapshot(&self) -> SchemaSnapshot {
        let tables = self.read().values().map(|t| t.as_ref().clone()).collect();
        SchemaSnapshot::new(tables)
    }

    fn persist(&self) {
        let Some(config) = &self.snapshot else {
            return;
        };
        if let Err(err) = self.snapshot().save(config) {
            tracing::warn!(
                target: "anyorm.schema",
                path = %config.path().display(),
                error = %err,
                "failed to write schema snapshot"
            );
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TableInfo>>> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<TableInfo>>> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }
}
