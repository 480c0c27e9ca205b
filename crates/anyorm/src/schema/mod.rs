//! Schema Registry.
//!
//! A light collaborator that knows which columns a table has. Column lists come
//! from a [`SchemaSource`] (usually [`DriverSchemaSource`], which introspects the
//! live database), are cached per table, and can be persisted to an on-disk
//! snapshot so a fresh process starts warm.
//!
//! When a statement fails because the database disagrees with what the caller
//! expected (missing table or column), [`SchemaRegistry::with_retry`] refreshes
//! that table once and retries the operation once.

mod introspect;
mod registry;
mod snapshot;

pub use introspect::DriverSchemaSource;
pub use registry::SchemaRegistry;
pub use snapshot::{SchemaSnapshot, SnapshotConfig};

use crate::error::OrmResult;
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default_expr: Option<String>,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// A discrepancy between expected columns and the registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaIssue {
    MissingColumn { table: String, column: String },
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaIssue::MissingColumn { table, column } => {
                write!(f, "column '{column}' not found on table '{table}'")
            }
        }
    }
}

/// Where table metadata comes from.
pub trait SchemaSource: Send + Sync {
    /// Load one table. `Ok(None)` means the table does not exist.
    fn load_table(&self, table: &str) -> impl Future<Output = OrmResult<Option<TableInfo>>> + Send;
}
