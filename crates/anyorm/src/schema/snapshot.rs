use super::TableInfo;
use crate::error::{OrmError, OrmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory holding the snapshot (default: `./.anyorm`).
    pub dir: PathBuf,
    /// File name inside `dir` (default: `schema.json`).
    pub file_name: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".anyorm");
        Self {
            dir,
            file_name: "schema.json".to_string(),
        }
    }
}

impl SnapshotConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

/// Serialized registry contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub version: u32,
    pub retrieved_at: DateTime<Utc>,
    pub tables: Vec<TableInfo>,
}

impl SchemaSnapshot {
    pub fn new(mut tables: Vec<TableInfo>) -> Self {
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            version: SNAPSHOT_VERSION,
            retrieved_at: Utc::now(),
            tables,
        }
    }

    /// Read the snapshot. A missing file or an older format yields `Ok(None)`.
    pub fn load(config: &SnapshotConfig) -> OrmResult<Option<Self>> {
        let path = config.path();
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OrmError::Other(format!("{}: {e}", path.display()))),
        };
        let snapshot: SchemaSnapshot = serde_json::from_slice(&data).map_err(|e| {
            OrmError::Serialization(format!("Failed to parse schema snapshot: {e}"))
        })?;
        Ok((snapshot.version == SNAPSHOT_VERSION).then_some(snapshot))
    }

    /// Write through a temporary file and rename, so readers never see a partial file.
    pub fn save(&self, config: &SnapshotConfig) -> OrmResult<()> {
        write_atomic(&config.path(), self)
    }
}

fn write_atomic(path: &Path, snapshot: &SchemaSnapshot) -> OrmResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| OrmError::Other(e.to_string()))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(snapshot).map_err(|e| {
        OrmError::Serialization(format!("Failed to serialize schema snapshot: {e}"))
    })?;

    std::fs::write(&tmp_path, data).map_err(|e| OrmError::Other(e.to_string()))?;
    std::fs::rename(&tmp_path, path).map_err(|e| OrmError::Other(e.to_string()))?;
    Ok(())
}
