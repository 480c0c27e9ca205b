use super::{Dialect, Grammar, Statement, Upsert, UpsertSql};
use crate::error::{OrmError, OrmResult};
use crate::query::{CompiledQuery, Lock};

/// SQLite: `?` placeholders, `"` quoting, `RETURNING`.
///
/// No row locks, no LATERAL, and upserts are rejected at compile time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteGrammar;

impl Grammar for SqliteGrammar {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn compile_lock(&self, _lock: Lock) -> &'static str {
        ""
    }

    fn operator(&self, op: &'static str) -> &'static str {
        match op {
            "ILIKE" => "LIKE",
            "NOT ILIKE" => "NOT LIKE",
            other => other,
        }
    }

    fn compile_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
            (Some(l), None) => format!(" LIMIT {l}"),
            (None, Some(o)) => format!(" LIMIT -1 OFFSET {o}"),
            (None, None) => String::new(),
        }
    }

    fn compile_truncate(&self, query: &CompiledQuery) -> Statement {
        Statement::new(
            format!("DELETE FROM {}", self.wrap_table(&query.table)),
            Vec::new(),
        )
    }

    fn compile_upsert_clause(&self, _upsert: &Upsert) -> OrmResult<UpsertSql> {
        Err(OrmError::unsupported("sqlite", "upsert"))
    }
}
