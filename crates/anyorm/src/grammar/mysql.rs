use super::{Dialect, Grammar, Upsert, UpsertSql};
use crate::error::OrmResult;
use crate::query::{CompiledQuery, Lock};

/// MySQL: `?` placeholders, backtick quoting, no `RETURNING`, no LATERAL.
///
/// Generated ids come back through the driver's last-insert-id channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlGrammar;

impl Grammar for MySqlGrammar {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn compile_lock(&self, lock: Lock) -> &'static str {
        match lock {
            Lock::ForUpdate => " FOR UPDATE",
            Lock::Shared => " LOCK IN SHARE MODE",
        }
    }

    // LIKE is case-insensitive under the default collations.
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
            // OFFSET is only valid after LIMIT.
            (None, Some(o)) => format!(" LIMIT 18446744073709551615 OFFSET {o}"),
            (None, None) => String::new(),
        }
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\\', "\\\\").replace('\'', "''")
    }

    fn insert_default_values(&self) -> &'static str {
        "() VALUES ()"
    }

    fn compile_upsert_clause(&self, upsert: &Upsert) -> OrmResult<UpsertSql> {
        if upsert.update.is_empty() {
            return Ok(UpsertSql::InsertKeyword("INSERT IGNORE INTO"));
        }
        let sets: Vec<String> = upsert
            .update
            .iter()
            .map(|c| {
                let col = self.wrap_identifier(c);
                format!("{col} = VALUES({col})")
            })
            .collect();
        Ok(UpsertSql::Suffix(format!(
            " ON DUPLICATE KEY UPDATE {}",
            sets.join(", ")
        )))
    }

    fn compile_mutation_limit(&self, query: &CompiledQuery) -> OrmResult<String> {
        Ok(query
            .limit
            .map(|l| format!(" LIMIT {l}"))
            .unwrap_or_default())
    }
}
