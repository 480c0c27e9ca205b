use super::{Dialect, Grammar, LateralQuery, Statement, Upsert, UpsertSql, lateral_sql};
use crate::error::{OrmError, OrmResult};
use crate::query::Lock;
use crate::value::Value;

/// PostgreSQL: `$N` placeholders, `"` quoting, `RETURNING`, `ON CONFLICT`, LATERAL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresGrammar;

impl PostgresGrammar {
    /// Element type used to cast the parent-id array.
    fn array_cast(ids: &[Value]) -> &'static str {
        if ids.iter().all(|v| matches!(v, Value::Int(_))) {
            "bigint[]"
        } else if ids.iter().all(|v| matches!(v, Value::Uuid(_))) {
            "uuid[]"
        } else {
            "text[]"
        }
    }
}

impl Grammar for PostgresGrammar {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn supports_lateral(&self) -> bool {
        true
    }

    fn compile_lock(&self, lock: Lock) -> &'static str {
        match lock {
            Lock::ForUpdate => " FOR UPDATE",
            Lock::Shared => " FOR SHARE",
        }
    }

    fn quote_bytes(&self, bytes: &[u8]) -> String {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("'\\x{hex}'::bytea")
    }

    fn compile_upsert_clause(&self, upsert: &Upsert) -> OrmResult<UpsertSql> {
        let target: Vec<String> = upsert
            .unique_by
            .iter()
            .map(|c| self.wrap_identifier(c))
            .collect();
        let target = if target.is_empty() {
            String::new()
        } else {
            format!(" ({})", target.join(", "))
        };

        if upsert.update.is_empty() {
            return Ok(UpsertSql::Suffix(format!(" ON CONFLICT{target} DO NOTHING")));
        }

        if upsert.unique_by.is_empty() {
            return Err(OrmError::validation(
                "ON CONFLICT DO UPDATE requires the unique_by columns",
            ));
        }

        let sets: Vec<String> = upsert
            .update
            .iter()
            .map(|c| {
                let col = self.wrap_identifier(c);
                format!("{col} = EXCLUDED.{col}")
            })
            .collect();
        Ok(UpsertSql::Suffix(format!(
            " ON CONFLICT{target} DO UPDATE SET {}",
            sets.join(", ")
        )))
    }

    fn compile_lateral(&self, spec: &LateralQuery<'_>) -> OrmResult<Statement> {
        // Numeric strings bind as integers so the array compares against a bigint key.
        let spec = LateralQuery {
            parent_ids: spec.parent_ids.iter().map(Value::canonical).collect(),
            ..*spec
        };
        let cast = Self::array_cast(&spec.parent_ids);
        lateral_sql(self, &spec, |ph| format!("unnest({ph}::{cast})"))
    }
}
