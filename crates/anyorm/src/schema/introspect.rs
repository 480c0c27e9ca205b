use super::{ColumnInfo, SchemaSource, TableInfo};
use crate::driver::Driver;
use crate::error::{OrmError, OrmResult};
use crate::grammar::Dialect;
use crate::row::Row;
use crate::value::Value;
use std::sync::Arc;

const POSTGRES_COLUMNS: &str = r#"
SELECT
  column_name,
  data_type,
  is_nullable,
  column_default,
  ordinal_position
FROM information_schema.columns
WHERE table_schema = current_schema()
  AND table_name = $1
ORDER BY ordinal_position
"#;

const MYSQL_COLUMNS: &str = r#"
SELECT
  column_name AS column_name,
  data_type AS data_type,
  is_nullable AS is_nullable,
  column_default AS column_default,
  ordinal_position AS ordinal_position
FROM information_schema.columns
WHERE table_schema = DATABASE()
  AND table_name = ?
ORDER BY ordinal_position
"#;

const SQLITE_COLUMNS: &str = r#"
SELECT
  name AS column_name,
  type AS data_type,
  CASE WHEN "notnull" = 1 THEN 'NO' ELSE 'YES' END AS is_nullable,
  dflt_value AS column_default,
  cid + 1 AS ordinal_position
FROM pragma_table_info(?)
ORDER BY cid
"#;

/// Introspects tables through a [`Driver`], using the catalog of its dialect.
#[derive(Debug)]
pub struct DriverSchemaSource<D> {
    driver: Arc<D>,
}

impl<D> DriverSchemaSource<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }
}

impl<D: Driver> SchemaSource for DriverSchemaSource<D> {
    async fn load_table(&self, table: &str) -> OrmResult<Option<TableInfo>> {
        let sql = match self.driver.grammar().dialect() {
            Dialect::Postgres => POSTGRES_COLUMNS,
            Dialect::MySql => MYSQL_COLUMNS,
            Dialect::Sqlite => SQLITE_COLUMNS,
        };
        let result = self.driver.query(sql, &[Value::from(table)]).await?;
        if result.rows.is_empty() {
            return Ok(None);
        }

        let columns = result
            .rows
            .iter()
            .map(column_from_row)
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(Some(TableInfo {
            name: table.to_string(),
            columns,
        }))
    }
}

fn column_from_row(row: &Row) -> OrmResult<ColumnInfo> {
    let is_nullable: String = row.try_get("is_nullable")?;
    let ordinal: i64 = row.try_get("ordinal_position")?;
    Ok(ColumnInfo {
        name: row.try_get("column_name")?,
        data_type: row.try_get("data_type")?,
        not_null: is_nullable.eq_ignore_ascii_case("NO"),
        default_expr: row.try_get("column_default")?,
        ordinal: i32::try_from(ordinal)
            .map_err(|e| OrmError::decode("ordinal_position", e.to_string()))?,
    })
}
