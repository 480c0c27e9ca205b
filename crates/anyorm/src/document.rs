//! Document-protocol compilation.
//!
//! [`DocumentGrammar`] compiles the same [`CompiledQuery`] the relational grammars
//! consume into a [`DocumentCommand`]: a collection name, an operation, a
//! Mongo-style filter, find options and an optional payload, all as `serde_json`
//! values ready for a document driver.
//!
//! Only constructs with a faithful document equivalent compile. Everything else
//! (nested groups, raw fragments, column comparisons, grouping, distinct, right or
//! cross joins) fails with [`OrmError::UnsupportedConstruct`] before any I/O.
//!
//! The primary-key column is stored as `_id`; filters, sort, projection and
//! payloads are rewritten on the way in, [`DocumentGrammar::map_document`]
//! rewrites it back on the way out.

use crate::driver::QueryResult;
use crate::error::{OrmError, OrmResult};
use crate::grammar::table_reference;
use crate::query::{
    Aggregate, Boolean, CompiledQuery, Direction, JoinKind, OrderClause, SelectColumn,
    WhereClause,
};
use crate::row::Row;
use crate::value::Value;
use serde::Serialize;
use serde_json::{Map, json};
use std::future::Future;

const TARGET: &str = "document";
const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentOperation {
    Find,
    Count,
    InsertMany,
    UpdateMany,
    DeleteMany,
}

/// A `$lookup`-style join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lookup {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    #[serde(rename = "as")]
    pub as_field: String,
    /// Keep documents without a match (LEFT JOIN).
    pub preserve_unmatched: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<serde_json::Value>,
    /// Ordered `(field, 1 | -1)` pairs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<(String, i32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lookups: Vec<Lookup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentCommand {
    pub collection: String,
    pub operation: DocumentOperation,
    pub filter: serde_json::Value,
    pub options: FindOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Executes [`DocumentCommand`]s against a document store.
pub trait DocumentDriver: Send + Sync {
    /// Run one command. Finds return documents as rows; counts and writes
    /// report their number in `row_count`.
    fn run(&self, command: &DocumentCommand) -> impl Future<Output = OrmResult<QueryResult>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentGrammar;

impl DocumentGrammar {
    pub fn compile_find(&self, query: &CompiledQuery) -> OrmResult<DocumentCommand> {
        if query.distinct {
            return Err(OrmError::unsupported(TARGET, "distinct"));
        }
        if !query.groups.is_empty() {
            return Err(OrmError::unsupported(TARGET, "group by"));
        }
        if !query.havings.is_empty() {
            return Err(OrmError::unsupported(TARGET, "having"));
        }
        if query.lock.is_some() {
            return Err(OrmError::unsupported(TARGET, "row lock"));
        }

        let options = FindOptions {
            projection: self.projection(query)?,
            sort: self.sort(query)?,
            limit: query.limit,
            skip: query.offset,
            lookups: self.lookups(query)?,
        };
        Ok(DocumentCommand {
            collection: query.table.clone(),
            operation: DocumentOperation::Find,
            filter: self.compile_filter(query)?,
            options,
            payload: None,
        })
    }

    pub fn compile_count(&self, query: &CompiledQuery) -> OrmResult<DocumentCommand> {
        let mut cmd = self.compile_find(query)?;
        cmd.operation = DocumentOperation::Count;
        cmd.options.projection = None;
        cmd.options.sort.clear();
        Ok(cmd)
    }

    /// Only `COUNT` has a document equivalent.
    pub fn compile_aggregate(
        &self,
        query: &CompiledQuery,
        function: Aggregate,
    ) -> OrmResult<DocumentCommand> {
        match function {
            Aggregate::Count => self.compile_count(query),
            other => Err(OrmError::unsupported(
                TARGET,
                format!("{} aggregate", other.as_sql()),
            )),
        }
    }

    pub fn compile_exists(&self, query: &CompiledQuery) -> OrmResult<DocumentCommand> {
        let mut cmd = self.compile_count(query)?;
        cmd.options.limit = Some(1);
        Ok(cmd)
    }

    pub fn compile_insert(&self, query: &CompiledQuery, rows: &[Row]) -> OrmResult<DocumentCommand> {
        if rows.is_empty() {
            return Err(OrmError::validation("insert requires at least one document"));
        }
        let docs: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| self.document(query, row.iter()))
            .collect();
        Ok(DocumentCommand {
            collection: query.table.clone(),
            operation: DocumentOperation::InsertMany,
            filter: json!({}),
            options: FindOptions::default(),
            payload: Some(serde_json::Value::Array(docs)),
        })
    }

    pub fn compile_update(
        &self,
        query: &CompiledQuery,
        values: &[(String, Value)],
    ) -> OrmResult<DocumentCommand> {
        if values.is_empty() {
            return Err(OrmError::validation("update requires at least one field"));
        }
        if !query.joins.is_empty() {
            return Err(OrmError::unsupported(TARGET, "join in update"));
        }
        let set = self.document(query, values.iter().map(|(k, v)| (k.as_str(), v)));
        Ok(DocumentCommand {
            collection: query.table.clone(),
            operation: DocumentOperation::UpdateMany,
            filter: self.compile_filter(query)?,
            options: FindOptions::default(),
            payload: Some(json!({ "$set": set })),
        })
    }

    pub fn compile_delete(&self, query: &CompiledQuery) -> OrmResult<DocumentCommand> {
        if !query.joins.is_empty() {
            return Err(OrmError::unsupported(TARGET, "join in delete"));
        }
        Ok(DocumentCommand {
            collection: query.table.clone(),
            operation: DocumentOperation::DeleteMany,
            filter: self.compile_filter(query)?,
            options: FindOptions::default(),
            payload: None,
        })
    }

    /// Run a find through `driver`, renaming `_id` back to the primary key.
    pub async fn find(
        &self,
        driver: &impl DocumentDriver,
        query: &CompiledQuery,
    ) -> OrmResult<Vec<Row>> {
        let command = self.compile_find(query)?;
        let result = driver.run(&command).await?;
        Ok(result
            .rows
            .into_iter()
            .map(|row| restore_key(row, &query.primary_key))
            .collect())
    }

    pub async fn count(&self, driver: &impl DocumentDriver, query: &CompiledQuery) -> OrmResult<u64> {
        let result = driver.run(&self.compile_count(query)?).await?;
        Ok(result.row_count as u64)
    }

    /// Convert a returned document into a row, renaming `_id` to the primary key.
    pub fn map_document(&self, document: serde_json::Value, primary_key: &str) -> Row {
        let mut row = Row::new();
        if let serde_json::Value::Object(map) = document {
            for (field, value) in map {
                let column = if field == ID_FIELD {
                    primary_key.to_string()
                } else {
                    field
                };
                row.push(column, Value::from_json(value));
            }
        }
        row
    }

    // ==================== Filter ====================

    /// Top-level OR splits the clause list into conjunctions.
    pub fn compile_filter(&self, query: &CompiledQuery) -> OrmResult<serde_json::Value> {
        let mut conjunctions: Vec<Vec<serde_json::Value>> = Vec::new();
        for (i, clause) in query.wheres.iter().enumerate() {
            if i == 0 || clause.boolean() == Boolean::Or {
                conjunctions.push(Vec::new());
            }
            let condition = self.condition(query, clause)?;
            if let Some(current) = conjunctions.last_mut() {
                current.push(condition);
            }
        }

        let mut branches: Vec<serde_json::Value> =
            conjunctions.into_iter().map(merge_conjunction).collect();
        Ok(match branches.len() {
            0 => json!({}),
            1 => branches.remove(0),
            _ => json!({ "$or": branches }),
        })
    }

    fn condition(&self, query: &CompiledQuery, clause: &WhereClause) -> OrmResult<serde_json::Value> {
        let (field, predicate) = match clause {
            WhereClause::Basic {
                column,
                operator,
                value,
                ..
            } => {
                let v = value.to_json();
                let predicate = match *operator {
                    "=" => v,
                    "!=" | "<>" => json!({ "$ne": v }),
                    ">" => json!({ "$gt": v }),
                    ">=" => json!({ "$gte": v }),
                    "<" => json!({ "$lt": v }),
                    "<=" => json!({ "$lte": v }),
                    "LIKE" | "ILIKE" | "NOT LIKE" | "NOT ILIKE" => {
                        let pattern = value.as_str().ok_or_else(|| {
                            OrmError::unsupported(TARGET, "LIKE with a non-string pattern")
                        })?;
                        let flags = if operator.contains("ILIKE") { "i" } else { "" };
                        let regex = json!({ "$regex": like_to_regex(pattern), "$options": flags });
                        if operator.starts_with("NOT") {
                            json!({ "$not": regex })
                        } else {
                            regex
                        }
                    }
                    other => {
                        return Err(OrmError::unsupported(TARGET, format!("operator {other}")));
                    }
                };
                (column, predicate)
            }
            WhereClause::In {
                column,
                values,
                not,
                ..
            } => {
                let list: Vec<serde_json::Value> = values.iter().map(Value::to_json).collect();
                let op = if *not { "$nin" } else { "$in" };
                (column, json!({ op: list }))
            }
            WhereClause::Null { column, not, .. } => (column, json!({ "$exists": *not })),
            WhereClause::Between {
                column, range, not, ..
            } => {
                let bounds = json!({ "$gte": range[0].to_json(), "$lte": range[1].to_json() });
                if *not {
                    (column, json!({ "$not": bounds }))
                } else {
                    (column, bounds)
                }
            }
            WhereClause::Raw { .. } => return Err(OrmError::unsupported(TARGET, "raw where")),
            WhereClause::Nested { .. } => {
                return Err(OrmError::unsupported(TARGET, "nested where group"));
            }
            WhereClause::Column { .. } => {
                return Err(OrmError::unsupported(TARGET, "column comparison"));
            }
        };

        let mut map = Map::new();
        map.insert(self.field(query, field), predicate);
        Ok(serde_json::Value::Object(map))
    }

    // ==================== Options ====================

    fn projection(&self, query: &CompiledQuery) -> OrmResult<Option<serde_json::Value>> {
        let mut fields = Map::new();
        for column in &query.columns {
            match column {
                SelectColumn::Column(name) if name == "*" => return Ok(None),
                SelectColumn::Column(name) => {
                    fields.insert(self.field(query, name), json!(1));
                }
                SelectColumn::Raw { .. } => {
                    return Err(OrmError::unsupported(TARGET, "raw select"));
                }
            }
        }
        Ok((!fields.is_empty()).then_some(serde_json::Value::Object(fields)))
    }

    fn sort(&self, query: &CompiledQuery) -> OrmResult<Vec<(String, i32)>> {
        query
            .orders
            .iter()
            .map(|order| match order {
                OrderClause::Column { column, direction } => {
                    let dir = match direction {
                        Direction::Asc => 1,
                        Direction::Desc => -1,
                    };
                    Ok((self.field(query, column), dir))
                }
                OrderClause::Raw { .. } => Err(OrmError::unsupported(TARGET, "raw order")),
            })
            .collect()
    }

    fn lookups(&self, query: &CompiledQuery) -> OrmResult<Vec<Lookup>> {
        let base = table_reference(&query.table);
        query
            .joins
            .iter()
            .map(|join| {
                let preserve_unmatched = match join.kind {
                    JoinKind::Inner => false,
                    JoinKind::Left => true,
                    JoinKind::Right => return Err(OrmError::unsupported(TARGET, "right join")),
                    JoinKind::Cross => return Err(OrmError::unsupported(TARGET, "cross join")),
                };
                let on = join
                    .on
                    .as_ref()
                    .ok_or_else(|| OrmError::unsupported(TARGET, "join without condition"))?;
                if on.operator != "=" {
                    return Err(OrmError::unsupported(TARGET, "non-equality join"));
                }

                let joined = table_reference(&join.table);
                let (local, foreign) = if qualifier(&on.first) == Some(joined) {
                    (&on.second, &on.first)
                } else {
                    (&on.first, &on.second)
                };
                if qualifier(local).is_some_and(|q| q != base) {
                    return Err(OrmError::unsupported(TARGET, "join on a joined collection"));
                }

                Ok(Lookup {
                    from: table_name(&join.table).to_string(),
                    local_field: self.field(query, local),
                    foreign_field: id_or(unqualify(foreign)),
                    as_field: joined.to_string(),
                    preserve_unmatched,
                })
            })
            .collect()
    }

    // ==================== Field mapping ====================

    /// Document field for a column: own-table qualifiers are dropped, the primary
    /// key becomes `_id`, columns of joined collections stay dotted paths.
    fn field(&self, query: &CompiledQuery, column: &str) -> String {
        let base = table_reference(&query.table);
        let bare = match column.split_once('.') {
            Some((qualifier, rest)) if qualifier == base || qualifier == table_name(&query.table) => rest,
            Some(_) => return column.to_string(),
            None => column,
        };
        if bare == query.primary_key {
            ID_FIELD.to_string()
        } else {
            bare.to_string()
        }
    }

    fn document<'r>(
        &self,
        query: &CompiledQuery,
        fields: impl Iterator<Item = (&'r str, &'r Value)>,
    ) -> serde_json::Value {
        let mut map = Map::new();
        for (column, value) in fields {
            map.insert(self.field(query, column), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

fn restore_key(mut row: Row, primary_key: &str) -> Row {
    if let Some(id) = row.take(ID_FIELD) {
        row.push(primary_key, id);
    }
    row
}

/// Merge a conjunction into one object when every field is distinct.
fn merge_conjunction(conditions: Vec<serde_json::Value>) -> serde_json::Value {
    let mut merged = Map::new();
    let mut collided = false;
    for condition in &conditions {
        if let serde_json::Value::Object(map) = condition {
            for (k, v) in map {
                if merged.insert(k.clone(), v.clone()).is_some() {
                    collided = true;
                }
            }
        }
    }
    if collided {
        json!({ "$and": conditions })
    } else {
        serde_json::Value::Object(merged)
    }
}

/// Anchored regular expression for a SQL LIKE pattern.
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out.push('$');
    out
}

fn qualifier(column: &str) -> Option<&str> {
    column.split_once('.').map(|(q, _)| q)
}

fn unqualify(column: &str) -> &str {
    column.split_once('.').map(|(_, c)| c).unwrap_or(column)
}

fn table_name(table: &str) -> &str {
    table.split_whitespace().next().unwrap_or(table)
}

fn id_or(field: &str) -> String {
    if field == "id" {
        ID_FIELD.to_string()
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueryBuilder;
    use crate::grammar::Dialect;

    fn q(table: &str) -> QueryBuilder {
        QueryBuilder::new(Dialect::Postgres.grammar(), table)
    }

    #[test]
    fn operators_fold_into_filter() {
        let compiled = q("users")
            .where_eq("status", "active")
            .where_op("age", ">=", 18)
            .where_in("role", vec!["admin", "staff"])
            .where_not_null("email")
            .where_between("score", 10, 20)
            .where_op("name", "like", "Jo_n%")
            .to_compiled()
            .unwrap();
        let cmd = DocumentGrammar.compile_find(&compiled).unwrap();
        assert_eq!(cmd.operation, DocumentOperation::Find);
        assert_eq!(
            cmd.filter,
            json!({
                "status": "active",
                "age": { "$gte": 18 },
                "role": { "$in": ["admin", "staff"] },
                "email": { "$exists": true },
                "score": { "$gte": 10, "$lte": 20 },
                "name": { "$regex": "^Jo.n.*$", "$options": "" },
            })
        );
    }

    #[test]
    fn single_or_level_becomes_or_of_conjunctions() {
        let compiled = q("t")
            .where_eq("a", 1)
            .where_eq("b", 2)
            .or_where_eq("c", 3)
            .to_compiled()
            .unwrap();
        let cmd = DocumentGrammar.compile_find(&compiled).unwrap();
        assert_eq!(cmd.filter, json!({ "$or": [{ "a": 1, "b": 2 }, { "c": 3 }] }));
    }

    #[test]
    fn repeated_field_uses_and() {
        let compiled = q("t")
            .where_op("age", ">", 1)
            .where_op("age", "<", 9)
            .to_compiled()
            .unwrap();
        let cmd = DocumentGrammar.compile_find(&compiled).unwrap();
        assert_eq!(
            cmd.filter,
            json!({ "$and": [{ "age": { "$gt": 1 } }, { "age": { "$lt": 9 } }] })
        );
    }

    #[test]
    fn nested_groups_are_a_compile_error() {
        let compiled = q("t")
            .where_eq("a", 1)
            .where_group(|g| g.where_eq("b", 2).or_where_eq("c", 3))
            .to_compiled()
            .unwrap();
        let err = DocumentGrammar.compile_find(&compiled).unwrap_err();
        assert!(matches!(
            err,
            OrmError::UnsupportedConstruct { target: "document", .. }
        ));
    }

    #[test]
    fn unsupported_constructs() {
        let raw = q("t").where_raw("a = ?", vec![Value::Int(1)]).to_compiled().unwrap();
        assert!(DocumentGrammar.compile_find(&raw).is_err());

        let grouped = q("t").group_by(&["a"]).to_compiled().unwrap();
        assert!(DocumentGrammar.compile_find(&grouped).is_err());

        let right = q("t")
            .right_join("u", "u.id", "=", "t.u_id")
            .to_compiled()
            .unwrap();
        assert!(DocumentGrammar.compile_find(&right).is_err());

        let sum = q("t").to_compiled().unwrap();
        assert!(DocumentGrammar.compile_aggregate(&sum, Aggregate::Sum).is_err());
    }

    #[test]
    fn primary_key_maps_to_id_everywhere() {
        let compiled = q("users")
            .select(&["id", "users.name"])
            .where_in("users.id", vec![1, 2])
            .order_by_desc("id")
            .limit(5)
            .to_compiled()
            .unwrap();
        let cmd = DocumentGrammar.compile_find(&compiled).unwrap();
        assert_eq!(cmd.filter, json!({ "_id": { "$in": [1, 2] } }));
        assert_eq!(cmd.options.projection, Some(json!({ "_id": 1, "name": 1 })));
        assert_eq!(cmd.options.sort, vec![("_id".to_string(), -1)]);
        assert_eq!(cmd.options.limit, Some(5));

        let row = DocumentGrammar.map_document(json!({ "_id": 7, "name": "x" }), "id");
        assert_eq!(row.get("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn equality_joins_become_lookups() {
        let compiled = q("posts")
            .left_join("users as author", "author.id", "=", "posts.user_id")
            .to_compiled()
            .unwrap();
        let cmd = DocumentGrammar.compile_find(&compiled).unwrap();
        assert_eq!(
            cmd.options.lookups,
            vec![Lookup {
                from: "users".into(),
                local_field: "user_id".into(),
                foreign_field: "_id".into(),
                as_field: "author".into(),
                preserve_unmatched: true,
            }]
        );
    }

    struct FakeStore {
        seen: std::sync::Mutex<Vec<DocumentCommand>>,
    }

    impl DocumentDriver for FakeStore {
        async fn run(&self, command: &DocumentCommand) -> OrmResult<QueryResult> {
            self.seen
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(command.clone());
            let docs = vec![
                DocumentGrammar.map_document(json!({ "_id": 1, "name": "a" }), ID_FIELD),
                DocumentGrammar.map_document(json!({ "_id": 2, "name": "b" }), ID_FIELD),
            ];
            Ok(QueryResult::from_rows(docs))
        }
    }

    #[tokio::test]
    async fn find_and_count_run_through_the_driver() {
        let store = FakeStore {
            seen: std::sync::Mutex::new(Vec::new()),
        };
        let compiled = q("users")
            .primary_key("user_id")
            .where_eq("active", true)
            .to_compiled()
            .unwrap();

        let rows = DocumentGrammar.find(&store, &compiled).await.unwrap();
        assert_eq!(rows[0].get("user_id"), Some(&Value::Int(1)));
        assert!(rows[0].get("_id").is_none());
        assert_eq!(DocumentGrammar.count(&store, &compiled).await.unwrap(), 2);

        let seen = store.seen.lock().unwrap();
        assert_eq!(seen[0].operation, DocumentOperation::Find);
        assert_eq!(seen[1].operation, DocumentOperation::Count);
        assert_eq!(seen[1].filter, json!({ "active": true }));
    }

    #[test]
    fn writes_carry_payloads() {
        let compiled = q("users").where_eq("id", 3).to_compiled().unwrap();
        let cmd = DocumentGrammar
            .compile_update(&compiled, &[("name".into(), Value::from("z"))])
            .unwrap();
        assert_eq!(cmd.operation, DocumentOperation::UpdateMany);
        assert_eq!(cmd.filter, json!({ "_id": 3 }));
        assert_eq!(cmd.payload, Some(json!({ "$set": { "name": "z" } })));

        let insert = DocumentGrammar
            .compile_insert(&compiled, &[Row::from_pairs([("id", 9i64)])])
            .unwrap();
        assert_eq!(insert.payload, Some(json!([{ "_id": 9 }])));

        let delete = DocumentGrammar.compile_delete(&compiled).unwrap();
        assert_eq!(delete.operation, DocumentOperation::DeleteMany);
    }
}
