//! Dialect-aware SQL compilation.
//!
//! A [`Grammar`] turns a [`CompiledQuery`] into a [`Statement`]: SQL text plus the
//! binding list in exactly the order its placeholders appear.
//!
//! The structural algorithm (clause ordering, binding-offset threading, nested
//! group rendering) lives in the provided trait methods. Dialects only supply the
//! leaves: identifier quoting, placeholder syntax, generated-id retrieval, upsert,
//! locking and the LATERAL per-parent path.
//!
//! # Binding offsets
//!
//! Every clause compiler takes the number of bindings already emitted and returns
//! a [`Fragment`] holding its text and the bindings it consumed. The caller adds
//! `fragment.bindings.len()` to the running offset before compiling the next
//! section. With numbered placeholders (`$1, $2, ...`) the offset is embedded in
//! the text, with anonymous placeholders (`?`) it only preserves order.
//!
//! ```ignore
//! use anyorm::grammar::{Dialect, Grammar, PostgresGrammar};
//! use anyorm::QueryBuilder;
//!
//! let q = QueryBuilder::new(Dialect::Postgres.grammar(), "users")
//!     .where_eq("status", "active")
//!     .where_in("id", vec![1, 2]);
//! let stmt = PostgresGrammar.compile_select(&q.to_compiled()?)?;
//! assert_eq!(
//!     stmt.sql,
//!     r#"SELECT * FROM "users" WHERE "status" = $1 AND "id" IN ($2, $3)"#
//! );
//! ```

mod mysql;
mod postgres;
mod sqlite;

#[cfg(test)]
mod tests;

pub use mysql::MySqlGrammar;
pub use postgres::PostgresGrammar;
pub use sqlite::SqliteGrammar;

use crate::error::{OrmError, OrmResult};
use crate::query::{
    Aggregate, CompiledQuery, HavingClause, JoinClause, Lock, OrderClause, SelectColumn,
    WhereClause,
};
use crate::row::Row;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Name of the column that tags each row of a lateral result with its parent id.
pub const LATERAL_PARENT_COLUMN: &str = "__parent_key";

/// Supported relational dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Shared grammar instance for this dialect.
    pub fn grammar(self) -> Arc<dyn Grammar> {
        match self {
            Dialect::Postgres => Arc::new(PostgresGrammar),
            Dialect::MySql => Arc::new(MySqlGrammar),
            Dialect::Sqlite => Arc::new(SqliteGrammar),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An executable statement: SQL text and its ordered bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub bindings: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            bindings,
        }
    }
}

/// Rendered clause text plus the bindings it consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub bindings: Vec<Value>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Conflict handling for upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    /// Columns of the unique constraint (Postgres `ON CONFLICT` target).
    pub unique_by: Vec<String>,
    /// Columns to overwrite on conflict. Empty means "ignore the conflicting row".
    pub update: Vec<String>,
}

/// Input for the lateral "top N children per parent" path.
#[derive(Debug, Clone)]
pub struct LateralQuery<'a> {
    /// The relation query with its own wheres/order/limit/offset.
    pub relation: &'a CompiledQuery,
    /// Column on the related table correlated against each parent id.
    pub foreign_key: &'a str,
    /// Distinct parent ids, bound as one array parameter.
    pub parent_ids: Vec<Value>,
}

/// How placeholders are rendered by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// The dialect's own placeholder (`$N` or `?`).
    Dialect,
    /// A neutral `?` marker, resolved later (nested groups).
    Marker,
    /// Values inlined as literals (debug output only).
    Inline,
}

/// Tracks bindings while one statement is walked.
struct Emitter<'g, G: Grammar + ?Sized> {
    grammar: &'g G,
    mode: Mode,
    offset: usize,
    bindings: Vec<Value>,
}

impl<'g, G: Grammar + ?Sized> Emitter<'g, G> {
    fn new(grammar: &'g G, mode: Mode, offset: usize) -> Self {
        Self {
            grammar,
            mode,
            offset,
            bindings: Vec::new(),
        }
    }

    fn bind(&mut self, value: &Value) -> String {
        self.bindings.push(value.clone());
        match self.mode {
            Mode::Dialect => self.grammar.placeholder(self.offset + self.bindings.len()),
            Mode::Marker => "?".to_string(),
            Mode::Inline => self.grammar.quote_value(value),
        }
    }

    /// Replace `?` markers in `sql` with placeholders for `values`, in order.
    fn substitute(&mut self, sql: &str, values: &[Value]) -> String {
        let mut out = String::with_capacity(sql.len() + values.len() * 2);
        let mut remaining = values.iter();
        let mut quotes = QuoteState::default();
        for ch in sql.chars() {
            if !quotes.is_marker(ch) {
                out.push(ch);
                continue;
            }
            match remaining.next() {
                Some(v) => {
                    let ph = self.bind(v);
                    out.push_str(&ph);
                }
                None => out.push(ch),
            }
        }
        out
    }

    fn finish(self, sql: String) -> Fragment {
        Fragment {
            sql,
            bindings: self.bindings,
        }
    }
}

/// Quote tracking for marker scans: string literals and quoted identifiers
/// (`"`, `` ` ``) are opaque until the same quote closes them.
#[derive(Default)]
struct QuoteState(Option<char>);

impl QuoteState {
    /// Feed one character; true for a `?` outside every quoted span.
    fn is_marker(&mut self, ch: char) -> bool {
        match (self.0, ch) {
            (None, '\'' | '"' | '`') => {
                self.0 = Some(ch);
                false
            }
            (Some(open), _) if ch == open => {
                self.0 = None;
                false
            }
            (None, '?') => true,
            _ => false,
        }
    }
}

/// Count the `?` markers outside quoted strings and quoted identifiers.
pub fn count_markers(sql: &str) -> usize {
    let mut quotes = QuoteState::default();
    sql.chars().filter(|ch| quotes.is_marker(*ch)).count()
}

/// The dialect contract.
///
/// Implementors provide the leaves; the compile methods are shared.
pub trait Grammar: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Character used to quote identifiers.
    fn quote_char(&self) -> char;

    /// Placeholder for the 1-based binding `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Whether `INSERT ... RETURNING` is available for generated ids.
    fn supports_returning(&self) -> bool;

    /// Whether correlated LATERAL subqueries are available.
    fn supports_lateral(&self) -> bool {
        false
    }

    /// Row lock suffix, including the leading space. Empty when unsupported.
    fn compile_lock(&self, lock: Lock) -> &'static str;

    /// Dialect spelling of a (normalized) comparison operator.
    fn operator(&self, op: &'static str) -> &'static str {
        op
    }

    /// `LIMIT`/`OFFSET` suffix, including the leading space.
    fn compile_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Escape a string literal body (without the surrounding quotes).
    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Literal for a byte string.
    fn quote_bytes(&self, bytes: &[u8]) -> String {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("X'{hex}'")
    }

    /// `INSERT` body used when a row has no columns.
    fn insert_default_values(&self) -> &'static str {
        "DEFAULT VALUES"
    }

    fn compile_truncate(&self, query: &CompiledQuery) -> Statement {
        Statement::new(
            format!("TRUNCATE TABLE {}", self.wrap_table(&query.table)),
            Vec::new(),
        )
    }

    /// Conflict clause appended to an insert; dialects without upsert support error.
    fn compile_upsert_clause(&self, upsert: &Upsert) -> OrmResult<UpsertSql>;

    /// `LIMIT` suffix for UPDATE/DELETE. Only some dialects accept one.
    fn compile_mutation_limit(&self, query: &CompiledQuery) -> OrmResult<String> {
        match query.limit {
            None => Ok(String::new()),
            Some(_) => Err(OrmError::validation(format!(
                "{} does not support LIMIT on UPDATE/DELETE",
                self.dialect()
            ))),
        }
    }

    /// Compile the lateral "top N per parent" statement.
    fn compile_lateral(&self, spec: &LateralQuery<'_>) -> OrmResult<Statement> {
        let _ = spec;
        Err(OrmError::LateralUnsupported(self.dialect().as_str()))
    }

    // ==================== Identifiers & literals ====================

    /// Quote a single identifier segment.
    fn wrap_identifier(&self, ident: &str) -> String {
        if ident == "*" {
            return ident.to_string();
        }
        let q = self.quote_char();
        let doubled: String = [q, q].iter().collect();
        format!("{q}{}{q}", ident.replace(q, &doubled))
    }

    /// Quote a column reference.
    ///
    /// Handles `table.column`, `column as alias` and `*`. Expressions containing a
    /// parenthesis (`COUNT(*)`, `LOWER(name)`) are emitted unchanged.
    fn wrap_column(&self, column: &str) -> String {
        let column = column.trim();
        if column.contains('(') {
            return column.to_string();
        }
        if let Some((expr, alias)) = split_alias(column) {
            return format!(
                "{} AS {}",
                self.wrap_column(expr),
                self.wrap_identifier(alias)
            );
        }
        column
            .split('.')
            .map(|segment| self.wrap_identifier(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a table reference, including `table as alias` / `table alias`.
    fn wrap_table(&self, table: &str) -> String {
        let table = table.trim();
        if let Some((name, alias)) = split_alias(table) {
            return format!("{} AS {}", self.wrap_column(name), self.wrap_identifier(alias));
        }
        self.wrap_column(table)
    }

    /// Render a value as an SQL literal.
    fn quote_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Text(s) => format!("'{}'", self.escape_string(s)),
            Value::Bytes(b) => self.quote_bytes(b),
            Value::Json(j) => format!("'{}'", self.escape_string(&j.to_string())),
            Value::Uuid(u) => format!("'{u}'"),
            Value::Timestamp(t) => format!("'{}'", t.to_rfc3339()),
            Value::Array(items) => format!(
                "({})",
                items
                    .iter()
                    .map(|v| self.quote_value(v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    // ==================== Clause compilers ====================

    /// Compile a WHERE clause list (without the `WHERE` keyword), starting after
    /// `offset` already-emitted bindings.
    fn compile_wheres(&self, wheres: &[WhereClause], offset: usize) -> Fragment {
        let mut e = Emitter::new(self, Mode::Dialect, offset);
        let sql = where_list(&mut e, wheres);
        e.finish(sql)
    }

    /// Compile a WHERE list into a fragment with neutral `?` markers.
    ///
    /// Used when a nested group is closed: the fragment is stored on the parent
    /// builder and its markers are numbered when the parent is compiled.
    fn compile_where_fragment(&self, wheres: &[WhereClause]) -> Fragment {
        let mut e = Emitter::new(self, Mode::Marker, 0);
        let sql = where_list(&mut e, wheres);
        e.finish(sql)
    }

    /// Compile a HAVING clause list (without the keyword).
    fn compile_havings(&self, havings: &[HavingClause], offset: usize) -> Fragment {
        let mut e = Emitter::new(self, Mode::Dialect, offset);
        let sql = having_list(&mut e, havings);
        e.finish(sql)
    }

    // ==================== Statements ====================

    fn compile_select(&self, query: &CompiledQuery) -> OrmResult<Statement> {
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let sql = select_sql(&mut e, query);
        Ok(Statement::new(sql, e.bindings))
    }

    /// The SELECT with every binding inlined as a literal. For logs and debugging only.
    fn compile_select_inline(&self, query: &CompiledQuery) -> String {
        let mut e = Emitter::new(self, Mode::Inline, 0);
        select_sql(&mut e, query)
    }

    fn compile_insert(&self, query: &CompiledQuery, rows: &[Row]) -> OrmResult<Statement> {
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let sql = insert_sql(&mut e, query, rows)?;
        Ok(Statement::new(sql, e.bindings))
    }

    /// INSERT that yields the generated primary key.
    ///
    /// With `RETURNING` support the statement returns the key column; otherwise it is
    /// a plain insert and the driver's last-insert-id channel carries the key.
    fn compile_insert_get_id(&self, query: &CompiledQuery, values: &Row) -> OrmResult<Statement> {
        let mut stmt = self.compile_insert(query, std::slice::from_ref(values))?;
        if self.supports_returning() {
            stmt.sql.push_str(" RETURNING ");
            stmt.sql.push_str(&self.wrap_column(&query.primary_key));
        }
        Ok(stmt)
    }

    fn compile_upsert(
        &self,
        query: &CompiledQuery,
        rows: &[Row],
        upsert: &Upsert,
    ) -> OrmResult<Statement> {
        let clause = self.compile_upsert_clause(upsert)?;
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let body = insert_sql(&mut e, query, rows)?;
        let sql = match clause {
            UpsertSql::Suffix(suffix) => format!("{body}{suffix}"),
            UpsertSql::InsertKeyword(keyword) => {
                body.replacen("INSERT INTO", keyword, 1)
            }
        };
        Ok(Statement::new(sql, e.bindings))
    }

    /// UPDATE: SET bindings first, WHERE bindings continue at `SET count + 1`.
    fn compile_update(
        &self,
        query: &CompiledQuery,
        values: &[(String, Value)],
    ) -> OrmResult<Statement> {
        if values.is_empty() {
            return Err(OrmError::validation("UPDATE requires at least one SET column"));
        }
        reject_joins(self, query, "UPDATE")?;

        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let sets: Vec<String> = values
            .iter()
            .map(|(column, value)| {
                let ph = e.bind(value);
                format!("{} = {}", self.wrap_identifier(unqualified(column)), ph)
            })
            .collect();

        let mut sql = format!("UPDATE {} SET {}", self.wrap_table(&query.table), sets.join(", "));
        let wheres = where_list(&mut e, &query.wheres);
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres);
        }
        sql.push_str(&self.compile_mutation_limit(query)?);
        Ok(Statement::new(sql, e.bindings))
    }

    fn compile_delete(&self, query: &CompiledQuery) -> OrmResult<Statement> {
        reject_joins(self, query, "DELETE")?;
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let mut sql = format!("DELETE FROM {}", self.wrap_table(&query.table));
        let wheres = where_list(&mut e, &query.wheres);
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres);
        }
        sql.push_str(&self.compile_mutation_limit(query)?);
        Ok(Statement::new(sql, e.bindings))
    }

    /// `SELECT FUNC(column) AS aggregate ...`, independent of the selected columns.
    ///
    /// Grouped, distinct or paginated queries are wrapped in a derived table so the
    /// aggregate sees the same rows the plain select would return.
    fn compile_aggregate(
        &self,
        query: &CompiledQuery,
        function: Aggregate,
        column: &str,
    ) -> OrmResult<Statement> {
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let alias = self.wrap_identifier("aggregate");

        let sql = if !query.groups.is_empty() || query.distinct || query.is_paginated() {
            let mut inner = query.clone();
            inner.lock = None;
            if !query.groups.is_empty() && inner.columns.iter().all(SelectColumn::is_star) {
                inner.columns = query.groups.iter().cloned().map(SelectColumn::Column).collect();
            }
            let inner_sql = select_sql(&mut e, &inner);
            let target = if column == "*" {
                "*".to_string()
            } else {
                self.wrap_identifier(unqualified(column))
            };
            format!(
                "SELECT {}({}) AS {} FROM ({}) AS {}",
                function.as_sql(),
                target,
                alias,
                inner_sql,
                self.wrap_identifier("__agg")
            )
        } else {
            let mut sql = format!(
                "SELECT {}({}) AS {} FROM {}",
                function.as_sql(),
                self.wrap_column(column),
                alias,
                self.wrap_table(&query.table)
            );
            sql.push_str(&joins_sql(self, &query.joins));
            let wheres = where_list(&mut e, &query.wheres);
            if !wheres.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&wheres);
            }
            sql
        };
        Ok(Statement::new(sql, e.bindings))
    }

    fn compile_exists(&self, query: &CompiledQuery) -> OrmResult<Statement> {
        let mut e = Emitter::new(self, Mode::Dialect, 0);
        let inner = select_sql(&mut e, query);
        Ok(Statement::new(
            format!("SELECT EXISTS({}) AS {}", inner, self.wrap_identifier("exists")),
            e.bindings,
        ))
    }
}

/// How a dialect expresses conflict handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertSql {
    /// Appended after the VALUES list.
    Suffix(String),
    /// Replaces the leading `INSERT INTO` (e.g. `INSERT IGNORE INTO`).
    InsertKeyword(&'static str),
}

// ==================== Shared walkers ====================

fn split_alias(expr: &str) -> Option<(&str, &str)> {
    let lower = expr.to_ascii_lowercase();
    if let Some(pos) = lower.find(" as ") {
        return Some((expr[..pos].trim(), expr[pos + 4..].trim()));
    }
    let mut parts = expr.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(alias), None) => Some((name, alias)),
        _ => None,
    }
}

/// Last segment of a dotted reference.
pub(crate) fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

/// Alias of a table reference (`posts as p` -> `p`), or the table itself.
pub(crate) fn table_reference(table: &str) -> &str {
    match split_alias(table.trim()) {
        Some((_, alias)) => alias,
        None => table.trim(),
    }
}

fn reject_joins<G: Grammar + ?Sized>(g: &G, query: &CompiledQuery, verb: &str) -> OrmResult<()> {
    if query.joins.is_empty() {
        Ok(())
    } else {
        Err(OrmError::validation(format!(
            "{} does not support JOIN in {verb} statements",
            g.dialect()
        )))
    }
}

fn where_clause<G: Grammar + ?Sized>(e: &mut Emitter<'_, G>, clause: &WhereClause) -> String {
    let g = e.grammar;
    match clause {
        WhereClause::Basic {
            column,
            operator,
            value,
            ..
        } => {
            let ph = e.bind(value);
            format!("{} {} {}", g.wrap_column(column), g.operator(operator), ph)
        }
        WhereClause::In {
            column,
            values,
            not,
            ..
        } => {
            let op = if *not { "NOT IN" } else { "IN" };
            // An empty list renders the literal `IN ()`, which most engines reject at execution.
            let phs: Vec<String> = values.iter().map(|v| e.bind(v)).collect();
            format!("{} {} ({})", g.wrap_column(column), op, phs.join(", "))
        }
        WhereClause::Null { column, not, .. } => {
            let op = if *not { "IS NOT NULL" } else { "IS NULL" };
            format!("{} {}", g.wrap_column(column), op)
        }
        WhereClause::Between {
            column, range, not, ..
        } => {
            let op = if *not { "NOT BETWEEN" } else { "BETWEEN" };
            let lo = e.bind(&range[0]);
            let hi = e.bind(&range[1]);
            format!("{} {} {} AND {}", g.wrap_column(column), op, lo, hi)
        }
        WhereClause::Raw { sql, bindings, .. } => e.substitute(sql, bindings),
        WhereClause::Nested {
            fragment, bindings, ..
        } => format!("({})", e.substitute(fragment, bindings)),
        WhereClause::Column {
            left,
            operator,
            right,
            ..
        } => format!(
            "{} {} {}",
            g.wrap_column(left),
            g.operator(operator),
            g.wrap_column(right)
        ),
    }
}

fn where_list<G: Grammar + ?Sized>(e: &mut Emitter<'_, G>, wheres: &[WhereClause]) -> String {
    let mut sql = String::new();
    for (i, clause) in wheres.iter().enumerate() {
        if i > 0 {
            sql.push(' ');
            sql.push_str(clause.boolean().as_sql());
            sql.push(' ');
        }
        sql.push_str(&where_clause(e, clause));
    }
    sql
}

fn having_list<G: Grammar + ?Sized>(e: &mut Emitter<'_, G>, havings: &[HavingClause]) -> String {
    let g = e.grammar;
    let mut sql = String::new();
    for (i, clause) in havings.iter().enumerate() {
        if i > 0 {
            sql.push(' ');
            sql.push_str(clause.boolean().as_sql());
            sql.push(' ');
        }
        let part = match clause {
            HavingClause::Basic {
                column,
                operator,
                value,
                ..
            } => {
                let ph = e.bind(value);
                format!("{} {} {}", g.wrap_column(column), g.operator(operator), ph)
            }
            HavingClause::Raw { sql, bindings, .. } => e.substitute(sql, bindings),
        };
        sql.push_str(&part);
    }
    sql
}

fn joins_sql<G: Grammar + ?Sized>(g: &G, joins: &[JoinClause]) -> String {
    let mut sql = String::new();
    for join in joins {
        sql.push(' ');
        sql.push_str(join.kind.as_sql());
        sql.push(' ');
        sql.push_str(&g.wrap_table(&join.table));
        if let Some(on) = &join.on {
            sql.push_str(&format!(
                " ON {} {} {}",
                g.wrap_column(&on.first),
                g.operator(on.operator),
                g.wrap_column(&on.second)
            ));
        }
    }
    sql
}

/// The canonical SELECT walk: select-raw -> where -> group -> having -> order-raw.
fn select_sql<G: Grammar + ?Sized>(e: &mut Emitter<'_, G>, q: &CompiledQuery) -> String {
    let g = e.grammar;
    let mut sql = String::from("SELECT ");
    if q.distinct {
        sql.push_str("DISTINCT ");
    }

    let cols: Vec<String> = q
        .columns
        .iter()
        .map(|c| match c {
            SelectColumn::Column(name) => g.wrap_column(name),
            SelectColumn::Raw { sql, bindings } => e.substitute(sql, bindings),
        })
        .collect();
    sql.push_str(&cols.join(", "));

    sql.push_str(" FROM ");
    sql.push_str(&g.wrap_table(&q.table));
    sql.push_str(&joins_sql(g, &q.joins));

    let wheres = where_list(e, &q.wheres);
    if !wheres.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&wheres);
    }

    if !q.groups.is_empty() {
        sql.push_str(" GROUP BY ");
        let groups: Vec<String> = q.groups.iter().map(|c| g.wrap_column(c)).collect();
        sql.push_str(&groups.join(", "));
    }

    let havings = having_list(e, &q.havings);
    if !havings.is_empty() {
        sql.push_str(" HAVING ");
        sql.push_str(&havings);
    }

    if !q.orders.is_empty() {
        sql.push_str(" ORDER BY ");
        let orders: Vec<String> = q
            .orders
            .iter()
            .map(|o| match o {
                OrderClause::Column { column, direction } => {
                    format!("{} {}", g.wrap_column(column), direction.as_sql())
                }
                OrderClause::Raw { sql, bindings } => e.substitute(sql, bindings),
            })
            .collect();
        sql.push_str(&orders.join(", "));
    }

    sql.push_str(&g.compile_limit_offset(q.limit, q.offset));

    if let Some(lock) = q.lock {
        sql.push_str(g.compile_lock(lock));
    }
    sql
}

fn insert_sql<G: Grammar + ?Sized>(
    e: &mut Emitter<'_, G>,
    q: &CompiledQuery,
    rows: &[Row],
) -> OrmResult<String> {
    let g = e.grammar;
    let first = rows
        .first()
        .ok_or_else(|| OrmError::validation("INSERT requires at least one row"))?;

    let table = g.wrap_table(&q.table);
    if first.is_empty() {
        if rows.len() > 1 {
            return Err(OrmError::validation(
                "multi-row INSERT requires at least one column",
            ));
        }
        return Ok(format!("INSERT INTO {table} {}", g.insert_default_values()));
    }

    let columns = first.columns();
    for (i, row) in rows.iter().enumerate().skip(1) {
        if row.columns() != columns {
            return Err(OrmError::validation(format!(
                "INSERT row {i} has different columns than row 0"
            )));
        }
    }

    let column_list: Vec<String> = columns.iter().map(|c| g.wrap_identifier(c)).collect();
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let phs: Vec<String> = row.iter().map(|(_, v)| e.bind(v)).collect();
            format!("({})", phs.join(", "))
        })
        .collect();

    Ok(format!(
        "INSERT INTO {table} ({}) VALUES {}",
        column_list.join(", "),
        tuples.join(", ")
    ))
}

/// Shared body of the LATERAL path for dialects that support it.
///
/// `unnest_source` renders the synthetic parent-row source from the array
/// placeholder (e.g. `unnest($1::bigint[])`).
pub(crate) fn lateral_sql<G: Grammar + ?Sized>(
    g: &G,
    spec: &LateralQuery<'_>,
    unnest_source: impl FnOnce(&str) -> String,
) -> OrmResult<Statement> {
    if spec.parent_ids.is_empty() {
        return Err(OrmError::validation("lateral query requires at least one parent id"));
    }

    let mut e = Emitter::new(g, Mode::Dialect, 0);
    let array_ph = e.bind(&Value::Array(spec.parent_ids.clone()));

    let parent = g.wrap_identifier("__parent");
    let parent_key = g.wrap_identifier(LATERAL_PARENT_COLUMN);
    let child_alias = g.wrap_identifier("__child");

    // Correlate on the parent row, then AND the relation's own filter as one group.
    let mut child = spec.relation.clone();
    let correlation_target = format!("{}.{}", table_reference(&child.table), spec.foreign_key);
    let mut wheres = vec![WhereClause::Column {
        left: correlation_target,
        operator: "=",
        right: format!("__parent.{LATERAL_PARENT_COLUMN}"),
        boolean: crate::query::Boolean::And,
    }];
    if !child.wheres.is_empty() {
        let group = g.compile_where_fragment(&child.wheres);
        wheres.push(WhereClause::Nested {
            fragment: group.sql,
            bindings: group.bindings,
            boolean: crate::query::Boolean::And,
        });
    }
    child.wheres = wheres;
    child.lock = None;

    let inner = select_sql(&mut e, &child);
    let sql = format!(
        "SELECT {parent}.{parent_key}, {child_alias}.* FROM {} AS {parent}({parent_key}) CROSS JOIN LATERAL ({inner}) AS {child_alias}",
        unnest_source(&array_ph)
    );
    Ok(Statement::new(sql, e.bindings))
}
