//! Fluent, dialect-independent query builder.
//!
//! A [`QueryBuilder`] accumulates clauses and their bindings and produces an
//! immutable [`CompiledQuery`] snapshot. Compilation to SQL happens in the
//! [`Grammar`] the builder was created with; execution goes through any
//! [`Driver`](crate::Driver).
//!
//! # Usage
//!
//! ```ignore
//! use anyorm::{Dialect, QueryBuilder};
//!
//! let users = QueryBuilder::new(Dialect::Postgres.grammar(), "users")
//!     .where_eq("status", "active")
//!     .where_group(|q| q.where_op("age", ">", 18).or_where_null("age"))
//!     .order_by_desc("created_at")
//!     .paginate(20, 2)
//!     .get(&driver)
//!     .await?;
//! ```
//!
//! Bindings are pushed into per-section buckets (select, where, having, order)
//! when a clause is appended, so the flattened binding list always matches
//! placeholder order no matter which order methods are called in.

mod exec;

#[cfg(test)]
mod tests;

use crate::error::{OrmError, OrmResult};
use crate::grammar::{Grammar, Statement, count_markers, table_reference};
use crate::query::{
    Bindings, Boolean, CompiledQuery, Direction, HavingClause, JoinClause, JoinKind, JoinOn,
    Lock, OrderClause, SelectColumn, WhereClause, normalize_operator,
};
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A named global scope: a builder transformation applied at compile time.
pub type ScopeFn = Arc<dyn Fn(QueryBuilder) -> QueryBuilder + Send + Sync>;

/// Fluent query accumulator bound to one grammar.
#[derive(Clone)]
pub struct QueryBuilder {
    grammar: Arc<dyn Grammar>,
    table: String,
    primary_key: String,
    columns: Vec<SelectColumn>,
    distinct: bool,
    wheres: Vec<WhereClause>,
    joins: Vec<JoinClause>,
    groups: Vec<String>,
    havings: Vec<HavingClause>,
    orders: Vec<OrderClause>,
    limit: Option<u64>,
    offset: Option<u64>,
    lock: Option<Lock>,
    bindings: Bindings,
    scopes: Vec<(String, ScopeFn)>,
    removed_scopes: HashSet<String>,
    scopes_applied: bool,
    build_error: Option<String>,
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("dialect", &self.grammar.dialect())
            .field("table", &self.table)
            .field("wheres", &self.wheres)
            .field("orders", &self.orders)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("bindings", &self.bindings)
            .field(
                "scopes",
                &self.scopes.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("removed_scopes", &self.removed_scopes)
            .field("build_error", &self.build_error)
            .finish()
    }
}

impl QueryBuilder {
    /// Create a builder for `table` compiled by `grammar`.
    pub fn new(grammar: Arc<dyn Grammar>, table: impl Into<String>) -> Self {
        Self {
            grammar,
            table: table.into(),
            primary_key: "id".to_string(),
            columns: vec![SelectColumn::Column("*".to_string())],
            distinct: false,
            wheres: Vec::new(),
            joins: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
            bindings: Bindings::default(),
            scopes: Vec::new(),
            removed_scopes: HashSet::new(),
            scopes_applied: false,
            build_error: None,
        }
    }

    /// Create a builder using the grammar of `driver`.
    pub fn on(driver: &impl crate::driver::Driver, table: impl Into<String>) -> Self {
        Self::new(driver.grammar(), table)
    }

    /// Set the primary-key column (default `id`).
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_name(&self) -> &str {
        &self.primary_key
    }

    pub fn grammar(&self) -> &Arc<dyn Grammar> {
        &self.grammar
    }

    pub fn has_limit_or_offset(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    fn fail(&mut self, message: impl Into<String>) {
        if self.build_error.is_none() {
            self.build_error = Some(message.into());
        }
    }

    fn operator(&mut self, op: &str) -> Option<&'static str> {
        let normalized = normalize_operator(op);
        if normalized.is_none() {
            self.fail(format!("invalid operator: {op:?}"));
        }
        normalized
    }

    fn check_identifier(&mut self, ident: &str) -> bool {
        let bad = ident.trim().is_empty() || ident.contains(';') || ident.contains("--");
        if bad {
            self.fail(format!("invalid identifier: {ident:?}"));
        }
        !bad
    }

    fn check_markers(&mut self, sql: &str, bindings: &[Value]) -> bool {
        let markers = count_markers(sql);
        if markers != bindings.len() {
            self.fail(format!(
                "raw fragment has {markers} placeholder(s) but {} binding(s): {sql:?}",
                bindings.len()
            ));
            return false;
        }
        true
    }

    // ==================== SELECT columns ====================

    /// Replace the selected columns.
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns.clear();
        self.bindings.select.clear();
        for column in columns {
            if self.check_identifier(column) {
                self.columns.push(SelectColumn::Column(column.to_string()));
            }
        }
        if self.columns.is_empty() {
            self.columns.push(SelectColumn::Column("*".to_string()));
        }
        self
    }

    /// Append one column, replacing the default `*`.
    pub fn add_select(mut self, column: &str) -> Self {
        if !self.check_identifier(column) {
            return self;
        }
        self.drop_star();
        self.columns.push(SelectColumn::Column(column.to_string()));
        self
    }

    /// Append a raw select expression with `?` markers.
    pub fn select_raw(mut self, sql: &str, bindings: Vec<Value>) -> Self {
        if !self.check_markers(sql, &bindings) {
            return self;
        }
        self.drop_star();
        self.bindings.select.extend(bindings.iter().cloned());
        self.columns.push(SelectColumn::Raw {
            sql: sql.to_string(),
            bindings,
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    fn drop_star(&mut self) {
        if self.columns.len() == 1 && self.columns[0].is_star() {
            self.columns.clear();
        }
    }

    // ==================== WHERE ====================

    fn add_where(mut self, clause: WhereClause) -> Self {
        self.bindings.where_.extend(clause.bindings());
        self.wheres.push(clause);
        self
    }

    fn basic_where(mut self, column: &str, op: &str, value: Value, boolean: Boolean) -> Self {
        let Some(operator) = self.operator(op) else {
            return self;
        };
        if !self.check_identifier(column) {
            return self;
        }
        // `= NULL` never matches; rewrite to IS [NOT] NULL.
        if value.is_null() {
            match operator {
                "=" => return self.null_where(column, false, boolean),
                "!=" | "<>" => return self.null_where(column, true, boolean),
                _ => {}
            }
        }
        self.add_where(WhereClause::Basic {
            column: column.to_string(),
            operator,
            value,
            boolean,
        })
    }

    /// `column = value`
    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.basic_where(column, "=", value.into(), Boolean::And)
    }

    pub fn or_where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.basic_where(column, "=", value.into(), Boolean::Or)
    }

    /// `column <op> value`, with `op` from the operator allow-list.
    pub fn where_op(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.basic_where(column, op, value.into(), Boolean::And)
    }

    pub fn or_where_op(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.basic_where(column, op, value.into(), Boolean::Or)
    }

    /// AND-ed equality for every `(column, value)` pair.
    pub fn where_all<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (column, value) in pairs {
            self = self.where_eq(column.as_ref(), value);
        }
        self
    }

    fn group_where<F>(mut self, f: F, boolean: Boolean) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        let child = f(QueryBuilder::new(self.grammar.clone(), self.table.clone()));
        if let Some(err) = child.build_error {
            self.fail(err);
            return self;
        }
        if child.wheres.is_empty() {
            return self;
        }
        let fragment = self.grammar.compile_where_fragment(&child.wheres);
        self.add_where(WhereClause::Nested {
            fragment: fragment.sql,
            bindings: fragment.bindings,
            boolean,
        })
    }

    /// Parenthesized group built by `f` on a fresh child builder.
    pub fn where_group<F>(self, f: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.group_where(f, Boolean::And)
    }

    pub fn or_where_group<F>(self, f: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.group_where(f, Boolean::Or)
    }

    fn in_where<I, V>(mut self, column: &str, values: I, not: bool, boolean: Boolean) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if !self.check_identifier(column) {
            return self;
        }
        self.add_where(WhereClause::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            not,
            boolean,
        })
    }

    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.in_where(column, values, false, Boolean::And)
    }

    pub fn where_not_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.in_where(column, values, true, Boolean::And)
    }

    pub fn or_where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.in_where(column, values, false, Boolean::Or)
    }

    pub fn or_where_not_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.in_where(column, values, true, Boolean::Or)
    }

    fn null_where(mut self, column: &str, not: bool, boolean: Boolean) -> Self {
        if !self.check_identifier(column) {
            return self;
        }
        self.add_where(WhereClause::Null {
            column: column.to_string(),
            not,
            boolean,
        })
    }

    pub fn where_null(self, column: &str) -> Self {
        self.null_where(column, false, Boolean::And)
    }

    pub fn where_not_null(self, column: &str) -> Self {
        self.null_where(column, true, Boolean::And)
    }

    pub fn or_where_null(self, column: &str) -> Self {
        self.null_where(column, false, Boolean::Or)
    }

    pub fn or_where_not_null(self, column: &str) -> Self {
        self.null_where(column, true, Boolean::Or)
    }

    fn between_where(
        mut self,
        column: &str,
        min: Value,
        max: Value,
        not: bool,
        boolean: Boolean,
    ) -> Self {
        if !self.check_identifier(column) {
            return self;
        }
        self.add_where(WhereClause::Between {
            column: column.to_string(),
            range: [min, max],
            not,
            boolean,
        })
    }

    pub fn where_between(self, column: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.between_where(column, min.into(), max.into(), false, Boolean::And)
    }

    pub fn where_not_between(
        self,
        column: &str,
        min: impl Into<Value>,
        max: impl Into<Value>,
    ) -> Self {
        self.between_where(column, min.into(), max.into(), true, Boolean::And)
    }

    pub fn or_where_between(
        self,
        column: &str,
        min: impl Into<Value>,
        max: impl Into<Value>,
    ) -> Self {
        self.between_where(column, min.into(), max.into(), false, Boolean::Or)
    }

    fn raw_where(mut self, sql: &str, bindings: Vec<Value>, boolean: Boolean) -> Self {
        if !self.check_markers(sql, &bindings) {
            return self;
        }
        self.add_where(WhereClause::Raw {
            sql: sql.to_string(),
            bindings,
            boolean,
        })
    }

    /// Raw condition with `?` markers, one per binding.
    pub fn where_raw(self, sql: &str, bindings: Vec<Value>) -> Self {
        self.raw_where(sql, bindings, Boolean::And)
    }

    pub fn or_where_raw(self, sql: &str, bindings: Vec<Value>) -> Self {
        self.raw_where(sql, bindings, Boolean::Or)
    }

    fn column_where(mut self, left: &str, op: &str, right: &str, boolean: Boolean) -> Self {
        let Some(operator) = self.operator(op) else {
            return self;
        };
        if !self.check_identifier(left) || !self.check_identifier(right) {
            return self;
        }
        self.add_where(WhereClause::Column {
            left: left.to_string(),
            operator,
            right: right.to_string(),
            boolean,
        })
    }

    /// Compare two columns.
    pub fn where_column(self, left: &str, op: &str, right: &str) -> Self {
        self.column_where(left, op, right, Boolean::And)
    }

    pub fn or_where_column(self, left: &str, op: &str, right: &str) -> Self {
        self.column_where(left, op, right, Boolean::Or)
    }

    // ==================== JOIN ====================

    fn add_join(mut self, kind: JoinKind, table: &str, on: Option<(&str, &str, &str)>) -> Self {
        if !self.check_identifier(table) {
            return self;
        }
        let on = match on {
            Some((first, op, second)) => {
                let Some(operator) = self.operator(op) else {
                    return self;
                };
                if !self.check_identifier(first) || !self.check_identifier(second) {
                    return self;
                }
                Some(JoinOn {
                    first: first.to_string(),
                    operator,
                    second: second.to_string(),
                })
            }
            None => None,
        };
        self.joins.push(JoinClause {
            kind,
            table: table.to_string(),
            on,
        });
        self
    }

    /// INNER JOIN `table` ON `first op second`.
    pub fn join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Inner, table, Some((first, op, second)))
    }

    pub fn left_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Left, table, Some((first, op, second)))
    }

    pub fn right_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.add_join(JoinKind::Right, table, Some((first, op, second)))
    }

    pub fn cross_join(self, table: &str) -> Self {
        self.add_join(JoinKind::Cross, table, None)
    }

    // ==================== GROUP BY / HAVING ====================

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        for column in columns {
            if self.check_identifier(column) {
                self.groups.push(column.to_string());
            }
        }
        self
    }

    fn add_having(mut self, column: &str, op: &str, value: Value, boolean: Boolean) -> Self {
        let Some(operator) = self.operator(op) else {
            return self;
        };
        if !self.check_identifier(column) {
            return self;
        }
        self.bindings.having.push(value.clone());
        self.havings.push(HavingClause::Basic {
            column: column.to_string(),
            operator,
            value,
            boolean,
        });
        self
    }

    pub fn having(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.add_having(column, op, value.into(), Boolean::And)
    }

    pub fn or_having(self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.add_having(column, op, value.into(), Boolean::Or)
    }

    pub fn having_raw(mut self, sql: &str, bindings: Vec<Value>) -> Self {
        if !self.check_markers(sql, &bindings) {
            return self;
        }
        self.bindings.having.extend(bindings.iter().cloned());
        self.havings.push(HavingClause::Raw {
            sql: sql.to_string(),
            bindings,
            boolean: Boolean::And,
        });
        self
    }

    // ==================== ORDER / LIMIT ====================

    fn add_order(mut self, column: &str, direction: Direction) -> Self {
        if self.check_identifier(column) {
            self.orders.push(OrderClause::Column {
                column: column.to_string(),
                direction,
            });
        }
        self
    }

    pub fn order_by(self, column: &str) -> Self {
        self.add_order(column, Direction::Asc)
    }

    pub fn order_by_desc(self, column: &str) -> Self {
        self.add_order(column, Direction::Desc)
    }

    pub fn order_by_raw(mut self, sql: &str, bindings: Vec<Value>) -> Self {
        if !self.check_markers(sql, &bindings) {
            return self;
        }
        self.bindings.order.extend(bindings.iter().cloned());
        self.orders.push(OrderClause::Raw {
            sql: sql.to_string(),
            bindings,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Page `page` (1-based) of `per_page` rows, ordered deterministically.
    pub fn paginate(mut self, per_page: u64, page: u64) -> Self {
        let page = page.max(1);
        self.limit = Some(per_page);
        self.offset = Some((page - 1) * per_page);
        self.ensure_key_order();
        self
    }

    /// Append `ORDER BY <pk> ASC` unless an ordering already references the key.
    fn ensure_key_order(&mut self) {
        if self.orders.iter().any(|o| o.references(&self.primary_key)) {
            return;
        }
        let column = if self.joins.is_empty() {
            self.primary_key.clone()
        } else {
            format!("{}.{}", table_reference(&self.table), self.primary_key)
        };
        self.orders.push(OrderClause::Column {
            column,
            direction: Direction::Asc,
        });
    }

    // ==================== Locking ====================

    pub fn lock_for_update(mut self) -> Self {
        self.lock = Some(Lock::ForUpdate);
        self
    }

    pub fn shared_lock(mut self) -> Self {
        self.lock = Some(Lock::Shared);
        self
    }

    // ==================== Global scopes ====================

    /// Register a named scope applied once at compile time. Re-registering a name
    /// replaces the earlier scope.
    pub fn with_global_scope<F>(mut self, name: impl Into<String>, scope: F) -> Self
    where
        F: Fn(QueryBuilder) -> QueryBuilder + Send + Sync + 'static,
    {
        let name = name.into();
        self.scopes.retain(|(existing, _)| *existing != name);
        self.scopes.push((name, Arc::new(scope)));
        self
    }

    /// Register an already shared scope.
    pub fn with_shared_scope(mut self, name: impl Into<String>, scope: ScopeFn) -> Self {
        let name = name.into();
        self.scopes.retain(|(existing, _)| *existing != name);
        self.scopes.push((name, scope));
        self
    }

    pub fn without_global_scope(mut self, name: &str) -> Self {
        self.removed_scopes.insert(name.to_string());
        self
    }

    pub fn without_global_scopes(mut self) -> Self {
        let names: Vec<String> = self.scopes.iter().map(|(n, _)| n.clone()).collect();
        self.removed_scopes.extend(names);
        self
    }

    /// Apply every non-removed scope once.
    ///
    /// When scopes add conditions and either side uses OR, the caller's wheres and
    /// the scope wheres are each wrapped in a group so a scope can never widen the
    /// caller's filter (and vice versa).
    fn apply_scopes(mut self) -> Self {
        if self.scopes_applied {
            return self;
        }
        self.scopes_applied = true;

        let scopes = std::mem::take(&mut self.scopes);
        let original = self.wheres.len();
        for (name, scope) in &scopes {
            if !self.removed_scopes.contains(name) {
                self = scope(self);
            }
        }
        self.scopes = scopes;

        let added = self.wheres.len().saturating_sub(original);
        if original > 0
            && added > 0
            && self.wheres.iter().any(|w| w.boolean() == Boolean::Or)
        {
            let scoped = self.wheres.split_off(original);
            let outer = std::mem::take(&mut self.wheres);
            for (part, boolean) in [(outer, Boolean::And), (scoped, Boolean::And)] {
                let fragment = self.grammar.compile_where_fragment(&part);
                self.wheres.push(WhereClause::Nested {
                    fragment: fragment.sql,
                    bindings: fragment.bindings,
                    boolean,
                });
            }
        }
        self
    }

    /// Wrap the current wheres in one group if any is OR-joined, so conditions
    /// appended afterwards narrow the whole filter.
    pub(crate) fn group_existing_wheres(mut self) -> Self {
        if !self.wheres.iter().any(|w| w.boolean() == Boolean::Or) {
            return self;
        }
        let wheres = std::mem::take(&mut self.wheres);
        let fragment = self.grammar.compile_where_fragment(&wheres);
        self.wheres.push(WhereClause::Nested {
            fragment: fragment.sql,
            bindings: fragment.bindings,
            boolean: Boolean::And,
        });
        self
    }

    // ==================== Compilation ====================

    /// Snapshot the builder into a [`CompiledQuery`].
    ///
    /// Global scopes are applied to a private copy, so calling this repeatedly is
    /// stable and never mutates `self`.
    pub fn to_compiled(&self) -> OrmResult<CompiledQuery> {
        if let Some(err) = &self.build_error {
            return Err(OrmError::validation(err.clone()));
        }
        let mut q = self.clone().apply_scopes();
        if let Some(err) = &q.build_error {
            return Err(OrmError::validation(err.clone()));
        }
        if q.has_limit_or_offset() {
            q.ensure_key_order();
        }
        let bindings = q.bindings.all();
        Ok(CompiledQuery {
            table: q.table,
            primary_key: q.primary_key,
            columns: q.columns,
            distinct: q.distinct,
            wheres: q.wheres,
            joins: q.joins,
            groups: q.groups,
            havings: q.havings,
            orders: q.orders,
            limit: q.limit,
            offset: q.offset,
            lock: q.lock,
            bindings,
        })
    }

    /// Compile the SELECT statement.
    pub fn to_sql(&self) -> OrmResult<Statement> {
        self.grammar.compile_select(&self.to_compiled()?)
    }

    /// The SELECT with bindings inlined as literals. Never execute this.
    pub fn to_raw_sql(&self) -> OrmResult<String> {
        Ok(self.grammar.compile_select_inline(&self.to_compiled()?))
    }
}
