//! The structured, dialect-independent query model.
//!
//! A [`CompiledQuery`] is the immutable snapshot a [`QueryBuilder`](crate::QueryBuilder)
//! produces. Grammars only ever read it.

use crate::value::Value;

/// How a clause combines with the previous clause in its list.
///
/// Ignored for the first clause of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boolean {
    And,
    Or,
}

impl Boolean {
    pub fn as_sql(self) -> &'static str {
        match self {
            Boolean::And => "AND",
            Boolean::Or => "OR",
        }
    }
}

/// Comparison operators accepted by `where_op` / `having`.
pub const OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", ">", "<=", ">=", "LIKE", "NOT LIKE", "ILIKE", "NOT ILIKE",
];

/// Normalize an operator, returning `None` if it is not in [`OPERATORS`].
pub fn normalize_operator(op: &str) -> Option<&'static str> {
    let upper = op.trim().to_ascii_uppercase();
    OPERATORS.iter().copied().find(|candidate| *candidate == upper)
}

/// A single WHERE condition.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    Basic {
        column: String,
        operator: &'static str,
        value: Value,
        boolean: Boolean,
    },
    In {
        column: String,
        values: Vec<Value>,
        not: bool,
        boolean: Boolean,
    },
    Null {
        column: String,
        not: bool,
        boolean: Boolean,
    },
    Between {
        column: String,
        range: [Value; 2],
        not: bool,
        boolean: Boolean,
    },
    /// Raw SQL with `?` markers, one per binding.
    Raw {
        sql: String,
        bindings: Vec<Value>,
        boolean: Boolean,
    },
    /// A parenthesized group rendered when the group was closed.
    ///
    /// `fragment` carries `?` markers, so placeholder numbering is still resolved
    /// by the grammar at final compile time.
    Nested {
        fragment: String,
        bindings: Vec<Value>,
        boolean: Boolean,
    },
    Column {
        left: String,
        operator: &'static str,
        right: String,
        boolean: Boolean,
    },
}

impl WhereClause {
    pub fn boolean(&self) -> Boolean {
        match self {
            WhereClause::Basic { boolean, .. }
            | WhereClause::In { boolean, .. }
            | WhereClause::Null { boolean, .. }
            | WhereClause::Between { boolean, .. }
            | WhereClause::Raw { boolean, .. }
            | WhereClause::Nested { boolean, .. }
            | WhereClause::Column { boolean, .. } => *boolean,
        }
    }

    /// Values this clause contributes to the binding list, in emission order.
    pub fn bindings(&self) -> Vec<Value> {
        match self {
            WhereClause::Basic { value, .. } => vec![value.clone()],
            WhereClause::In { values, .. } => values.clone(),
            WhereClause::Between { range, .. } => range.to_vec(),
            WhereClause::Raw { bindings, .. } | WhereClause::Nested { bindings, .. } => {
                bindings.clone()
            }
            WhereClause::Null { .. } | WhereClause::Column { .. } => Vec::new(),
        }
    }

    /// The column name this clause filters on, if it is a plain column clause.
    pub fn column(&self) -> Option<&str> {
        match self {
            WhereClause::Basic { column, .. }
            | WhereClause::In { column, .. }
            | WhereClause::Null { column, .. }
            | WhereClause::Between { column, .. } => Some(column),
            _ => None,
        }
    }
}

/// A post-aggregation condition.
#[derive(Debug, Clone, PartialEq)]
pub enum HavingClause {
    Basic {
        column: String,
        operator: &'static str,
        value: Value,
        boolean: Boolean,
    },
    Raw {
        sql: String,
        bindings: Vec<Value>,
        boolean: Boolean,
    },
}

impl HavingClause {
    pub fn boolean(&self) -> Boolean {
        match self {
            HavingClause::Basic { boolean, .. } | HavingClause::Raw { boolean, .. } => *boolean,
        }
    }

    pub fn bindings(&self) -> Vec<Value> {
        match self {
            HavingClause::Basic { value, .. } => vec![value.clone()],
            HavingClause::Raw { bindings, .. } => bindings.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Cross,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

/// `first operator second` join condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOn {
    pub first: String,
    pub operator: &'static str,
    pub second: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: String,
    /// `None` only for cross joins.
    pub on: Option<JoinOn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderClause {
    Column { column: String, direction: Direction },
    Raw { sql: String, bindings: Vec<Value> },
}

impl OrderClause {
    /// Whether this ordering references `column` (bare or table-qualified).
    pub fn references(&self, column: &str) -> bool {
        match self {
            OrderClause::Column { column: c, .. } => {
                c == column || c.rsplit('.').next() == Some(column)
            }
            OrderClause::Raw { sql, .. } => sql
                .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
                .any(|token| token == column),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    Column(String),
    Raw { sql: String, bindings: Vec<Value> },
}

impl SelectColumn {
    pub fn is_star(&self) -> bool {
        matches!(self, SelectColumn::Column(c) if c == "*")
    }
}

/// Row locking clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lock {
    ForUpdate,
    Shared,
}

/// Aggregate functions understood by `compile_aggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub fn as_sql(self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// Per-section binding buckets.
///
/// Values are pushed into the bucket of the clause that introduced them at the
/// moment the clause is appended, and flattened in canonical emission order
/// (select -> where -> having -> order). That keeps the binding order structurally
/// equal to placeholder order regardless of the order builder methods are called in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    pub select: Vec<Value>,
    pub where_: Vec<Value>,
    pub having: Vec<Value>,
    pub order: Vec<Value>,
}

impl Bindings {
    pub fn all(&self) -> Vec<Value> {
        let mut out =
            Vec::with_capacity(self.select.len() + self.where_.len() + self.having.len() + self.order.len());
        out.extend(self.select.iter().cloned());
        out.extend(self.where_.iter().cloned());
        out.extend(self.having.iter().cloned());
        out.extend(self.order.iter().cloned());
        out
    }

    pub fn len(&self) -> usize {
        self.select.len() + self.where_.len() + self.having.len() + self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable snapshot of one statement's intent.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<SelectColumn>,
    pub distinct: bool,
    pub wheres: Vec<WhereClause>,
    pub joins: Vec<JoinClause>,
    pub groups: Vec<String>,
    pub havings: Vec<HavingClause>,
    pub orders: Vec<OrderClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: Option<Lock>,
    /// Full ordered binding list for a SELECT of this query.
    pub bindings: Vec<Value>,
}

impl CompiledQuery {
    /// A bare `SELECT * FROM table` snapshot.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
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
            bindings: Vec::new(),
        }
    }

    pub fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    pub fn orders_reference(&self, column: &str) -> bool {
        self.orders.iter().any(|o| o.references(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_are_normalized() {
        assert_eq!(normalize_operator("like"), Some("LIKE"));
        assert_eq!(normalize_operator(" >= "), Some(">="));
        assert_eq!(normalize_operator("; DROP"), None);
    }

    #[test]
    fn order_reference_detection() {
        let plain = OrderClause::Column {
            column: "users.id".into(),
            direction: Direction::Asc,
        };
        assert!(plain.references("id"));
        let raw = OrderClause::Raw {
            sql: "FIELD(id, ?, ?)".into(),
            bindings: vec![],
        };
        assert!(raw.references("id"));
        assert!(!raw.references("uid"));
    }

    #[test]
    fn bindings_flatten_in_canonical_order() {
        let b = Bindings {
            select: vec![Value::Int(1)],
            where_: vec![Value::Int(2)],
            having: vec![Value::Int(3)],
            order: vec![Value::Int(4)],
        };
        assert_eq!(
            b.all(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
    }
}
