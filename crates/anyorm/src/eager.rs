//! Eager loading (batch preloading for relations).
//!
//! [`EagerLoader`] takes relation paths (`"posts"`, `"posts.comments"`) and loads
//! them for a slice of [`Record`]s with one batched query per relation per model
//! at each level, instead of one query per parent.
//!
//! - To-one / to-many relations: one `related_key IN (...)` query.
//! - A constraint that sets limit/offset means "N per parent" and goes through the
//!   grammar's LATERAL path (one query), or the configured [`LateralFallback`].
//! - `MorphTo`: one query per distinct concrete type.
//! - `MorphOne` / `MorphMany`: one query filtered by id and the parent's type tag.
//! - `BelongsToMany`: a pivot query, then one query for the related rows.
//!
//! Distribution is keyed by [`ValueKey`], so `42` and `"42"` land on the same parent.

use crate::builder::QueryBuilder;
use crate::config::{EagerConfig, LateralFallback};
use crate::driver::Driver;
use crate::error::{OrmError, OrmResult};
use crate::grammar::{LATERAL_PARENT_COLUMN, LateralQuery};
use crate::model::{Loaded, ModelDef, ModelRegistry, Record};
use crate::relation::{RelationKind, RelationshipMeta};
use crate::row::Row;
use crate::value::{Value, ValueKey};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Caller-supplied narrowing of a relation query.
pub type Constraint = Arc<dyn Fn(QueryBuilder) -> QueryBuilder + Send + Sync>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone)]
struct Node {
    name: String,
    constraint: Option<Constraint>,
    children: Vec<Node>,
}

/// Relation-path planner and executor.
#[derive(Clone, Default)]
pub struct EagerLoader {
    nodes: Vec<Node>,
    config: EagerConfig,
    build_error: Option<String>,
}

impl std::fmt::Debug for EagerLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn paths(nodes: &[Node], prefix: &str, out: &mut Vec<String>) {
            for node in nodes {
                let path = if prefix.is_empty() {
                    node.name.clone()
                } else {
                    format!("{prefix}.{}", node.name)
                };
                paths(&node.children, &path, out);
                out.push(path);
            }
        }
        let mut out = Vec::new();
        paths(&self.nodes, "", &mut out);
        f.debug_struct("EagerLoader")
            .field("paths", &out)
            .field("config", &self.config)
            .finish()
    }
}

impl EagerLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Load a relation path. Intermediate segments are loaded unconstrained.
    pub fn with(self, path: &str) -> Self {
        self.add_path(path, None)
    }

    /// Load a relation path, narrowing the last segment's query with `constraint`.
    pub fn with_constrained<F>(self, path: &str, constraint: F) -> Self
    where
        F: Fn(QueryBuilder) -> QueryBuilder + Send + Sync + 'static,
    {
        self.add_path(path, Some(Arc::new(constraint)))
    }

    fn add_path(mut self, path: &str, constraint: Option<Constraint>) -> Self {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            if self.build_error.is_none() {
                self.build_error = Some(format!("invalid relation path: {path:?}"));
            }
            return self;
        }
        insert_path(&mut self.nodes, &segments, constraint);
        self
    }

    /// Run `query` for `model`, hydrate the rows and load every registered path.
    pub async fn get<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        model: &str,
        query: &QueryBuilder,
    ) -> OrmResult<Vec<Record>> {
        let rows = query.get(driver).await?;
        let mut records = registry.hydrate(model, rows)?;
        self.load(driver, registry, &mut records).await?;
        Ok(records)
    }

    /// Load every registered path onto `records`.
    pub async fn load<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        records: &mut [Record],
    ) -> OrmResult<()> {
        if let Some(err) = &self.build_error {
            return Err(OrmError::validation(err.clone()));
        }
        if records.is_empty() || self.nodes.is_empty() {
            return Ok(());
        }
        let parents: Vec<&mut Record> = records.iter_mut().collect();
        self.load_nodes(driver, registry, parents, &self.nodes).await
    }

    fn load_nodes<'a, D: Driver>(
        &'a self,
        driver: &'a D,
        registry: &'a ModelRegistry,
        mut parents: Vec<&'a mut Record>,
        nodes: &'a [Node],
    ) -> BoxFuture<'a, OrmResult<()>> {
        Box::pin(async move {
            for node in nodes {
                // Group by model so heterogeneous levels (after MorphTo) stay batched.
                let mut groups: BTreeMap<String, Vec<&mut Record>> = BTreeMap::new();
                for record in parents.iter_mut() {
                    groups
                        .entry(record.model().to_string())
                        .or_default()
                        .push(&mut **record);
                }

                for (model, group) in groups.iter_mut() {
                    let def = registry.get(model)?.clone();
                    let meta = def.get_relation(&node.name)?.clone();
                    self.load_relation(driver, registry, &def, &meta, node.constraint.as_ref(), group)
                        .await?;
                }

                if !node.children.is_empty() {
                    let mut next: Vec<&mut Record> = Vec::new();
                    for group in groups.values_mut() {
                        for record in group.iter_mut() {
                            next.extend(record.related_mut(&node.name));
                        }
                    }
                    if !next.is_empty() {
                        self.load_nodes(driver, registry, next, &node.children).await?;
                    }
                }
            }
            Ok(())
        })
    }

    async fn load_relation<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        parent_def: &ModelDef,
        meta: &RelationshipMeta,
        constraint: Option<&Constraint>,
        parents: &mut [&mut Record],
    ) -> OrmResult<()> {
        match meta.kind {
            RelationKind::MorphTo => {
                self.load_morph_to(driver, registry, meta, constraint, parents)
                    .await
            }
            RelationKind::BelongsToMany => {
                self.load_pivot(driver, registry, meta, constraint, parents)
                    .await
            }
            _ => {
                self.load_direct(driver, registry, parent_def, meta, constraint, parents)
                    .await
            }
        }
    }

    /// HasOne, HasMany, BelongsTo, MorphOne, MorphMany.
    async fn load_direct<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        parent_def: &ModelDef,
        meta: &RelationshipMeta,
        constraint: Option<&Constraint>,
        parents: &mut [&mut Record],
    ) -> OrmResult<()> {
        let related_def = related_model(registry, meta)?;
        let keys = distinct_keys(parents.iter().map(|p| p.raw(&meta.parent_key)));
        if keys.is_empty() {
            assign_empty(parents, meta);
            return Ok(());
        }

        let mut query = related_def.query(driver.grammar());
        if let Some(type_column) = &meta.morph_type {
            query = query.where_eq(type_column, parent_def.morph_type());
        }
        let query = constrained(query, constraint);

        let related = if query.has_limit_or_offset() {
            self.per_parent_rows(driver, meta, query, keys)
                .await?
                .into_iter()
                .map(|(key, row)| (key, Record::from_row(related_def.clone(), row)))
                .collect()
        } else {
            let rows = query.where_in(&meta.related_key, keys.clone()).get(driver).await?;
            tracing::debug!(
                target: "anyorm.eager",
                relation = %meta.name,
                parents = keys.len(),
                rows = rows.len(),
                "batched relation query"
            );
            keyed_by(hydrate(related_def, rows), &meta.related_key)
        };

        distribute(parents, meta, &meta.parent_key, related);
        Ok(())
    }

    /// Rows for a relation whose constraint limits "N per parent", each paired
    /// with the key of the parent it was loaded for.
    async fn per_parent_rows<D: Driver>(
        &self,
        driver: &D,
        meta: &RelationshipMeta,
        query: QueryBuilder,
        keys: Vec<Value>,
    ) -> OrmResult<Vec<(ValueKey, Row)>> {
        let grammar = query.grammar().clone();
        if grammar.supports_lateral() {
            let relation = query.to_compiled()?;
            let stmt = grammar.compile_lateral(&LateralQuery {
                relation: &relation,
                foreign_key: &meta.related_key,
                parent_ids: keys.clone(),
            })?;
            let rows: Vec<(ValueKey, Row)> = driver
                .fetch(&stmt)
                .await?
                .rows
                .into_iter()
                .filter_map(|mut row| {
                    let key = row.take(LATERAL_PARENT_COLUMN)?.key()?;
                    Some((key, row))
                })
                .collect();
            tracing::debug!(
                target: "anyorm.eager",
                relation = %meta.name,
                parents = keys.len(),
                rows = rows.len(),
                "lateral relation query"
            );
            return Ok(rows);
        }

        let dialect = grammar.dialect();
        match self.config.lateral_fallback {
            LateralFallback::Error => Err(OrmError::LateralUnsupported(dialect.as_str())),
            LateralFallback::Unbounded => {
                tracing::warn!(
                    target: "anyorm.eager",
                    relation = %meta.name,
                    %dialect,
                    "no LATERAL support; limit applies to the whole batch, not per parent"
                );
                let rows = query.where_in(&meta.related_key, keys).get(driver).await?;
                Ok(rows
                    .into_iter()
                    .filter_map(|row| Some((row.get(&meta.related_key)?.key()?, row)))
                    .collect())
            }
            LateralFallback::PerParent => {
                tracing::warn!(
                    target: "anyorm.eager",
                    relation = %meta.name,
                    %dialect,
                    parents = keys.len(),
                    "no LATERAL support; issuing one query per parent"
                );
                let mut rows = Vec::new();
                for key in keys {
                    let Some(parent) = key.key() else {
                        continue;
                    };
                    let batch = query
                        .clone()
                        .where_eq(&meta.related_key, key)
                        .get(driver)
                        .await?;
                    rows.extend(batch.into_iter().map(|row| (parent.clone(), row)));
                }
                Ok(rows)
            }
        }
    }

    async fn load_morph_to<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        meta: &RelationshipMeta,
        constraint: Option<&Constraint>,
        parents: &mut [&mut Record],
    ) -> OrmResult<()> {
        let Some(type_column) = meta.morph_type.as_deref() else {
            return Err(OrmError::validation(format!(
                "morph_to relation {} has no type column",
                meta.name
            )));
        };

        // tag -> ids, in first-seen id order
        let mut by_tag: BTreeMap<String, Vec<Option<&Value>>> = BTreeMap::new();
        for parent in parents.iter() {
            if let Some(tag) = parent.raw(type_column).and_then(Value::as_str) {
                by_tag
                    .entry(tag.to_string())
                    .or_default()
                    .push(parent.raw(&meta.parent_key));
            }
        }
        let by_tag: Vec<(String, Vec<Value>)> = by_tag
            .into_iter()
            .map(|(tag, ids)| (tag, distinct_keys(ids.into_iter())))
            .collect();

        let mut found: HashMap<(String, ValueKey), Record> = HashMap::new();
        for (tag, ids) in by_tag {
            if ids.is_empty() {
                continue;
            }
            let def = registry.resolve_morph(&tag)?.clone();
            let query = constrained(def.query(driver.grammar()), constraint);
            let rows = query.where_in(&def.primary_key, ids).get(driver).await?;
            tracing::debug!(
                target: "anyorm.eager",
                relation = %meta.name,
                morph_type = %tag,
                rows = rows.len(),
                "morph_to batch"
            );
            for record in hydrate(&def, rows) {
                if let Some(key) = record.key_of(&def.primary_key) {
                    found.entry((tag.clone(), key)).or_insert(record);
                }
            }
        }

        for parent in parents.iter_mut() {
            let owner = match (
                parent.raw(type_column).and_then(Value::as_str),
                parent.key_of(&meta.parent_key),
            ) {
                (Some(tag), Some(key)) => found.get(&(tag.to_string(), key)).cloned(),
                _ => None,
            };
            parent.set_relation(meta.name.clone(), Loaded::One(owner.map(Box::new)));
        }
        Ok(())
    }

    async fn load_pivot<D: Driver>(
        &self,
        driver: &D,
        registry: &ModelRegistry,
        meta: &RelationshipMeta,
        constraint: Option<&Constraint>,
        parents: &mut [&mut Record],
    ) -> OrmResult<()> {
        let Some(pivot) = &meta.pivot else {
            return Err(OrmError::validation(format!(
                "belongs_to_many relation {} has no pivot table",
                meta.name
            )));
        };
        let related_def = related_model(registry, meta)?;
        let keys = distinct_keys(parents.iter().map(|p| p.raw(&meta.parent_key)));
        if keys.is_empty() {
            assign_empty(parents, meta);
            return Ok(());
        }

        let query = constrained(related_def.query(driver.grammar()), constraint);
        if query.has_limit_or_offset() {
            return Err(OrmError::validation(format!(
                "per-parent limit is not supported on many-to-many relation {}",
                meta.name
            )));
        }

        let pivot_rows = QueryBuilder::new(driver.grammar(), pivot.table.clone())
            .select(&[
                pivot.foreign_pivot_key.as_str(),
                pivot.related_pivot_key.as_str(),
            ])
            .where_in(&pivot.foreign_pivot_key, keys)
            .get(driver)
            .await?;

        // related key -> parent keys, in pivot order
        let mut owners: HashMap<ValueKey, Vec<ValueKey>> = HashMap::new();
        let mut related_ids = Vec::new();
        let mut seen = HashSet::new();
        for row in &pivot_rows {
            let (Some(parent), Some(related)) = (
                row.get(&pivot.foreign_pivot_key),
                row.get(&pivot.related_pivot_key),
            ) else {
                continue;
            };
            let (Some(parent_key), Some(related_key)) = (parent.key(), related.key()) else {
                continue;
            };
            if seen.insert(related_key.clone()) {
                related_ids.push(related.clone());
            }
            owners.entry(related_key).or_default().push(parent_key);
        }

        let mut buckets: HashMap<ValueKey, Vec<Record>> = HashMap::new();
        if !related_ids.is_empty() {
            let rows = query
                .where_in(&related_def.primary_key, related_ids)
                .get(driver)
                .await?;
            tracing::debug!(
                target: "anyorm.eager",
                relation = %meta.name,
                pivot_rows = pivot_rows.len(),
                rows = rows.len(),
                "many-to-many batch"
            );
            for record in hydrate(related_def, rows) {
                let Some(key) = record.key_of(&related_def.primary_key) else {
                    continue;
                };
                for parent_key in owners.get(&key).into_iter().flatten() {
                    buckets
                        .entry(parent_key.clone())
                        .or_default()
                        .push(record.clone());
                }
            }
        }

        for parent in parents.iter_mut() {
            let bucket = parent
                .key_of(&meta.parent_key)
                .and_then(|k| buckets.get(&k).cloned())
                .unwrap_or_default();
            parent.set_relation(meta.name.clone(), Loaded::Many(bucket));
        }
        Ok(())
    }
}

fn insert_path(nodes: &mut Vec<Node>, segments: &[&str], constraint: Option<Constraint>) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let idx = match nodes.iter().position(|n| n.name == *first) {
        Some(idx) => idx,
        None => {
            nodes.push(Node {
                name: first.to_string(),
                constraint: None,
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };
    if rest.is_empty() {
        if constraint.is_some() {
            nodes[idx].constraint = constraint;
        }
    } else {
        insert_path(&mut nodes[idx].children, rest, constraint);
    }
}

fn related_model<'r>(
    registry: &'r ModelRegistry,
    meta: &RelationshipMeta,
) -> OrmResult<&'r Arc<ModelDef>> {
    let name = meta.related.as_deref().ok_or_else(|| {
        OrmError::validation(format!("relation {} has no related model", meta.name))
    })?;
    registry.get(name)
}

fn constrained(query: QueryBuilder, constraint: Option<&Constraint>) -> QueryBuilder {
    match constraint {
        Some(f) => f(query).group_existing_wheres(),
        None => query,
    }
}

/// Distinct non-null values in canonical form, first occurrence wins.
fn distinct_keys<'v>(values: impl Iterator<Item = Option<&'v Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values.flatten() {
        if let Some(key) = value.key() {
            if seen.insert(key) {
                out.push(value.canonical());
            }
        }
    }
    out
}

/// Pair each record with its grouping key in `column`; records without one are dropped.
fn keyed_by(records: Vec<Record>, column: &str) -> Vec<(ValueKey, Record)> {
    records
        .into_iter()
        .filter_map(|record| Some((record.key_of(column)?, record)))
        .collect()
}

fn hydrate(def: &Arc<ModelDef>, rows: Vec<Row>) -> Vec<Record> {
    rows.into_iter()
        .map(|row| Record::from_row(def.clone(), row))
        .collect()
}

fn assign_empty(parents: &mut [&mut Record], meta: &RelationshipMeta) {
    for parent in parents.iter_mut() {
        let empty = if meta.kind.is_many() {
            Loaded::Many(Vec::new())
        } else {
            Loaded::One(None)
        };
        parent.set_relation(meta.name.clone(), empty);
    }
}

/// Attach each related record to the parents whose `parent_key` matches its key.
fn distribute(
    parents: &mut [&mut Record],
    meta: &RelationshipMeta,
    parent_key: &str,
    related: Vec<(ValueKey, Record)>,
) {
    let mut buckets: HashMap<ValueKey, Vec<Record>> = HashMap::new();
    for (key, record) in related {
        buckets.entry(key).or_default().push(record);
    }

    for parent in parents.iter_mut() {
        let bucket = parent.key_of(parent_key).and_then(|k| buckets.get(&k));
        let loaded = if meta.kind.is_many() {
            Loaded::Many(bucket.cloned().unwrap_or_default())
        } else {
            Loaded::One(bucket.and_then(|b| b.first()).cloned().map(Box::new))
        };
        parent.set_relation(meta.name.clone(), loaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_merge_into_a_tree() {
        let loader = EagerLoader::new()
            .with("posts.comments")
            .with_constrained("posts", |q| q.limit(3))
            .with("profile");
        assert_eq!(loader.nodes.len(), 2);
        assert_eq!(loader.nodes[0].name, "posts");
        assert!(loader.nodes[0].constraint.is_some());
        assert_eq!(loader.nodes[0].children[0].name, "comments");
        assert!(loader.nodes[0].children[0].constraint.is_none());
    }

    #[test]
    fn distinct_keys_coerce_numeric_strings() {
        let values = [Value::Int(1), Value::from("1"), Value::Null, Value::Int(2)];
        let keys = distinct_keys(values.iter().map(Some));
        assert_eq!(keys, vec![Value::Int(1), Value::Int(2)]);

        let strings = [Value::from("1"), Value::Int(2), Value::from("2"), Value::from("x")];
        let keys = distinct_keys(strings.iter().map(Some));
        assert_eq!(keys, vec![Value::Int(1), Value::Int(2), Value::from("x")]);
    }

    #[tokio::test]
    async fn malformed_path_is_rejected_before_io() {
        struct Unreachable;
        impl Driver for Unreachable {
            fn grammar(&self) -> Arc<dyn crate::grammar::Grammar> {
                crate::grammar::Dialect::Postgres.grammar()
            }
            async fn connect(&self) -> OrmResult<()> {
                unreachable!()
            }
            async fn disconnect(&self) -> OrmResult<()> {
                unreachable!()
            }
            fn is_connected(&self) -> bool {
                true
            }
            async fn query(&self, _: &str, _: &[Value]) -> OrmResult<crate::QueryResult> {
                panic!("unexpected query")
            }
            async fn execute(&self, _: &str, _: &[Value]) -> OrmResult<crate::ExecResult> {
                panic!("unexpected execute")
            }
            async fn begin_transaction(&self) -> OrmResult<()> {
                unreachable!()
            }
            async fn commit(&self) -> OrmResult<()> {
                unreachable!()
            }
            async fn rollback(&self) -> OrmResult<()> {
                unreachable!()
            }
            fn in_transaction(&self) -> bool {
                false
            }
        }

        let mut registry = ModelRegistry::new();
        registry.register(ModelDef::new("User", "users"));
        let mut records = registry
            .hydrate("User", vec![Row::from_pairs([("id", 1i64)])])
            .unwrap();
        let err = EagerLoader::new()
            .with("posts..comments")
            .load(&Unreachable, &registry, &mut records)
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
    }
}
