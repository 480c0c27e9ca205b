//! Model definitions, the model registry, and the `Record` attribute bag.
//!
//! Models are declared explicitly at startup:
//!
//! ```ignore
//! use anyorm::{ModelDef, ModelRegistry, RelationshipMeta};
//!
//! let mut registry = ModelRegistry::new();
//! registry
//!     .register(
//!         ModelDef::new("User", "users")
//!             .relation(RelationshipMeta::has_many("posts", "Post", "user_id"))
//!             .accessor("email", |v| v.as_str().map(str::to_lowercase).into()),
//!     )
//!     .register(ModelDef::new("Post", "posts").morph_alias("post"));
//! let registry = registry.into_shared();
//! ```
//!
//! Attribute reads and writes go through `Record::get_attribute` /
//! `Record::set_attribute`, which consult the model's accessor and mutator
//! tables by column name.

use crate::builder::{QueryBuilder, ScopeFn};
use crate::error::{OrmError, OrmResult};
use crate::grammar::Grammar;
use crate::relation::RelationshipMeta;
use crate::row::Row;
use crate::value::{Value, ValueKey};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type Accessor = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type Mutator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Static description of one model.
#[derive(Clone)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    /// Declared columns. Empty means "not declared".
    pub columns: Vec<String>,
    relations: HashMap<String, RelationshipMeta>,
    accessors: HashMap<String, Accessor>,
    mutators: HashMap<String, Mutator>,
    scopes: Vec<(String, ScopeFn)>,
    morph_alias: Option<String>,
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .field("accessors", &self.accessors.keys().collect::<Vec<_>>())
            .field("mutators", &self.mutators.keys().collect::<Vec<_>>())
            .field("morph_alias", &self.morph_alias)
            .finish()
    }
}

impl ModelDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: "id".to_string(),
            columns: Vec::new(),
            relations: HashMap::new(),
            accessors: HashMap::new(),
            mutators: HashMap::new(),
            scopes: Vec::new(),
            morph_alias: None,
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn relation(mut self, meta: RelationshipMeta) -> Self {
        self.relations.insert(meta.name.clone(), meta);
        self
    }

    /// Transform a column's value on read.
    pub fn accessor<F>(mut self, column: &str, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.accessors.insert(column.to_string(), Arc::new(f));
        self
    }

    /// Transform a column's value on write.
    pub fn mutator<F>(mut self, column: &str, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.mutators.insert(column.to_string(), Arc::new(f));
        self
    }

    /// Scope applied to every query built from this model.
    pub fn global_scope<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(QueryBuilder) -> QueryBuilder + Send + Sync + 'static,
    {
        self.scopes.push((name.to_string(), Arc::new(f)));
        self
    }

    /// Discriminator value stored in morph type columns (defaults to the model name).
    pub fn morph_alias(mut self, alias: impl Into<String>) -> Self {
        self.morph_alias = Some(alias.into());
        self
    }

    pub fn morph_type(&self) -> &str {
        self.morph_alias.as_deref().unwrap_or(&self.name)
    }

    pub fn get_relation(&self, name: &str) -> OrmResult<&RelationshipMeta> {
        self.relations
            .get(name)
            .ok_or_else(|| OrmError::UnknownRelation {
                model: self.name.clone(),
                relation: name.to_string(),
            })
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationshipMeta> {
        self.relations.values()
    }

    /// A builder over this model's table with its global scopes attached.
    pub fn query(&self, grammar: Arc<dyn Grammar>) -> QueryBuilder {
        let mut q = QueryBuilder::new(grammar, self.table.clone()).primary_key(self.primary_key.clone());
        for (name, scope) in &self.scopes {
            q = q.with_shared_scope(name.clone(), scope.clone());
        }
        q
    }
}

/// All registered models plus the morph map.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelDef>>,
    morph_map: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Its morph type is added to the morph map.
    pub fn register(&mut self, def: ModelDef) -> &mut Self {
        self.morph_map
            .insert(def.morph_type().to_string(), def.name.clone());
        self.models.insert(def.name.clone(), Arc::new(def));
        self
    }

    /// Map an extra discriminator value to a model.
    pub fn morph_map(&mut self, tag: impl Into<String>, model: impl Into<String>) -> &mut Self {
        self.morph_map.insert(tag.into(), model.into());
        self
    }

    pub fn get(&self, name: &str) -> OrmResult<&Arc<ModelDef>> {
        self.models
            .get(name)
            .ok_or_else(|| OrmError::UnknownModel(name.to_string()))
    }

    /// Resolve a discriminator value to its model.
    pub fn resolve_morph(&self, tag: &str) -> OrmResult<&Arc<ModelDef>> {
        let name = self
            .morph_map
            .get(tag)
            .ok_or_else(|| OrmError::UnknownMorphType(tag.to_string()))?;
        self.get(name)
    }

    /// Freeze the registry for sharing.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Hydrate rows of `model` into records.
    pub fn hydrate(&self, model: &str, rows: Vec<Row>) -> OrmResult<Vec<Record>> {
        let def = self.get(model)?;
        Ok(rows
            .into_iter()
            .map(|row| Record::from_row(def.clone(), row))
            .collect())
    }
}

/// A loaded relation on a record.
#[derive(Debug, Clone)]
pub enum Loaded {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Loaded {
    pub fn as_one(&self) -> Option<&Record> {
        match self {
            Loaded::One(r) => r.as_deref(),
            Loaded::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> &[Record] {
        match self {
            Loaded::Many(rs) => rs,
            Loaded::One(_) => &[],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Loaded::One(r) => usize::from(r.is_some()),
            Loaded::Many(rs) => rs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records_mut(&mut self) -> Vec<&mut Record> {
        match self {
            Loaded::One(Some(r)) => vec![r.as_mut()],
            Loaded::One(None) => Vec::new(),
            Loaded::Many(rs) => rs.iter_mut().collect(),
        }
    }
}

/// A hydrated row of a model with its loaded relations.
#[derive(Clone)]
pub struct Record {
    def: Arc<ModelDef>,
    attributes: Row,
    original: Row,
    relations: BTreeMap<String, Loaded>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.def.name)
            .field("attributes", &self.attributes)
            .field("relations", &self.relations)
            .finish()
    }
}

impl Record {
    pub fn from_row(def: Arc<ModelDef>, row: Row) -> Self {
        Self {
            def,
            original: row.clone(),
            attributes: row,
            relations: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    /// Stored value without the accessor.
    pub fn raw(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column)
    }

    /// Value as seen by callers, through the column's accessor if one is registered.
    pub fn get_attribute(&self, column: &str) -> Value {
        let value = self.attributes.get(column).cloned().unwrap_or(Value::Null);
        match self.def.accessors.get(column) {
            Some(accessor) => accessor(&value),
            None => value,
        }
    }

    /// Store a value through the column's mutator if one is registered.
    pub fn set_attribute(&mut self, column: &str, value: impl Into<Value>) {
        let value = value.into();
        let value = match self.def.mutators.get(column) {
            Some(mutator) => mutator(value),
            None => value,
        };
        self.attributes.push(column, value);
    }

    pub fn attributes(&self) -> &Row {
        &self.attributes
    }

    /// Primary-key value.
    pub fn key(&self) -> Option<&Value> {
        self.attributes.get(&self.def.primary_key)
    }

    /// Canonical key of `column`, for batching and distribution.
    pub fn key_of(&self, column: &str) -> Option<ValueKey> {
        self.attributes.get(column).and_then(Value::key)
    }

    /// Columns whose stored value differs from the hydrated original.
    pub fn dirty(&self) -> Row {
        let mut changed = Row::new();
        for (column, value) in self.attributes.iter() {
            if self.original.get(column) != Some(value) {
                changed.push(column, value.clone());
            }
        }
        changed
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty().is_empty()
    }

    /// Accept current attributes as the new original.
    pub fn sync_original(&mut self) {
        self.original = self.attributes.clone();
    }

    pub fn relation(&self, name: &str) -> Option<&Loaded> {
        self.relations.get(name)
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, loaded: Loaded) {
        self.relations.insert(name.into(), loaded);
    }

    /// Records loaded under `name`, mutably.
    pub(crate) fn related_mut(&mut self, name: &str) -> Vec<&mut Record> {
        match self.relations.get_mut(name) {
            Some(loaded) => loaded.records_mut(),
            None => Vec::new(),
        }
    }

    /// JSON object of the (accessor-applied) attributes and loaded relations.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for column in self.attributes.columns() {
            map.insert(column.clone(), self.get_attribute(column).to_json());
        }
        for (name, loaded) in &self.relations {
            let value = match loaded {
                Loaded::One(Some(r)) => r.to_json(),
                Loaded::One(None) => serde_json::Value::Null,
                Loaded::Many(rs) => serde_json::Value::Array(rs.iter().map(Record::to_json).collect()),
            };
            map.insert(name.clone(), value);
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Dialect;

    fn user_def() -> ModelDef {
        ModelDef::new("User", "users")
            .accessor("name", |v| match v.as_str() {
                Some(s) => Value::from(s.to_uppercase()),
                None => v.clone(),
            })
            .mutator("email", |v| match v.as_str() {
                Some(s) => Value::from(s.trim().to_lowercase()),
                None => v,
            })
    }

    #[test]
    fn accessors_and_mutators_intercept_by_name() {
        let def = Arc::new(user_def());
        let mut rec = Record::from_row(
            def,
            Row::from_pairs([("id", Value::Int(1)), ("name", Value::from("ann"))]),
        );
        assert_eq!(rec.get_attribute("name"), Value::from("ANN"));
        assert_eq!(rec.raw("name"), Some(&Value::from("ann")));

        rec.set_attribute("email", "  Ann@Example.COM ");
        assert_eq!(rec.raw("email"), Some(&Value::from("ann@example.com")));
    }

    #[test]
    fn dirty_tracking_compares_against_original() {
        let def = Arc::new(user_def());
        let mut rec = Record::from_row(def, Row::from_pairs([("id", 1i64), ("age", 30i64)]));
        assert!(!rec.is_dirty());
        rec.set_attribute("age", 31i64);
        assert_eq!(rec.dirty(), Row::from_pairs([("age", 31i64)]));
        rec.sync_original();
        assert!(!rec.is_dirty());
    }

    #[test]
    fn morph_map_resolves_aliases() {
        let mut registry = ModelRegistry::new();
        registry
            .register(ModelDef::new("Post", "posts").morph_alias("post"))
            .register(ModelDef::new("Video", "videos"))
            .morph_map("App\\Video", "Video");

        assert_eq!(registry.resolve_morph("post").unwrap().name, "Post");
        assert_eq!(registry.resolve_morph("Video").unwrap().name, "Video");
        assert_eq!(registry.resolve_morph("App\\Video").unwrap().name, "Video");
        assert!(matches!(
            registry.resolve_morph("photo"),
            Err(OrmError::UnknownMorphType(_))
        ));
    }

    #[test]
    fn model_query_carries_scopes_and_key() {
        let def = ModelDef::new("Post", "posts")
            .primary_key("post_id")
            .global_scope("live", |q| q.where_null("deleted_at"));
        let stmt = def
            .query(Dialect::Postgres.grammar())
            .limit(1)
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"SELECT * FROM "posts" WHERE "deleted_at" IS NULL ORDER BY "post_id" ASC LIMIT 1"#
        );
    }
}
