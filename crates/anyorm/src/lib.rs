//! # anyorm
//!
//! A database-agnostic query builder, dialect compiler and eager-loading planner.
//!
//! ## Features
//!
//! - **Intent first**: `QueryBuilder` accumulates a dialect-free `CompiledQuery`
//! - **One algorithm, many dialects**: Postgres, MySQL/MariaDB and SQLite grammars share
//!   clause ordering and binding-offset threading; dialects only supply the leaves
//! - **Document stores**: the same query compiles to a Mongo-style filter command
//! - **Eager loading without N+1**: one query per relation per batch, one per morph type,
//!   and a single LATERAL query for "top N children per parent"
//! - **Safe defaults**: DELETE requires WHERE, UPDATE requires SET, unsupported
//!   constructs fail before any I/O
//! - **Self-healing schema**: one refresh and one retry on a schema mismatch
//!
//! ## Query Builder
//!
//! ```ignore
//! use anyorm::{Dialect, QueryBuilder, Row};
//!
//! let users = QueryBuilder::new(Dialect::Postgres.grammar(), "users")
//!     .where_eq("status", "active")
//!     .where_group(|q| q.where_op("age", ">", 18).or_where_eq("vip", true))
//!     .order_by_desc("created_at")
//!     .paginate(20, 1)
//!     .get(&driver)
//!     .await?;
//!
//! QueryBuilder::on(&driver, "users")
//!     .where_eq("id", 7)
//!     .update(&driver, Row::from_pairs([("status", "inactive")]))
//!     .await?;
//! ```
//!
//! ## Eager loading
//!
//! ```ignore
//! use anyorm::{EagerLoader, ModelDef, ModelRegistry, RelationshipMeta};
//!
//! let mut registry = ModelRegistry::new();
//! registry
//!     .register(ModelDef::new("User", "users")
//!         .relation(RelationshipMeta::has_many("posts", "Post", "user_id")))
//!     .register(ModelDef::new("Post", "posts"));
//!
//! let users = EagerLoader::new()
//!     .with_constrained("posts", |q| q.order_by_desc("created_at").limit(3))
//!     .get(&driver, &registry, "User", &registry.get("User")?.query(driver.grammar()))
//!     .await?;
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod document;
pub mod driver;
pub mod eager;
pub mod error;
pub mod grammar;
pub mod model;
pub mod query;
pub mod relation;
pub mod row;
pub mod schema;
pub mod transaction;
pub mod value;

pub use builder::{QueryBuilder, ScopeFn};
pub use cache::{CacheProvider, InMemoryCache};
pub use config::{EagerConfig, LateralFallback, PoolConfig};
pub use document::{DocumentCommand, DocumentDriver, DocumentGrammar, DocumentOperation};
pub use driver::{Driver, ExecResult, QueryResult};
pub use eager::EagerLoader;
pub use error::{OrmError, OrmResult};
pub use grammar::{
    Dialect, Grammar, LateralQuery, MySqlGrammar, PostgresGrammar, SqliteGrammar, Statement,
};
pub use model::{Loaded, ModelDef, ModelRegistry, Record};
pub use query::CompiledQuery;
pub use relation::{RelationKind, RelationshipMeta};
pub use row::{FromRow, FromValue, Row};
pub use schema::{SchemaRegistry, SchemaSource, TableInfo};
pub use transaction::{TransactionState, TransactionTracker};
pub use value::{Value, ValueKey};

pub use rust_decimal::Decimal;

#[cfg(feature = "postgres")]
pub use driver::postgres::PgDriver;
