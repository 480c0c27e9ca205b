//! Error types for anyorm

use thiserror::Error;

/// Result type alias for anyorm operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for compilation, execution and eager loading.
///
/// Compilation errors (`Validation`, `UnsupportedConstruct`, `LateralUnsupported`)
/// are raised before any I/O happens. The constraint variants and
/// `Query` form the closed taxonomy every driver normalizes its native errors into.
#[derive(Debug, Error)]
pub enum OrmError {
    /// Database connection error (including pool acquisition timeouts)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Generic statement execution error
    #[error("Query error: {0}")]
    Query(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// NOT NULL constraint violation
    #[error("Not-null violation: {0}")]
    NotNullViolation(String),

    /// Referenced table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Builder or identifier validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Construct that the target protocol cannot express
    #[error("Unsupported construct for {target}: {construct}")]
    UnsupportedConstruct {
        target: &'static str,
        construct: String,
    },

    /// Per-parent limit requested against a dialect without LATERAL support
    #[error("Dialect '{0}' does not support lateral per-parent queries")]
    LateralUnsupported(&'static str),

    /// Relation name not registered on the model
    #[error("Relation '{relation}' is not defined on model '{model}'")]
    UnknownRelation { model: String, relation: String },

    /// Model name not registered
    #[error("Model '{0}' is not registered")]
    UnknownModel(String),

    /// Polymorphic discriminator value without a registered model
    #[error("No model registered for morph type '{0}'")]
    UnknownMorphType(String),

    /// `begin_transaction` on a handle that already has an active transaction
    #[error("A transaction is already active on this connection")]
    TransactionAlreadyActive,

    /// `commit`/`rollback` without an active transaction
    #[error("No active transaction")]
    NoActiveTransaction,

    /// Serialization error (schema snapshots, cache keys)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Pool error
    #[cfg(feature = "postgres")]
    #[error("Pool error: {0}")]
    Pool(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an unsupported-construct error for the given compile target
    pub fn unsupported(target: &'static str, construct: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            target,
            construct: construct.into(),
        }
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error was raised at compile time, before any I/O.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnsupportedConstruct { .. }
                | Self::LateralUnsupported(_)
        )
    }

    /// Whether this error looks like the cached schema no longer matches the database.
    ///
    /// Used by the schema registry's one-shot refresh-and-retry.
    pub fn is_schema_mismatch(&self) -> bool {
        match self {
            Self::TableNotFound(_) => true,
            Self::Query(message) => {
                let m = message.to_ascii_lowercase();
                (m.contains("column") && m.contains("does not exist"))
                    || m.contains("no such column")
                    || m.contains("unknown column")
                    || m.contains("no such table")
            }
            _ => false,
        }
    }

    /// Parse a tokio_postgres error into the normalized taxonomy.
    #[cfg(feature = "postgres")]
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let constraint = db_err.constraint().unwrap_or("unknown");
            let message = db_err.message();

            match db_err.code().code() {
                "23505" => return Self::UniqueViolation(format!("{}: {}", constraint, message)),
                "23503" => {
                    return Self::ForeignKeyViolation(format!("{}: {}", constraint, message));
                }
                "23502" => {
                    let column = db_err.column().unwrap_or("unknown");
                    return Self::NotNullViolation(format!("{}: {}", column, message));
                }
                "42P01" => return Self::TableNotFound(message.to_string()),
                _ => return Self::Query(format!("{} ({})", message, db_err.code().code())),
            }
        }
        if err.is_closed() {
            return Self::Connection(err.to_string());
        }
        Self::Query(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Timeout(kind) => {
                Self::Connection(format!("timed out acquiring pooled connection ({kind:?})"))
            }
            other => Self::Pool(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
