use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The entity type has no usable structural map.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// A member-access chain never resolved to a mapped column.
    #[error("Unmapped field: {member} on {entity}")]
    UnmappedField { entity: String, member: String },

    /// Node shape outside the grammar accepted by the compiler mode.
    #[error("Unsupported expression: {kind} in {mode} mode")]
    UnsupportedExpression { kind: &'static str, mode: &'static str },

    /// A batch flush failed; nothing from the batch was kept pending.
    #[error("Flush failed: {0}")]
    Flush(#[source] Box<QueryError>),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl QueryError {
    pub(crate) fn unsupported(kind: &'static str, mode: &'static str) -> Self {
        QueryError::UnsupportedExpression { kind, mode }
    }

    /// Compile errors are deterministic; retrying the same expression cannot succeed.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            QueryError::Mapping(_)
                | QueryError::UnmappedField { .. }
                | QueryError::UnsupportedExpression { .. }
        )
    }
}
