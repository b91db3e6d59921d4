//! tx2-orm - Expression-tree ORM core for TX-2
//!
//! tx2-orm compiles typed expression trees (filters, projections, orderings and
//! assignments) over mapped entity types into parameterized SQL, and batches
//! mutations into transactional flushes.
//!
//! # Architecture
//!
//! - **Structural Mapping**: Each entity describes its table and fields once;
//!   the validated map is cached process-wide
//! - **Expression Compiler**: Pattern-matches [`expr::Expr`] trees into SQL
//!   fragments, binding every constant as a parameter
//! - **Dialects**: Identifier quoting, placeholders and paging per backend
//! - **Save Coordinator**: Queues compiled mutations and flushes them atomically
//!
//! # Features
//!
//! - **No interpolated values**: Constants always travel as bind parameters
//! - **Computed columns**: Mapped to expressions and aliased back to members
//! - **Deterministic paging**: The key column is always the final tie-break,
//!   including for dialects that page by double reversal; pages can carry
//!   the total row count
//! - **Backend Abstraction**: SQLite and PostgreSQL via sqlx
//!
//! # Example
//!
//! ```rust,no_run
//! use tx2_orm::prelude::*;
//! use tx2_orm::expr::{field, lit};
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct Account {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Entity for Account {
//!     fn describe() -> EntityDescriptor<Self> {
//!         EntityDescriptor::<Self>::new("accounts")
//!             .key("id", |a| a.id.map(Value::from))
//!             .field("name", |a| Some(Value::from(a.name.clone())))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     #[cfg(feature = "sqlite")]
//!     {
//!         let backend = SqliteBackend::memory().await?;
//!         let ctx = DbContext::new(backend, DialectKind::Sqlite.provider());
//!
//!         ctx.insert(&Account { id: None, name: "alice".into() }).await?;
//!         ctx.save_changes().await?;
//!
//!         let page = ctx
//!             .table::<Account>()
//!             .where_clause(field("name").starts_with(lit("a")))
//!             .desc(field("name"))
//!             .to_page(10, 2, false)?;
//!
//!         let rows = ctx.query(&page).await?;
//!         println!("Accounts: {:?}", rows);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! tx2-orm = { version = "0.1", features = ["postgres", "sqlite"] }
//! ```

pub mod backend;
pub mod builder;
pub mod compiler;
pub mod context;
pub mod dialect;
pub mod error;
pub mod expr;
pub mod mapping;
pub mod paging;
pub mod params;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod fixtures;

pub use backend::{DatabaseBackend, IsolationLevel, QueryResult, QueryRow, Transaction};
pub use builder::{PagedStatements, Statement, TableQuery};
pub use compiler::{ExpressionCompiler, InsertFragment, OrderTerm, Projection};
pub use context::{ContextConfig, CoordinatorState, DbContext, MutationKind};
pub use dialect::{Dialect, DialectKind, LimitStyle, Postgres, SqlServer, SqlServer2000, Sqlite};
pub use error::{QueryError, Result};
pub use expr::{BinaryOp, Expr, Method};
pub use mapping::{get_map, Entity, EntityDescriptor, FieldKind, MapRegistry, StructuralMap};
pub use paging::{NativeOffsetPaging, PagingStrategy, ReversalPaging};
pub use params::{ParamTable, ParameterEntry};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
    pub use crate::builder::{Statement, TableQuery};
    pub use crate::context::{ContextConfig, DbContext};
    pub use crate::dialect::{Dialect, DialectKind};
    pub use crate::error::{QueryError, Result};
    pub use crate::expr::Expr;
    pub use crate::mapping::{Entity, EntityDescriptor};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}
