use crate::builder::Statement;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub columns: HashMap<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }
}

impl Default for QueryRow {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Database backend trait
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Connect to the database
    async fn connect(url: &str) -> Result<Self>
    where
        Self: Sized;

    /// Execute a statement, returning the number of affected rows
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Query and return results
    async fn query(&mut self, statement: &Statement) -> Result<QueryResult>;

    /// Execute statements in order, stopping at the first failure
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64> {
        let mut affected = 0;
        for statement in statements {
            affected += self.execute(statement).await?;
        }
        Ok(affected)
    }

    /// Begin a transaction
    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rollback the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(self) -> Result<()>;
}

/// Transaction scope over a backend. Dropping it without `commit` leaves
/// cleanup to the backend; call `rollback` to undo explicitly.
pub struct Transaction<'a, B: DatabaseBackend> {
    backend: &'a mut B,
}

impl<'a, B: DatabaseBackend> Transaction<'a, B> {
    pub async fn new(backend: &'a mut B, isolation: IsolationLevel) -> Result<Self> {
        backend.begin_transaction(isolation).await?;
        Ok(Self { backend })
    }

    pub async fn commit(self) -> Result<()> {
        self.backend.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.backend.rollback().await
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.backend.execute(statement).await
    }

    pub async fn query(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.backend.query(statement).await
    }

    pub async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64> {
        self.backend.execute_batch(statements).await
    }
}
