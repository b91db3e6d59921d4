use crate::backend::{DatabaseBackend, IsolationLevel, QueryResult, QueryRow};
use crate::builder::Statement;
use crate::error::{QueryError, Result};
use crate::params::ParameterEntry;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row};

pub struct PostgresBackend {
    pool: PgPool,
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        Ok(Self { pool, tx: None })
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Convert PostgreSQL row to QueryRow
    fn convert_row(row: &PgRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let column_name = column.name();

            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                query_row.insert(column_name.to_string(), Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                query_row.insert(column_name.to_string(), Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<i32>, _>(column_name) {
                query_row.insert(column_name.to_string(), Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                if let Some(num) = serde_json::Number::from_f64(value) {
                    query_row.insert(column_name.to_string(), Value::Number(num));
                }
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                query_row.insert(column_name.to_string(), Value::Bool(value));
            } else {
                query_row.insert(column_name.to_string(), Value::Null);
            }
        }

        query_row
    }
}

fn bind_params<'q>(sql: &'q str, params: &'q [ParameterEntry]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);

    for param in params {
        query = match &param.value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }

    query
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn connect(url: &str) -> Result<Self> {
        Self::new(url).await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let query = bind_params(&statement.sql, &statement.params);
        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn query(&mut self, statement: &Statement) -> Result<QueryResult> {
        let query = bind_params(&statement.sql, &statement.params);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.tx.is_some() {
            return Err(QueryError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let set_isolation = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.to_sql());
        sqlx::query(&set_isolation).execute(&mut *tx).await?;

        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(QueryError::Transaction("Not in transaction".to_string())),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(QueryError::Transaction("Not in transaction".to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(self) -> Result<()> {
        if let Some(tx) = self.tx {
            tx.rollback().await?;
        }
        self.pool.close().await;
        Ok(())
    }
}
