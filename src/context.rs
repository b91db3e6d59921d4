use crate::backend::{DatabaseBackend, IsolationLevel, QueryResult, Transaction};
use crate::builder::{Statement, TableQuery};
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::expr::Expr;
use crate::mapping::Entity;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kind of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Target table and mutation kind of a queued statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    pub table: String,
    pub kind: MutationKind,
}

/// A compiled mutation waiting for `save_changes`
#[derive(Debug, Clone)]
pub struct QueuedStatement {
    pub key: QueueKey,
    pub statement: Statement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Accumulating,
    Flushing,
}

/// Mutations queued since the last flush
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    state: CoordinatorState,
    next_index: usize,
    queued: Vec<QueuedStatement>,
}

impl PendingBatch {
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn queued(&self) -> &[QueuedStatement] {
        &self.queued
    }
}

/// Configuration for a [`DbContext`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Queue mutations until `save_changes`; when false each one is flushed immediately
    pub merge_commands: bool,
    /// Wrap each flush in a transaction
    pub transactional: bool,
    pub isolation: IsolationLevel,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            merge_commands: true,
            transactional: true,
            isolation: IsolationLevel::Serializable,
        }
    }
}

/// Unit of work over one backend.
///
/// Mutations are compiled when queued and sent together by
/// [`save_changes`](DbContext::save_changes). With `transactional` set, a
/// flush either applies every queued statement or none of them.
pub struct DbContext<B: DatabaseBackend> {
    backend: Arc<RwLock<B>>,
    dialect: Arc<dyn Dialect>,
    config: ContextConfig,
    pending: Arc<RwLock<PendingBatch>>,
}

impl<B: DatabaseBackend> DbContext<B> {
    pub fn new(backend: B, dialect: Arc<dyn Dialect>) -> Self {
        Self::with_config(backend, dialect, ContextConfig::default())
    }

    pub fn with_config(backend: B, dialect: Arc<dyn Dialect>, config: ContextConfig) -> Self {
        Self {
            backend: Arc::new(RwLock::new(backend)),
            dialect,
            config,
            pending: Arc::new(RwLock::new(PendingBatch::default())),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::clone(&self.dialect)
    }

    pub fn backend(&self) -> Arc<RwLock<B>> {
        Arc::clone(&self.backend)
    }

    /// Query builder over `E`'s table, bound to this context's dialect.
    pub fn table<E: Entity>(&self) -> TableQuery<E> {
        TableQuery::new(Arc::clone(&self.dialect))
    }

    /// Queue an insert of `entity`.
    pub async fn insert<E: Entity>(&self, entity: &E) -> Result<u64> {
        let query = self.table::<E>();
        self.enqueue(MutationKind::Insert, &query, |q| q.insert(entity))
            .await
    }

    /// Queue an update of `entity`, matched by its key.
    pub async fn update<E: Entity>(&self, entity: &E) -> Result<u64> {
        let query = self.table::<E>();
        self.enqueue(MutationKind::Update, &query, |q| q.update(entity))
            .await
    }

    /// Queue a partial update of the rows matched by `query`.
    pub async fn update_with<E: Entity>(&self, query: &TableQuery<E>, assignment: &Expr) -> Result<u64> {
        self.enqueue(MutationKind::Update, query, |q| q.update_with(assignment))
            .await
    }

    /// Queue a delete of the rows matched by `query`.
    pub async fn delete<E: Entity>(&self, query: &TableQuery<E>) -> Result<u64> {
        self.enqueue(MutationKind::Delete, query, |q| q.delete())
            .await
    }

    /// Compile one mutation under the next sequence index and queue it.
    ///
    /// Returns the rows affected when the context flushes immediately, else 0.
    async fn enqueue<E, F>(&self, kind: MutationKind, query: &TableQuery<E>, build: F) -> Result<u64>
    where
        E: Entity,
        F: FnOnce(TableQuery<E>) -> Result<Statement>,
    {
        {
            let mut pending = self.pending.write().await;

            let statement = build(query.clone().with_index(pending.next_index))?;
            let table = crate::builder::table_of::<E>()?;

            tracing::debug!(
                sql = %statement.sql,
                params = statement.params.len(),
                index = pending.next_index,
                "mutation queued"
            );

            pending.next_index += 1;
            pending.queued.push(QueuedStatement {
                key: QueueKey { table, kind },
                statement,
            });
            if pending.state == CoordinatorState::Idle {
                pending.state = CoordinatorState::Accumulating;
            }
        }

        if self.config.merge_commands {
            return Ok(0);
        }
        self.save_changes().await
    }

    /// Send every queued mutation, returning the total affected rows.
    ///
    /// Whatever the outcome, the flushed statements leave the pending set. A
    /// failure is reported as [`QueryError::Flush`] after rolling back.
    pub async fn save_changes(&self) -> Result<u64> {
        let batch = {
            let mut pending = self.pending.write().await;

            if pending.queued.is_empty() {
                return Ok(0);
            }

            pending.state = CoordinatorState::Flushing;
            pending.next_index = 0;
            std::mem::take(&mut pending.queued)
        };

        let statements: Vec<Statement> = batch.into_iter().map(|q| q.statement).collect();
        tracing::debug!(
            statements = statements.len(),
            transactional = self.config.transactional,
            "flushing pending batch"
        );

        let result = {
            let mut backend = self.backend.write().await;
            self.flush(&mut backend, &statements).await
        };

        {
            let mut pending = self.pending.write().await;
            pending.state = if pending.queued.is_empty() {
                CoordinatorState::Idle
            } else {
                CoordinatorState::Accumulating
            };
        }

        result.map_err(|e| QueryError::Flush(Box::new(e)))
    }

    async fn flush(&self, backend: &mut B, statements: &[Statement]) -> Result<u64> {
        if !self.config.transactional {
            return backend.execute_batch(statements).await;
        }

        let mut tx = Transaction::new(backend, self.config.isolation).await?;

        match tx.execute_batch(statements).await {
            Ok(affected) => {
                tx.commit().await?;
                Ok(affected)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed flush failed");
                }
                Err(e)
            }
        }
    }

    /// Run a read statement immediately.
    pub async fn query(&self, statement: &Statement) -> Result<QueryResult> {
        let mut backend = self.backend.write().await;
        backend.query(statement).await
    }

    /// Fetch one page along with the total number of rows it is cut from.
    pub async fn query_page<E: Entity>(
        &self,
        query: &TableQuery<E>,
        page_size: usize,
        page_index: usize,
        distinct: bool,
    ) -> Result<(QueryResult, u64)> {
        let paged = query.to_page_with_count(page_size, page_index, distinct)?;

        let mut backend = self.backend.write().await;
        let counted = backend.query(&paged.count).await?;
        let total = counted
            .first()
            .and_then(|row| row.columns.values().next())
            .and_then(|v| v.as_u64())
            .ok_or_else(|| QueryError::Query("count returned no value".to_string()))?;
        let rows = backend.query(&paged.page).await?;

        tracing::debug!(total, rows = rows.len(), "page fetched");
        Ok((rows, total))
    }

    /// Run a statement immediately, bypassing the pending set.
    pub async fn execute(&self, statement: &Statement) -> Result<u64> {
        let mut backend = self.backend.write().await;
        backend.execute(statement).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn state(&self) -> CoordinatorState {
        self.pending.read().await.state()
    }

    pub async fn is_connected(&self) -> bool {
        let backend = self.backend.read().await;
        backend.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServer;
    use crate::expr::{field, lit};
    use crate::fixtures::User;
    use async_trait::async_trait;

    /// Records statements; staged writes only become visible on commit.
    #[derive(Default)]
    struct MockBackend {
        committed: Vec<String>,
        staged: Vec<String>,
        in_transaction: bool,
        executions: usize,
        fail_on: Option<usize>,
        begins: usize,
        rollbacks: usize,
    }

    impl MockBackend {
        fn failing_on(n: usize) -> Self {
            Self {
                fail_on: Some(n),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DatabaseBackend for MockBackend {
        async fn connect(_url: &str) -> Result<Self> {
            Ok(Self::default())
        }

        async fn execute(&mut self, statement: &Statement) -> Result<u64> {
            self.executions += 1;
            if self.fail_on == Some(self.executions) {
                return Err(QueryError::Database("constraint violation".to_string()));
            }

            if self.in_transaction {
                self.staged.push(statement.sql.clone());
            } else {
                self.committed.push(statement.sql.clone());
            }
            Ok(1)
        }

        async fn query(&mut self, _statement: &Statement) -> Result<QueryResult> {
            Ok(vec![])
        }

        async fn begin_transaction(&mut self, _isolation: IsolationLevel) -> Result<()> {
            self.in_transaction = true;
            self.begins += 1;
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            self.committed.append(&mut self.staged);
            self.in_transaction = false;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.staged.clear();
            self.in_transaction = false;
            self.rollbacks += 1;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(self) -> Result<()> {
            Ok(())
        }
    }

    fn context(backend: MockBackend, config: ContextConfig) -> DbContext<MockBackend> {
        DbContext::with_config(backend, Arc::new(SqlServer), config)
    }

    #[tokio::test]
    async fn test_queue_then_save() {
        let ctx = context(MockBackend::default(), ContextConfig::default());
        assert_eq!(ctx.state().await, CoordinatorState::Idle);

        ctx.insert(&User::sample()).await.unwrap();
        ctx.insert(&User::sample()).await.unwrap();

        assert_eq!(ctx.state().await, CoordinatorState::Accumulating);
        assert_eq!(ctx.pending_count().await, 2);
        assert!(ctx.backend().read().await.committed.is_empty());

        {
            let pending = ctx.pending.read().await;
            let queued = pending.queued();
            assert_eq!(queued[0].key.table, "Members_User");
            assert_eq!(queued[0].key.kind, MutationKind::Insert);
            assert_eq!(queued[0].statement.params[0].name, "p0_UserName");
            assert_eq!(queued[1].statement.params[0].name, "p1_UserName");
        }

        assert_eq!(ctx.save_changes().await.unwrap(), 2);
        assert_eq!(ctx.state().await, CoordinatorState::Idle);
        assert_eq!(ctx.pending_count().await, 0);

        let backend = ctx.backend();
        let backend = backend.read().await;
        assert_eq!(backend.committed.len(), 2);
        assert_eq!(backend.begins, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_applies_nothing() {
        let ctx = context(MockBackend::failing_on(2), ContextConfig::default());

        ctx.insert(&User::sample()).await.unwrap();
        ctx.insert(&User::sample()).await.unwrap();
        ctx.insert(&User::sample()).await.unwrap();

        let err = ctx.save_changes().await.unwrap_err();
        assert!(matches!(err, QueryError::Flush(ref inner) if matches!(**inner, QueryError::Database(_))));

        assert_eq!(ctx.state().await, CoordinatorState::Idle);
        assert_eq!(ctx.pending_count().await, 0);

        let backend = ctx.backend();
        let backend = backend.read().await;
        assert!(backend.committed.is_empty());
        assert_eq!(backend.rollbacks, 1);
    }

    #[tokio::test]
    async fn test_compile_error_is_not_queued() {
        let ctx = context(MockBackend::default(), ContextConfig::default());

        let result = ctx.update(&User::sample()).await;
        assert!(matches!(result, Err(QueryError::Query(_))));
        assert_eq!(ctx.pending_count().await, 0);
        assert_eq!(ctx.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_immediate_mode() {
        let config = ContextConfig {
            merge_commands: false,
            transactional: false,
            ..Default::default()
        };
        let ctx = context(MockBackend::default(), config);

        let query = ctx.table::<User>().where_clause(field("ID").eq(lit(4)));
        assert_eq!(ctx.delete(&query).await.unwrap(), 1);
        assert_eq!(
            ctx.update_with(&query, &field("LoginCount").set(lit(0)))
                .await
                .unwrap(),
            1
        );

        assert_eq!(ctx.pending_count().await, 0);
        let backend = ctx.backend();
        let backend = backend.read().await;
        assert_eq!(backend.begins, 0);
        assert_eq!(
            backend.committed,
            vec![
                "DELETE FROM [Members_User] WHERE [ID] = @p0_ID".to_string(),
                "UPDATE [Members_User] SET [LoginCount] = @p0_LoginCount WHERE [ID] = @p0_ID".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_save_with_nothing_pending() {
        let ctx = context(MockBackend::default(), ContextConfig::default());
        assert_eq!(ctx.save_changes().await.unwrap(), 0);
        assert_eq!(ctx.backend().read().await.begins, 0);
    }

    #[test]
    fn test_config_from_json() {
        let config: ContextConfig =
            serde_json::from_str(r#"{"merge_commands": false, "isolation": "read_committed"}"#)
                .unwrap();

        assert!(!config.merge_commands);
        assert!(config.transactional);
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
    }
}
