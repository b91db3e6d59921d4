use crate::compiler::{ExpressionCompiler, OrderTerm};
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::expr::{field, Expr};
use crate::mapping::{get_map, Entity};
use crate::paging::{render_select, PageRequest, SelectParts};
use crate::params::ParameterEntry;
use std::marker::PhantomData;
use std::sync::Arc;

/// SQL text with its bind values, in ordinal order
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<ParameterEntry>,
}

impl Statement {
    /// Statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<ParameterEntry>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A page and the statement counting all rows it is cut from
#[derive(Debug, Clone, PartialEq)]
pub struct PagedStatements {
    pub page: Statement,
    pub count: Statement,
}

/// Query over the table of entity `E`.
///
/// Holds the expressions of a query and assembles them into complete
/// statements. Each terminal call compiles afresh, so a `TableQuery` can be
/// reused for several statements.
pub struct TableQuery<E: Entity> {
    dialect: Arc<dyn Dialect>,
    index: usize,
    table: Option<String>,
    select: Vec<Expr>,
    filter: Option<Expr>,
    order: Vec<(Expr, bool)>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for TableQuery<E> {
    fn clone(&self) -> Self {
        Self {
            dialect: Arc::clone(&self.dialect),
            index: self.index,
            table: self.table.clone(),
            select: self.select.clone(),
            filter: self.filter.clone(),
            order: self.order.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> TableQuery<E> {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            index: 0,
            table: None,
            select: Vec::new(),
            filter: None,
            order: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Statement sequence index; prefixes parameter names.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Override the mapped table name.
    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn select(mut self, expr: Expr) -> Self {
        self.select.push(expr);
        self
    }

    /// Replace the filter.
    pub fn where_clause(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn or_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.or(expr),
            None => expr,
        });
        self
    }

    pub fn asc(mut self, expr: Expr) -> Self {
        self.order.push((expr, true));
        self
    }

    pub fn desc(mut self, expr: Expr) -> Self {
        self.order.push((expr, false));
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    fn compiler(&self) -> Result<ExpressionCompiler<'_, E>> {
        ExpressionCompiler::new(self.dialect.as_ref(), self.index)
    }

    fn from_clause(&self, compiler: &ExpressionCompiler<'_, E>) -> String {
        let table = self
            .table
            .as_deref()
            .unwrap_or_else(|| compiler.map().table());
        self.dialect.quote_identifier(table)
    }

    fn compile_filter(&self, compiler: &mut ExpressionCompiler<'_, E>) -> Result<Option<String>> {
        match &self.filter {
            Some(filter) => compiler.where_clause(filter),
            None => Ok(None),
        }
    }

    /// `SELECT [TOP n] ... ORDER BY ...`; `top == 0` leaves the result unbounded.
    ///
    /// With `rand`, rows come back in the dialect's random order instead of
    /// the requested one.
    pub fn to_list(&self, top: usize, distinct: bool, rand: bool) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let from = self.from_clause(&compiler);

        let columns = compiler
            .projections(&self.select)?
            .iter()
            .map(|p| p.to_sql())
            .collect();
        let where_sql = self.compile_filter(&mut compiler)?;
        let order = if rand {
            Vec::new()
        } else {
            compiler.order_terms(&self.order)?
        };

        let dialect = self.dialect.as_ref();
        let limit = (top > 0).then_some(top);
        let mut parts = SelectParts {
            from,
            distinct,
            columns,
            where_sql,
            order,
        };

        if !rand {
            let sql = render_select(dialect, &parts, limit, None);
            return Ok(finish(sql, compiler));
        }

        let random = vec![OrderTerm {
            expr: dialect.random_function().to_string(),
            output: dialect.random_function().to_string(),
            ascending: true,
        }];
        let sql = if distinct {
            // Random keys are not part of the select list, so DISTINCT runs first.
            let inner = render_select(dialect, &parts, None, None);
            let outer = SelectParts {
                from: format!("({}) r", inner),
                order: random,
                ..SelectParts::default()
            };
            render_select(dialect, &outer, limit, None)
        } else {
            parts.order = random;
            render_select(dialect, &parts, limit, None)
        };
        Ok(finish(sql, compiler))
    }

    /// Single row.
    pub fn to_info(&self) -> Result<Statement> {
        self.to_list(1, false, false)
    }

    /// One page of results. `page_index` is 1-based; 0 is treated as 1, and a
    /// `page_size` of 0 returns every row.
    ///
    /// The key column is appended as a final ordering tie-break so that page
    /// windows are deterministic. A DISTINCT page over selected columns is
    /// broken by those columns instead, and may only order by them.
    pub fn to_page(&self, page_size: usize, page_index: usize, distinct: bool) -> Result<Statement> {
        if page_size == 0 {
            return self.to_list(0, distinct, false);
        }

        let mut compiler = self.compiler()?;
        let from = self.from_clause(&compiler);

        let projections = compiler.projections(&self.select)?;
        let where_sql = self.compile_filter(&mut compiler)?;
        let mut order = compiler.order_terms(&self.order)?;

        if distinct && !projections.is_empty() {
            if let Some(term) = order
                .iter()
                .find(|t| !projections.iter().any(|p| p.output() == t.output))
            {
                return Err(QueryError::Query(format!(
                    "DISTINCT page cannot order by {}, which is not selected",
                    term.expr
                )));
            }

            let tie_break = projections
                .iter()
                .map(|p| OrderTerm {
                    expr: p.expr.clone(),
                    output: p.output().to_string(),
                    ascending: true,
                })
                .collect();
            append_missing(&mut order, tie_break);
        } else {
            let key = compiler.map().index_field().map(|k| k.member.clone());
            match key {
                Some(member) => {
                    let tie_break = compiler.order_terms(&[(field(member), true)])?;
                    append_missing(&mut order, tie_break);
                }
                None if order.is_empty() => {
                    return Err(QueryError::Mapping(format!(
                        "{} has no key to page by and no ordering was given",
                        compiler.map().entity_name()
                    )));
                }
                None => {}
            }
        }

        let request = PageRequest {
            from,
            distinct,
            projections,
            where_sql,
            order,
            page_size,
            page_index: page_index.max(1),
        };
        let sql = self.dialect.paging().page(self.dialect.as_ref(), &request)?;
        Ok(finish(sql, compiler))
    }

    /// A page together with the count of every row the page is cut from.
    pub fn to_page_with_count(
        &self,
        page_size: usize,
        page_index: usize,
        distinct: bool,
    ) -> Result<PagedStatements> {
        Ok(PagedStatements {
            page: self.to_page(page_size, page_index, distinct)?,
            count: self.count_rows(distinct)?,
        })
    }

    /// `SELECT COUNT(0) FROM ... WHERE ...`
    pub fn count(&self) -> Result<Statement> {
        self.count_rows(false)
    }

    fn count_rows(&self, distinct: bool) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let from = self.from_clause(&compiler);

        if distinct {
            let columns = compiler
                .projections(&self.select)?
                .iter()
                .map(|p| p.to_sql())
                .collect();
            let where_sql = self.compile_filter(&mut compiler)?;
            let inner = render_select(
                self.dialect.as_ref(),
                &SelectParts {
                    from,
                    distinct,
                    columns,
                    where_sql,
                    order: Vec::new(),
                },
                None,
                None,
            );
            let sql = format!("SELECT COUNT(0) FROM ({}) c", inner);
            return Ok(finish(sql, compiler));
        }

        let mut sql = format!("SELECT COUNT(0) FROM {}", from);
        if let Some(where_sql) = self.compile_filter(&mut compiler)? {
            sql.push_str(&format!(" WHERE {}", where_sql));
        }
        Ok(finish(sql, compiler))
    }

    pub fn insert(&self, entity: &E) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let fragment = compiler.insert(entity)?;

        if fragment.is_empty() {
            return Err(QueryError::Query(
                "INSERT must have at least one value".to_string(),
            ));
        }

        let sql = format!("INSERT INTO {} {}", self.from_clause(&compiler), fragment);
        Ok(finish(sql, compiler))
    }

    /// Update every writable, non-null field of `entity`. Rows are selected by
    /// the filter when one is set, otherwise by the entity's key value.
    pub fn update(&self, entity: &E) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let assignments = compiler.assign_entity(entity)?;

        if assignments.is_empty() {
            return Err(QueryError::Query(
                "UPDATE must have at least one SET value".to_string(),
            ));
        }

        let where_sql = match &self.filter {
            Some(filter) => compiler.where_clause(filter)?,
            None => {
                let key = compiler
                    .map()
                    .index_field()
                    .and_then(|k| k.value(entity).map(|v| (k.member.clone(), v)));
                match key {
                    Some((member, value)) => {
                        compiler.where_clause(&field(member).eq(Expr::Constant(value)))?
                    }
                    None => {
                        return Err(QueryError::Query(
                            "UPDATE requires a filter or a key value".to_string(),
                        ))
                    }
                }
            }
        };

        let mut sql = format!("UPDATE {} SET {}", self.from_clause(&compiler), assignments);
        if let Some(where_sql) = where_sql {
            sql.push_str(&format!(" WHERE {}", where_sql));
        }
        Ok(finish(sql, compiler))
    }

    /// Partial update from explicit assignments, e.g. `o.LoginCount = o.LoginCount + 1`.
    pub fn update_with(&self, assignment: &Expr) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let assignments = compiler.assign(assignment)?.ok_or_else(|| {
            QueryError::Query("UPDATE must have at least one SET value".to_string())
        })?;

        let mut sql = format!("UPDATE {} SET {}", self.from_clause(&compiler), assignments);
        if let Some(where_sql) = self.compile_filter(&mut compiler)? {
            sql.push_str(&format!(" WHERE {}", where_sql));
        }
        Ok(finish(sql, compiler))
    }

    pub fn delete(&self) -> Result<Statement> {
        let mut compiler = self.compiler()?;
        let mut sql = format!("DELETE FROM {}", self.from_clause(&compiler));
        if let Some(where_sql) = self.compile_filter(&mut compiler)? {
            sql.push_str(&format!(" WHERE {}", where_sql));
        }
        Ok(finish(sql, compiler))
    }
}

/// Resolve `E`'s table name without building a query.
pub fn table_of<E: Entity>() -> Result<String> {
    Ok(get_map::<E>()?.table().to_string())
}

fn append_missing(order: &mut Vec<OrderTerm>, extra: Vec<OrderTerm>) {
    for term in extra {
        if !order.iter().any(|t| t.expr == term.expr) {
            order.push(term);
        }
    }
}

fn finish<E: Entity>(sql: String, compiler: ExpressionCompiler<'_, E>) -> Statement {
    let params = compiler.into_params().into_entries();
    tracing::debug!(sql = %sql, params = params.len(), "statement compiled");
    Statement::with_params(sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Postgres, SqlServer, SqlServer2000, Sqlite};
    use crate::expr::{lit, new_record};
    use crate::fixtures::User;
    use crate::mapping::EntityDescriptor;
    use serde_json::Value;

    fn users(dialect: Arc<dyn Dialect>) -> TableQuery<User> {
        TableQuery::new(dialect)
    }

    struct Keyless;

    impl Entity for Keyless {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("log").field("Message", |_| None)
        }
    }

    #[test]
    fn test_to_list() {
        let stmt = users(Arc::new(SqlServer))
            .select(new_record(vec![field("ID"), field("UserName")]))
            .where_clause(field("LoginCount").gt(lit(3)))
            .desc(field("LoginCount"))
            .to_list(10, true, false)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT DISTINCT TOP 10 [ID], [UserName] FROM [Members_User] WHERE [LoginCount] > @p0_LoginCount ORDER BY [LoginCount] DESC"
        );
        assert_eq!(stmt.params.len(), 1);
        assert_eq!(stmt.params[0].value, Value::from(3));
    }

    #[test]
    fn test_to_info_and_unbounded_list() {
        let info = users(Arc::new(Sqlite)).to_info().unwrap();
        assert_eq!(info.sql, "SELECT * FROM \"Members_User\" LIMIT 1");

        let all = users(Arc::new(Sqlite)).to_list(0, false, false).unwrap();
        assert_eq!(all.sql, "SELECT * FROM \"Members_User\"");
    }

    #[test]
    fn test_to_page_appends_key_tie_break() {
        let stmt = users(Arc::new(Sqlite))
            .desc(field("LoginCount"))
            .to_page(10, 3, false)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"Members_User\" ORDER BY \"LoginCount\" DESC, \"ID\" ASC LIMIT 10 OFFSET 20"
        );

        let stmt = users(Arc::new(Sqlite))
            .asc(field("ID"))
            .to_page(10, 0, false)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"Members_User\" ORDER BY \"ID\" ASC LIMIT 10"
        );
    }

    #[test]
    fn test_to_page_with_reversal_dialect() {
        let stmt = users(Arc::new(SqlServer2000))
            .select(field("UserName"))
            .to_page(20, 2, false)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT [UserName] FROM (SELECT TOP 20 * FROM (SELECT TOP 40 [UserName], [ID] FROM [Members_User] ORDER BY [ID] ASC) a ORDER BY [ID] DESC) b ORDER BY [ID] ASC"
        );
    }

    #[test]
    fn test_to_page_without_key_or_order() {
        let result = TableQuery::<Keyless>::new(Arc::new(Sqlite)).to_page(10, 2, false);
        assert!(matches!(result, Err(QueryError::Mapping(_))));

        let stmt = TableQuery::<Keyless>::new(Arc::new(Sqlite))
            .asc(field("Message"))
            .to_page(10, 2, false)
            .unwrap();
        assert!(stmt.sql.ends_with("ORDER BY \"Message\" ASC LIMIT 10 OFFSET 10"));
    }

    #[test]
    fn test_to_list_random_order() {
        let stmt = users(Arc::new(SqlServer))
            .desc(field("ID"))
            .to_list(10, false, true)
            .unwrap();
        assert_eq!(stmt.sql, "SELECT TOP 10 * FROM [Members_User] ORDER BY NEWID() ASC");

        let stmt = users(Arc::new(Sqlite))
            .select(field("GenderType"))
            .where_clause(field("LoginCount").gt(lit(0)))
            .to_list(3, true, true)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM (SELECT DISTINCT \"GenderType\" FROM \"Members_User\" WHERE \"LoginCount\" > ?1) r ORDER BY RANDOM() ASC LIMIT 3"
        );
        assert_eq!(stmt.params.len(), 1);
    }

    #[test]
    fn test_distinct_page_breaks_ties_on_selected_columns() {
        let stmt = users(Arc::new(SqlServer))
            .select(field("LoginCount"))
            .to_page(5, 2, true)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT DISTINCT [LoginCount] FROM [Members_User] ORDER BY [LoginCount] ASC OFFSET 5 ROWS FETCH NEXT 5 ROWS ONLY"
        );

        let stmt = users(Arc::new(SqlServer2000))
            .select(field("LoginCount"))
            .desc(field("LoginCount"))
            .to_page(5, 2, true)
            .unwrap();
        assert!(stmt.sql.contains("SELECT DISTINCT TOP 10 [LoginCount] FROM [Members_User] ORDER BY [LoginCount] DESC)"));
        assert!(!stmt.sql.contains("[ID]"));

        let err = users(Arc::new(SqlServer))
            .select(field("LoginCount"))
            .asc(field("UserName"))
            .to_page(5, 2, true)
            .unwrap_err();
        assert!(matches!(err, QueryError::Query(_)));
    }

    #[test]
    fn test_to_page_overflow_is_an_error() {
        let result = users(Arc::new(Sqlite)).to_page(usize::MAX / 2, 4, false);
        assert!(matches!(result, Err(QueryError::Query(_))));
    }

    #[test]
    fn test_to_page_with_count() {
        let paged = users(Arc::new(Sqlite))
            .where_clause(field("ID").gt(lit(10)))
            .to_page_with_count(20, 2, false)
            .unwrap();
        assert_eq!(
            paged.page.sql,
            "SELECT * FROM \"Members_User\" WHERE \"ID\" > ?1 ORDER BY \"ID\" ASC LIMIT 20 OFFSET 20"
        );
        assert_eq!(
            paged.count.sql,
            "SELECT COUNT(0) FROM \"Members_User\" WHERE \"ID\" > ?1"
        );
        assert_eq!(paged.count.params[0].value, Value::from(10));

        let paged = users(Arc::new(Sqlite))
            .select(field("GenderType"))
            .to_page_with_count(20, 1, true)
            .unwrap();
        assert_eq!(
            paged.count.sql,
            "SELECT COUNT(0) FROM (SELECT DISTINCT \"GenderType\" FROM \"Members_User\") c"
        );
    }

    #[test]
    fn test_count() {
        let stmt = users(Arc::new(Postgres))
            .where_clause(field("UserName").eq(lit("admin")))
            .count()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(0) FROM \"Members_User\" WHERE \"UserName\" = $1"
        );
    }

    #[test]
    fn test_insert() {
        let stmt = users(Arc::new(SqlServer)).insert(&User::sample()).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO [Members_User] ([UserName], [PassWord], [GenderType], [LoginCount]) VALUES (@p0_UserName, @p0_PassWord, @p0_GenderType, @p0_LoginCount)"
        );
        assert_eq!(stmt.params.len(), 4);

        let empty = users(Arc::new(SqlServer)).insert(&User::default());
        assert!(matches!(empty, Err(QueryError::Query(_))));
    }

    #[test]
    fn test_update_by_key() {
        let user = User {
            id: Some(9),
            ..User::sample()
        };
        let stmt = users(Arc::new(Sqlite)).with_index(2).update(&user).unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE \"Members_User\" SET \"UserName\" = ?1, \"PassWord\" = ?2, \"GenderType\" = ?3, \"LoginCount\" = ?4 WHERE \"ID\" = ?5"
        );
        assert_eq!(stmt.params[4].value, Value::from(9));
        assert_eq!(stmt.params[4].name, "p2_ID");

        let result = users(Arc::new(Sqlite)).update(&User::sample());
        assert!(matches!(result, Err(QueryError::Query(_))));
    }

    #[test]
    fn test_update_with_assignments() {
        let stmt = users(Arc::new(SqlServer))
            .where_clause(field("ID").eq(lit(1)))
            .update_with(&field("LoginCount").set(field("LoginCount").add(lit(1))))
            .unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE [Members_User] SET [LoginCount] = ([LoginCount] + @p0_LoginCount) WHERE [ID] = @p0_ID"
        );
        assert_eq!(stmt.params[0].value, Value::from(1));
        assert_eq!(stmt.params[1].value, Value::from(1));
    }

    #[test]
    fn test_delete_and_table_override() {
        let stmt = users(Arc::new(SqlServer))
            .table_name("Members_User_Archive")
            .where_clause(field("LoginIP").eq(lit(Value::Null)))
            .delete()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM [Members_User_Archive] WHERE [LoginIP] IS NULL"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_and_or_where() {
        let stmt = users(Arc::new(Sqlite))
            .and_where(field("LoginCount").gt(lit(1)))
            .and_where(field("GenderType").eq(lit(2)))
            .or_where(field("IsLocked"))
            .count()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(0) FROM \"Members_User\" WHERE ((\"LoginCount\" > ?1 AND \"GenderType\" = ?2) OR \"IsLocked\" = ?3)"
        );
    }

    #[test]
    fn test_table_of() {
        assert_eq!(table_of::<User>().unwrap(), "Members_User");
    }
}
