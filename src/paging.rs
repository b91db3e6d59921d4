//! Page-window SQL generation.
//!
//! [`NativeOffsetPaging`] relies on the engine's own row offsets.
//! [`ReversalPaging`] targets engines that can only bound the top of a result:
//! it takes the first `size * index` rows in the requested order, keeps the
//! last `size` of them by reading that window in reverse, then restores the
//! requested order. The window is only deterministic when the ordering is
//! total, so callers always append the key column as a final tie-break.

use crate::compiler::{OrderTerm, Projection};
use crate::dialect::{Dialect, LimitStyle};
use crate::error::{QueryError, Result};

/// Clauses of a single-table SELECT
#[derive(Debug, Clone, Default)]
pub struct SelectParts {
    pub from: String,
    pub distinct: bool,
    /// Select-list items; empty selects `*`.
    pub columns: Vec<String>,
    pub where_sql: Option<String>,
    pub order: Vec<OrderTerm>,
}

/// A paged select, before the strategy renders it
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub from: String,
    pub distinct: bool,
    pub projections: Vec<Projection>,
    pub where_sql: Option<String>,
    /// Requested ordering, including the tie-break
    pub order: Vec<OrderTerm>,
    pub page_size: usize,
    /// 1-based page number
    pub page_index: usize,
}

impl PageRequest {
    fn parts(&self) -> SelectParts {
        SelectParts {
            from: self.from.clone(),
            distinct: self.distinct,
            columns: self.projections.iter().map(Projection::to_sql).collect(),
            where_sql: self.where_sql.clone(),
            order: self.order.clone(),
        }
    }

    /// Rows that precede or end the requested page.
    fn rows_through(&self, pages: usize) -> Result<usize> {
        self.page_size.checked_mul(pages).ok_or_else(|| {
            QueryError::Query(format!(
                "page {} of size {} is out of range",
                self.page_index, self.page_size
            ))
        })
    }

    /// First page: a plain bounded select with no offset.
    fn first_page(&self, dialect: &dyn Dialect) -> String {
        render_select(dialect, &self.parts(), Some(self.page_size), None)
    }
}

pub trait PagingStrategy: Send + Sync {
    fn page(&self, dialect: &dyn Dialect, request: &PageRequest) -> Result<String>;
}

/// `LIMIT/OFFSET` or `OFFSET .. FETCH`, depending on the dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOffsetPaging;

impl PagingStrategy for NativeOffsetPaging {
    fn page(&self, dialect: &dyn Dialect, request: &PageRequest) -> Result<String> {
        if request.page_index <= 1 {
            return Ok(request.first_page(dialect));
        }

        let offset = request.rows_through(request.page_index - 1)?;
        Ok(render_select(
            dialect,
            &request.parts(),
            Some(request.page_size),
            Some(offset),
        ))
    }
}

/// Nested TOP/reverse/restore paging.
///
/// A partial last page still returns `page_size` rows: the remainder plus the
/// tail of the previous page. Native offsets return only the remainder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReversalPaging;

impl PagingStrategy for ReversalPaging {
    fn page(&self, dialect: &dyn Dialect, request: &PageRequest) -> Result<String> {
        if request.page_index <= 1 {
            return Ok(request.first_page(dialect));
        }

        let window = request.rows_through(request.page_index)?;

        // Order columns must survive into the derived tables.
        let mut inner_columns: Vec<String> =
            request.projections.iter().map(Projection::to_sql).collect();
        let mut carried: Vec<&str> = request.projections.iter().map(Projection::output).collect();
        let select_all = inner_columns.is_empty();
        if select_all {
            inner_columns.push("*".to_string());
        }

        for term in &request.order {
            let needed = if select_all {
                term.expr != term.output
            } else {
                true
            };
            if needed && !carried.contains(&term.output.as_str()) {
                // An extra column would change what DISTINCT collapses.
                if request.distinct && !select_all {
                    return Err(QueryError::Query(format!(
                        "DISTINCT page cannot order by {}, which is not selected",
                        term.expr
                    )));
                }
                inner_columns.push(term.carry());
                carried.push(&term.output);
            }
        }

        let inner = render_select(
            dialect,
            &SelectParts {
                from: request.from.clone(),
                distinct: request.distinct,
                columns: if select_all && inner_columns.len() == 1 {
                    Vec::new()
                } else {
                    inner_columns
                },
                where_sql: request.where_sql.clone(),
                order: request.order.clone(),
            },
            Some(window),
            None,
        );

        let middle = render_select(
            dialect,
            &SelectParts {
                from: format!("({}) a", inner),
                order: request
                    .order
                    .iter()
                    .map(|t| t.as_output().reversed())
                    .collect(),
                ..SelectParts::default()
            },
            Some(request.page_size),
            None,
        );

        let outer = render_select(
            dialect,
            &SelectParts {
                from: format!("({}) b", middle),
                columns: request
                    .projections
                    .iter()
                    .map(|p| p.output().to_string())
                    .collect(),
                order: request.order.iter().map(OrderTerm::as_output).collect(),
                ..SelectParts::default()
            },
            None,
            None,
        );

        tracing::trace!(window, page_size = request.page_size, "reversal page rendered");
        Ok(outer)
    }
}

/// Render one SELECT with an optional row bound and offset.
pub fn render_select(
    dialect: &dyn Dialect,
    parts: &SelectParts,
    limit: Option<usize>,
    offset: Option<usize>,
) -> String {
    let style = dialect.limit_style();
    let mut sql = String::from("SELECT ");

    if parts.distinct {
        sql.push_str("DISTINCT ");
    }

    if style == LimitStyle::Top && offset.is_none() {
        if let Some(n) = limit {
            sql.push_str(&format!("TOP {} ", n));
        }
    }

    if parts.columns.is_empty() {
        sql.push('*');
    } else {
        sql.push_str(&parts.columns.join(", "));
    }

    sql.push_str(&format!(" FROM {}", parts.from));

    if let Some(where_sql) = &parts.where_sql {
        sql.push_str(&format!(" WHERE {}", where_sql));
    }

    if !parts.order.is_empty() {
        let order: Vec<String> = parts.order.iter().map(OrderTerm::to_sql).collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    match style {
        LimitStyle::Top => {
            if let Some(m) = offset {
                sql.push_str(&format!(" OFFSET {} ROWS", m));
                if let Some(n) = limit {
                    sql.push_str(&format!(" FETCH NEXT {} ROWS ONLY", n));
                }
            }
        }
        LimitStyle::LimitOffset => {
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {}", n));
            }
            if let Some(m) = offset {
                sql.push_str(&format!(" OFFSET {}", m));
            }
        }
    }

    sql
}
