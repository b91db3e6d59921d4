//! Expression-to-SQL compiler.
//!
//! One [`ExpressionCompiler`] compiles the fragments of one statement. Its
//! fragment stacks are reused between entry points and cleared at the start of
//! each; its [`ParamTable`] lives for the whole statement so that fragments
//! compiled by different entry points share bind slots.

use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::expr::{BinaryOp, Expr, Method};
use crate::mapping::{get_map, ColumnInfo, Entity, StructuralMap};
use crate::params::ParamTable;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

const MODE_PROJECTION: &str = "projection";
const MODE_ORDERING: &str = "ordering";
const MODE_PREDICATE: &str = "predicate";
const MODE_ASSIGNMENT: &str = "assignment";

/// LIFO buffer of emitted fragments
#[derive(Debug, Clone)]
pub struct FragmentStack<T> {
    items: Vec<T>,
}

impl<T> FragmentStack<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empty the stack, returning fragments in the order they were emitted.
    pub fn drain_ordered(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T> Default for FragmentStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A projected column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Column reference as it appears in the source table
    pub expr: String,
    /// Alias emitted for computed columns in select mode
    pub alias: Option<String>,
    pub member: String,
    pub(crate) plain: bool,
}

impl Projection {
    pub fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.expr, alias),
            None => self.expr.clone(),
        }
    }

    /// Name under which the column is visible once projected.
    pub fn output(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.expr)
    }
}

/// One ORDER BY entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub expr: String,
    /// Name of the column once carried through a derived table
    pub output: String,
    pub ascending: bool,
}

impl OrderTerm {
    pub fn to_sql(&self) -> String {
        format!("{} {}", self.expr, if self.ascending { "ASC" } else { "DESC" })
    }

    pub fn reversed(&self) -> Self {
        Self {
            ascending: !self.ascending,
            ..self.clone()
        }
    }

    /// The same term, referencing the derived-table column.
    pub fn as_output(&self) -> Self {
        Self {
            expr: self.output.clone(),
            ..self.clone()
        }
    }

    /// Select-list item that carries this term's column through a derived table.
    pub fn carry(&self) -> String {
        if self.expr == self.output {
            self.expr.clone()
        } else {
            format!("{} AS {}", self.expr, self.output)
        }
    }
}

/// Column and value lists of an INSERT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertFragment {
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

impl InsertFragment {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for InsertFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) VALUES ({})",
            self.columns.join(", "),
            self.values.join(", ")
        )
    }
}

struct ResolvedField {
    member: String,
    column: ColumnInfo,
}

pub struct ExpressionCompiler<'d, E> {
    map: Arc<StructuralMap<E>>,
    dialect: &'d dyn Dialect,
    params: ParamTable,
    fields: FragmentStack<Projection>,
    conditions: FragmentStack<String>,
    select_mode: bool,
}

impl<'d, E: Entity> ExpressionCompiler<'d, E> {
    /// Compiler for statement number `index`, using the global map of `E`.
    pub fn new(dialect: &'d dyn Dialect, index: usize) -> Result<Self> {
        Ok(Self::with_map(get_map::<E>()?, dialect, index))
    }

    pub fn with_map(map: Arc<StructuralMap<E>>, dialect: &'d dyn Dialect, index: usize) -> Self {
        Self {
            map,
            dialect,
            params: ParamTable::new(index),
            fields: FragmentStack::new(),
            conditions: FragmentStack::new(),
            select_mode: false,
        }
    }

    pub fn map(&self) -> &StructuralMap<E> {
        &self.map
    }

    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    pub fn into_params(self) -> ParamTable {
        self.params
    }

    fn clear(&mut self) {
        self.fields.clear();
        self.conditions.clear();
    }

    /// `col = @p, ...` for every writable, non-null field of `entity`.
    pub fn assign_entity(&mut self, entity: &E) -> Result<String> {
        self.clear();
        tracing::trace!(entity = self.map.entity_name(), "compiling entity assignment");

        let map = Arc::clone(&self.map);
        let mut parts = Vec::new();

        for field in map.db_fields() {
            if field.column.is_db_generated || !self.dialect.is_plain_field(&field.column.name) {
                continue;
            }
            let Some(value) = field.value(entity) else {
                continue;
            };

            let placeholder = self
                .params
                .create_param(self.dialect, &field.column.name, value)
                .placeholder
                .clone();
            parts.push(format!(
                "{} = {}",
                self.dialect.quote_identifier(&field.column.name),
                placeholder
            ));
        }

        Ok(parts.join(", "))
    }

    /// Compile explicit assignments (`o.X = value`, possibly inside `new { ... }`).
    pub fn assign(&mut self, expr: &Expr) -> Result<Option<String>> {
        self.clear();
        self.select_mode = false;
        tracing::trace!(kind = expr.kind(), "compiling assignment");

        self.visit_assignment(expr)?;

        let parts = self.conditions.drain_ordered();
        Ok((!parts.is_empty()).then(|| parts.join(", ")))
    }

    /// Column and value lists for inserting `entity`. Generated keys are never included.
    pub fn insert(&mut self, entity: &E) -> Result<InsertFragment> {
        self.clear();
        tracing::trace!(entity = self.map.entity_name(), "compiling insert");

        let map = Arc::clone(&self.map);
        let mut fragment = InsertFragment::default();

        for field in map.db_fields() {
            if field.column.is_db_generated || !self.dialect.is_plain_field(&field.column.name) {
                continue;
            }
            let Some(value) = field.value(entity) else {
                continue;
            };

            let placeholder = self
                .params
                .create_param(self.dialect, &field.column.name, value)
                .placeholder
                .clone();
            fragment
                .columns
                .push(self.dialect.quote_identifier(&field.column.name));
            fragment.values.push(placeholder);
        }

        Ok(fragment)
    }

    /// Structured ORDER BY terms, one per resolved field.
    pub fn order_terms(&mut self, entries: &[(Expr, bool)]) -> Result<Vec<OrderTerm>> {
        self.clear();
        self.select_mode = false;

        let mut terms = Vec::new();
        for (expr, ascending) in entries {
            self.fields.clear();
            self.visit_projection(expr, MODE_ORDERING)?;

            for projection in self.fields.drain_ordered() {
                let output = if projection.plain {
                    projection.expr.clone()
                } else {
                    self.dialect.quote_identifier(&projection.member)
                };
                terms.push(OrderTerm {
                    expr: projection.expr,
                    output,
                    ascending: *ascending,
                });
            }
        }

        Ok(terms)
    }

    /// `col ASC, col DESC, ...`; `None` when there is nothing to order by.
    pub fn order_by(&mut self, entries: &[(Expr, bool)]) -> Result<Option<String>> {
        let terms = self.order_terms(entries)?;
        if terms.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            terms
                .iter()
                .map(OrderTerm::to_sql)
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    /// Projected columns of a select list.
    pub fn projections(&mut self, exprs: &[Expr]) -> Result<Vec<Projection>> {
        self.clear();
        self.select_mode = true;

        for expr in exprs {
            self.visit_projection(expr, MODE_PROJECTION)?;
        }

        Ok(self.fields.drain_ordered())
    }

    /// Select list text; `None` selects every column.
    pub fn select(&mut self, exprs: &[Expr]) -> Result<Option<String>> {
        let projections = self.projections(exprs)?;
        if projections.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            projections
                .iter()
                .map(Projection::to_sql)
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    /// Compile a filter. All constants are bound as parameters.
    pub fn where_clause(&mut self, expr: &Expr) -> Result<Option<String>> {
        self.clear();
        self.select_mode = false;
        tracing::trace!(kind = expr.kind(), "compiling predicate");

        self.visit_predicate(expr)?;

        let parts = self.conditions.drain_ordered();
        Ok((!parts.is_empty()).then(|| parts.join(" AND ")))
    }

    fn visit_projection(&mut self, expr: &Expr, mode: &'static str) -> Result<()> {
        match expr {
            Expr::Lambda { body, .. } | Expr::Convert(body) => self.visit_projection(body, mode),
            Expr::New(items) => {
                for item in items {
                    self.visit_projection(item, mode)?;
                }
                Ok(())
            }
            Expr::Member { .. } => {
                let field = self.resolve_field(expr)?;
                let projection = self.render_field(&field);
                self.fields.push(projection);
                Ok(())
            }
            other => Err(QueryError::unsupported(other.kind(), mode)),
        }
    }

    fn visit_assignment(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Lambda { body, .. } => self.visit_assignment(body),
            Expr::New(items) => {
                for item in items {
                    self.visit_assignment(item)?;
                }
                Ok(())
            }
            Expr::Assign { target, value } => {
                let field = self.resolve_field(target)?;
                let column = field.column.name;

                if field.column.is_db_generated || !self.dialect.is_plain_field(&column) {
                    return Err(QueryError::Query(format!(
                        "column {} of {} is not writable",
                        column,
                        self.map.entity_name()
                    )));
                }

                self.visit_operand(value, &column, MODE_ASSIGNMENT)?;
                let value_sql = self.pop_condition()?;
                self.conditions.push(format!(
                    "{} = {}",
                    self.dialect.quote_identifier(&column),
                    value_sql
                ));
                Ok(())
            }
            other => Err(QueryError::unsupported(other.kind(), MODE_ASSIGNMENT)),
        }
    }

    fn visit_predicate(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Lambda { body, .. } | Expr::Convert(body) => self.visit_predicate(body),
            Expr::Binary { op, left, right } if op.is_logical() => {
                self.visit_predicate(left)?;
                self.visit_predicate(right)?;
                let right_sql = self.pop_condition()?;
                let left_sql = self.pop_condition()?;
                self.conditions
                    .push(format!("({} {} {})", left_sql, op, right_sql));
                Ok(())
            }
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.visit_comparison(*op, left, right)
            }
            Expr::Member { .. } => self.push_flag_test(expr, true),
            Expr::Not(inner) => match inner.as_ref() {
                Expr::Member { .. } => self.push_flag_test(inner, false),
                _ => {
                    self.visit_predicate(inner)?;
                    let inner_sql = self.pop_condition()?;
                    self.conditions.push(format!("NOT ({})", inner_sql));
                    Ok(())
                }
            },
            Expr::Call {
                method,
                target,
                args,
            } => self.visit_call(*method, target, args),
            Expr::Constant(Value::Bool(flag)) => {
                self.conditions
                    .push(if *flag { "1 = 1" } else { "1 = 0" }.to_string());
                Ok(())
            }
            other => Err(QueryError::unsupported(other.kind(), MODE_PREDICATE)),
        }
    }

    /// A boolean member used directly as a predicate.
    fn push_flag_test(&mut self, member: &Expr, expected: bool) -> Result<()> {
        let field = self.resolve_field(member)?;
        let column_sql = self.render_field(&field).expr;
        let placeholder = self
            .params
            .create_param(self.dialect, &field.column.name, Value::Bool(expected))
            .placeholder
            .clone();
        self.conditions
            .push(format!("{} = {}", column_sql, placeholder));
        Ok(())
    }

    fn visit_comparison(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<()> {
        let column = self
            .column_hint(left)
            .or_else(|| self.column_hint(right))
            .unwrap_or_else(|| "p".to_string());

        if matches!(op, BinaryOp::Eq | BinaryOp::Ne)
            && (left.is_null_constant() || right.is_null_constant())
        {
            let subject = if right.is_null_constant() { left } else { right };
            self.visit_operand(subject, &column, MODE_PREDICATE)?;
            let subject_sql = self.pop_condition()?;
            let test = if op == BinaryOp::Eq { "IS NULL" } else { "IS NOT NULL" };
            self.conditions.push(format!("{} {}", subject_sql, test));
            return Ok(());
        }

        self.visit_operand(left, &column, MODE_PREDICATE)?;
        self.visit_operand(right, &column, MODE_PREDICATE)?;
        let right_sql = self.pop_condition()?;
        let left_sql = self.pop_condition()?;
        self.conditions
            .push(format!("{} {} {}", left_sql, op, right_sql));
        Ok(())
    }

    /// Value position: columns, bound constants and arithmetic over them.
    fn visit_operand(&mut self, expr: &Expr, column: &str, mode: &'static str) -> Result<()> {
        match expr {
            Expr::Member { .. } => {
                let field = self.resolve_field(expr)?;
                let column_sql = self.render_field(&field).expr;
                self.conditions.push(column_sql);
                Ok(())
            }
            Expr::Constant(value) => {
                let placeholder = self
                    .params
                    .create_param(self.dialect, column, value.clone())
                    .placeholder
                    .clone();
                self.conditions.push(placeholder);
                Ok(())
            }
            Expr::Convert(inner) => self.visit_operand(inner, column, mode),
            Expr::Binary { op, left, right } if op.is_arithmetic() => {
                self.visit_operand(left, column, mode)?;
                self.visit_operand(right, column, mode)?;
                let right_sql = self.pop_condition()?;
                let left_sql = self.pop_condition()?;
                self.conditions
                    .push(format!("({} {} {})", left_sql, op, right_sql));
                Ok(())
            }
            other => Err(QueryError::unsupported(other.kind(), mode)),
        }
    }

    fn visit_call(&mut self, method: Method, target: &Expr, args: &[Expr]) -> Result<()> {
        let Some(arg) = args.first() else {
            return Err(QueryError::unsupported("Call", MODE_PREDICATE));
        };

        match (method, strip_convert(target)) {
            (Method::Contains, Expr::Constant(Value::Array(items))) => {
                let field = self.resolve_field(strip_convert(arg))?;
                let column_sql = self.render_field(&field).expr;

                if items.is_empty() {
                    self.conditions.push("1 = 0".to_string());
                    return Ok(());
                }

                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| {
                        self.params
                            .create_param(self.dialect, &field.column.name, item.clone())
                            .placeholder
                            .clone()
                    })
                    .collect();
                self.conditions
                    .push(format!("{} IN ({})", column_sql, placeholders.join(", ")));
                Ok(())
            }
            (
                Method::Contains | Method::StartsWith | Method::EndsWith,
                member @ Expr::Member { .. },
            ) => {
                let Expr::Constant(Value::String(text)) = strip_convert(arg) else {
                    return Err(QueryError::unsupported(arg.kind(), MODE_PREDICATE));
                };

                let text = escape_like(text);
                let pattern = match method {
                    Method::StartsWith => format!("{}%", text),
                    Method::EndsWith => format!("%{}", text),
                    _ => format!("%{}%", text),
                };

                let field = self.resolve_field(member)?;
                let column_sql = self.render_field(&field).expr;
                let placeholder = self
                    .params
                    .create_param(self.dialect, &field.column.name, Value::String(pattern))
                    .placeholder
                    .clone();
                self.conditions
                    .push(format!("{} LIKE {} ESCAPE '\\'", column_sql, placeholder));
                Ok(())
            }
            (Method::Equals, _) => self.visit_comparison(BinaryOp::Eq, target, arg),
            _ => Err(QueryError::unsupported("Call", MODE_PREDICATE)),
        }
    }

    /// Resolve a member chain to its mapped column, walking up owners until one is mapped.
    fn resolve_field(&self, expr: &Expr) -> Result<ResolvedField> {
        let mut current = expr;
        loop {
            match current {
                Expr::Member { owner, name } => {
                    if let Some(field) = self.map.field(name) {
                        if !field.column.is_db_field {
                            return Err(self.unmapped(name));
                        }
                        return Ok(ResolvedField {
                            member: field.member.clone(),
                            column: field.column.clone(),
                        });
                    }
                    current = owner.as_ref();
                }
                _ => return Err(self.unmapped(&member_path(expr))),
            }
        }
    }

    fn column_hint(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Member { .. } => self.resolve_field(expr).ok().map(|f| f.column.name),
            Expr::Convert(inner) => self.column_hint(inner),
            Expr::Binary { op, left, right } if op.is_arithmetic() => self
                .column_hint(left)
                .or_else(|| self.column_hint(right)),
            _ => None,
        }
    }

    fn render_field(&self, field: &ResolvedField) -> Projection {
        let column = &field.column.name;

        if self.dialect.is_plain_field(column) {
            return Projection {
                expr: self.dialect.quote_identifier(column),
                alias: None,
                member: field.member.clone(),
                plain: true,
            };
        }

        Projection {
            expr: column.clone(),
            alias: self
                .select_mode
                .then(|| self.dialect.quote_identifier(&field.member)),
            member: field.member.clone(),
            plain: false,
        }
    }

    fn pop_condition(&mut self) -> Result<String> {
        self.conditions
            .pop()
            .ok_or_else(|| QueryError::Query("predicate fragment stack underflow".to_string()))
    }

    fn unmapped(&self, member: &str) -> QueryError {
        QueryError::UnmappedField {
            entity: self.map.entity_name().to_string(),
            member: member.to_string(),
        }
    }
}

/// Match `text` literally inside a LIKE pattern escaped with `\`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn strip_convert(expr: &Expr) -> &Expr {
    match expr {
        Expr::Convert(inner) => strip_convert(inner),
        other => other,
    }
}

/// Dotted rendering of a member chain, for error messages.
fn member_path(expr: &Expr) -> String {
    let mut segments = Vec::new();
    let mut current = expr;
    while let Expr::Member { owner, name } = current {
        segments.push(name.as_str());
        current = owner.as_ref();
    }
    if segments.is_empty() {
        return expr.kind().to_string();
    }
    segments.reverse();
    segments.join(".")
}
