//! Backend-specific SQL rules.
//!
//! The compiler only talks to [`Dialect`]; swapping the implementation changes
//! quoting, placeholders and paging without touching compilation.

use crate::paging::{NativeOffsetPaging, PagingStrategy, ReversalPaging};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a row bound is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `SELECT TOP n ...`; offsets use `OFFSET .. ROWS FETCH NEXT .. ROWS ONLY`
    Top,
    /// `... LIMIT n OFFSET m`
    LimitOffset,
}

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Escape a column or table identifier.
    fn quote_identifier(&self, name: &str) -> String;

    /// Whether `name` is a plain column identifier. Anything else (function
    /// calls, expressions) is emitted raw and aliased in projections.
    fn is_plain_field(&self, name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// SQL text for the bind slot `name` at 1-based position `ordinal`.
    fn placeholder(&self, name: &str, ordinal: usize) -> String;

    fn limit_style(&self) -> LimitStyle;

    /// Expression yielding a fresh random sort key per row.
    fn random_function(&self) -> &'static str {
        "RANDOM()"
    }

    fn paging(&self) -> &dyn PagingStrategy {
        &NativeOffsetPaging
    }
}

fn quote_with(name: &str, open: char, close: char) -> String {
    let escaped = name.replace(close, &format!("{}{}", close, close));
    format!("{}{}{}", open, escaped, close)
}

/// SQL Server 2012 and later
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServer;

impl Dialect for SqlServer {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '[', ']')
    }

    fn placeholder(&self, name: &str, _ordinal: usize) -> String {
        format!("@{}", name)
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Top
    }

    fn random_function(&self) -> &'static str {
        "NEWID()"
    }
}

/// SQL Server 2000: no native offsets, pages through double reversal
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServer2000;

impl Dialect for SqlServer2000 {
    fn name(&self) -> &'static str {
        "sqlserver2000"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '[', ']')
    }

    fn placeholder(&self, name: &str, _ordinal: usize) -> String {
        format!("@{}", name)
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Top
    }

    fn random_function(&self) -> &'static str {
        "NEWID()"
    }

    fn paging(&self) -> &dyn PagingStrategy {
        &ReversalPaging
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn placeholder(&self, _name: &str, ordinal: usize) -> String {
        format!("?{}", ordinal)
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::LimitOffset
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn placeholder(&self, _name: &str, ordinal: usize) -> String {
        format!("${}", ordinal)
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::LimitOffset
    }
}

/// Configurable dialect selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    SqlServer,
    SqlServer2000,
    #[default]
    Sqlite,
    Postgres,
}

impl DialectKind {
    pub fn provider(self) -> Arc<dyn Dialect> {
        match self {
            DialectKind::SqlServer => Arc::new(SqlServer),
            DialectKind::SqlServer2000 => Arc::new(SqlServer2000),
            DialectKind::Sqlite => Arc::new(Sqlite),
            DialectKind::Postgres => Arc::new(Postgres),
        }
    }
}
