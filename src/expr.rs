//! Typed expression trees.
//!
//! Filters, projections, orderings and assignments are all described with the
//! same closed [`Expr`] tree. The compiler pattern-matches over it; each mode
//! accepts a subset of node kinds and rejects the rest.
//!
//! ```rust
//! use tx2_orm::expr::{field, lit};
//!
//! // o => o.LoginCount > 3 && o.UserName.Contains("ad")
//! let filter = field("LoginCount").gt(lit(3)).and(field("UserName").contains(lit("ad")));
//! assert_eq!(filter.kind(), "Binary");
//! ```

use serde_json::Value;
use std::fmt;

/// Name of the implicit lambda parameter used by the helper constructors.
pub const ROOT: &str = "o";

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::OrElse)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "="),
            BinaryOp::Ne => write!(f, "<>"),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
            BinaryOp::AndAlso => write!(f, "AND"),
            BinaryOp::OrElse => write!(f, "OR"),
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Subtract => write!(f, "-"),
            BinaryOp::Multiply => write!(f, "*"),
            BinaryOp::Divide => write!(f, "/"),
        }
    }
}

/// Methods recognised inside predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// String containment on a member, or list membership when the target is a constant array.
    Contains,
    StartsWith,
    EndsWith,
    Equals,
}

/// Expression tree node
#[derive(Debug, Clone)]
pub enum Expr {
    /// Reference to a lambda parameter (the root of every member chain).
    Parameter(String),
    /// Member access on an owning expression.
    Member { owner: Box<Expr>, name: String },
    Constant(Value),
    Convert(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        method: Method,
        target: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Record construction, e.g. `o => new { o.ID, o.UserName }`.
    New(Vec<Expr>),
    Lambda { params: Vec<String>, body: Box<Expr> },
    /// Single-field assignment used by partial updates.
    Assign { target: Box<Expr>, value: Box<Expr> },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
}

impl Expr {
    /// Node kind name, reported by unsupported-expression errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Parameter(_) => "Parameter",
            Expr::Member { .. } => "MemberAccess",
            Expr::Constant(_) => "Constant",
            Expr::Convert(_) => "Convert",
            Expr::Not(_) => "Not",
            Expr::Binary { .. } => "Binary",
            Expr::Call { .. } => "Call",
            Expr::New(_) => "New",
            Expr::Lambda { .. } => "Lambda",
            Expr::Assign { .. } => "Assign",
            Expr::Conditional { .. } => "Conditional",
        }
    }

    /// Member access on this expression (`self.name`).
    pub fn member(self, name: impl Into<String>) -> Self {
        Expr::Member {
            owner: Box::new(self),
            name: name.into(),
        }
    }

    /// Wrap in a single-parameter lambda.
    pub fn lambda(self, param: impl Into<String>) -> Self {
        Expr::Lambda {
            params: vec![param.into()],
            body: Box::new(self),
        }
    }

    pub fn convert(self) -> Self {
        Expr::Convert(Box::new(self))
    }

    pub fn binary(self, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    pub fn eq(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Eq, rhs)
    }

    pub fn ne(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn le(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Le, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Ge, rhs)
    }

    pub fn and(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::AndAlso, rhs)
    }

    pub fn or(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::OrElse, rhs)
    }

    pub fn add(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Subtract, rhs)
    }

    pub fn mul(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Multiply, rhs)
    }

    pub fn div(self, rhs: Expr) -> Self {
        self.binary(BinaryOp::Divide, rhs)
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn call(self, method: Method, args: Vec<Expr>) -> Self {
        Expr::Call {
            method,
            target: Box::new(self),
            args,
        }
    }

    pub fn contains(self, arg: Expr) -> Self {
        self.call(Method::Contains, vec![arg])
    }

    pub fn starts_with(self, arg: Expr) -> Self {
        self.call(Method::StartsWith, vec![arg])
    }

    pub fn ends_with(self, arg: Expr) -> Self {
        self.call(Method::EndsWith, vec![arg])
    }

    /// `self IN (values...)`, expressed as `values.Contains(self)`.
    pub fn in_list<V: Into<Value>>(self, values: Vec<V>) -> Self {
        let list = Value::Array(values.into_iter().map(Into::into).collect());
        Expr::Constant(list).contains(self)
    }

    /// Assignment of `value` to this member.
    pub fn set(self, value: Expr) -> Self {
        Expr::Assign {
            target: Box::new(self),
            value: Box::new(value),
        }
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, Expr::Constant(Value::Null))
    }
}

/// `o.name`
pub fn field(name: impl Into<String>) -> Expr {
    Expr::Parameter(ROOT.to_string()).member(name)
}

/// `o.a.b.c`
pub fn path<I, S>(segments: I) -> Expr
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments
        .into_iter()
        .fold(Expr::Parameter(ROOT.to_string()), |owner, name| owner.member(name))
}

/// Constant value
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Constant(value.into())
}

/// `new { a, b, ... }`
pub fn new_record(fields: Vec<Expr>) -> Expr {
    Expr::New(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_builds_nested_members() {
        let expr = path(["ID", "Value"]);
        match expr {
            Expr::Member { owner, name } => {
                assert_eq!(name, "Value");
                assert!(matches!(*owner, Expr::Member { ref name, .. } if name == "ID"));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_in_list_targets_constant_array() {
        let expr = field("ID").in_list(vec![1, 2, 3]);
        match expr {
            Expr::Call { method, target, args } => {
                assert_eq!(method, Method::Contains);
                assert!(matches!(*target, Expr::Constant(Value::Array(ref v)) if v.len() == 3));
                assert_eq!(args[0].kind(), "MemberAccess");
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_operator_display() {
        assert_eq!(BinaryOp::Ne.to_string(), "<>");
        assert_eq!(BinaryOp::AndAlso.to_string(), "AND");
        assert!(BinaryOp::Ge.is_comparison());
        assert!(BinaryOp::Divide.is_arithmetic());
    }
}
