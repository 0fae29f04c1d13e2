use crate::attr::AttributeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use stratadb_value::{Affinity, Collation, SqlValue};

/// A statement parameter reference: by 1-based ordinal or by name. The
/// same name always binds to the same value however often it appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRef {
    Ordinal(usize),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Like,
    Glob,
}

/// A scalar expression. Relational inputs are reached through
/// [`Expr::Column`], which resolves against the row-context at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(SqlValue),
    Column(AttributeId),
    Param(ParamRef),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Searched or simple CASE; `operand` present for the simple form.
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        affinity: Affinity,
    },
    /// Attach an explicit collation to the comparison this expression
    /// feeds.
    Collate {
        expr: Box<Expr>,
        collation: Collation,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn literal(v: impl Into<SqlValue>) -> Expr {
        Expr::Literal(v.into())
    }

    pub fn column(attr: u32) -> Expr {
        Expr::Column(AttributeId(attr))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn call(name: impl Into<String>, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Function { name: name.into(), args: args.into_iter().collect() }
    }
}

/// One aggregate invocation inside an Aggregate node. `args` empty means
/// the star form (`count(*)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggCall {
    pub func: String,
    pub args: Vec<Expr>,
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column(attr) => write!(f, "#{attr}"),
            Expr::Param(ParamRef::Ordinal(i)) => write!(f, "?{i}"),
            Expr::Param(ParamRef::Named(n)) => write!(f, ":{n}"),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Neg => write!(f, "-({expr})"),
                UnaryOp::Not => write!(f, "NOT ({expr})"),
                UnaryOp::IsNull => write!(f, "({expr}) IS NULL"),
                UnaryOp::IsNotNull => write!(f, "({expr}) IS NOT NULL"),
            },
            Expr::Binary { op, left, right } => {
                let sym = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Rem => "%",
                    BinaryOp::Concat => "||",
                    BinaryOp::Eq => "=",
                    BinaryOp::Ne => "<>",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "AND",
                    BinaryOp::Or => "OR",
                    BinaryOp::Like => "LIKE",
                    BinaryOp::Glob => "GLOB",
                };
                write!(f, "({left} {sym} {right})")
            }
            Expr::Case { operand, whens, otherwise } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {op}")?;
                }
                for (when, then) in whens {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(e) = otherwise {
                    write!(f, " ELSE {e}")?;
                }
                write!(f, " END")
            }
            Expr::Cast { expr, affinity } => write!(f, "CAST({expr} AS {affinity:?})"),
            Expr::Collate { expr, collation } => write!(f, "({expr}) COLLATE {}", collation.name()),
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_round_trip_reads_like_sql() {
        let e = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Ge, Expr::column(1), Expr::literal(2i64)),
            Expr::Unary { op: UnaryOp::IsNotNull, expr: Box::new(Expr::column(2)) },
        );
        assert_eq!(e.to_string(), "((#1 >= 2) AND ((#2) IS NOT NULL))");
    }
}
