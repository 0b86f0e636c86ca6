// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Expression nodes of the SQL tree.

// Copyright 2024 Oxide Computer Company

use crate::render::Renderer;
use crate::Error;
use crate::Select;
use itertools::Itertools;
use std::fmt;

/// Binary comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::In => "IN",
            CmpOp::NotIn => "NOT IN",
        }
    }

    /// Parse one of the six ordering / equality operators shared by the
    /// query languages.
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "=" | "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            _ => None,
        }
    }
}

/// Logical connectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn as_sql(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Set operations combining whole statements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOp {
    UnionAll,
    UnionDistinct,
    Intersect,
}

impl SetOp {
    fn as_sql(&self) -> &'static str {
        match self {
            SetOp::UnionAll => "UNION ALL",
            SetOp::UnionDistinct => "UNION DISTINCT",
            SetOp::Intersect => "INTERSECT",
        }
    }
}

/// A node of the SQL expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A fragment emitted verbatim, e.g. a column or table name.
    Raw(String),
    /// A quoted string literal.
    Str(String),
    Int(i64),
    Float(f64),
    Func { name: String, args: Vec<Expr> },
    Cmp { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    Logical { op: LogicalOp, operands: Vec<Expr> },
    Not(Box<Expr>),
    /// A reference to a CTE by alias.
    CteRef(String),
    Subquery(Box<Select>),
    SetOp { op: SetOp, selects: Vec<Select> },
    /// A named parameter resolved from the render context.
    Param(String),
}

impl Expr {
    pub fn raw(s: impl Into<String>) -> Self {
        Expr::Raw(s.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Expr::Str(s.into())
    }

    pub fn int(i: i64) -> Self {
        Expr::Int(i)
    }

    pub fn float(f: f64) -> Self {
        Expr::Float(f)
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func { name: name.into(), args }
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Cmp { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Eq, left, right)
    }

    pub fn ne(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Ne, left, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Gt, left, right)
    }

    pub fn ge(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Ge, left, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Lt, left, right)
    }

    pub fn le(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::Le, left, right)
    }

    pub fn in_(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::In, left, right)
    }

    pub fn not_in(left: Expr, right: Expr) -> Self {
        Self::cmp(CmpOp::NotIn, left, right)
    }

    pub fn and(operands: Vec<Expr>) -> Self {
        Expr::Logical { op: LogicalOp::And, operands }
    }

    pub fn or(operands: Vec<Expr>) -> Self {
        Expr::Logical { op: LogicalOp::Or, operands }
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn cte(alias: impl Into<String>) -> Self {
        Expr::CteRef(alias.into())
    }

    pub fn subquery(select: Select) -> Self {
        Expr::Subquery(Box::new(select))
    }

    pub fn set_op(op: SetOp, selects: Vec<Select>) -> Self {
        Expr::SetOp { op, selects }
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    /// A tuple or array literal of strings, e.g. `('a','b')`.
    pub fn str_tuple<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Expr::Raw(format!(
            "({})",
            items.into_iter().map(|s| quote(s.as_ref())).join(",")
        ))
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        match self {
            Expr::Raw(s) => Ok(s.clone()),
            Expr::Str(s) => Ok(quote(s)),
            Expr::Int(i) => Ok(i.to_string()),
            Expr::Float(f) => Ok(format_float(*f)),
            Expr::Func { name, args } => {
                let args = args
                    .iter()
                    .map(|a| a.render(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{}({})", name, args.join(", ")))
            }
            Expr::Cmp { op, left, right } => Ok(format!(
                "{} {} {}",
                left.render(r)?,
                op.as_sql(),
                right.render(r)?
            )),
            Expr::Logical { op, operands } => match operands.as_slice() {
                [] => Err(Error::EmptyCondition(*op)),
                [single] => single.render(r),
                many => {
                    let parts = many
                        .iter()
                        .map(|o| o.render(r))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(format!(
                        "({})",
                        parts.join(&format!(" {} ", op.as_sql()))
                    ))
                }
            },
            Expr::Not(inner) => Ok(format!("NOT ({})", inner.render(r)?)),
            Expr::CteRef(alias) => r.render_cte_ref(alias),
            Expr::Subquery(select) => {
                Ok(format!("({})", r.render_nested(select)?))
            }
            Expr::SetOp { op, selects } => {
                let parts = selects
                    .iter()
                    .map(|s| r.render_nested(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "({})",
                    parts.join(&format!(") {} (", op.as_sql()))
                ))
            }
            Expr::Param(name) => match r.ctx().params.get(name) {
                Some(expr) => expr.render(r),
                None => Err(Error::UnknownParam(name.clone())),
            },
        }
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Raw(s.to_string())
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Raw(s)
    }
}

impl From<i64> for Expr {
    fn from(i: i64) -> Self {
        Expr::Int(i)
    }
}

/// Quote a string as a ClickHouse string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else if f.is_nan() {
        String::from("nan")
    } else if f.is_infinite() {
        String::from(if f > 0.0 { "inf" } else { "-inf" })
    } else {
        format!("{}", f)
    }
}
