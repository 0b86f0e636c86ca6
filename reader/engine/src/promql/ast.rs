// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The subset of the PromQL AST the engine rewrites.

// Copyright 2024 Oxide Computer Company

pub use crate::logql::ast::Grouping;
pub use crate::logql::ast::LabelMatcher;
pub use crate::logql::ast::MatchOp;

use crate::logql::ast::duration_str;
use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// The label holding the metric name.
pub const METRIC_NAME: &str = "__name__";

/// `metric{matchers}`. The metric name, if any, is a matcher on
/// [`METRIC_NAME`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct VectorSelector {
    pub matchers: Vec<LabelMatcher>,
}

impl VectorSelector {
    /// A selector of every series of a metric.
    pub fn metric(name: &str) -> Self {
        let matcher = LabelMatcher::new(METRIC_NAME, MatchOp::Eq, name);
        Self { matchers: vec![matcher] }
    }

    /// The metric name, when the selector matches exactly one.
    pub fn metric_name(&self) -> Option<&str> {
        self.matchers
            .iter()
            .find(|m| m.name == METRIC_NAME && m.op == MatchOp::Eq)
            .map(|m| m.value.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Sum,
    Min,
    Max,
    Avg,
    Count,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    Quantile,
}

/// A PromQL expression.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromExpr {
    Vector(VectorSelector),
    Matrix {
        selector: VectorSelector,
        #[serde(with = "duration_str")]
        range: Duration,
    },
    Call {
        func: String,
        args: Vec<PromExpr>,
    },
    Aggregate {
        op: AggOp,
        #[serde(default)]
        grouping: Option<Grouping>,
        expr: Box<PromExpr>,
        #[serde(default)]
        param: Option<Box<PromExpr>>,
    },
    Binary {
        op: String,
        lhs: Box<PromExpr>,
        rhs: Box<PromExpr>,
    },
    Paren(Box<PromExpr>),
    Number(f64),
}

impl PromExpr {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::not_supported(format!("invalid query: {e}")))
    }

    /// Rewrite the tree bottom up: every child is rewritten before `f` sees
    /// its parent.
    pub fn rewrite<F>(self, f: &mut F) -> Result<PromExpr, Error>
    where
        F: FnMut(PromExpr) -> Result<PromExpr, Error>,
    {
        let node = match self {
            PromExpr::Call { func, args } => PromExpr::Call {
                func,
                args: args
                    .into_iter()
                    .map(|a| a.rewrite(f))
                    .collect::<Result<_, _>>()?,
            },
            PromExpr::Aggregate { op, grouping, expr, param } => {
                PromExpr::Aggregate {
                    op,
                    grouping,
                    expr: Box::new(expr.rewrite(f)?),
                    param: param
                        .map(|p| p.rewrite(f).map(Box::new))
                        .transpose()?,
                }
            }
            PromExpr::Binary { op, lhs, rhs } => PromExpr::Binary {
                op,
                lhs: Box::new(lhs.rewrite(f)?),
                rhs: Box::new(rhs.rewrite(f)?),
            },
            PromExpr::Paren(inner) => {
                PromExpr::Paren(Box::new(inner.rewrite(f)?))
            }
            leaf @ (PromExpr::Vector(_)
            | PromExpr::Matrix { .. }
            | PromExpr::Number(_)) => leaf,
        };
        f(node)
    }
}

/// What the evaluator is going to do with the samples of a selector, in
/// milliseconds.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SelectHints {
    pub start: i64,
    pub end: i64,
    pub step: i64,
    /// The range of the function applied, zero for instant vectors.
    #[serde(default)]
    pub range: i64,
    /// The function applied to the selected series. Empty if none.
    #[serde(default)]
    pub func: String,
    #[serde(default)]
    pub by: bool,
    #[serde(default)]
    pub grouping: Vec<String>,
}

/// Functions over instant vectors.
pub const INSTANT_FUNCTIONS: &[&str] = &[
    "abs", "absent", "ceil", "exp", "floor", "ln", "log2", "log10", "round",
    "scalar", "sgn", "sort", "sqrt", "timestamp", "atan", "cos", "cosh", "sin",
    "sinh", "tan", "tanh", "deg", "rad",
];

/// Functions over range vectors.
pub const RANGE_FUNCTIONS: &[&str] = &[
    "absent_over_time",
    "deriv",
    "idelta",
    "irate",
    "rate",
    "resets",
    "min_over_time",
    "max_over_time",
    "sum_over_time",
    "count_over_time",
    "stddev_over_time",
    "stdvar_over_time",
    "last_over_time",
    "present_over_time",
    "delta",
    "increase",
    "avg_over_time",
];

impl SelectHints {
    pub fn is_instant(&self) -> bool {
        self.func.is_empty() || INSTANT_FUNCTIONS.contains(&self.func.as_str())
    }

    pub fn is_range(&self) -> bool {
        RANGE_FUNCTIONS.contains(&self.func.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let query = json!({
            "aggregate": {
                "op": "sum",
                "grouping": {"by": ["job"]},
                "expr": {"call": {
                    "func": "rate",
                    "args": [{"matrix": {
                        "selector": {"matchers": [
                            {"name": "__name__", "op": "=", "value": "up"}
                        ]},
                        "range": "5m"
                    }}]
                }}
            }
        });
        let expr = PromExpr::from_json(&query.to_string()).unwrap();
        let PromExpr::Aggregate { op, expr, .. } = expr else {
            panic!("expected an aggregation");
        };
        assert_eq!(op, AggOp::Sum);
        let PromExpr::Call { args, .. } = *expr else {
            panic!("expected a call");
        };
        assert_eq!(
            args[0],
            PromExpr::Matrix {
                selector: VectorSelector::metric("up"),
                range: Duration::from_secs(300),
            }
        );
    }

    #[test]
    fn test_rewrite_is_bottom_up() {
        let expr = PromExpr::Binary {
            op: "+".into(),
            lhs: Box::new(PromExpr::Number(1.0)),
            rhs: Box::new(PromExpr::Paren(Box::new(PromExpr::Number(2.0)))),
        };
        let mut seen = vec![];
        let out = expr
            .rewrite(&mut |node| {
                let name = format!("{node:?}");
                seen.push(name[..3].to_string());
                Ok(match node {
                    PromExpr::Number(n) => PromExpr::Number(n * 10.0),
                    other => other,
                })
            })
            .unwrap();
        assert_eq!(seen, vec!["Num", "Num", "Par", "Bin"]);
        let PromExpr::Binary { lhs, .. } = out else {
            panic!("expected a binary expression");
        };
        assert_eq!(*lhs, PromExpr::Number(10.0));
    }

    #[test]
    fn test_hints_classification() {
        let mut hints = SelectHints::default();
        assert!(hints.is_instant());
        hints.func = "rate".into();
        assert!(hints.is_range() && !hints.is_instant());
    }
}
