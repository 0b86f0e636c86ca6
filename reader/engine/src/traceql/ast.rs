// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TraceQL AST.

// Copyright 2024 Oxide Computer Company

use crate::logql::ast::duration_str;
use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// `{...} | ... && {...} || ...`: spansets combined left to right.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TraceQuery {
    pub head: SpansetSelector,
    #[serde(default)]
    pub op: Option<SpansetOp>,
    #[serde(default)]
    pub tail: Option<Box<TraceQuery>>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum SpansetOp {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SpansetSelector {
    /// `None` for `{}`, matching every span.
    #[serde(default)]
    pub cond: Option<AttrExpr>,
    #[serde(default)]
    pub pipeline: Vec<PipelineStage>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum BoolOp {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrExpr {
    /// The `true` literal.
    True,
    Term(AttrCondition),
    Paren(Box<AttrExpr>),
    Binary { op: BoolOp, lhs: Box<AttrExpr>, rhs: Box<AttrExpr> },
}

/// `label op value`, e.g. `.http.status_code >= 500`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AttrCondition {
    pub label: LabelName,
    pub op: AttrOp,
    pub value: Value,
}

impl fmt::Display for AttrCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.label, self.op.as_str(), self.value)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum AttrOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "=~")]
    Re,
    #[serde(rename = "!~")]
    NotRe,
}

impl AttrOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttrOp::Eq => "=",
            AttrOp::Ne => "!=",
            AttrOp::Lt => "<",
            AttrOp::Le => "<=",
            AttrOp::Gt => ">",
            AttrOp::Ge => ">=",
            AttrOp::Re => "=~",
            AttrOp::NotRe => "!~",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Number(f64),
    Duration(#[serde(with = "duration_str")] Duration),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Duration(d) => write!(f, "{}ns", d.as_nanos()),
        }
    }
}

/// An attribute as written in a query: `span.x`, `resource.x`, `.x`, or an
/// intrinsic such as `name`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LabelName(pub String);

/// Intrinsic attributes stored with every span.
pub const INTRINSICS: &[&str] = &["name", "duration", "status"];

/// Marks root spans: `{nestedSetParent < 0}` selects them.
pub const NESTED_SET_PARENT: &str = "nestedSetParent";

impl LabelName {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    fn scoped(&self) -> Option<&str> {
        ["span.", "resource."]
            .iter()
            .find_map(|scope| self.0.strip_prefix(scope))
            .filter(|key| !key.is_empty())
    }

    fn unscoped(&self) -> Option<&str> {
        self.0.strip_prefix('.').filter(|key| !key.is_empty())
    }

    pub fn is_intrinsic(&self) -> bool {
        INTRINSICS.contains(&self.0.as_str())
    }

    pub fn is_duration(&self) -> bool {
        self.0 == "duration"
    }

    /// The key of the attribute in the attributes index.
    pub fn key(&self) -> &str {
        self.scoped().or_else(|| self.unscoped()).unwrap_or(&self.0)
    }

    pub fn check_supported(&self) -> Result<(), Error> {
        if self.scoped().is_some()
            || self.unscoped().is_some()
            || self.is_intrinsic()
        {
            return Ok(());
        }
        Err(Error::not_supported(format!("unsupported label: {self}")))
    }
}

impl fmt::Display for LabelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// `| count() > 2`, `| avg(duration) > 1s`.
    Aggregate(Aggregator),
    /// `| select(span.x, ...)`: attributes returned with every span.
    Select(Vec<LabelName>),
    /// `| by(span.x, ...)`: spansets split by attribute values.
    By(Vec<LabelName>),
    /// `| rate()`.
    Metric(MetricFn),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Aggregator {
    pub func: AggFn,
    #[serde(default)]
    pub attr: Option<LabelName>,
    pub op: AttrOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFn {
    Rate,
    CountOverTime,
}

impl MetricFn {
    pub fn name(&self) -> &'static str {
        match self {
            MetricFn::Rate => "rate",
            MetricFn::CountOverTime => "count_over_time",
        }
    }
}

impl TraceQuery {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::not_supported(format!("invalid query: {e}")))
    }

    /// The spanset selectors, in order.
    pub fn selectors(&self) -> Vec<&SpansetSelector> {
        let mut res = vec![&self.head];
        let mut tail = self.tail.as_deref();
        while let Some(q) = tail {
            res.push(&q.head);
            tail = q.tail.as_deref();
        }
        res
    }

    pub fn selectors_mut(&mut self) -> Vec<&mut SpansetSelector> {
        let mut res = vec![&mut self.head];
        let mut tail = self.tail.as_deref_mut();
        while let Some(q) = tail {
            res.push(&mut q.head);
            tail = q.tail.as_deref_mut();
        }
        res
    }

    pub fn is_complex(&self) -> bool {
        self.tail.is_some()
    }

    /// The metric function of the query, if any.
    pub fn metric(&self) -> Result<Option<MetricFn>, Error> {
        let mut found = self.selectors().into_iter().flat_map(|s| {
            s.pipeline.iter().filter_map(|p| match p {
                PipelineStage::Metric(m) => Some(*m),
                _ => None,
            })
        });
        let first = found.next();
        if found.next().is_some() {
            return Err(Error::not_supported(
                "multiple metric functions are not supported",
            ));
        }
        if first.is_some() && self.is_complex() {
            return Err(Error::not_supported(
                "complex expression with metric functions is not supported",
            ));
        }
        Ok(first)
    }

    /// The attributes of every `by(..)` stage.
    pub fn group_by(&self) -> Vec<LabelName> {
        self.selectors()
            .into_iter()
            .flat_map(|s| s.pipeline.iter())
            .filter_map(|p| match p {
                PipelineStage::By(labels) => Some(labels.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The attributes returned with every span: `select(..)` and `by(..)`.
    pub fn select_attrs(&self) -> Vec<LabelName> {
        self.selectors()
            .into_iter()
            .flat_map(|s| s.pipeline.iter())
            .filter_map(|p| match p {
                PipelineStage::Select(labels) | PipelineStage::By(labels) => {
                    Some(labels.iter().cloned())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Reject shapes of queries the planners cannot handle.
    pub fn check(&self) -> Result<(), Error> {
        let selectors = self.selectors();
        for (i, s) in selectors.iter().enumerate() {
            if s.cond.is_some() {
                continue;
            }
            if i > 0 {
                return Err(Error::not_supported(
                    "requests like `... || {}` are not supported",
                ));
            }
            if s.aggregator().is_some() {
                return Err(Error::not_supported(
                    "requests like `{} | ....` are not supported",
                ));
            }
            if self.is_complex() {
                return Err(Error::not_supported(
                    "requests like `{} || .....` are not supported",
                ));
            }
        }
        for s in selectors {
            let mut labels = vec![];
            if let Some(cond) = &s.cond {
                cond.labels(&mut labels);
            }
            for stage in s.pipeline.iter() {
                match stage {
                    PipelineStage::Aggregate(a) => labels.extend(a.attr.iter()),
                    PipelineStage::Select(l) | PipelineStage::By(l) => {
                        labels.extend(l.iter())
                    }
                    PipelineStage::Metric(_) => (),
                }
            }
            if s.is_root_spans() {
                continue;
            }
            for label in labels {
                label.check_supported()?;
            }
        }
        Ok(())
    }
}

impl SpansetSelector {
    pub fn aggregator(&self) -> Option<&Aggregator> {
        self.pipeline.iter().find_map(|p| match p {
            PipelineStage::Aggregate(a) => Some(a),
            _ => None,
        })
    }

    /// True for exactly `{nestedSetParent < 0}`, which selects root spans.
    pub fn is_root_spans(&self) -> bool {
        matches!(
            &self.cond,
            Some(AttrExpr::Term(AttrCondition {
                label,
                op: AttrOp::Lt,
                value: Value::Number(n),
            })) if label.0 == NESTED_SET_PARENT && *n == 0.0
        )
    }

    /// Fold `true` literals out of the attribute condition.
    pub fn optimize(&mut self) {
        self.cond = self.cond.take().and_then(|cond| match fold(cond) {
            AttrExpr::True => None,
            cond => Some(cond),
        });
    }
}

impl AttrExpr {
    fn labels<'a>(&'a self, out: &mut Vec<&'a LabelName>) {
        match self {
            AttrExpr::True => (),
            AttrExpr::Term(t) => out.push(&t.label),
            AttrExpr::Paren(inner) => inner.labels(out),
            AttrExpr::Binary { lhs, rhs, .. } => {
                lhs.labels(out);
                rhs.labels(out);
            }
        }
    }
}

fn fold(expr: AttrExpr) -> AttrExpr {
    match expr {
        AttrExpr::Paren(inner) => match fold(*inner) {
            e @ (AttrExpr::True | AttrExpr::Term(_)) => e,
            e => AttrExpr::Paren(Box::new(e)),
        },
        AttrExpr::Binary { op, lhs, rhs } => {
            match (op, fold(*lhs), fold(*rhs)) {
                (BoolOp::And, AttrExpr::True, e)
                | (BoolOp::And, e, AttrExpr::True) => e,
                (BoolOp::Or, AttrExpr::True, _)
                | (BoolOp::Or, _, AttrExpr::True) => AttrExpr::True,
                (op, lhs, rhs) => AttrExpr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            }
        }
        e => e,
    }
}

/// Fold `true` literals out of every selector of a query.
pub fn optimize(query: &mut TraceQuery) {
    for s in query.selectors_mut() {
        s.optimize();
    }
}
