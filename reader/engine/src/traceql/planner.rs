// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planners searching spans through the attributes index.
//!
//! The index holds one row per attribute of every span. A span matches a
//! selector when the attribute rows of the span satisfy the condition tree
//! of the selector, so conditions over several attributes are evaluated
//! per `(trace_id, span_id)` group.

// Copyright 2024 Oxide Computer Company

use super::ast::AggFn;
use super::ast::AttrCondition;
use super::ast::AttrExpr;
use super::ast::AttrOp;
use super::ast::BoolOp;
use super::ast::LabelName;
use super::ast::MetricFn;
use super::ast::SpansetOp;
use super::ast::Value;
use crate::config::Table;
use crate::context::PlannerContext;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::Error;
use sql_select::quote;
use sql_select::CmpOp;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::Join;
use sql_select::JoinKind;
use sql_select::OrderBy;
use sql_select::Select;
use sql_select::SetOp;
use sql_select::Source;
use std::collections::BTreeMap;
use std::time::Duration;

const INDEX_ALIAS: &str = "traces_idx";

/// Spans kept per trace and spanset.
const SPANS_PER_TRACE: usize = 100;

const NS_PER_MS: i64 = 1_000_000;

fn index_source(ctx: &PlannerContext) -> Source {
    Source::table(ctx.dist_table(Table::TracesAttrs)).alias(INDEX_ALIAS)
}

fn index_range(ctx: &PlannerContext) -> [Expr; 4] {
    let col = |c: &str| Expr::raw(format!("{INDEX_ALIAS}.{c}"));
    [
        Expr::ge(col("date"), Expr::str(ctx.from_date())),
        Expr::le(col("date"), Expr::str(ctx.to_date())),
        Expr::ge(col("timestamp_ns"), Expr::int(ctx.from_ns())),
        Expr::lt(col("timestamp_ns"), Expr::int(ctx.to_ns())),
    ]
}

fn span_ids() -> [Column; 2] {
    [
        Column::new(format!("{INDEX_ALIAS}.trace_id"), "trace_id"),
        Column::new(format!("{INDEX_ALIAS}.span_id"), "span_id"),
    ]
}

fn cmp_op(op: AttrOp) -> Option<CmpOp> {
    match op {
        AttrOp::Eq => Some(CmpOp::Eq),
        AttrOp::Ne => Some(CmpOp::Ne),
        AttrOp::Lt => Some(CmpOp::Lt),
        AttrOp::Le => Some(CmpOp::Le),
        AttrOp::Gt => Some(CmpOp::Gt),
        AttrOp::Ge => Some(CmpOp::Ge),
        AttrOp::Re | AttrOp::NotRe => None,
    }
}

fn duration_ns(d: &Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// The value of a comparison against a numeric column or aggregate.
fn numeric_value(value: &Value) -> Result<Expr, Error> {
    match value {
        Value::Number(n) => Ok(Expr::float(*n)),
        Value::Duration(d) => Ok(Expr::int(duration_ns(d))),
        Value::Str(s) => Err(Error::not_supported(format!(
            "a string is not comparable with a number: {s:?}"
        ))),
    }
}

/// The predicate matching the index rows of a single condition.
pub(crate) fn term_expr(term: &AttrCondition) -> Result<Expr, Error> {
    let col = |c: &str| Expr::raw(format!("{INDEX_ALIAS}.{c}"));
    if term.label.is_duration() {
        let op = cmp_op(term.op).ok_or_else(|| {
            Error::not_supported(format!("not supported operator: {term}"))
        })?;
        return Ok(Expr::cmp(op, col("duration"), numeric_value(&term.value)?));
    }
    let value = match (&term.value, term.op) {
        (Value::Str(re), AttrOp::Re) => {
            Expr::func("match", vec![col("val"), Expr::str(anchored(re))])
        }
        (Value::Str(re), AttrOp::NotRe) => Expr::eq(
            Expr::func("match", vec![col("val"), Expr::str(anchored(re))]),
            Expr::int(0),
        ),
        (_, AttrOp::Re | AttrOp::NotRe) => {
            return Err(Error::not_supported(format!(
                "regular expressions match strings only: {term}"
            )))
        }
        (Value::Str(s), op) => {
            let op = cmp_op(op).ok_or_else(|| {
                Error::planning(format!("unexpected operator in {term}"))
            })?;
            Expr::cmp(op, col("val"), Expr::str(s.as_str()))
        }
        (value, op) => {
            let op = cmp_op(op).ok_or_else(|| {
                Error::planning(format!("unexpected operator in {term}"))
            })?;
            let val = Expr::func("toFloat64OrNull", vec![col("val")]);
            Expr::cmp(op, val, numeric_value(value)?)
        }
    };
    Ok(Expr::and(vec![
        Expr::eq(col("key"), Expr::str(term.label.key())),
        value,
    ]))
}

fn anchored(re: &str) -> String {
    format!("^(?:{re})$")
}

/// A condition tree over the distinct terms of a selector.
#[derive(Clone, Debug, PartialEq)]
pub enum Cond {
    Term(usize),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
}

impl Cond {
    /// A SQL condition, with `term` giving the condition of each term.
    pub fn render(&self, term: &impl Fn(usize) -> Expr) -> Expr {
        match self {
            Cond::Term(i) => term(*i),
            Cond::And(l, r) => Expr::and(vec![l.render(term), r.render(term)]),
            Cond::Or(l, r) => Expr::or(vec![l.render(term), r.render(term)]),
        }
    }

    /// A statement combining the statements of the terms with set
    /// operations.
    pub fn combine(&self, term: &impl Fn(usize) -> Select) -> Select {
        let (op, l, r) = match self {
            Cond::Term(i) => return term(*i),
            Cond::And(l, r) => (SetOp::Intersect, l, r),
            Cond::Or(l, r) => (SetOp::UnionDistinct, l, r),
        };
        let operands = vec![l.combine(term), r.combine(term)];
        Select::new()
            .select([Column::raw("*")])
            .from(Source::new(Expr::set_op(op, operands)))
    }
}

/// The distinct attribute conditions of a selector and how they combine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Terms {
    pub terms: Vec<AttrCondition>,
    /// `None` when every span matches.
    pub cond: Option<Cond>,
}

impl Terms {
    pub fn analyze(expr: Option<&AttrExpr>) -> Self {
        let mut res = Terms::default();
        let mut seen = BTreeMap::new();
        res.cond = expr.and_then(|e| res.add(e, &mut seen));
        res
    }

    fn add(
        &mut self,
        expr: &AttrExpr,
        seen: &mut BTreeMap<String, usize>,
    ) -> Option<Cond> {
        match expr {
            AttrExpr::True => None,
            AttrExpr::Term(t) => {
                let idx = *seen.entry(t.to_string()).or_insert_with(|| {
                    self.terms.push(t.clone());
                    self.terms.len() - 1
                });
                Some(Cond::Term(idx))
            }
            AttrExpr::Paren(inner) => self.add(inner, seen),
            AttrExpr::Binary { op, lhs, rhs } => {
                let lhs = self.add(lhs, seen);
                let rhs = self.add(rhs, seen);
                match (op, lhs, rhs) {
                    (BoolOp::And, Some(l), Some(r)) => {
                        Some(Cond::And(Box::new(l), Box::new(r)))
                    }
                    (BoolOp::And, l, r) => l.or(r),
                    (BoolOp::Or, Some(l), Some(r)) => {
                        Some(Cond::Or(Box::new(l), Box::new(r)))
                    }
                    (BoolOp::Or, _, _) => None,
                }
            }
        }
    }
}

/// Read the attributes index over the time range of the request.
///
/// Selects one row per span, or, to estimate the cost of a search, the
/// number of index rows as `_count`.
#[derive(Debug)]
pub struct IndexInit {
    pub eval: bool,
}

impl Planner for IndexInit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let res = Select::new()
            .from(index_source(ctx))
            .and_where(index_range(ctx));
        if self.eval {
            return Ok(res.select([Column::new("count()", "_count")]));
        }
        let [trace_id, span_id] = span_ids();
        Ok(res
            .select([
                trace_id,
                span_id,
                Column::new(format!("any({INDEX_ALIAS}.duration)"), "duration"),
                Column::new(
                    format!("any({INDEX_ALIAS}.timestamp_ns)"),
                    "timestamp_ns",
                ),
            ])
            .group_by([
                Expr::raw(format!("{INDEX_ALIAS}.trace_id")),
                Expr::raw(format!("{INDEX_ALIAS}.span_id")),
            ]))
    }
}

fn agg_val_column(attr: &LabelName) -> Column {
    Column::new(
        format!(
            "anyIf(toFloat64OrNull({INDEX_ALIAS}.val), {INDEX_ALIAS}.key = {})",
            quote(attr.key())
        ),
        "agg_val",
    )
}

/// Filter the index with every term of a selector at once, then keep the
/// spans whose terms satisfy the condition tree.
///
/// Each term sets one bit of a per-span mask, checked in `HAVING`.
#[derive(Debug)]
pub struct AttrConditionPlanner {
    pub main: BoxPlanner,
    pub terms: Terms,
    /// The attribute aggregated by the selector, exposed as `agg_val`.
    pub aggregated_attr: Option<LabelName>,
}

impl Planner for AttrConditionPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let mut res = self.main.process(ctx)?;
        if self.terms.terms.len() > 64 {
            return Err(Error::not_supported(
                "too many attribute conditions in a selector",
            ));
        }
        let preds = self
            .terms
            .terms
            .iter()
            .map(term_expr)
            .collect::<Result<Vec<_>, _>>()?;
        let mut filter = preds.clone();
        let grouped = !res.group_by_exprs().is_empty();
        let agg_attr =
            self.aggregated_attr.as_ref().filter(|a| !a.is_duration());
        if let (Some(attr), true) = (agg_attr, grouped) {
            filter.push(Expr::eq(
                Expr::raw(format!("{INDEX_ALIAS}.key")),
                Expr::str(attr.key()),
            ));
            res = res.add_column(agg_val_column(attr));
        }
        if !filter.is_empty() {
            res = res.and_where([Expr::or(filter)]);
        }
        let Some(cond) = &self.terms.cond else {
            return Ok(res);
        };
        if !grouped {
            return Ok(res);
        }
        let bits = preds
            .into_iter()
            .enumerate()
            .map(|(i, pred)| {
                let bit = Expr::func("toUInt64", vec![pred]);
                Expr::func("bitShiftLeft", vec![bit, Expr::int(i as i64)])
            })
            .reduce(|acc, bit| Expr::func("bitOr", vec![acc, bit]))
            .ok_or_else(|| Error::planning("a condition without terms"))?;
        let having = cond.render(&|i| {
            let mask = Expr::raw(format!("{}", 1u64 << i));
            Expr::ne(
                Expr::func("bitAnd", vec![Expr::raw("_mask"), mask]),
                Expr::int(0),
            )
        });
        let mask = Column::new(Expr::func("groupBitOr", vec![bits]), "_mask");
        Ok(res.add_column(mask).and_having([having]))
    }
}

/// Match every term separately and combine the matched spans with set
/// operations.
///
/// Heavier to run than [`AttrConditionPlanner`] on small ranges, but never
/// builds a composite condition over the whole index.
#[derive(Debug)]
pub struct TermSetPlanner {
    pub terms: Terms,
    pub aggregated_attr: Option<LabelName>,
    pub prefix: String,
}

impl Planner for TermSetPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let cond = self.terms.cond.as_ref().ok_or_else(|| {
            Error::planning("matching terms separately needs a condition")
        })?;
        let ctes = self
            .terms
            .terms
            .iter()
            .enumerate()
            .map(|(i, term)| {
                let body = Select::new()
                    .distinct(true)
                    .select(span_ids())
                    .from(index_source(ctx))
                    .and_where(index_range(ctx))
                    .and_where([term_expr(term)?]);
                Ok(Cte::new(format!("{}term_{i}", self.prefix), body))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let combined = cond.combine(&|i| {
            let alias = ctes.get(i).map(|c| c.alias.as_str()).unwrap_or("");
            Select::new()
                .select([Column::simple("trace_id"), Column::simple("span_id")])
                .from(Source::cte(alias))
        });
        let matched = Cte::new(format!("{}terms", self.prefix), combined);
        let cond = Expr::in_(
            Expr::raw(format!(
                "({INDEX_ALIAS}.trace_id, {INDEX_ALIAS}.span_id)"
            )),
            matched.reference(),
        );
        let mut res = IndexInit { eval: false }.process(ctx)?;
        for cte in ctes {
            res = res.with(cte);
        }
        res = res.with(matched).and_where([cond]);
        if let Some(attr) =
            self.aggregated_attr.as_ref().filter(|a| !a.is_duration())
        {
            res = res.add_column(agg_val_column(attr));
        }
        Ok(res)
    }
}

/// Select spans of a selector without attribute conditions, `{}`, from the
/// spans table: the spans of the latest traces or, with `only_root`, their
/// root spans.
#[derive(Debug)]
pub struct AttrlessPlanner {
    pub only_root: bool,
}

impl Planner for AttrlessPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let table = ctx.dist_table(Table::Traces);
        let in_range = |col: &str| {
            [
                Expr::ge(Expr::raw(col), Expr::int(ctx.from_ns())),
                Expr::lt(Expr::raw(col), Expr::int(ctx.to_ns())),
            ]
        };
        let mut trace_ids = Select::new()
            .distinct(true)
            .select([Column::simple("trace_id")])
            .from(Source::table(table).alias("traces"))
            .and_where(in_range("timestamp_ns"))
            .order_by([OrderBy::desc("timestamp_ns")]);
        if ctx.limit > 0 {
            trace_ids = trace_ids.limit(ctx.limit);
        }
        let trace_ids = Cte::new("attrless_trace_ids", trace_ids);
        let spans = Cte::new(
            "attrless_spans",
            Select::new()
                .select([
                    Column::simple("trace_id"),
                    Column::new(
                        format!("groupArray({SPANS_PER_TRACE})(span_id)"),
                        "span_id",
                    ),
                ])
                .from(Source::table(table).alias("traces"))
                .and_where(in_range("timestamp_ns"))
                .and_where([Expr::in_(
                    Expr::raw("trace_id"),
                    trace_ids.reference(),
                )])
                .group_by([Expr::raw("trace_id")]),
        );
        let unnested = Cte::new(
            "attrless_spans_unnested",
            Select::new()
                .select([
                    Column::simple("trace_id"),
                    Column::new("_span_id", "span_id"),
                ])
                .from(Source::cte(spans.alias.as_str()))
                .join(Join::array(format!(
                    "{}.span_id AS _span_id",
                    spans.alias
                ))),
        );
        let matched = Expr::in_(
            Expr::raw("(traces.trace_id, traces.span_id)"),
            unnested.reference(),
        );
        let res = Select::new()
            .with(trace_ids)
            .with(spans)
            .with(unnested)
            .from(Source::table(table).alias("traces"))
            .and_where(in_range("traces.timestamp_ns"))
            .and_where([matched]);
        if self.only_root {
            return Ok(res
                .select([
                    Column::simple("trace_id"),
                    Column::new(
                        "argMin(traces.span_id, traces.timestamp_ns)",
                        "span_id",
                    ),
                    Column::new(
                        "argMin(traces.duration_ns, traces.timestamp_ns)",
                        "duration",
                    ),
                    Column::new("min(traces.timestamp_ns)", "timestamp_ns"),
                ])
                .group_by([Expr::raw("trace_id")])
                .order_by([OrderBy::desc("timestamp_ns")]));
        }
        Ok(res
            .select([
                Column::simple("trace_id"),
                Column::new("traces.span_id", "span_id"),
                Column::new("traces.duration_ns", "duration"),
                Column::new("traces.timestamp_ns", "timestamp_ns"),
            ])
            .order_by([OrderBy::desc("traces.timestamp_ns")]))
    }
}

/// The alias of the CTE holding the matched spans of a selector.
pub fn search_alias(prefix: &str) -> String {
    format!("{prefix}index_search")
}

/// Group the matched spans by trace: `trace_id` and the arrays `span_id`,
/// `duration` and `timestamp_ns`, latest traces first.
#[derive(Debug)]
pub struct IndexGroupByPlanner {
    pub main: BoxPlanner,
    pub prefix: String,
}

impl Planner for IndexGroupByPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let search = Cte::new(search_alias(&self.prefix), main);
        let src = search.alias.clone();
        let arr = |col: &str| {
            Column::new(
                format!("groupArray({SPANS_PER_TRACE})({src}.{col})"),
                col,
            )
        };
        Ok(Select::new()
            .with(search)
            .select([
                Column::new(format!("{src}.trace_id"), "trace_id"),
                arr("span_id"),
                arr("duration"),
                arr("timestamp_ns"),
            ])
            .from(Source::cte(src.as_str()))
            .group_by([Expr::raw(format!("{src}.trace_id"))])
            .order_by([OrderBy::desc(format!("max({src}.timestamp_ns)"))]))
    }
}

/// Keep the traces whose matched spans satisfy an aggregate condition, e.g.
/// `| count() > 2`.
#[derive(Debug)]
pub struct AggregatorPlanner {
    pub main: BoxPlanner,
    pub func: AggFn,
    pub attr: Option<LabelName>,
    pub op: AttrOp,
    pub value: Value,
    pub prefix: String,
}

impl Planner for AggregatorPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let src = search_alias(&self.prefix);
        let func = match self.func {
            AggFn::Count => "count",
            AggFn::Sum => "sum",
            AggFn::Min => "min",
            AggFn::Max => "max",
            AggFn::Avg => "avg",
        };
        let lhs = match (&self.func, &self.attr) {
            (AggFn::Count, _) => Expr::raw("count()"),
            (_, Some(attr)) if attr.is_duration() => {
                Expr::raw(format!("{func}({src}.duration)"))
            }
            (_, Some(_)) => Expr::raw(format!("{func}({src}.agg_val)")),
            (_, None) => {
                return Err(Error::not_supported(format!(
                    "{func}() needs an attribute"
                )))
            }
        };
        let op = cmp_op(self.op).ok_or_else(|| {
            Error::not_supported(format!(
                "not supported operator: {}",
                self.op.as_str()
            ))
        })?;
        let rhs = numeric_value(&self.value)?;
        Ok(main.and_having([Expr::cmp(op, lhs, rhs)]))
    }
}

/// Combine the spansets of several selectors, each grouped by trace.
///
/// With `&&` a trace must be matched by every operand; its spans are those
/// of every operand.
#[derive(Debug)]
pub struct SpansetCombinePlanner {
    pub op: SpansetOp,
    pub operands: Vec<BoxPlanner>,
    pub prefix: String,
}

impl Planner for SpansetCombinePlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let selects = self
            .operands
            .iter()
            .map(|p| p.process(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let n = selects.len();
        let mut ctes = Vec::new();
        let mut members = Vec::new();
        // Operands keep their own CTEs, declared once at the top.
        for mut select in selects {
            for cte in select.ctes().to_vec() {
                select = select.drop_with(&cte.alias);
                ctes.push(cte);
            }
            members.push(select);
        }
        let src = format!("{}a", self.prefix);
        let arr = |col: &str| {
            Column::new(format!("groupArrayArray({src}.{col})"), col)
        };
        let mut res = Select::new()
            .select([
                Column::new(format!("{src}.trace_id"), "trace_id"),
                arr("span_id"),
                arr("duration"),
                arr("timestamp_ns"),
            ])
            .from(
                Source::new(Expr::set_op(SetOp::UnionAll, members))
                    .alias(src.as_str()),
            )
            .group_by([Expr::raw(format!("{src}.trace_id"))])
            .order_by([OrderBy::desc(format!(
                "max(arrayMax({src}.timestamp_ns))"
            ))]);
        for cte in ctes {
            res = res.with(cte);
        }
        if self.op == SpansetOp::And {
            res = res.and_having([Expr::eq(
                Expr::raw("count()"),
                Expr::int(n as i64),
            )]);
        }
        Ok(res)
    }
}

/// Read the details of the matched traces.
///
/// Every row is a trace: the matched spans with their durations, start
/// times and requested attributes, along with the start, duration, root
/// service and root span name of the whole trace.
#[derive(Debug)]
pub struct TracesDataPlanner {
    pub main: BoxPlanner,
    /// Attributes returned with every span.
    pub attrs: Vec<LabelName>,
}

impl Planner for TracesDataPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let table = ctx.dist_table(Table::Traces);
        let grouped = Cte::new("index_grouped", self.main.process(ctx)?);
        let trace_ids = Cte::new(
            "trace_ids",
            Select::new()
                .select([Column::simple("trace_id")])
                .from(Source::cte("index_grouped")),
        );
        let span_ids = Cte::new(
            "trace_span_ids",
            Select::new()
                .select([Column::simple("trace_id"), Column::simple("span_id")])
                .from(Source::cte("index_grouped"))
                .join(Join::array("span_id")),
        );
        let info = Cte::new(
            "traces_info",
            Select::new()
                .select([
                    Column::new("traces.trace_id", "trace_id"),
                    Column::new(
                        "min(traces.timestamp_ns)",
                        "_start_time_unix_nano",
                    ),
                    Column::new(
                        "toFloat64(max(traces.timestamp_ns + \
                         traces.duration_ns) - min(traces.timestamp_ns)) \
                         / 1000000",
                        "_duration_ms",
                    ),
                    Column::new(
                        "argMin(traces.service_name, traces.timestamp_ns)",
                        "_root_service_name",
                    ),
                    Column::new(
                        "argMin(traces.name, traces.timestamp_ns)",
                        "_root_trace_name",
                    ),
                ])
                .from(Source::table(table).alias("traces"))
                .and_where([Expr::in_(
                    Expr::raw("traces.trace_id"),
                    trace_ids.reference(),
                )])
                .group_by([Expr::raw("traces.trace_id")]),
        );
        let res = Select::new()
            .select([
                Column::new("lower(hex(traces.trace_id))", "trace_id"),
                Column::new(
                    "arrayMap(x -> lower(hex(x)), groupArray(traces.span_id))",
                    "span_id",
                ),
                Column::new("groupArray(traces.duration_ns)", "duration"),
                Column::new("groupArray(traces.timestamp_ns)", "timestamp_ns"),
                Column::new(
                    "min(_start_time_unix_nano)",
                    "start_time_unix_nano",
                ),
                Column::new("min(_duration_ms)", "duration_ms"),
                Column::new("min(_root_service_name)", "root_service_name"),
                Column::new("min(_root_trace_name)", "root_trace_name"),
            ])
            .from(Source::table(table).alias("traces"))
            .join(Join::new(
                JoinKind::AnyLeft,
                Source::cte(info.alias.as_str()),
                Expr::eq(
                    Expr::raw("traces.trace_id"),
                    Expr::raw("traces_info.trace_id"),
                ),
            ))
            .and_where([
                Expr::in_(Expr::raw("traces.trace_id"), trace_ids.reference()),
                Expr::in_(
                    Expr::raw("(traces.trace_id, traces.span_id)"),
                    span_ids.reference(),
                ),
            ])
            .group_by([Expr::raw("traces.trace_id")])
            .order_by([OrderBy::desc("start_time_unix_nano")]);
        let res = res
            .with(grouped)
            .with(trace_ids)
            .with(span_ids.clone())
            .with(info);
        if self.attrs.is_empty() {
            return Ok(res.add_column(Column::new(
                "[]::Array(Array(Tuple(String, String)))",
                "attrs",
            )));
        }
        let keys = Expr::str_tuple(self.attrs.iter().map(LabelName::key));
        let attrs = Cte::new(
            "attrs",
            Select::new()
                .select([
                    Column::simple("trace_id"),
                    Column::simple("span_id"),
                    Column::new(
                        "arrayZip(groupArray(key), groupArray(val))",
                        "attrs",
                    ),
                ])
                .from(ctx.dist_table(Table::TracesAttrs))
                .and_where([
                    Expr::in_(
                        Expr::raw("(trace_id, span_id)"),
                        span_ids.reference(),
                    ),
                    Expr::in_(Expr::raw("key"), keys),
                    Expr::ge(Expr::raw("date"), Expr::str(ctx.from_date())),
                    Expr::le(Expr::raw("date"), Expr::str(ctx.to_date())),
                ])
                .group_by([Expr::raw("trace_id"), Expr::raw("span_id")]),
        );
        Ok(res
            .add_column(Column::new("groupArray(attrs.attrs)", "attrs"))
            .join(Join::new(
                JoinKind::AnyLeft,
                Source::cte(attrs.alias.as_str()),
                Expr::and(vec![
                    Expr::eq(
                        Expr::raw("traces.trace_id"),
                        Expr::raw("attrs.trace_id"),
                    ),
                    Expr::eq(
                        Expr::raw("traces.span_id"),
                        Expr::raw("attrs.span_id"),
                    ),
                ]),
            ))
            .with(attrs))
    }
}

/// Estimate the cost of searching a selector: the number of index rows
/// its terms match, as `_count`, tagged with the selector `prefix`.
#[derive(Debug)]
pub struct AttrConditionEvaluator {
    pub main: BoxPlanner,
    pub prefix: String,
}

impl Planner for AttrConditionEvaluator {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let columns = std::iter::once(Column::new(
            Expr::str(self.prefix.as_str()),
            "prefix",
        ))
        .chain(main.columns().iter().cloned())
        .collect::<Vec<_>>();
        Ok(main.select(columns))
    }
}

/// The cost of a selector reading the spans table: the request limit.
#[derive(Debug)]
pub struct AttrlessEvaluator {
    pub prefix: String,
}

impl Planner for AttrlessEvaluator {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        Ok(Select::new().select([
            Column::new(Expr::str(self.prefix.as_str()), "prefix"),
            Column::new(Expr::int(ctx.limit), "_count"),
        ]))
    }
}

/// Count the matched spans of a selector per step.
#[derive(Debug)]
pub struct MetricPlanner {
    /// The grouped spans of a selector, see [`IndexGroupByPlanner`].
    pub main: BoxPlanner,
    pub func: MetricFn,
    pub prefix: String,
}

impl Planner for MetricPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let alias = search_alias(&self.prefix);
        if main.cte(&alias).is_none() {
            return Err(Error::planning(format!(
                "could not find the '{alias}' CTE"
            )));
        }
        // The traces left once the aggregate conditions apply.
        let traces = Cte::new("pre_metric", main);
        let trace_ids = Cte::new(
            "metric_traces",
            Select::new()
                .select([Column::simple("trace_id")])
                .from(Source::cte("pre_metric")),
        );
        let step_ms = ctx.step_ms();
        let value = match self.func {
            MetricFn::Rate => format!(
                "toFloat64(count()) / {}",
                step_ms as f64 / 1000.0
            ),
            MetricFn::CountOverTime => String::from("count()"),
        };
        let matched = Expr::in_(
            Expr::raw(format!("{alias}.trace_id")),
            trace_ids.reference(),
        );
        Ok(Select::new()
            .with(traces)
            .with(trace_ids)
            .select([
                Column::new(
                    format!(
                        "intDiv({alias}.timestamp_ns, {}) * {step_ms}",
                        step_ms * NS_PER_MS
                    ),
                    "timestamp_ms",
                ),
                Column::new(value, "value"),
            ])
            .from(Source::cte(alias.as_str()))
            .and_where([matched])
            .group_by([Expr::raw("timestamp_ms")])
            .order_by([OrderBy::asc("timestamp_ms")]))
    }
}

/// The attribute names of the spans matched by `main`, or of every span
/// when there is no condition.
#[derive(Debug)]
pub struct TagNamesPlanner {
    pub main: Option<BoxPlanner>,
}

/// The values of an attribute over the spans matched by `main`, or over
/// every span when there is no condition.
#[derive(Debug)]
pub struct TagValuesPlanner {
    pub main: Option<BoxPlanner>,
    pub key: String,
}

fn tags_select(
    ctx: &PlannerContext,
    main: Option<&BoxPlanner>,
    column: &str,
) -> Result<Select, Error> {
    let res = Select::new()
        .distinct(true)
        .select([Column::simple(column)])
        .order_by([OrderBy::asc(column)]);
    let res = match main {
        None => res
            .from(ctx.dist_table(Table::TracesKv))
            .and_where([
                Expr::ge(Expr::raw("date"), Expr::str(ctx.from_date())),
                Expr::le(Expr::raw("date"), Expr::str(ctx.to_date())),
            ]),
        Some(main) => {
            let search = Cte::new("tag_search", main.process(ctx)?);
            let spans = Cte::new(
                "tag_spans",
                Select::new()
                    .select([
                        Column::simple("trace_id"),
                        Column::simple("span_id"),
                    ])
                    .from(Source::cte("tag_search")),
            );
            let matched = Expr::in_(
                Expr::raw(format!(
                    "({INDEX_ALIAS}.trace_id, {INDEX_ALIAS}.span_id)"
                )),
                spans.reference(),
            );
            res.with(search)
                .with(spans)
                .from(index_source(ctx))
                .and_where(index_range(ctx))
                .and_where([matched])
        }
    };
    if ctx.limit > 0 {
        return Ok(res.limit(ctx.limit));
    }
    Ok(res)
}

impl Planner for TagNamesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        tags_select(ctx, self.main.as_ref(), "key")
    }
}

impl Planner for TagValuesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let res = tags_select(ctx, self.main.as_ref(), "val")?;
        let key = match self.main {
            Some(_) => format!("{INDEX_ALIAS}.key"),
            None => String::from("key"),
        };
        Ok(res.and_where([Expr::eq(Expr::raw(key), Expr::str(&self.key))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_context;

    fn term(label: &str, op: AttrOp, value: Value) -> AttrCondition {
        AttrCondition { label: LabelName::new(label), op, value }
    }

    fn expr(t: AttrCondition) -> AttrExpr {
        AttrExpr::Term(t)
    }

    fn binary(op: BoolOp, lhs: AttrExpr, rhs: AttrExpr) -> AttrExpr {
        AttrExpr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    fn service(name: &str) -> AttrCondition {
        term("resource.service.name", AttrOp::Eq, Value::Str(name.into()))
    }

    fn slow() -> AttrCondition {
        term(
            "duration",
            AttrOp::Gt,
            Value::Duration(Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_terms_are_deduplicated() {
        let cond = binary(
            BoolOp::Or,
            binary(BoolOp::And, expr(service("api")), expr(slow())),
            expr(service("api")),
        );
        let terms = Terms::analyze(Some(&cond));
        assert_eq!(terms.terms, vec![service("api"), slow()]);
        assert_eq!(
            terms.cond,
            Some(Cond::Or(
                Box::new(Cond::And(
                    Box::new(Cond::Term(0)),
                    Box::new(Cond::Term(1))
                )),
                Box::new(Cond::Term(0)),
            ))
        );
    }

    #[test]
    fn test_term_expressions() {
        let ctx = test_context();
        let render = |t: AttrCondition| {
            let e = term_expr(&t).unwrap();
            ctx.render(&Select::new().select([Column::raw(e)])).unwrap()
        };
        assert_eq!(
            render(service("api")),
            "SELECT (traces_idx.key = 'service.name' AND \
             traces_idx.val = 'api')"
        );
        assert_eq!(
            render(slow()),
            "SELECT traces_idx.duration > 100000000"
        );
        assert_eq!(
            render(term(".code", AttrOp::Ge, Value::Number(500.0))),
            "SELECT (traces_idx.key = 'code' AND \
             toFloat64OrNull(traces_idx.val) >= 500.0)"
        );
        assert_eq!(
            render(term("name", AttrOp::NotRe, Value::Str("GET .*".into()))),
            "SELECT (traces_idx.key = 'name' AND \
             match(traces_idx.val, '^(?:GET .*)$') = 0)"
        );
        let bad = term(".code", AttrOp::Re, Value::Number(5.0));
        assert!(matches!(term_expr(&bad), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_attr_condition_bitmask() {
        let cond = binary(BoolOp::And, expr(service("api")), expr(slow()));
        let p = AttrConditionPlanner {
            main: Box::new(IndexInit { eval: false }),
            terms: Terms::analyze(Some(&cond)),
            aggregated_attr: None,
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with(
            "SELECT traces_idx.trace_id AS trace_id, \
             traces_idx.span_id AS span_id"
        ));
        assert!(sql.contains("FROM tempo_traces_attrs_gin AS traces_idx"));
        assert!(sql.contains(
            "groupBitOr(bitOr(bitShiftLeft(toUInt64((traces_idx.key = \
             'service.name' AND traces_idx.val = 'api')), 0), \
             bitShiftLeft(toUInt64(traces_idx.duration > 100000000), 1))) \
             AS _mask"
        ));
        assert!(sql.ends_with(
            "HAVING (bitAnd(_mask, 1) != 0 AND bitAnd(_mask, 2) != 0)"
        ));
    }

    #[test]
    fn test_attr_condition_eval() {
        let p = AttrConditionEvaluator {
            main: Box::new(AttrConditionPlanner {
                main: Box::new(IndexInit { eval: true }),
                terms: Terms::analyze(Some(&expr(service("api")))),
                aggregated_attr: Some(LabelName::new("span.size")),
            }),
            prefix: "_1".into(),
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with("SELECT '_1' AS prefix, count() AS _count"));
        assert!(!sql.contains("_mask"));
        assert!(!sql.contains("agg_val"));
    }

    #[test]
    fn test_term_set() {
        let cond = binary(BoolOp::Or, expr(service("api")), expr(slow()));
        let p = TermSetPlanner {
            terms: Terms::analyze(Some(&cond)),
            aggregated_attr: Some(LabelName::new(".size")),
            prefix: "_1".into(),
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("_1term_0 AS (SELECT DISTINCT"), "{sql}");
        assert!(sql.contains("_1term_1 AS ("));
        assert!(sql.contains(
            "_1terms AS (SELECT * FROM ((SELECT trace_id, span_id FROM \
             _1term_0) UNION DISTINCT (SELECT trace_id, span_id FROM \
             _1term_1)))"
        ));
        assert!(sql.contains(
            "(traces_idx.trace_id, traces_idx.span_id) IN _1terms"
        ));
        assert!(sql.contains("AS agg_val"));
        assert!(!sql.contains("_mask"));
    }

    #[test]
    fn test_attrless_root_spans() {
        let ctx = test_context().with_limit(20);
        let p = AttrlessPlanner { only_root: true };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("ORDER BY timestamp_ns DESC LIMIT 20)"), "{sql}");
        assert!(sql.contains("ARRAY JOIN attrless_spans.span_id AS _span_id"));
        assert!(sql.contains("argMin(traces.span_id, traces.timestamp_ns)"));
        assert!(sql.contains("GROUP BY trace_id"));
    }

    #[test]
    fn test_group_by_and_aggregator() {
        let p = AggregatorPlanner {
            main: Box::new(IndexGroupByPlanner {
                main: Box::new(AttrlessPlanner { only_root: false }),
                prefix: "_1".into(),
            }),
            func: AggFn::Avg,
            attr: Some(LabelName::new("duration")),
            op: AttrOp::Gt,
            value: Value::Duration(Duration::from_secs(1)),
            prefix: "_1".into(),
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "groupArray(100)(_1index_search.span_id) AS span_id"
        ));
        assert!(sql.contains("GROUP BY _1index_search.trace_id"));
        assert!(sql.contains(
            "HAVING avg(_1index_search.duration) > 1000000000"
        ));

        let p = AggregatorPlanner {
            main: Box::new(IndexGroupByPlanner {
                main: Box::new(AttrlessPlanner { only_root: false }),
                prefix: "_1".into(),
            }),
            func: AggFn::Sum,
            attr: None,
            op: AttrOp::Gt,
            value: Value::Number(1.0),
            prefix: "_1".into(),
        };
        assert!(p.process(&ctx).is_err());
    }

    #[test]
    fn test_spanset_and() {
        let selector = |prefix: &str, t: AttrCondition| -> BoxPlanner {
            Box::new(IndexGroupByPlanner {
                main: Box::new(AttrConditionPlanner {
                    main: Box::new(IndexInit { eval: false }),
                    terms: Terms::analyze(Some(&expr(t))),
                    aggregated_attr: None,
                }),
                prefix: prefix.into(),
            })
        };
        let p = SpansetCombinePlanner {
            op: SpansetOp::And,
            operands: vec![
                selector("_2", service("api")),
                selector("_3", service("db")),
            ],
            prefix: "_1".into(),
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with("WITH _2index_search AS ("), "{sql}");
        assert!(sql.contains(", _3index_search AS ("));
        assert!(sql.contains(") UNION ALL (SELECT _3index_search.trace_id"));
        assert!(sql.contains("groupArrayArray(_1a.span_id) AS span_id"));
        assert!(sql.contains("HAVING count() = 2"));
    }

    #[test]
    fn test_traces_data() {
        let ctx = test_context();
        let main = || -> BoxPlanner {
            Box::new(IndexGroupByPlanner {
                main: Box::new(AttrlessPlanner { only_root: false }),
                prefix: "_1".into(),
            })
        };
        let p = TracesDataPlanner { main: main(), attrs: vec![] };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "trace_span_ids AS (SELECT trace_id, span_id FROM index_grouped \
             ARRAY JOIN span_id)"
        ));
        assert!(sql.contains("ANY LEFT JOIN traces_info ON"));
        assert!(
            sql.contains("[]::Array(Array(Tuple(String, String))) AS attrs")
        );
        assert!(sql.ends_with("ORDER BY start_time_unix_nano DESC"));

        let p = TracesDataPlanner {
            main: main(),
            attrs: vec![LabelName::new("span.http.method")],
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("key IN ('http.method')"), "{sql}");
        assert!(sql.contains("groupArray(attrs.attrs) AS attrs"));
        assert!(sql.contains("ANY LEFT JOIN attrs ON"));
    }

    #[test]
    fn test_metric() {
        let main = IndexGroupByPlanner {
            main: Box::new(AttrlessPlanner { only_root: false }),
            prefix: "_1".into(),
        };
        let p = MetricPlanner {
            main: Box::new(main),
            func: MetricFn::Rate,
            prefix: "_1".into(),
        };
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "intDiv(_1index_search.timestamp_ns, 15000000000) * 15000 \
             AS timestamp_ms, toFloat64(count()) / 15 AS value"
        ), "{sql}");
        assert!(sql.contains("_1index_search.trace_id IN metric_traces"));

        let p = MetricPlanner {
            main: Box::new(AttrlessPlanner { only_root: false }),
            func: MetricFn::CountOverTime,
            prefix: "_1".into(),
        };
        assert!(matches!(p.process(&ctx), Err(Error::Planning(_))));
    }

    #[test]
    fn test_tags() {
        let ctx = test_context().with_limit(5);
        let p = TagNamesPlanner { main: None };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT key FROM tempo_traces_kv WHERE \
             (date >= '2024-01-01' AND date <= '2024-01-01') \
             ORDER BY key ASC LIMIT 5"
        );
        let p = TagValuesPlanner {
            main: Some(Box::new(AttrConditionPlanner {
                main: Box::new(IndexInit { eval: false }),
                terms: Terms::analyze(Some(&expr(service("api")))),
                aggregated_attr: None,
            })),
            key: "http.method".into(),
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with("WITH tag_search AS ("), "{sql}");
        assert!(
            sql.contains("SELECT DISTINCT val FROM tempo_traces_attrs_gin")
        );
        assert!(sql.contains("traces_idx.key = 'http.method'"));
    }
}
