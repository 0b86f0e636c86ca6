// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TraceQL front end.
//!
//! Every query has two plans. The simple plan filters the attributes index
//! with a single composite condition; the complex plan matches every term
//! on its own and combines the matched spans with set operations. A cheap
//! estimate of the number of index rows involved picks one of them, see
//! [`choose`].

// Copyright 2024 Oxide Computer Company

pub mod ast;
pub mod planner;

use crate::client::query_all;
use crate::client::Row;
use crate::context::PlannerContext;
use crate::entry::Labels;
use crate::planner::BoxPlanner;
use crate::planner::LimitPlanner;
use crate::planner::Planner;
use crate::planner::UnionAll;
use crate::Error;
use ast::LabelName;
use ast::MetricFn;
use ast::SpansetOp;
use ast::SpansetSelector;
use ast::TraceQuery;
use highway::HighwayHasher;
use planner::AggregatorPlanner;
use planner::AttrConditionEvaluator;
use planner::AttrConditionPlanner;
use planner::AttrlessEvaluator;
use planner::AttrlessPlanner;
use planner::IndexGroupByPlanner;
use planner::IndexInit;
use planner::MetricPlanner;
use planner::SpansetCombinePlanner;
use planner::TagNamesPlanner;
use planner::TagValuesPlanner;
use planner::TermSetPlanner;
use planner::Terms;
use planner::TracesDataPlanner;
use serde::Serialize;
use serde_json::Value;
use slog::debug;
use slog::trace;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Estimated index rows from which the complex plan is used.
pub const COMPLEXITY_THRESHOLD: i64 = 10_000_000;

/// The plans of a query.
#[derive(Debug)]
pub struct TracePlan {
    pub simple: BoxPlanner,
    pub complex: BoxPlanner,
    /// Selects `prefix` and `_count`, the estimated cost, per selector.
    pub eval: BoxPlanner,
    pub group_by: Vec<LabelName>,
    pub metric: Option<MetricFn>,
}

#[derive(Default)]
struct Prefixes(usize);

impl Prefixes {
    fn next(&mut self) -> String {
        self.0 += 1;
        format!("_{}", self.0)
    }
}

fn selector_planner(
    s: &SpansetSelector,
    prefix: &str,
    complex: bool,
) -> BoxPlanner {
    let terms = Terms::analyze(s.cond.as_ref());
    let agg = s.aggregator();
    let aggregated_attr = agg.and_then(|a| a.attr.clone());
    let main: BoxPlanner = if s.is_root_spans() {
        Box::new(AttrlessPlanner { only_root: true })
    } else if terms.cond.is_none() {
        Box::new(AttrlessPlanner { only_root: false })
    } else if complex {
        Box::new(TermSetPlanner {
            terms,
            aggregated_attr,
            prefix: prefix.to_string(),
        })
    } else {
        Box::new(AttrConditionPlanner {
            main: Box::new(IndexInit { eval: false }),
            terms,
            aggregated_attr,
        })
    };
    let grouped =
        Box::new(IndexGroupByPlanner { main, prefix: prefix.to_string() });
    match agg {
        Some(a) => Box::new(AggregatorPlanner {
            main: grouped,
            func: a.func,
            attr: a.attr.clone(),
            op: a.op,
            value: a.value.clone(),
            prefix: prefix.to_string(),
        }),
        None => grouped,
    }
}

fn selector_eval(s: &SpansetSelector, prefix: String) -> BoxPlanner {
    let terms = Terms::analyze(s.cond.as_ref());
    if s.is_root_spans() || terms.cond.is_none() {
        return Box::new(AttrlessEvaluator { prefix });
    }
    Box::new(AttrConditionEvaluator {
        main: Box::new(AttrConditionPlanner {
            main: Box::new(IndexInit { eval: true }),
            terms,
            aggregated_attr: None,
        }),
        prefix,
    })
}

// Selectors joined with `&&` bind tighter than `||`.
fn or_groups(query: &TraceQuery) -> Vec<Vec<&SpansetSelector>> {
    let mut groups = vec![vec![]];
    let mut next = Some(query);
    while let Some(q) = next {
        if let Some(group) = groups.last_mut() {
            group.push(&q.head);
        }
        if q.op == Some(SpansetOp::Or) {
            groups.push(vec![]);
        }
        next = q.tail.as_deref();
    }
    groups.retain(|g| !g.is_empty());
    groups
}

fn combine(
    op: SpansetOp,
    mut operands: Vec<BoxPlanner>,
    prefixes: &mut Prefixes,
) -> BoxPlanner {
    if operands.len() == 1 {
        if let Some(only) = operands.pop() {
            return only;
        }
    }
    Box::new(SpansetCombinePlanner { op, operands, prefix: prefixes.next() })
}

fn spans_planner(query: &TraceQuery, complex: bool) -> BoxPlanner {
    let mut prefixes = Prefixes::default();
    let groups = or_groups(query)
        .into_iter()
        .map(|group| {
            let operands = group
                .into_iter()
                .map(|s| selector_planner(s, &prefixes.next(), complex))
                .collect();
            combine(SpansetOp::And, operands, &mut prefixes)
        })
        .collect();
    combine(SpansetOp::Or, groups, &mut prefixes)
}

fn search_planner(
    query: &TraceQuery,
    metric: Option<MetricFn>,
    complex: bool,
) -> BoxPlanner {
    if let Some(func) = metric {
        // Only single selectors carry metric functions.
        let prefix = Prefixes::default().next();
        let main = selector_planner(&query.head, &prefix, complex);
        return Box::new(MetricPlanner { main, func, prefix });
    }
    let spans = spans_planner(query, complex);
    Box::new(TracesDataPlanner {
        main: Box::new(LimitPlanner { main: spans }),
        attrs: query.select_attrs(),
    })
}

/// Plan a search.
pub fn plan(query: &TraceQuery) -> Result<TracePlan, Error> {
    let mut query = query.clone();
    ast::optimize(&mut query);
    query.check()?;
    let metric = query.metric()?;

    let mut prefixes = Prefixes::default();
    let mut evals = query
        .selectors()
        .into_iter()
        .map(|s| selector_eval(s, prefixes.next()))
        .collect::<Vec<_>>();
    let eval: BoxPlanner = match evals.len() {
        1 => evals.remove(0),
        _ => Box::new(UnionAll { mains: evals }),
    };
    Ok(TracePlan {
        simple: search_planner(&query, metric, false),
        complex: search_planner(&query, metric, true),
        eval,
        group_by: query.group_by(),
        metric,
    })
}

/// Run the estimate of a plan: the largest `_count` of its selectors.
pub async fn evaluate_complexity(
    ctx: &PlannerContext,
    plan: &TracePlan,
) -> Result<i64, Error> {
    let sql = ctx.render(&plan.eval.process(ctx)?)?;
    trace!(ctx.log, "estimating the cost of a trace search"; "sql" => &sql);
    let rows = query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?;
    rows.iter().try_fold(0, |max, row| Ok(max.max(row.i64("_count")?)))
}

/// Pick the plan to run for the estimated cost of the search.
pub async fn choose<'a>(
    ctx: &PlannerContext,
    plan: &'a TracePlan,
) -> Result<&'a BoxPlanner, Error> {
    let estimate = evaluate_complexity(ctx, plan).await?;
    let complex = estimate >= COMPLEXITY_THRESHOLD;
    debug!(
        ctx.log,
        "trace search plan chosen";
        "estimate" => estimate,
        "path" => if complex { "complex" } else { "simple" },
    );
    Ok(if complex { &plan.complex } else { &plan.simple })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttrValue {
    #[serde(rename = "stringValue")]
    pub string_value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanAttr {
    pub key: String,
    pub value: AttrValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanInfo {
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub start_time_unix_nano: String,
    /// `"n/a"` when the span was not finished.
    pub duration_nanos: String,
    pub attributes: Vec<SpanAttr>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanSet {
    pub spans: Vec<SpanInfo>,
    pub matched: usize,
}

impl SpanSet {
    fn new(spans: Vec<SpanInfo>) -> Self {
        Self { matched: spans.len(), spans }
    }
}

/// A matched trace.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub root_service_name: String,
    pub root_trace_name: String,
    pub start_time_unix_nano: String,
    pub duration_ms: f64,
    pub span_set: SpanSet,
    pub span_sets: Vec<SpanSet>,
}

// 64-bit integers may arrive quoted.
fn int_at(values: &[Value], i: usize, column: &str) -> Result<i64, Error> {
    values
        .get(i)
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| {
            Error::Database(format!("column '{column}' has no integer at {i}"))
        })
}

fn span_attrs(value: Option<&Value>) -> Vec<SpanAttr> {
    let Some(Value::Array(pairs)) = value else {
        return Vec::new();
    };
    pairs
        .iter()
        .filter_map(|pair| match pair.as_array()?.as_slice() {
            [Value::String(k), Value::String(v)] => Some(SpanAttr {
                key: k.clone(),
                value: AttrValue { string_value: v.clone() },
            }),
            _ => None,
        })
        .collect()
}

impl TraceInfo {
    /// Read a row of [`planner::TracesDataPlanner`].
    pub fn from_row(row: &Row) -> Result<Self, Error> {
        let span_ids = row.array("span_id")?;
        let durations = row.array("duration")?;
        let timestamps = row.array("timestamp_ns")?;
        let attrs = match row.get("attrs") {
            Some(Value::Array(a)) => a.as_slice(),
            _ => &[],
        };
        let mut spans = span_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let duration = int_at(durations, i, "duration")?;
                let start = int_at(timestamps, i, "timestamp_ns")?;
                // Unfinished spans are stored with their start time as
                // duration.
                let duration_nanos = if duration == start {
                    String::from("n/a")
                } else {
                    duration.to_string()
                };
                Ok(SpanInfo {
                    span_id: id.as_str().unwrap_or_default().to_string(),
                    start_time_unix_nano: start.to_string(),
                    duration_nanos,
                    attributes: span_attrs(attrs.get(i)),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        spans.sort_by_key(|s| {
            std::cmp::Reverse(s.start_time_unix_nano.parse::<i64>().ok())
        });
        let span_set = SpanSet::new(spans);
        Ok(TraceInfo {
            trace_id: row.str("trace_id")?.to_string(),
            root_service_name: row.str("root_service_name")?.to_string(),
            root_trace_name: row.str("root_trace_name")?.to_string(),
            start_time_unix_nano: row.i64("start_time_unix_nano")?.to_string(),
            duration_ms: row.f64("duration_ms")?,
            span_sets: vec![span_set.clone()],
            span_set,
        })
    }
}

// Spans with the same values of the grouping attributes share a key. The
// grouping attributes are renamed to `by(label)`.
fn group_key(span: &mut SpanInfo, group_by: &[LabelName]) -> u64 {
    let mut pairs = Vec::new();
    for attr in span.attributes.iter_mut() {
        let Some(label) = group_by.iter().find(|l| l.key() == attr.key) else {
            continue;
        };
        pairs.push(format!("{:?}={:?}", attr.key, attr.value.string_value));
        attr.key = format!("by({label})");
    }
    pairs.sort();
    let mut hasher = HighwayHasher::default();
    hasher.write(pairs.join(",").as_bytes());
    hasher.finish()
}

/// Split the spans of a trace into one spanset per value of the grouping
/// attributes.
pub fn group_spans(trace: &mut TraceInfo, group_by: &[LabelName]) {
    if group_by.is_empty() {
        return;
    }
    let mut sets: BTreeMap<u64, Vec<SpanInfo>> = BTreeMap::new();
    for mut span in trace.span_sets.drain(..).flat_map(|s| s.spans) {
        let key = group_key(&mut span, group_by);
        sets.entry(key).or_default().push(span);
    }
    trace.span_sets = sets.into_values().map(SpanSet::new).collect();
}

/// A series of a metrics query.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricSeries {
    pub labels: Labels,
    /// `(timestamp_ms, value)` pairs.
    pub samples: Vec<(i64, f64)>,
}

/// The result of a search.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceResult {
    Traces(Vec<TraceInfo>),
    Metrics(Vec<MetricSeries>),
}

/// Plan and run a search.
pub async fn search(
    ctx: &PlannerContext,
    query: &TraceQuery,
) -> Result<TraceResult, Error> {
    let plan = plan(query)?;
    let planner = choose(ctx, &plan).await?;
    let sql = ctx.render(&planner.process(ctx)?)?;
    trace!(ctx.log, "searching traces"; "sql" => &sql);
    let rows = query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?;
    if let Some(func) = plan.metric {
        let samples = rows
            .iter()
            .map(|r| Ok((r.i64("timestamp_ms")?, r.f64("value")?)))
            .collect::<Result<Vec<_>, Error>>()?;
        let labels =
            Labels::from([(String::from("__name__"), func.name().to_string())]);
        return Ok(TraceResult::Metrics(vec![MetricSeries { labels, samples }]));
    }
    let traces = rows
        .iter()
        .map(|row| {
            let mut trace = TraceInfo::from_row(row)?;
            group_spans(&mut trace, &plan.group_by);
            Ok(trace)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(TraceResult::Traces(traces))
}

fn tags_main(query: Option<&TraceQuery>) -> Result<Option<BoxPlanner>, Error> {
    let Some(query) = query else {
        return Ok(None);
    };
    if query.is_complex() {
        return Err(Error::not_supported(
            "complex requests `{} || {} ...` are not supported",
        ));
    }
    let mut query = query.clone();
    ast::optimize(&mut query);
    query.check()?;
    let terms = Terms::analyze(query.head.cond.as_ref());
    if terms.cond.is_none() {
        return Ok(None);
    }
    Ok(Some(Box::new(AttrConditionPlanner {
        main: Box::new(IndexInit { eval: false }),
        terms,
        aggregated_attr: None,
    })))
}

/// Plan the listing of attribute names, over the spans matched by `query`.
pub fn plan_tag_names(
    query: Option<&TraceQuery>,
) -> Result<BoxPlanner, Error> {
    Ok(Box::new(TagNamesPlanner { main: tags_main(query)? }))
}

/// Plan the listing of the values of an attribute.
pub fn plan_tag_values(
    query: Option<&TraceQuery>,
    key: &str,
) -> Result<BoxPlanner, Error> {
    Ok(Box::new(TagValuesPlanner {
        main: tags_main(query)?,
        key: LabelName::new(key).key().to_string(),
    }))
}

/// Run a tags planner, returning the strings in `column`.
pub async fn run_tags(
    ctx: &PlannerContext,
    planner: &BoxPlanner,
    column: &str,
) -> Result<Vec<String>, Error> {
    let sql = ctx.render(&planner.process(ctx)?)?;
    trace!(ctx.log, "listing trace attributes"; "sql" => &sql);
    let rows = query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?;
    rows.iter().map(|r| Ok(r.str(column)?.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::row;
    use crate::test_util::test_config;
    use crate::test_util::test_context;
    use crate::test_util::test_context_with;
    use crate::test_util::MemoryDb;
    use ast::AttrCondition;
    use ast::AttrExpr;
    use ast::AttrOp;
    use ast::BoolOp;
    use ast::PipelineStage;
    use serde_json::json;
    use std::sync::Arc;

    fn term(label: &str, value: &str) -> AttrExpr {
        AttrExpr::Term(AttrCondition {
            label: LabelName::new(label),
            op: AttrOp::Eq,
            value: ast::Value::Str(value.into()),
        })
    }

    fn both(lhs: AttrExpr, rhs: AttrExpr) -> AttrExpr {
        AttrExpr::Binary {
            op: BoolOp::And,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn query(cond: AttrExpr) -> TraceQuery {
        TraceQuery {
            head: SpansetSelector { cond: Some(cond), pipeline: vec![] },
            op: None,
            tail: None,
        }
    }

    fn chain(parts: Vec<(AttrExpr, Option<SpansetOp>)>) -> TraceQuery {
        parts
            .into_iter()
            .rev()
            .fold(None, |tail: Option<TraceQuery>, (cond, op)| {
                Some(TraceQuery {
                    head: SpansetSelector {
                        cond: Some(cond),
                        pipeline: vec![],
                    },
                    op,
                    tail: tail.map(Box::new),
                })
            })
            .unwrap()
    }

    async fn run_with_estimate(estimate: i64) -> Vec<String> {
        let db = Arc::new(MemoryDb::new().respond(
            "AS _count",
            vec![row(&[("prefix", json!("_1")), ("_count", json!(estimate))])],
        ));
        let ctx = test_context_with(db.clone(), &test_config());
        let q = query(both(term(".a", "x"), term(".b", "y")));
        let res = search(&ctx, &q).await.unwrap();
        assert_eq!(res, TraceResult::Traces(vec![]));
        db.queries()
    }

    #[tokio::test]
    async fn test_large_estimate_picks_complex_plan() {
        let queries = run_with_estimate(COMPLEXITY_THRESHOLD + 1).await;
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starts_with("SELECT '_1' AS prefix, count()"));
        assert!(queries[1].contains("INTERSECT"), "{}", queries[1]);
        assert!(queries[1].contains("_1term_1 AS ("));
        assert!(!queries[1].contains("_mask"));
    }

    #[tokio::test]
    async fn test_small_estimate_picks_simple_plan() {
        let queries = run_with_estimate(COMPLEXITY_THRESHOLD - 1).await;
        assert_eq!(queries.len(), 2);
        assert!(!queries[1].contains("INTERSECT"), "{}", queries[1]);
        assert!(queries[1].contains("AS _mask"));
        assert!(queries[1].contains(
            "HAVING (bitAnd(_mask, 1) != 0 AND bitAnd(_mask, 2) != 0)"
        ));
    }

    #[test]
    fn test_spanset_precedence() {
        // {a} && {b} || {c}
        let q = chain(vec![
            (term(".a", "1"), Some(SpansetOp::And)),
            (term(".b", "2"), Some(SpansetOp::Or)),
            (term(".c", "3"), None),
        ]);
        let groups = or_groups(&q);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);

        let plan = plan(&q).unwrap();
        let ctx = test_context();
        let sql = ctx.render(&plan.simple.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("groupArrayArray(_3a.span_id)"), "{sql}");
        assert!(sql.contains("groupArrayArray(_5a.span_id)"));
        assert!(sql.contains("HAVING count() = 2"));
        let eval = ctx.render(&plan.eval.process(&ctx).unwrap()).unwrap();
        assert_eq!(eval.matches(" AS prefix").count(), 3);
        assert!(eval.contains("UNION ALL"));
    }

    #[test]
    fn test_true_is_folded_before_planning() {
        let q = query(AttrExpr::Binary {
            op: BoolOp::Or,
            lhs: Box::new(term(".a", "x")),
            rhs: Box::new(AttrExpr::True),
        });
        let plan = plan(&q).unwrap();
        let ctx = test_context();
        let sql = ctx.render(&plan.simple.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("attrless_trace_ids AS ("), "{sql}");
        let eval = ctx.render(&plan.eval.process(&ctx).unwrap()).unwrap();
        assert_eq!(eval, "SELECT '_1' AS prefix, 0 AS _count");
    }

    #[test]
    fn test_metric_plan() {
        let mut q = query(term("name", "GET"));
        q.head.pipeline.push(PipelineStage::Metric(MetricFn::CountOverTime));
        let plan = plan(&q).unwrap();
        assert_eq!(plan.metric, Some(MetricFn::CountOverTime));
        let ctx = test_context();
        let sql = ctx.render(&plan.complex.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("count() AS value"), "{sql}");
        assert!(sql.contains("_1term_0 AS ("));
    }

    #[test]
    fn test_scan_trace() {
        let r = row(&[
            ("trace_id", json!("abc")),
            ("span_id", json!(["01", "02", "03"])),
            ("duration", json!([5, "2000", 30])),
            ("timestamp_ns", json!([10, "2000", 30])),
            ("start_time_unix_nano", json!(10)),
            ("duration_ms", json!(0.02)),
            ("root_service_name", json!("api")),
            ("root_trace_name", json!("GET /")),
            ("attrs", json!([])),
        ]);
        let trace = TraceInfo::from_row(&r).unwrap();
        let ids: Vec<_> =
            trace.span_set.spans.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["02", "03", "01"]);
        assert_eq!(trace.span_set.spans[0].duration_nanos, "n/a");
        assert_eq!(trace.span_set.spans[2].duration_nanos, "5");
        assert_eq!(trace.span_set.matched, 3);
        assert_eq!(trace.span_sets, vec![trace.span_set.clone()]);
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["traceID"], "abc");
        assert_eq!(json["spanSet"]["spans"][0]["spanID"], "02");
        assert_eq!(json["spanSet"]["spans"][0]["startTimeUnixNano"], "2000");
    }

    #[test]
    fn test_group_spans() {
        let span = |id: &str, method: &str| SpanInfo {
            span_id: id.into(),
            start_time_unix_nano: "1".into(),
            duration_nanos: "1".into(),
            attributes: vec![SpanAttr {
                key: "http.method".into(),
                value: AttrValue { string_value: method.into() },
            }],
        };
        let spans = vec![span("1", "GET"), span("2", "POST"), span("3", "GET")];
        let mut trace = TraceInfo {
            trace_id: "t".into(),
            root_service_name: String::new(),
            root_trace_name: String::new(),
            start_time_unix_nano: "1".into(),
            duration_ms: 0.0,
            span_set: SpanSet::new(spans.clone()),
            span_sets: vec![SpanSet::new(spans)],
        };
        group_spans(&mut trace, &[LabelName::new("span.http.method")]);
        assert_eq!(trace.span_sets.len(), 2);
        let mut sizes: Vec<_> =
            trace.span_sets.iter().map(|s| s.matched).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
        let attr = &trace.span_sets[0].spans[0].attributes[0];
        assert_eq!(attr.key, "by(span.http.method)");
    }

    #[tokio::test]
    async fn test_metrics_result() {
        let db = Arc::new(MemoryDb::new().respond(
            "AS timestamp_ms",
            vec![
                row(&[("timestamp_ms", json!(0)), ("value", json!(2.0))]),
                row(&[("timestamp_ms", json!(15000)), ("value", json!(0.5))]),
            ],
        ));
        let ctx = test_context_with(db, &test_config());
        let mut q = query(term("name", "GET"));
        q.head.pipeline.push(PipelineStage::Metric(MetricFn::Rate));
        let TraceResult::Metrics(series) = search(&ctx, &q).await.unwrap()
        else {
            panic!("expected metrics");
        };
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels["__name__"], "rate");
        assert_eq!(series[0].samples, vec![(0, 2.0), (15000, 0.5)]);
    }

    #[tokio::test]
    async fn test_tags() {
        let db = Arc::new(MemoryDb::new().respond(
            "SELECT DISTINCT key",
            vec![row(&[("key", json!("http.method"))])],
        ));
        let ctx = test_context_with(db, &test_config());
        let p = plan_tag_names(None).unwrap();
        let names = run_tags(&ctx, &p, "key").await.unwrap();
        assert_eq!(names, vec!["http.method"]);

        let complex = chain(vec![
            (term(".a", "1"), Some(SpansetOp::Or)),
            (term(".b", "2"), None),
        ]);
        assert!(plan_tag_values(Some(&complex), "x").is_err());
    }
}
