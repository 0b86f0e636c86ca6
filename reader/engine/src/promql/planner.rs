// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planners selecting metric samples.
//!
//! Every statement built here selects `fingerprint`, `timestamp_ms` and
//! `val`, and declares the fingerprints of the matched series as the `fp`
//! CTE. Planners wrapping a statement rely on both.

// Copyright 2024 Oxide Computer Company

use super::ast::AggOp;
use super::ast::Grouping;
use super::ast::LabelMatcher;
use super::ast::SelectHints;
use super::ast::METRIC_NAME;
use crate::config::Table;
use crate::context::PlannerContext;
use crate::context::SampleKind;
use crate::logql::planner::select_fingerprints;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::Error;
use sql_select::quote;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::Frame;
use sql_select::FrameBound;
use sql_select::Join;
use sql_select::JoinKind;
use sql_select::OrderBy;
use sql_select::Select;
use sql_select::SetOp;
use sql_select::Source;
use sql_select::Window;
use std::time::Duration;

/// The alias of the CTE selecting the fingerprints of the matched series.
pub const FP_ALIAS: &str = "fp";

/// How far back a counter reset and the start of a rate are looked for.
const LOOKBACK_MS: i64 = 300_000;

const NS_PER_MS: i64 = 1_000_000;

fn fp_cte(main: &Select) -> Result<&Cte, Error> {
    main.cte(FP_ALIAS).ok_or_else(|| {
        Error::planning(format!("could not find the '{FP_ALIAS}' CTE"))
    })
}

fn by_series() -> [OrderBy; 2] {
    [OrderBy::asc("fingerprint"), OrderBy::asc("timestamp_ms")]
}

fn group_by_series() -> [Expr; 2] {
    [Expr::raw("fingerprint"), Expr::raw("timestamp_ms")]
}

fn samples_from(ctx: &PlannerContext, table: Table) -> Source {
    Source::table(ctx.dist_table(table)).alias("samples")
}

fn in_time_range(ctx: &PlannerContext) -> [Expr; 2] {
    let ts = || Expr::raw("samples.timestamp_ns");
    [
        Expr::gt(ts(), Expr::int(ctx.from_ns())),
        Expr::le(ts(), Expr::int(ctx.to_ns())),
    ]
}

/// Select the fingerprints of the metric series matching label matchers.
#[derive(Debug)]
pub struct FingerprintsPlanner {
    pub matchers: Vec<LabelMatcher>,
}

impl Planner for FingerprintsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        select_fingerprints(
            ctx,
            &self.matchers,
            &ctx.from_date(),
            SampleKind::Metrics,
        )
    }
}

/// Read the raw samples of the matched series.
#[derive(Debug)]
pub struct ValuesPlanner {
    pub fingerprints: BoxPlanner,
}

impl Planner for ValuesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let fp = Cte::new(FP_ALIAS, self.fingerprints.process(ctx)?);
        let res = Select::new()
            .select([
                Column::new("samples.fingerprint", "fingerprint"),
                Column::new("samples.value", "val"),
                Column::new(
                    "intDiv(samples.timestamp_ns, 1000000)",
                    "timestamp_ms",
                ),
            ])
            .from(samples_from(ctx, Table::Samples))
            .and_where(in_time_range(ctx))
            .and_where([Expr::in_(
                Expr::raw("samples.fingerprint"),
                fp.reference(),
            )])
            .and_where(ctx.types_filter(SampleKind::Metrics, "samples.type"))
            .with(fp)
            .order_by(by_series());
        if ctx.limit > 0 {
            return Ok(res.limit(ctx.limit));
        }
        Ok(res)
    }
}

/// Read the 15 second rollup in place of the raw samples.
#[derive(Debug)]
pub struct DownsampleValuesPlanner {
    pub values: ValuesPlanner,
}

impl Planner for DownsampleValuesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let timestamp = format!(
            "intDiv(samples.timestamp_ns, {}) * {}",
            ctx.step_ms() * NS_PER_MS,
            ctx.step_ms()
        );
        Ok(self
            .values
            .process(ctx)?
            .patch_field("val", Column::new("argMaxMerge(samples.last)", "val"))
            .patch_field("timestamp_ms", Column::new(timestamp, "timestamp_ms"))
            .from(samples_from(ctx, Table::Metrics15s))
            .group_by(group_by_series())
            .order_by(by_series()))
    }
}

/// The default initial planner of a downsampled selection: the last value
/// of every 15 second bucket, unrestricted.
///
/// The fingerprints are connected by the caller.
#[derive(Debug)]
pub struct DownsampleInit;

impl Planner for DownsampleInit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        Ok(Select::new()
            .select([
                Column::new("samples.fingerprint", "fingerprint"),
                Column::new(
                    "intDiv(samples.timestamp_ns, 1000000)",
                    "timestamp_ms",
                ),
                Column::new("argMaxMerge(samples.last)", "val"),
            ])
            .from(samples_from(ctx, Table::Metrics15s))
            .and_where(in_time_range(ctx))
            .and_where(ctx.types_filter(SampleKind::Metrics, "samples.type"))
            .group_by(group_by_series())
            .order_by(by_series()))
    }
}

/// Reduce raw samples to what the evaluator needs: the last sample of each
/// step for instant functions, and only the samples inside the ranges of a
/// range function.
#[derive(Debug)]
pub struct HintsPlanner {
    pub main: BoxPlanner,
    pub hints: SelectHints,
}

impl Planner for HintsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let mut query = self.main.process(ctx)?;
        let h = &self.hints;
        if h.is_instant() && h.step > 0 {
            let spls = Cte::new("spls", query);
            query = Select::new()
                .select([
                    Column::simple("fingerprint"),
                    Column::new("argMax(spls.val, spls.timestamp_ms)", "val"),
                    Column::new(
                        format!(
                            "intDiv(spls.timestamp_ms - {start} + {step} - 1, \
                             {step}) * {step} + {start}",
                            start = h.start,
                            step = h.step,
                        ),
                        "timestamp_ms",
                    ),
                ])
                .from(Source::cte(spls.alias.as_str()))
                .with(spls)
                .group_by([Expr::raw("timestamp_ms"), Expr::raw("fingerprint")])
                .order_by(by_series());
        }
        if h.is_range() && h.step > h.range {
            let in_step = Expr::raw(format!("timestamp_ms % {}", h.step));
            query = query.and_where([Expr::or(vec![
                Expr::eq(in_step.clone(), Expr::int(0)),
                Expr::ge(in_step, Expr::int(h.step - h.range)),
            ])]);
        }
        Ok(query)
    }
}

/// Range functions the rollup can answer, in every form of the merge.
pub const DOWNSAMPLE_FUNCTIONS: &[&str] = &[
    "absent_over_time",
    "min_over_time",
    "max_over_time",
    "sum_over_time",
    "count_over_time",
    "last_over_time",
    "present_over_time",
    "avg_over_time",
];

/// The expression merging rollup rows into one value per step.
pub fn merge_expr(func: &str) -> &'static str {
    match func {
        "absent_over_time" | "present_over_time" => "1",
        "min_over_time" => "min(min)",
        "max_over_time" => "max(max)",
        "sum_over_time" => "sum(sum)",
        "count_over_time" => "countMerge(count)",
        "avg_over_time" => "sum(sum) / countMerge(count)",
        _ => "argMaxMerge(samples.last)",
    }
}

/// Like [`merge_expr`], but leaving a mergeable state.
pub fn partial_expr(func: &str) -> &'static str {
    match func {
        "absent_over_time" | "present_over_time" => "1",
        "min_over_time" => "min(min)",
        "max_over_time" => "max(max)",
        "sum_over_time" => "sum(sum)",
        "count_over_time" => "countMergeState(count)",
        "avg_over_time" => "(sum(sum), countMerge(count))",
        _ => "argMaxMergeState(samples.last)",
    }
}

/// The expression merging the partial states of [`partial_expr`].
pub fn finalize_expr(func: &str) -> &'static str {
    match func {
        "absent_over_time" | "present_over_time" => "toFloat64(1)",
        "min_over_time" => "min(val)",
        "max_over_time" => "max(val)",
        "sum_over_time" => "sum(val)",
        "count_over_time" => "countMerge(val)",
        "avg_over_time" => "sum(val.1) / sum(val.2)",
        _ => "argMaxMerge(val)",
    }
}

/// Bucket rollup rows to the step of the evaluation, merging them with the
/// function the evaluator is going to apply.
///
/// In cluster mode every shard merges into partial states, which a final
/// pass merges again.
#[derive(Debug)]
pub struct DownsampleHintsPlanner {
    pub main: BoxPlanner,
    pub hints: SelectHints,
}

impl Planner for DownsampleHintsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let query = self.main.process(ctx)?;
        let h = &self.hints;
        if h.step == 0 {
            return Ok(query);
        }
        let partial = ctx.is_cluster;
        let merge =
            if partial { partial_expr(&h.func) } else { merge_expr(&h.func) };
        let mut query = query.patch_field("val", Column::new(merge, "val"));
        let timestamp = if h.is_range() && h.step > h.range {
            let in_step = Expr::raw(format!(
                "samples.timestamp_ns % {}",
                h.step * NS_PER_MS
            ));
            let skipped = Expr::int((h.step - h.range) * NS_PER_MS);
            query = query.and_where([Expr::or(vec![
                Expr::eq(in_step.clone(), Expr::int(0)),
                Expr::gt(in_step, skipped),
            ])]);
            format!(
                "intDiv(samples.timestamp_ns + {range} * 1000000, \
                 {step} * 1000000) * {step}",
                range = h.range,
                step = h.step,
            )
        } else {
            format!(
                "intDiv(samples.timestamp_ns, {} * 1000000) * {}",
                h.step, h.step
            )
        };
        let timestamp = Column::new(timestamp, "timestamp_ms");
        query = query.patch_field("timestamp_ms", timestamp);
        if partial {
            let alias = ctx.next_alias("partial");
            query = Select::new()
                .select([
                    Column::simple("fingerprint"),
                    Column::simple("timestamp_ms"),
                    Column::new(finalize_expr(&h.func), "val"),
                ])
                .from(Source::cte(alias.as_str()))
                .with(Cte::new(alias, query))
                .group_by(group_by_series())
                .order_by(by_series());
        }
        if h.func == "count_over_time" {
            query = expand_counts(ctx, query);
        }
        Ok(query)
    }
}

// Expand every counted row into that many rows of value 1, one per event.
fn expand_counts(ctx: &PlannerContext, query: Select) -> Select {
    let query = query.add_column(Column::new("range(toInt64(val))", "arr"));
    let pre = Cte::new(ctx.next_alias("pre_count_over_time"), query);
    Select::new()
        .select([
            Column::simple("fingerprint"),
            Column::new("toFloat64(1)", "val"),
            Column::simple("timestamp_ms"),
        ])
        .from(Source::cte(pre.alias.as_str()))
        .join(Join::array("arr"))
        .with(pre)
}

/// `rate(selector[range])` over counters, compensating for counter resets.
///
/// Values are the last of each step. A row is a reset when the previous
/// value within the lookback is larger than its own; the reset then adds
/// that previous value back. The rate at `t` is
/// `(value(t) - value(t - range) + resets in (t - range, t]) / range`,
/// where `value(t - range)` is the last value in
/// `[t - range - 5m, t - range]`. Rows with no such value are dropped.
#[derive(Debug)]
pub struct RatePlanner {
    pub fingerprints: BoxPlanner,
    pub range: Duration,
}

impl RatePlanner {
    fn range_ms(&self) -> i64 {
        i64::try_from(self.range.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    fn values(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let fp = Cte::new(FP_ALIAS, self.fingerprints.process(ctx)?);
        let step = ctx.step_ms();
        let from = ctx.from_ns() - (self.range_ms() + LOOKBACK_MS) * NS_PER_MS;
        Ok(Select::new()
            .select([
                Column::simple("fingerprint"),
                Column::new(
                    format!(
                        "intDiv(timestamp_ns, {}) * {}",
                        step * NS_PER_MS,
                        step
                    ),
                    "timestamp_ms",
                ),
                Column::new("argMaxMerge(last)", "val"),
            ])
            .from(Source::table(ctx.dist_table(Table::Metrics15s)))
            .and_where([
                Expr::ge(Expr::raw("timestamp_ns"), Expr::int(from)),
                Expr::le(Expr::raw("timestamp_ns"), Expr::int(ctx.to_ns())),
                Expr::in_(Expr::raw("fingerprint"), fp.reference()),
            ])
            .with(fp)
            .group_by(group_by_series()))
    }

    fn resets(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let values = Cte::new("rate_val", self.values(ctx)?);
        let lookback = ctx.step_ms().max(LOOKBACK_MS);
        Ok(Select::new()
            .select([
                Column::simple("fingerprint"),
                Column::simple("timestamp_ms"),
                Column::simple("val"),
                Column::new(
                    "(argMax(val, timestamp_ms) OVER rate_reset AS \
                     rate_past) * (rate_past > val)",
                    "reset",
                ),
            ])
            .from(Source::cte(values.alias.as_str()))
            .with(values)
            .window(series_window(
                "rate_reset",
                FrameBound::Preceding(lookback),
                FrameBound::Preceding(1),
            )))
    }
}

fn series_window(alias: &str, start: FrameBound, end: FrameBound) -> Window {
    Window::new(alias)
        .partition_by(vec![Expr::raw("fingerprint")])
        .order_by(vec![OrderBy::asc("timestamp_ms")])
        .frame(Frame::Range(start, end))
}

impl Planner for RatePlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let resets = Cte::new("rate_resets", self.resets(ctx)?);
        let range = self.range_ms();
        let ranges = Select::new()
            .select([
                Column::simple("fingerprint"),
                Column::simple("timestamp_ms"),
                Column::new("val", "rate_end"),
                Column::new(
                    "argMax(val, timestamp_ms) OVER rate_open",
                    "rate_start",
                ),
                Column::new("count() OVER rate_open", "rate_start_count"),
                Column::new("sum(reset) OVER rate_close", "rate_reset_sum"),
            ])
            .from(Source::cte(resets.alias.as_str()))
            .with(resets)
            .window(series_window(
                "rate_open",
                FrameBound::Preceding(range + LOOKBACK_MS),
                FrameBound::Preceding(range),
            ))
            .window(series_window(
                "rate_close",
                FrameBound::Preceding(range - 1),
                FrameBound::CurrentRow,
            ));
        let ranges = Cte::new("rate_ranges", ranges);
        Ok(Select::new()
            .select([
                Column::simple("fingerprint"),
                Column::simple("timestamp_ms"),
                Column::new(
                    format!(
                        "(rate_end - rate_start + rate_reset_sum) / {}",
                        range as f64 / 1000.0
                    ),
                    "val",
                ),
            ])
            .from(Source::cte(ranges.alias.as_str()))
            .with(ranges)
            .and_where([
                Expr::gt(Expr::raw("rate_start_count"), Expr::int(0)),
                Expr::ge(
                    Expr::raw("timestamp_ms"),
                    Expr::int(ctx.from_ns() / NS_PER_MS),
                ),
            ])
            .order_by(by_series()))
    }
}

fn label_array(labels: &[String]) -> String {
    format!(
        "[{}]",
        labels.iter().map(|l| quote(l)).collect::<Vec<_>>().join(",")
    )
}

/// Aggregate series across the labels left by a grouping, e.g.
/// `sum by (job) (...)`.
///
/// Every series is relabeled and identified by the hash of its new labels.
/// The result holds value rows (`type` 1) and one labels row per new series
/// (`type` 2).
#[derive(Debug)]
pub struct AggPlanner {
    pub main: BoxPlanner,
    pub op: AggOp,
    pub grouping: Grouping,
}

impl AggPlanner {
    fn aggregate(&self) -> Result<&'static str, Error> {
        Ok(match self.op {
            AggOp::Sum => "sum(val)",
            AggOp::Min => "min(val)",
            AggOp::Max => "max(val)",
            AggOp::Avg => "avg(val)",
            AggOp::Count => "toFloat64(count(val))",
            op => {
                return Err(Error::not_supported(format!(
                    "aggregation {op:?} cannot be pushed down"
                )))
            }
        })
    }

    fn relabel(&self, ctx: &PlannerContext, fp: &Cte) -> Select {
        let keep = match &self.grouping {
            Grouping::By(labels) => {
                format!("has({}, x.1)", label_array(labels))
            }
            Grouping::Without(labels) => {
                let mut dropped = labels.clone();
                dropped.push(String::from(METRIC_NAME));
                format!("NOT has({}, x.1)", label_array(&dropped))
            }
        };
        Select::new()
            .select([
                Column::new("fingerprint", "old_fingerprint"),
                Column::new(
                    format!(
                        "toJSONString(mapFromArrays(arrayMap(x -> x.1, \
                         arrayFilter(x -> {keep}, \
                         JSONExtractKeysAndValues(labels, 'String')) AS a), \
                         arrayMap(x -> x.2, a)))"
                    ),
                    "new_labels",
                ),
                Column::new("cityHash64(new_labels)", "new_fingerprint"),
            ])
            .from(Source::table(ctx.dist_table(Table::TimeSeries)))
            .and_where([
                Expr::ge(Expr::raw("date"), Expr::str(ctx.from_date())),
                Expr::in_(Expr::raw("fingerprint"), fp.reference()),
            ])
    }
}

impl Planner for AggPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let aggregate = self.aggregate()?;
        let main = self.main.process(ctx)?;
        let fp = fp_cte(&main)?.clone();
        let labels = Cte::new("agg_labels", self.relabel(ctx, &fp));
        let pre_agg = Cte::new("pre_agg", main);
        let values = Select::new()
            .select([
                Column::new("1", "type"),
                Column::new("agg_labels.new_fingerprint", "fingerprint"),
                Column::simple("timestamp_ms"),
                Column::new(aggregate, "val"),
                Column::new("''", "labels"),
            ])
            .from(Source::cte(pre_agg.alias.as_str()))
            .join(Join::new(
                JoinKind::AnyLeft,
                Source::cte(labels.alias.as_str()),
                Expr::eq(
                    Expr::raw("pre_agg.fingerprint"),
                    Expr::raw("agg_labels.old_fingerprint"),
                ),
            ))
            .group_by([
                Expr::raw("agg_labels.new_fingerprint"),
                Expr::raw("timestamp_ms"),
            ]);
        let series = Select::new()
            .distinct(true)
            .select([
                Column::new("2", "type"),
                Column::new("new_fingerprint", "fingerprint"),
                Column::new("0", "timestamp_ms"),
                Column::new("toFloat64(0)", "val"),
                Column::new("new_labels", "labels"),
            ])
            .from(Source::cte(labels.alias.as_str()));
        Ok(Select::new()
            .select([Column::raw("*")])
            .from(Source::new(Expr::set_op(
                SetOp::UnionAll,
                vec![values, series],
            )))
            .with(pre_agg)
            .with(labels)
            .order_by([
                OrderBy::asc("fingerprint"),
                OrderBy::asc("type"),
                OrderBy::asc("timestamp_ms"),
            ]))
    }
}

/// Add the label sets of the selected series to the samples of `main`, as
/// rows of `type` 2 next to the value rows of `type` 1.
#[derive(Debug)]
pub struct LabelsPlanner {
    pub main: BoxPlanner,
}

impl Planner for LabelsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let fp = fp_cte(&main)?.clone();
        let values = Cte::new("values", main);
        let samples = Select::new()
            .select([
                Column::new("1", "type"),
                Column::simple("fingerprint"),
                Column::simple("timestamp_ms"),
                Column::simple("val"),
                Column::new("''", "labels"),
            ])
            .from(Source::cte(values.alias.as_str()));
        let labels = Select::new()
            .distinct(true)
            .select([
                Column::new("2", "type"),
                Column::simple("fingerprint"),
                Column::new("0", "timestamp_ms"),
                Column::new("toFloat64(0)", "val"),
                Column::simple("labels"),
            ])
            .from(Source::table(ctx.dist_table(Table::TimeSeries)))
            .and_where([
                Expr::ge(Expr::raw("date"), Expr::str(ctx.from_date())),
                Expr::in_(Expr::raw("fingerprint"), fp.reference()),
            ]);
        Ok(Select::new()
            .select([Column::raw("*")])
            .from(Source::new(Expr::set_op(
                SetOp::UnionAll,
                vec![samples, labels],
            )))
            .with(values)
            .order_by([
                OrderBy::asc("fingerprint"),
                OrderBy::asc("type"),
                OrderBy::asc("timestamp_ms"),
            ]))
    }
}

/// The latest metadata of every metric, or of a single one.
#[derive(Debug)]
pub struct MetadataPlanner {
    pub metric: Option<String>,
}

impl Planner for MetadataPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let res = Select::new()
            .select([
                Column::simple("metric_name"),
                Column::new("argMax(value, timestamp_ms)", "metadata_json"),
            ])
            .from(Source::table(ctx.dist_table(Table::MetricsMeta)))
            .and_where(self.metric.as_ref().map(|m| {
                Expr::eq(Expr::raw("metric_name"), Expr::str(m.as_str()))
            }))
            .group_by([Expr::raw("metric_name")])
            .order_by([OrderBy::asc("metric_name")]);
        if ctx.limit > 0 {
            return Ok(res.limit(ctx.limit));
        }
        Ok(res)
    }
}
