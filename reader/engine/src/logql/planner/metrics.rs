// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregations of log lines into samples, and the final ordering of
//! results.

// Copyright 2024 Oxide Computer Company

use crate::context::PlannerContext;
use crate::logql::ast::Comparison;
use crate::logql::ast::Grouping;
use crate::logql::ast::RangeFn;
use crate::logql::ast::TopKOp;
use crate::logql::ast::VectorOp;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::Error;
use sql_select::quote;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::OrderBy;
use sql_select::Select;
use sql_select::Source;
use sql_select::Window;
use std::time::Duration;

/// What a range aggregation computes per bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RangeAgg {
    Func(RangeFn),
    Quantile(f64),
}

impl RangeAgg {
    fn value(&self, src: &str, range: Duration) -> Result<String, Error> {
        let secs = range.as_secs_f64();
        let value = format!("{src}.value");
        Ok(match self {
            RangeAgg::Quantile(q) => format!("quantile({q})({value})"),
            RangeAgg::Func(f) => match f {
                RangeFn::Rate => format!("toFloat64(count()) / {secs}"),
                RangeFn::CountOverTime => String::from("toFloat64(count())"),
                RangeFn::BytesRate => {
                    format!("toFloat64(sum(length({src}.string))) / {secs}")
                }
                RangeFn::BytesOverTime => {
                    format!("toFloat64(sum(length({src}.string)))")
                }
                RangeFn::SumOverTime => format!("sum({value})"),
                RangeFn::AvgOverTime => format!("avg({value})"),
                RangeFn::MinOverTime => format!("min({value})"),
                RangeFn::MaxOverTime => format!("max({value})"),
                RangeFn::FirstOverTime => {
                    format!("argMin({value}, {src}.timestamp_ns)")
                }
                RangeFn::LastOverTime => {
                    format!("argMax({value}, {src}.timestamp_ns)")
                }
                RangeFn::StddevOverTime => format!("stddevPop({value})"),
                RangeFn::StdvarOverTime => format!("varPop({value})"),
                RangeFn::AbsentOverTime => {
                    return Err(Error::planning(
                        "absent_over_time is computed in the residual pipeline",
                    ))
                }
            },
        })
    }
}

// The labels kept by a grouping.
fn grouped_labels(src: &str, grouping: Option<&Grouping>) -> Expr {
    let list = |names: &[String]| {
        names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ")
    };
    match grouping {
        None => Expr::raw("CAST(map(), 'Map(String, String)')"),
        Some(Grouping::By(names)) => Expr::raw(format!(
            "mapFilter((k, v) -> k IN ({}), {src}.labels)",
            list(names)
        )),
        Some(Grouping::Without(names)) => Expr::raw(format!(
            "mapFilter((k, v) -> k NOT IN ({}), {src}.labels)",
            list(names)
        )),
    }
}

/// A range aggregation: bucket rows by `range` and aggregate each bucket.
///
/// Rows of `main` without labels are grouped per fingerprint. With labels,
/// the optional grouping decides which labels survive.
#[derive(Debug)]
pub struct Lra {
    pub main: BoxPlanner,
    pub agg: RangeAgg,
    pub range: Duration,
    /// The rows of `main` carry a `labels` column.
    pub with_labels: bool,
    pub grouping: Option<Grouping>,
}

impl Planner for Lra {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let src = ctx.next_alias("lra");
        let range_ns = self.range.as_nanos();
        let mut columns = vec![];
        if self.with_labels {
            let labels = match &self.grouping {
                Some(g) => grouped_labels(&src, Some(g)),
                None => Expr::raw(format!("{src}.labels")),
            };
            let fingerprint = match &self.grouping {
                Some(_) => Expr::func("cityHash64", vec![labels.clone()]),
                None => Expr::raw(format!("{src}.fingerprint")),
            };
            columns.push(Column::new(fingerprint, "fingerprint"));
            columns
                .push(Column::new(Expr::func("any", vec![labels]), "labels"));
        } else if self.grouping.is_some() {
            return Err(Error::planning(
                "grouping a range aggregation without labels",
            ));
        } else {
            columns
                .push(Column::new(format!("{src}.fingerprint"), "fingerprint"));
        }
        columns.push(Column::new(
            format!("intDiv({src}.timestamp_ns, {range_ns}) * {range_ns}"),
            "timestamp_ns",
        ));
        columns.push(Column::new(self.agg.value(&src, self.range)?, "value"));
        Ok(Select::new()
            .select(columns)
            .from(Source::cte(src.as_str()))
            .group_by([Expr::raw("fingerprint"), Expr::raw("timestamp_ns")])
            .with(Cte::new(src.as_str(), main)))
    }
}

/// Keep the samples whose value satisfies a comparison.
#[derive(Debug)]
pub struct ComparisonFilter {
    pub main: BoxPlanner,
    pub comparison: Comparison,
}

impl Planner for ComparisonFilter {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let alias = ctx.next_alias("cmp");
        Ok(Select::new()
            .select([Column::raw("*")])
            .from(Source::cte(alias.as_str()))
            .and_where([Expr::cmp(
                self.comparison.op.as_cmp_op(),
                Expr::raw(format!("{alias}.value")),
                Expr::float(self.comparison.value),
            )])
            .with(Cte::new(alias, main)))
    }
}

/// Aggregate samples across series sharing the grouped labels.
#[derive(Debug)]
pub struct VectorAgg {
    pub main: BoxPlanner,
    pub op: VectorOp,
    pub grouping: Option<Grouping>,
}

impl Planner for VectorAgg {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let src = ctx.next_alias("agg");
        let labels = grouped_labels(&src, self.grouping.as_ref());
        let value = format!("{src}.value");
        let value = match self.op {
            VectorOp::Sum => format!("sum({value})"),
            VectorOp::Min => format!("min({value})"),
            VectorOp::Max => format!("max({value})"),
            VectorOp::Avg => format!("avg({value})"),
            VectorOp::Count => String::from("toFloat64(count())"),
            VectorOp::Stddev => format!("stddevPop({value})"),
            VectorOp::Stdvar => format!("varPop({value})"),
        };
        Ok(Select::new()
            .select([
                Column::new(
                    Expr::func("cityHash64", vec![labels.clone()]),
                    "fingerprint",
                ),
                Column::new(Expr::func("any", vec![labels]), "labels"),
                Column::new(format!("{src}.timestamp_ns"), "timestamp_ns"),
                Column::new(value, "value"),
            ])
            .from(Source::cte(src.as_str()))
            .group_by([Expr::raw("fingerprint"), Expr::raw("timestamp_ns")])
            .with(Cte::new(src, main)))
    }
}

/// Keep the `k` largest (or smallest) samples at every timestamp.
#[derive(Debug)]
pub struct TopKPlanner {
    pub main: BoxPlanner,
    pub op: TopKOp,
    pub k: u64,
}

impl Planner for TopKPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let src = Cte::new(ctx.next_alias("topk"), main);
        let order = match self.op {
            TopKOp::Topk => OrderBy::desc("value"),
            TopKOp::Bottomk => OrderBy::asc("value"),
        };
        let ranked = Cte::new(
            ctx.next_alias("ranked"),
            Select::new()
                .select([
                    Column::simple("fingerprint"),
                    Column::simple("labels"),
                    Column::simple("timestamp_ns"),
                    Column::simple("value"),
                    Column::new("row_number() OVER topk_w", "_rank"),
                ])
                .from(Source::cte(src.alias.as_str()))
                .window(
                    Window::new("topk_w")
                        .partition_by(vec![Expr::raw("timestamp_ns")])
                        .order_by(vec![order]),
                ),
        );
        let k = i64::try_from(self.k).unwrap_or(i64::MAX);
        Ok(Select::new()
            .select([
                Column::simple("fingerprint"),
                Column::simple("labels"),
                Column::simple("timestamp_ns"),
                Column::simple("value"),
            ])
            .from(Source::cte(ranked.alias.as_str()))
            .and_where([Expr::le(Expr::raw("_rank"), Expr::int(k))])
            .with(src)
            .with(ranked))
    }
}

/// Order log lines by time and apply the request limit.
#[derive(Debug)]
pub struct OrderLimit {
    pub main: BoxPlanner,
}

impl Planner for OrderLimit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self
            .main
            .process(ctx)?
            .order_by([OrderBy::new("timestamp_ns", ctx.order_asc)]);
        if ctx.limit > 0 {
            return Ok(main.limit(ctx.limit));
        }
        Ok(main)
    }
}

/// Order the final rows by series, then by time.
///
/// Log streams follow the direction of the request; samples are always
/// returned oldest first.
#[derive(Debug)]
pub struct SeriesOrder {
    pub main: BoxPlanner,
    pub matrix: bool,
}

impl Planner for SeriesOrder {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let mut main = self.main.process(ctx)?;
        // Reordering a limited statement in place would change which rows
        // the limit keeps.
        if main.limit_expr().is_some() {
            let alias = ctx.next_alias("ordered");
            main = Select::new()
                .select([Column::raw("*")])
                .from(Source::cte(alias.as_str()))
                .with(Cte::new(alias, main));
        }
        let asc = self.matrix || ctx.order_asc;
        Ok(main.order_by([
            OrderBy::asc("fingerprint"),
            OrderBy::new("timestamp_ns", asc),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logql::ast::Comparator;
    use crate::planner::tests::fixed;
    use crate::test_util::test_context;
    use strum::IntoEnumIterator;

    #[test]
    fn test_lra_without_labels() {
        let ctx = test_context();
        let p = Lra {
            main: fixed("samples"),
            agg: RangeAgg::Func(RangeFn::Rate),
            range: Duration::from_secs(60),
            with_labels: false,
            grouping: None,
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "WITH lra_0 AS (SELECT fingerprint FROM samples) \
             SELECT lra_0.fingerprint AS fingerprint, \
             intDiv(lra_0.timestamp_ns, 60000000000) * 60000000000 \
             AS timestamp_ns, \
             toFloat64(count()) / 60 AS value FROM lra_0 \
             GROUP BY fingerprint, timestamp_ns"
        );
    }

    #[test]
    fn test_lra_grouping() {
        let ctx = test_context();
        let p = Lra {
            main: fixed("joined"),
            agg: RangeAgg::Quantile(0.99),
            range: Duration::from_secs(300),
            with_labels: true,
            grouping: Some(Grouping::By(vec!["app".into()])),
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "cityHash64(mapFilter((k, v) -> k IN ('app'), lra_0.labels)) \
             AS fingerprint"
        ));
        assert!(sql.contains("quantile(0.99)(lra_0.value) AS value"));

        let bad = Lra {
            main: fixed("samples"),
            agg: RangeAgg::Func(RangeFn::SumOverTime),
            range: Duration::from_secs(300),
            with_labels: false,
            grouping: Some(Grouping::By(vec![])),
        };
        assert!(bad.process(&ctx).is_err());
    }

    #[test]
    fn test_every_range_fn_but_absent_compiles() {
        for f in RangeFn::iter() {
            let v = RangeAgg::Func(f).value("s", Duration::from_secs(10));
            assert_eq!(v.is_err(), f == RangeFn::AbsentOverTime, "{f:?}");
        }
    }

    #[test]
    fn test_vector_agg_and_comparison() {
        let ctx = test_context();
        let p = ComparisonFilter {
            main: Box::new(VectorAgg {
                main: fixed("m"),
                op: VectorOp::Count,
                grouping: Some(Grouping::Without(vec!["pod".into()])),
            }),
            comparison: Comparison { op: Comparator::Gt, value: 2.0 },
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "WITH agg_0 AS (SELECT fingerprint FROM m), \
             cmp_1 AS (SELECT cityHash64(mapFilter((k, v) -> k NOT IN ('pod'), \
             agg_0.labels)) AS fingerprint, any(mapFilter((k, v) -> k NOT IN \
             ('pod'), agg_0.labels)) AS labels, \
             agg_0.timestamp_ns AS timestamp_ns, \
             toFloat64(count()) AS value FROM agg_0 \
             GROUP BY fingerprint, timestamp_ns) \
             SELECT * FROM cmp_1 WHERE cmp_1.value > 2.0"
        );
    }

    #[test]
    fn test_topk() {
        let ctx = test_context();
        let p = TopKPlanner { main: fixed("m"), op: TopKOp::Bottomk, k: 3 };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "row_number() OVER topk_w AS _rank FROM topk_0 \
             WINDOW topk_w AS (PARTITION BY timestamp_ns ORDER BY value ASC)"
        ));
        assert!(sql.ends_with("FROM ranked_1 WHERE _rank <= 3"));
    }

    #[test]
    fn test_ordering() {
        let ctx = test_context().with_limit(100);
        let p = SeriesOrder {
            main: Box::new(OrderLimit { main: fixed("s") }),
            matrix: false,
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "WITH ordered_0 AS (SELECT fingerprint FROM s \
             ORDER BY timestamp_ns DESC LIMIT 100) \
             SELECT * FROM ordered_0 \
             ORDER BY fingerprint ASC, timestamp_ns DESC"
        );

        let ctx = test_context();
        let p = SeriesOrder { main: fixed("s"), matrix: true };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.ends_with("ORDER BY fingerprint ASC, timestamp_ns ASC"));
    }
}
