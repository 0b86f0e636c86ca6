// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile the SQL part of a log query into a planner tree.

// Copyright 2024 Oxide Computer Company

mod filter;
mod meta;
mod metrics;
mod select;

pub use filter::JoinedStage;
pub use filter::LineFilterPlanner;
pub use meta::DetectLabelsPlanner;
pub use meta::LabelNamesPlanner;
pub use meta::LabelValuesPlanner;
pub use meta::PatternsPlanner;
pub use meta::SeriesPlanner;
pub use metrics::ComparisonFilter;
pub use metrics::Lra;
pub use metrics::OrderLimit;
pub use metrics::RangeAgg;
pub use metrics::SeriesOrder;
pub use metrics::TopKPlanner;
pub use metrics::VectorAgg;
pub use select::LabelsJoin;
pub use select::Metrics15sInit;
pub use select::SamplesInit;
pub use select::SimpleLabelFilter;
pub use select::StreamSelect;
pub use select::TimeSeriesInit;
pub use select::MATRIX_COLUMNS;
pub use select::STREAM_COLUMNS;

pub(crate) use filter::pattern_to_like;
pub(crate) use select::select_fingerprints;

use super::analyze::metrics_15s_shortcut;
use super::ast::Comparison;
use super::ast::Grouping;
use super::ast::LogQuery;
use super::ast::QuantileOverTime;
use super::ast::RangeAggregation;
use super::ast::RangeFn;
use super::ast::Stage;
use super::ast::StrSelector;
use super::ast::TopKInner;
use super::ast::VectorAggregation;
use crate::planner::BoxPlanner;
use crate::planner::CacheSlot;
use crate::planner::PlannerFactory;
use crate::planner::SharedPlanner;
use crate::planner::WithConnector;
use crate::Error;
use std::sync::Arc;
use std::time::Duration;

// Stages evaluated before labels are joined in: line filters over the raw
// line, and label filters over the stream labels.
fn is_prejoin(stage: &Stage) -> bool {
    matches!(stage, Stage::LineFilter(_) | Stage::LabelFilter(_))
}

/// The fingerprints of the streams a selector matches, before any parser.
pub fn fingerprints(
    selector: &StrSelector,
    offset: Option<Duration>,
) -> SharedPlanner {
    let mut fp: BoxPlanner =
        Box::new(StreamSelect { matchers: selector.matchers.clone(), offset });
    for stage in selector.pipeline.iter().take_while(|s| is_prejoin(s)) {
        if let Stage::LabelFilter(filter) = stage {
            fp = Box::new(SimpleLabelFilter {
                main: fp,
                filter: filter.clone(),
            });
        }
    }
    Arc::from(fp)
}

// A selector compiled to SQL, and whether its rows carry labels.
struct SelectorPlan {
    planner: BoxPlanner,
    fingerprints: SharedPlanner,
    with_labels: bool,
}

fn plan_selector(
    selector: &StrSelector,
    offset: Option<Duration>,
    factory: &PlannerFactory,
    stream: bool,
    force_labels: bool,
) -> Result<SelectorPlan, Error> {
    let fp = fingerprints(selector, offset);
    let join_idx = selector
        .pipeline
        .iter()
        .position(|s| !is_prejoin(s))
        .unwrap_or(selector.pipeline.len());

    let mut main: BoxPlanner = Box::new(
        WithConnector::new(
            factory.samples_init(offset),
            Box::new(fp.clone()),
            "fp_sel",
            "samples.fingerprint",
        )
        .cached(CacheSlot::Fingerprints),
    );
    for stage in selector.pipeline[..join_idx].iter() {
        if let Stage::LineFilter(filter) = stage {
            main = Box::new(LineFilterPlanner {
                main,
                filter: filter.clone(),
                column: String::from("samples.string"),
            });
        }
    }
    let post_join = &selector.pipeline[join_idx..];
    if !stream && post_join.is_empty() && !force_labels {
        return Ok(SelectorPlan {
            planner: main,
            fingerprints: fp,
            with_labels: false,
        });
    }
    if stream && post_join.is_empty() {
        main = Box::new(OrderLimit { main });
    }
    main = Box::new(LabelsJoin {
        main,
        fingerprints: fp.clone(),
        offset,
        columns: STREAM_COLUMNS,
    });
    for stage in post_join {
        main = Box::new(JoinedStage { main, stage: stage.clone() });
    }
    if stream && !post_join.is_empty() {
        main = Box::new(OrderLimit { main });
    }
    Ok(SelectorPlan { planner: main, fingerprints: fp, with_labels: true })
}

fn with_comparison(main: BoxPlanner, cmp: &Option<Comparison>) -> BoxPlanner {
    match cmp {
        Some(comparison) => {
            Box::new(ComparisonFilter { main, comparison: comparison.clone() })
        }
        None => main,
    }
}

// Attach labels to samples aggregated per fingerprint.
fn join_matrix(
    main: BoxPlanner,
    fingerprints: SharedPlanner,
    offset: Option<Duration>,
) -> BoxPlanner {
    Box::new(LabelsJoin { main, fingerprints, offset, columns: MATRIX_COLUMNS })
}

fn plan_range(
    lra: &RangeAggregation,
    factory: &PlannerFactory,
) -> Result<BoxPlanner, Error> {
    let main = if metrics_15s_shortcut_applies(lra) {
        let fp = fingerprints(&lra.selector, lra.offset);
        let rollup = WithConnector::new(
            Box::new(Metrics15sInit {
                range: lra.range,
                per_second: lra.func == RangeFn::Rate,
                offset: lra.offset,
            }),
            Box::new(fp.clone()),
            "fp_sel",
            "metrics_15s.fingerprint",
        )
        .prewhere()
        .cached(CacheSlot::Fingerprints);
        join_matrix(Box::new(rollup), fp, lra.offset)
    } else {
        let sel = plan_selector(
            &lra.selector,
            lra.offset,
            factory,
            false,
            lra.grouping.is_some(),
        )?;
        let agg: BoxPlanner = Box::new(Lra {
            main: sel.planner,
            agg: RangeAgg::Func(lra.func),
            range: lra.range,
            with_labels: sel.with_labels,
            grouping: lra.grouping.clone(),
        });
        if sel.with_labels {
            agg
        } else {
            join_matrix(agg, sel.fingerprints, lra.offset)
        }
    };
    Ok(with_comparison(main, &lra.comparison))
}

fn metrics_15s_shortcut_applies(lra: &RangeAggregation) -> bool {
    lra.grouping.is_none()
        && metrics_15s_shortcut(&LogQuery::Range(lra.clone()))
}

fn plan_vector(
    v: &VectorAggregation,
    factory: &PlannerFactory,
) -> Result<BoxPlanner, Error> {
    let inner = plan_range(&v.inner, factory)?;
    let main = Box::new(VectorAgg {
        main: inner,
        op: v.op,
        grouping: v.grouping.clone(),
    });
    Ok(with_comparison(main, &v.comparison))
}

fn plan_quantile(
    q: &QuantileOverTime,
    factory: &PlannerFactory,
) -> Result<BoxPlanner, Error> {
    let sel = plan_selector(&q.selector, None, factory, false, true)?;
    let main = Box::new(Lra {
        main: sel.planner,
        agg: RangeAgg::Quantile(q.quantile),
        range: q.range,
        with_labels: true,
        grouping: Some(
            q.grouping.clone().unwrap_or(Grouping::Without(vec![])),
        ),
    });
    Ok(with_comparison(main, &q.comparison))
}

/// Compile the selector feeding a residual pipeline: every line of the
/// matched streams with its labels, ordered by series. The row limit is left
/// to the residual pipeline.
pub fn plan_residual_source(
    selector: &StrSelector,
    offset: Option<Duration>,
    factory: &PlannerFactory,
    matrix: bool,
) -> Result<BoxPlanner, Error> {
    let sel = plan_selector(selector, offset, factory, false, true)?;
    Ok(Box::new(SeriesOrder { main: sel.planner, matrix }))
}

/// Compile a log query that runs entirely in the database.
pub fn plan_sql(
    query: &LogQuery,
    factory: &PlannerFactory,
) -> Result<BoxPlanner, Error> {
    let main = match query {
        LogQuery::Stream(selector) => {
            let sel = plan_selector(selector, None, factory, true, true)?;
            return Ok(Box::new(SeriesOrder {
                main: sel.planner,
                matrix: false,
            }));
        }
        LogQuery::Range(lra) => plan_range(lra, factory)?,
        LogQuery::Vector(v) => plan_vector(v, factory)?,
        LogQuery::QuantileOverTime(q) => plan_quantile(q, factory)?,
        LogQuery::TopK(t) => {
            let inner = match t.inner.as_ref() {
                TopKInner::Range(r) => plan_range(r, factory)?,
                TopKInner::Vector(v) => plan_vector(v, factory)?,
                TopKInner::QuantileOverTime(q) => plan_quantile(q, factory)?,
            };
            let topk =
                Box::new(TopKPlanner { main: inner, op: t.op, k: t.param });
            with_comparison(topk, &t.comparison)
        }
    };
    Ok(Box::new(SeriesOrder { main, matrix: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logql::ast::LabelFilter;
    use crate::logql::ast::LabelMatcher;
    use crate::logql::ast::LineFilter;
    use crate::logql::ast::LineFilterOp;
    use crate::logql::ast::MatchOp;
    use crate::logql::ast::Parser;
    use crate::logql::ast::ParserParam;
    use crate::logql::ast::TopK;
    use crate::logql::ast::TopKOp;
    use crate::logql::ast::Unwrap;
    use crate::logql::ast::VectorOp;
    use crate::test_util::test_context;

    fn selector(pipeline: Vec<Stage>) -> StrSelector {
        StrSelector {
            matchers: vec![LabelMatcher::new("app", MatchOp::Eq, "api")],
            pipeline,
        }
    }

    fn contains(value: &str) -> Stage {
        Stage::LineFilter(LineFilter {
            op: LineFilterOp::Contains,
            value: value.to_string(),
        })
    }

    fn render(query: &LogQuery) -> String {
        let ctx = test_context().with_limit(1000);
        let p = plan_sql(query, &PlannerFactory::default()).unwrap();
        ctx.render(&p.process(&ctx).unwrap()).unwrap()
    }

    fn range(func: RangeFn, pipeline: Vec<Stage>) -> RangeAggregation {
        RangeAggregation {
            func,
            selector: selector(pipeline),
            range: Duration::from_secs(300),
            offset: None,
            grouping: None,
            comparison: None,
        }
    }

    #[test]
    fn test_stream_with_line_filter() {
        let sql = render(&LogQuery::Stream(selector(vec![contains("error")])));
        assert!(sql.contains("like(samples.string, '%error%')"), "{sql}");
        assert!(sql.contains("samples.fingerprint IN fp_sel"));
        assert!(sql.contains("ORDER BY timestamp_ns DESC LIMIT 1000"));
        assert!(sql.contains("ANY LEFT JOIN _time_series"));
        assert!(sql.ends_with("ORDER BY fingerprint ASC, timestamp_ns DESC"));
        // The fingerprint CTE is declared once.
        assert_eq!(sql.matches("fp_sel AS (").count(), 1);
    }

    #[test]
    fn test_stream_with_label_stages() {
        let sql = render(&LogQuery::Stream(selector(vec![
            Stage::LabelFilter(LabelFilter::Match(LabelMatcher::new(
                "env",
                MatchOp::Ne,
                "dev",
            ))),
            Stage::Parser(Parser::Json(vec![ParserParam {
                label: "lvl".into(),
                path: None,
            }])),
            Stage::LabelFilter(LabelFilter::Match(LabelMatcher::new(
                "lvl",
                MatchOp::Eq,
                "error",
            ))),
        ])));
        assert!(
            sql.contains("JSONExtractString(labels, 'env') != 'dev'"),
            "{sql}"
        );
        assert!(sql.contains(".labels['lvl'] = 'error'"), "{sql}");
        // The limit applies after the label stages.
        let limit = sql.find("LIMIT 1000").unwrap();
        assert!(sql.find("'lvl'").unwrap() < limit);
    }

    #[test]
    fn test_rate_uses_rollup() {
        let sql = render(&LogQuery::Range(range(RangeFn::Rate, vec![])));
        assert!(sql.contains("countMerge(metrics_15s.count)"), "{sql}");
        assert!(sql.contains("PREWHERE"));
        assert!(sql.contains("metrics_15s.fingerprint IN fp_sel"));
        assert!(sql.ends_with("ORDER BY fingerprint ASC, timestamp_ns ASC"));
    }

    #[test]
    fn test_unwrapped_sum_by() {
        let mut lra = range(
            RangeFn::SumOverTime,
            vec![
                contains("took"),
                Stage::Parser(Parser::Json(vec![ParserParam {
                    label: "ms".into(),
                    path: Some("timing.ms".into()),
                }])),
                Stage::Unwrap(Unwrap { label: "ms".into() }),
            ],
        );
        lra.grouping = Some(Grouping::By(vec!["app".into()]));
        let query = LogQuery::Vector(VectorAggregation {
            op: VectorOp::Sum,
            grouping: None,
            inner: lra,
            comparison: Some(Comparison {
                op: crate::logql::ast::Comparator::Gt,
                value: 10.0,
            }),
        });
        let sql = render(&query);
        assert!(sql.contains("toFloat64OrZero("), "{sql}");
        assert!(sql.contains("sum(lra_"), "{sql}");
        assert!(sql.contains("CAST(map(), 'Map(String, String)')"));
        assert!(sql.contains(".value > 10.0"));
        assert!(!sql.contains("metrics_15s"));
    }

    #[test]
    fn test_residual_source_is_unlimited() {
        let ctx = test_context().with_limit(1000);
        let sel = selector(vec![contains("x")]);
        let p = plan_residual_source(
            &sel,
            Some(Duration::from_secs(3600)),
            &PlannerFactory::default(),
            false,
        )
        .unwrap();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(!sql.contains("LIMIT"), "{sql}");
        assert!(sql.contains("samples.timestamp_ns + 3600000000000"));
        assert!(sql.contains("date >= '2023-12-31'"));
        assert!(sql.ends_with("ORDER BY fingerprint ASC, timestamp_ns DESC"));
    }

    #[test]
    fn test_topk_of_count() {
        let query = LogQuery::TopK(TopK {
            op: TopKOp::Topk,
            param: 2,
            inner: Box::new(TopKInner::Range(range(
                RangeFn::BytesOverTime,
                vec![],
            ))),
            comparison: None,
        });
        let sql = render(&query);
        assert!(sql.contains("toFloat64(sum(length(lra_"), "{sql}");
        assert!(sql.contains("_rank <= 2"));
    }
}
