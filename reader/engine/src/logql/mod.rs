// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The LogQL front end.
//!
//! A query is compiled to SQL up to its [breakpoint](analyze::breakpoint).
//! Whatever follows the breakpoint becomes a chain of residual stages over
//! the rows the SQL returns.

// Copyright 2024 Oxide Computer Company

pub mod analyze;
pub mod ast;
pub mod json_path;
pub mod planner;
pub mod template;

use crate::entry::Labels;
use crate::planner::PlannerFactory;
use crate::residual::RequestProcessor;
use crate::residual::StageKind;
use crate::Error;
use analyze::Breakpoint;
use ast::LogQuery;
use ast::MatchOp;
use ast::RangeAggregation;
use ast::Stage;
use ast::StrSelector;

/// Compile a log query into a request processor.
pub fn plan(
    query: &LogQuery,
    factory: &PlannerFactory,
) -> Result<RequestProcessor, Error> {
    let mut query = query.clone();
    analyze::cancel_json_and_logfmt(&mut query);
    let bp = analyze::breakpoint(&query);
    if bp == Breakpoint::None || analyze::metrics_15s_shortcut(&query) {
        let sql = planner::plan_sql(&query, factory)?;
        return Ok(RequestProcessor::source(sql, query.is_matrix()));
    }

    let (sql, residual) = analyze::split_at_breakpoint(&query, bp)?;
    let Some(residual) = residual else {
        return Err(Error::planning("split query has no residual part"));
    };
    let source = planner::plan_residual_source(
        sql.selector(),
        query.offset(),
        factory,
        query.is_matrix(),
    )?;
    let mut processor = RequestProcessor::source(source, false);
    processor = residual_stages(&residual.selector().pipeline)
        .into_iter()
        .fold(processor, RequestProcessor::then);

    match &residual {
        LogQuery::Stream(_) => {
            return Ok(processor.then(StageKind::Limit));
        }
        LogQuery::Range(lra) => {
            processor = then_range(processor, lra);
        }
        LogQuery::Vector(v) => {
            processor = then_range(processor, &v.inner).then(
                StageKind::VectorAggregation {
                    op: v.op,
                    grouping: v.grouping.clone(),
                },
            );
            if let Some(c) = v.comparison {
                processor = processor.then(StageKind::Comparison(c));
            }
        }
        // Rejected by the split.
        LogQuery::TopK(_) | LogQuery::QuantileOverTime(_) => {
            return Err(Error::planning("unexpected residual query"));
        }
    }
    Ok(processor
        .then(StageKind::ZeroEater)
        .then(StageKind::FixPeriod { duration: query.duration() }))
}

fn then_range(
    processor: RequestProcessor,
    lra: &RangeAggregation,
) -> RequestProcessor {
    let processor = processor.then(StageKind::RangeAggregation {
        func: lra.func,
        range: lra.range,
        grouping: lra.grouping.clone(),
        absent_labels: absent_labels(&lra.selector),
    });
    match lra.comparison {
        Some(c) => processor.then(StageKind::Comparison(c)),
        None => processor,
    }
}

// The series reported by `absent_over_time` carries the equality matchers
// of the selector.
fn absent_labels(selector: &StrSelector) -> Labels {
    selector
        .matchers
        .iter()
        .filter(|m| m.op == MatchOp::Eq)
        .map(|m| (m.name.clone(), m.value.clone()))
        .collect()
}

fn residual_stages(pipeline: &[Stage]) -> Vec<StageKind> {
    pipeline
        .iter()
        .map(|stage| match stage {
            Stage::LineFilter(f) => StageKind::LineFilter(f.clone()),
            Stage::LabelFilter(f) => StageKind::LabelFilter(f.clone()),
            Stage::Parser(p) => StageKind::Parser(p.clone()),
            Stage::LineFormat(t) => StageKind::LineFormat(t.clone()),
            Stage::LabelFormat(ops) => StageKind::LabelFormat(ops.clone()),
            Stage::Unwrap(u) => StageKind::Unwrap(u.label.clone()),
            Stage::Drop(params) => StageKind::Drop(params.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::drain;
    use crate::residual::tests::labels;
    use crate::test_util::row;
    use crate::test_util::test_config;
    use crate::test_util::test_context_with;
    use crate::test_util::MemoryDb;
    use crate::Processor;
    use ast::LabelFilter;
    use ast::LabelMatcher;
    use ast::Parser;
    use ast::RangeFn;
    use ast::TopK;
    use ast::TopKInner;
    use ast::TopKOp;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn selector(pipeline: Vec<Stage>) -> StrSelector {
        StrSelector {
            matchers: vec![
                LabelMatcher::new("app", MatchOp::Eq, "api"),
                LabelMatcher::new("env", MatchOp::Re, "prod.*"),
            ],
            pipeline,
        }
    }

    fn range(func: RangeFn, pipeline: Vec<Stage>) -> RangeAggregation {
        RangeAggregation {
            func,
            selector: selector(pipeline),
            range: Duration::from_secs(60),
            offset: None,
            grouping: None,
            comparison: None,
        }
    }

    fn logfmt() -> Stage {
        Stage::Parser(Parser::Logfmt(vec![]))
    }

    fn level_is(value: &str) -> Stage {
        Stage::LabelFilter(LabelFilter::Match(LabelMatcher::new(
            "level",
            MatchOp::Eq,
            value,
        )))
    }

    fn names(p: &RequestProcessor) -> Vec<String> {
        p.stages()
            .into_iter()
            .map(|s| format!("{s:?}").split(['(', ' ']).next().unwrap().into())
            .collect()
    }

    #[test]
    fn test_sql_only() {
        let factory = PlannerFactory::default();
        let p = plan(&LogQuery::Stream(selector(vec![])), &factory).unwrap();
        assert!(p.stages().is_empty());
        assert!(!p.is_matrix());

        let q = LogQuery::Range(range(RangeFn::Rate, vec![]));
        let p = plan(&q, &factory).unwrap();
        assert!(p.stages().is_empty());
        assert!(p.is_matrix());
    }

    #[test]
    fn test_split_stream() {
        let q = LogQuery::Stream(selector(vec![logfmt(), level_is("error")]));
        let p = plan(&q, &PlannerFactory::default()).unwrap();
        assert_eq!(names(&p), vec!["Parser", "LabelFilter", "Limit"]);
        assert!(!p.is_matrix());
    }

    #[test]
    fn test_split_range() {
        let q = LogQuery::Range(range(
            RangeFn::CountOverTime,
            vec![Stage::Parser(Parser::Json(vec![])), level_is("warn")],
        ));
        let p = plan(&q, &PlannerFactory::default()).unwrap();
        assert_eq!(
            names(&p),
            vec![
                "Parser",
                "LabelFilter",
                "RangeAggregation",
                "ZeroEater",
                "FixPeriod"
            ]
        );
        assert!(p.is_matrix());
        assert!(p.stages().contains(&&StageKind::FixPeriod {
            duration: Duration::from_secs(60)
        }));
    }

    #[test]
    fn test_json_then_logfmt_cancels() {
        let q = LogQuery::Stream(selector(vec![
            Stage::Parser(Parser::Json(vec![])),
            logfmt(),
        ]));
        let p = plan(&q, &PlannerFactory::default()).unwrap();
        assert!(p.stages().is_empty());
    }

    #[test]
    fn test_absent_over_time() {
        let q = LogQuery::Range(range(RangeFn::AbsentOverTime, vec![]));
        let p = plan(&q, &PlannerFactory::default()).unwrap();
        let stages = p.stages();
        let StageKind::RangeAggregation { absent_labels, .. } = stages[0]
        else {
            panic!("expected a range aggregation, found {stages:?}");
        };
        assert_eq!(absent_labels, &labels(&[("app", "api")]));
    }

    #[test]
    fn test_topk_over_residual_is_not_supported() {
        let q = LogQuery::TopK(TopK {
            op: TopKOp::Topk,
            param: 3,
            inner: Box::new(TopKInner::Range(range(
                RangeFn::Rate,
                vec![logfmt()],
            ))),
            comparison: None,
        });
        let err = plan(&q, &PlannerFactory::default()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_residual_stream_end_to_end() {
        let line = |ts: i64, msg: &str| {
            row(&[
                ("fingerprint", json!(7)),
                ("timestamp_ns", json!(ts)),
                ("labels", json!({"app": "api"})),
                ("string", json!(msg)),
            ])
        };
        let db = Arc::new(MemoryDb::new().respond(
            "samples_v3",
            vec![
                line(3, "level=error msg=\"disk full\""),
                line(2, "level=info msg=ok"),
                line(1, "level=error msg=retry"),
            ],
        ));
        let ctx = test_context_with(db.clone(), &test_config()).with_limit(1);
        let q = LogQuery::Stream(selector(vec![logfmt(), level_is("error")]));
        let p = plan(&q, &PlannerFactory::default()).unwrap();
        let (entries, err) = drain(p.process(&Arc::new(ctx)).unwrap()).await;
        assert_eq!(err, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].labels,
            labels(&[("app", "api"), ("level", "error"), ("msg", "disk full")])
        );
        // The source reads every matching line.
        assert!(!db.queries()[0].contains("LIMIT"));
    }
}
