// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PromQL front end.
//!
//! PromQL is evaluated outside of the database. The engine serves the
//! selectors of an expression, reduced according to the hints of the
//! evaluator, and the subtrees [`optimizer::optimize`] manages to push down.

// Copyright 2024 Oxide Computer Company

pub mod ast;
pub mod optimizer;
pub mod planner;

use crate::planner::BoxPlanner;
use crate::planner::PlannerFactory;
use crate::planner::WithConnector;
use ast::LabelMatcher;
use ast::SelectHints;
use planner::DownsampleHintsPlanner;
use planner::FingerprintsPlanner;
use planner::HintsPlanner;
use planner::LabelsPlanner;
use planner::ValuesPlanner;
use planner::FP_ALIAS;

/// Plan the selection of the series matching `matchers`.
///
/// The rows are the samples of every series (`type` 1) followed by its
/// labels (`type` 2). With `downsample`, samples are read from the 15 second
/// rollup and already merged by the function named in the hints.
pub fn plan_select(
    hints: SelectHints,
    matchers: Vec<LabelMatcher>,
    downsample: bool,
    factory: &PlannerFactory,
) -> BoxPlanner {
    let fingerprints = Box::new(FingerprintsPlanner { matchers });
    let main: BoxPlanner = if downsample {
        let init = WithConnector::new(
            factory.downsample_init(),
            fingerprints,
            FP_ALIAS,
            "samples.fingerprint",
        );
        Box::new(DownsampleHintsPlanner { main: Box::new(init), hints })
    } else {
        let values = Box::new(ValuesPlanner { fingerprints });
        Box::new(HintsPlanner { main: values, hints })
    };
    Box::new(LabelsPlanner { main })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DownsampleInitFn;
    use crate::planner::Planner;
    use crate::test_util::test_context;
    use ast::MatchOp;
    use ast::METRIC_NAME;
    use sql_select::Column;
    use sql_select::Select;
    use std::sync::Arc;

    fn up() -> Vec<LabelMatcher> {
        vec![LabelMatcher::new(METRIC_NAME, MatchOp::Eq, "up")]
    }

    fn hints(func: &str) -> SelectHints {
        SelectHints {
            start: 1704067200000,
            end: 1704070800000,
            step: 60000,
            range: 300000,
            func: func.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_select() {
        let p = plan_select(hints(""), up(), false, &PlannerFactory::default());
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("FROM samples_v3 AS samples"), "{sql}");
        assert!(sql.contains("argMax(spls.val, spls.timestamp_ms) AS val"));
        assert!(sql.contains("SELECT DISTINCT 2 AS type"));
        assert_eq!(sql.matches("fp AS (").count(), 1);
    }

    #[test]
    fn test_downsampled_select() {
        let p = plan_select(
            hints("max_over_time"),
            up(),
            true,
            &PlannerFactory::default(),
        );
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("FROM metrics_15s AS samples"), "{sql}");
        assert!(sql.contains("max(max) AS val"));
        assert!(sql.contains("samples.fingerprint IN fp"));
    }

    #[derive(Debug)]
    struct Rollup;

    impl Planner for Rollup {
        fn process(
            &self,
            _: &crate::PlannerContext,
        ) -> Result<Select, crate::Error> {
            Ok(Select::new()
                .select([
                    Column::simple("fingerprint"),
                    Column::simple("timestamp_ms"),
                    Column::new("last", "val"),
                ])
                .from("custom_rollup AS samples"))
        }
    }

    #[test]
    fn test_injected_downsample_planner() {
        let init: DownsampleInitFn =
            Arc::new(|| -> BoxPlanner { Box::new(Rollup) });
        let factory = PlannerFactory {
            downsample_init: Some(init),
            ..Default::default()
        };
        let p = plan_select(hints("sum_over_time"), up(), true, &factory);
        let ctx = test_context();
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("FROM custom_rollup AS samples"), "{sql}");
        assert!(sql.contains("sum(sum) AS val"));
    }
}
