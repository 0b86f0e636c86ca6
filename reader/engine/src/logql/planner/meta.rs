// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planners answering metadata requests: series, label names and values,
//! detected labels and log patterns.

// Copyright 2024 Oxide Computer Company

use crate::config::Table;
use crate::context::PlannerContext;
use crate::context::SampleKind;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::Error;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::OrderBy;
use sql_select::Select;
use sql_select::Source;

fn date_range(ctx: &PlannerContext, column: &str) -> [Expr; 2] {
    [
        Expr::ge(Expr::raw(column), Expr::str(ctx.from_date())),
        Expr::le(Expr::raw(column), Expr::str(ctx.to_date())),
    ]
}

// Restrict `req` to the fingerprints selected by `fp`, if any.
fn restrict(
    ctx: &PlannerContext,
    req: Select,
    fp: Option<&BoxPlanner>,
    alias: &str,
    column: &str,
) -> Result<Select, Error> {
    let Some(fp) = fp else {
        return Ok(req);
    };
    let cte = Cte::new(alias, fp.process(ctx)?);
    Ok(req
        .and_where([Expr::in_(Expr::raw(column), cte.reference())])
        .with(cte))
}

fn limited(ctx: &PlannerContext, req: Select) -> Select {
    if ctx.limit > 0 {
        return req.limit(ctx.limit);
    }
    req
}

/// The distinct label sets of the streams matched by `fingerprints`.
#[derive(Debug)]
pub struct SeriesPlanner {
    pub fingerprints: BoxPlanner,
}

impl Planner for SeriesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let req = Select::new()
            .distinct(true)
            .select([Column::simple("labels")])
            .from(
                Source::table(ctx.dist_table(Table::TimeSeries))
                    .alias("time_series"),
            )
            .and_where(date_range(ctx, "date"))
            .and_where(ctx.types_filter(SampleKind::Logs, "type"));
        let req = restrict(
            ctx,
            req,
            Some(&self.fingerprints),
            "fp_sel",
            "fingerprint",
        )?;
        Ok(limited(ctx, req))
    }
}

/// The names of the labels present in the time range.
#[derive(Debug)]
pub struct LabelNamesPlanner {
    pub fingerprints: Option<BoxPlanner>,
}

impl Planner for LabelNamesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let req = Select::new()
            .distinct(true)
            .select([Column::simple("key")])
            .from(Source::table(ctx.dist_table(Table::TimeSeriesGin)))
            .and_where(date_range(ctx, "date"))
            .and_where(ctx.types_filter(SampleKind::Logs, "type"));
        let req = restrict(
            ctx,
            req,
            self.fingerprints.as_ref(),
            "fp_sel",
            "fingerprint",
        )?;
        Ok(limited(ctx, req))
    }
}

/// The values a label takes in the time range.
#[derive(Debug)]
pub struct LabelValuesPlanner {
    pub fingerprints: Option<BoxPlanner>,
    pub key: String,
}

impl Planner for LabelValuesPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let req = Select::new()
            .distinct(true)
            .select([Column::simple("val")])
            .from(Source::table(ctx.dist_table(Table::TimeSeriesGin)))
            .and_where(date_range(ctx, "date"))
            .and_where([Expr::eq(
                Expr::raw("key"),
                Expr::str(self.key.as_str()),
            )])
            .and_where(ctx.types_filter(SampleKind::Logs, "type"));
        let req = restrict(
            ctx,
            req,
            self.fingerprints.as_ref(),
            "fp_sel",
            "fingerprint",
        )?;
        Ok(limited(ctx, req))
    }
}

/// Every label with its number of distinct values.
#[derive(Debug)]
pub struct DetectLabelsPlanner {
    pub fingerprints: Option<BoxPlanner>,
}

impl Planner for DetectLabelsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let req = Select::new()
            .select([
                Column::simple("key"),
                Column::new("count(distinct val)", "cardinality"),
            ])
            .from(Source::table(ctx.dist_table(Table::TimeSeriesGin)))
            .and_where(date_range(ctx, "date"))
            .group_by([Expr::raw("key")]);
        restrict(ctx, req, self.fingerprints.as_ref(), "fp", "fingerprint")
    }
}

/// Log patterns of the matched streams with their counts per step, most
/// frequent first. Patterns seen once are dropped.
#[derive(Debug)]
pub struct PatternsPlanner {
    pub fingerprints: BoxPlanner,
}

const PATTERN_TOTAL: &str = "arraySum(arrayMap(x -> x.2, samples))";

impl Planner for PatternsPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let step = ctx.step.as_secs().max(1);
        let from = ctx.from.timestamp();
        let to = ctx.to.timestamp();
        let pregroup = Select::new()
            .select([
                Column::simple("pattern_id"),
                Column::new("max(p.iteration_id)", "_iteration_id"),
                Column::new("argMax(p.tokens, p.iteration_id)", "tokens"),
                Column::new(
                    format!("intDiv(p.timestamp_s, {step}) * {step}"),
                    "timestamp_s",
                ),
                Column::new("sum(p.samples_count)", "count"),
            ])
            .from(Source::table(ctx.dist_table(Table::Patterns)).alias("p"))
            .and_where([
                Expr::ge(Expr::raw("p.timestamp_10m"), Expr::int(from / 600)),
                Expr::le(Expr::raw("p.timestamp_10m"), Expr::int(to / 600)),
                Expr::ge(Expr::raw("p.timestamp_s"), Expr::int(from)),
                Expr::le(Expr::raw("p.timestamp_s"), Expr::int(to)),
            ])
            .group_by([Expr::raw("pattern_id"), Expr::raw("timestamp_s")]);
        let pregroup = restrict(
            ctx,
            pregroup,
            Some(&self.fingerprints),
            "fp",
            "p.fingerprint",
        )?;
        let req = Select::new()
            .select([
                Column::new("argMax(tokens, _iteration_id)", "tokens"),
                Column::new(
                    "arraySort(groupArray((timestamp_s, count)))",
                    "samples",
                ),
            ])
            .from(Source::cte("pregroup"))
            .group_by([Expr::raw("pattern_id")])
            .and_having([Expr::gt(Expr::raw(PATTERN_TOTAL), Expr::int(1))])
            .order_by([OrderBy::desc(PATTERN_TOTAL)])
            .with(Cte::new("pregroup", pregroup));
        Ok(limited(ctx, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::fixed;
    use crate::test_util::test_context;

    #[test]
    fn test_series() {
        let ctx = test_context().with_limit(5);
        let p = SeriesPlanner { fingerprints: fixed("fps") };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "WITH fp_sel AS (SELECT fingerprint FROM fps) \
             SELECT DISTINCT labels FROM time_series AS time_series \
             WHERE (date >= '2024-01-01' AND date <= '2024-01-01' AND \
             type IN (0,1) AND fingerprint IN fp_sel) LIMIT 5"
        );
    }

    #[test]
    fn test_label_names_and_values() {
        let ctx = test_context();
        let p = LabelNamesPlanner { fingerprints: None };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with("SELECT DISTINCT key FROM time_series_gin"));
        assert!(!sql.contains("fp_sel"));

        let p = LabelValuesPlanner {
            fingerprints: Some(fixed("fps")),
            key: "app".into(),
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("key = 'app'"));
        assert!(sql.contains("fingerprint IN fp_sel"));
    }

    #[test]
    fn test_detect_labels() {
        let ctx = test_context();
        let p = DetectLabelsPlanner { fingerprints: Some(fixed("fps")) };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains("count(distinct val) AS cardinality"));
        assert!(sql.contains("fingerprint IN fp"));
        assert!(sql.contains("GROUP BY key"));
    }

    #[test]
    fn test_patterns() {
        let ctx = test_context().with_limit(50);
        let p = PatternsPlanner { fingerprints: fixed("fps") };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with(
            "WITH fp AS (SELECT fingerprint FROM fps), pregroup AS (SELECT \
             pattern_id, max(p.iteration_id) AS _iteration_id"
        ));
        assert!(sql.contains("intDiv(p.timestamp_s, 15) * 15 AS timestamp_s"));
        assert!(sql.contains("p.timestamp_10m >= 2840112"));
        assert!(sql.ends_with(
            "GROUP BY pattern_id \
             HAVING arraySum(arrayMap(x -> x.2, samples)) > 1 \
             ORDER BY arraySum(arrayMap(x -> x.2, samples)) DESC LIMIT 50"
        ));
    }
}
