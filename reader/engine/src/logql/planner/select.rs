// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planners reading the raw tables: stream selection, samples, labels.

// Copyright 2024 Oxide Computer Company

use super::filter::label_filter_cond;
use crate::config::Table;
use crate::context::timestamp_ns;
use crate::context::PlannerContext;
use crate::context::SampleKind;
use crate::logql::ast::LabelFilter;
use crate::logql::ast::LabelMatcher;
use crate::logql::ast::MatchOp;
use crate::planner::BoxPlanner;
use crate::planner::CacheSlot;
use crate::planner::Planner;
use crate::planner::SharedPlanner;
use crate::planner::WithConnector;
use crate::Error;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::Join;
use sql_select::JoinKind;
use sql_select::Select;
use sql_select::Source;
use std::time::Duration;

/// The condition matching `val` against a label matcher value.
pub(crate) fn match_cond(column: Expr, op: MatchOp, value: &str) -> Expr {
    match op {
        MatchOp::Eq => Expr::eq(column, Expr::str(value)),
        MatchOp::Ne => Expr::ne(column, Expr::str(value)),
        MatchOp::Re => Expr::eq(regex_match(column, value), Expr::int(1)),
        MatchOp::NotRe => Expr::eq(regex_match(column, value), Expr::int(0)),
    }
}

// Label matchers match the whole value.
fn regex_match(column: Expr, pattern: &str) -> Expr {
    Expr::func("match", vec![column, Expr::str(format!("^(?:{pattern})$"))])
}

/// `groupBitOr(bitShiftLeft(c0, 0) + bitShiftLeft(c1, 1) ...)`, which has
/// every bit set for a fingerprint matching all the conditions.
pub(crate) fn bitset_and(conds: &[Expr]) -> Expr {
    let sum = conds
        .iter()
        .enumerate()
        .map(|(i, c)| {
            Expr::func("bitShiftLeft", vec![c.clone(), Expr::int(i as i64)])
        })
        .reduce(|acc, e| Expr::func("plus", vec![acc, e]))
        .unwrap_or(Expr::int(0));
    Expr::func("groupBitOr", vec![sum])
}

/// The mask every matching fingerprint reaches.
pub(crate) fn bitset_mask(n: usize) -> Expr {
    Expr::int((1i64 << n) - 1)
}

/// Select the fingerprints of the streams matching a stream selector.
#[derive(Debug)]
pub struct StreamSelect {
    pub matchers: Vec<LabelMatcher>,
    pub offset: Option<Duration>,
}

impl Planner for StreamSelect {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let from = shifted(ctx, self.offset).0;
        select_fingerprints(ctx, &self.matchers, &from, SampleKind::Logs)
    }
}

/// Select the fingerprints of the series of `kind` matching every matcher,
/// from the time series written on or after `from_date`.
pub(crate) fn select_fingerprints(
    ctx: &PlannerContext,
    matchers: &[LabelMatcher],
    from_date: &str,
    kind: SampleKind,
) -> Result<Select, Error> {
    let (empty, matchers): (Vec<_>, Vec<_>) = matchers
        .iter()
        .partition(|m| m.op == MatchOp::Eq && m.value.is_empty());

    let clauses = matchers
        .iter()
        .map(|m| {
            Expr::and(vec![
                Expr::eq(Expr::raw("key"), Expr::str(m.name.as_str())),
                match_cond(Expr::raw("val"), m.op, &m.value),
            ])
        })
        .collect::<Vec<_>>();

    let fp_request = if clauses.is_empty() {
        None
    } else {
        Some(
            Select::new()
                .select([Column::simple("fingerprint")])
                .from(Source::table(ctx.dist_table(Table::TimeSeriesGin)))
                .and_where([Expr::ge(Expr::raw("date"), Expr::str(from_date))])
                .and_where(ctx.types_filter(kind, "type"))
                .and_where([Expr::or(clauses.clone())])
                .group_by([Expr::raw("fingerprint")])
                .and_having([Expr::eq(
                    bitset_and(&clauses),
                    bitset_mask(clauses.len()),
                )]),
        )
    };
    if empty.is_empty() {
        return fp_request.ok_or_else(|| {
            Error::not_supported("stream selector without matchers")
        });
    }

    // `label=""` matches streams without the label, which the inverted
    // index cannot find.
    let empty_clauses = empty
        .iter()
        .map(|m| {
            Expr::eq(
                Expr::func(
                    "simpleJSONHas",
                    vec![Expr::raw("labels"), Expr::str(m.name.as_str())],
                ),
                Expr::int(0),
            )
        })
        .collect::<Vec<_>>();
    let mut res = Select::new()
        .select([Column::simple("fingerprint")])
        .from(Source::table(ctx.dist_table(Table::TimeSeries)))
        .and_where([Expr::ge(Expr::raw("date"), Expr::str(from_date))])
        .and_where([Expr::and(empty_clauses)]);
    if let Some(fp_request) = fp_request {
        let pre = Cte::new("fp_pre_req", fp_request);
        res = res
            .and_where([Expr::in_(Expr::raw("fingerprint"), pre.reference())])
            .with(pre);
    }
    Ok(res)
}

/// Restrict the fingerprints of `main` with a label filter evaluated over the
/// stream labels.
#[derive(Debug)]
pub struct SimpleLabelFilter {
    pub main: BoxPlanner,
    pub filter: LabelFilter,
}

impl Planner for SimpleLabelFilter {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let sub = Cte::new(ctx.next_alias("subsel"), main);
        let cond = label_filter_cond(&self.filter, &|label: &str| {
            Expr::func(
                "JSONExtractString",
                vec![Expr::raw("labels"), Expr::str(label)],
            )
        });
        Ok(Select::new()
            .select([Column::simple("fingerprint")])
            .from(Source::table(ctx.dist_table(Table::TimeSeries)))
            .and_where([
                Expr::in_(Expr::raw("fingerprint"), sub.reference()),
                cond,
            ])
            .with(sub))
    }
}

// The time range read for a query shifted back by `offset`, as dates and
// nanoseconds.
pub(crate) fn shifted(
    ctx: &PlannerContext,
    offset: Option<Duration>,
) -> (String, i64, i64) {
    let offset = offset
        .and_then(|o| chrono::Duration::from_std(o).ok())
        .unwrap_or_else(chrono::Duration::zero);
    let from = ctx.from - offset;
    let to = ctx.to - offset;
    let date = from.format("%Y-%m-%d").to_string();
    (date, timestamp_ns(&from), timestamp_ns(&to))
}

/// Read raw log lines from the samples table.
///
/// With an offset, lines are read from a range shifted back in time and
/// reported at the shifted-forward timestamp.
#[derive(Debug)]
pub struct SamplesInit {
    pub offset: Option<Duration>,
}

impl Planner for SamplesInit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let (_, from, to) = shifted(ctx, self.offset);
        let ts = match self.offset {
            Some(o) => format!("samples.timestamp_ns + {}", o.as_nanos()),
            None => String::from("samples.timestamp_ns"),
        };
        Ok(Select::new()
            .select([
                Column::new(ts, "timestamp_ns"),
                Column::new("samples.fingerprint", "fingerprint"),
                Column::new("samples.string", "string"),
                Column::new("toFloat64(0)", "value"),
            ])
            .from(
                Source::table(ctx.dist_table(Table::Samples)).alias("samples"),
            )
            .and_prewhere([
                Expr::ge(Expr::raw("samples.timestamp_ns"), Expr::int(from)),
                Expr::lt(Expr::raw("samples.timestamp_ns"), Expr::int(to)),
            ])
            .and_prewhere(ctx.types_filter(SampleKind::Logs, "samples.type")))
    }
}

/// Read the label sets of the time series as maps.
#[derive(Debug)]
pub struct TimeSeriesInit {
    pub offset: Option<Duration>,
}

impl Planner for TimeSeriesInit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let (from_date, _, _) = shifted(ctx, self.offset);
        Ok(Select::new()
            .select([
                Column::new("time_series.fingerprint", "fingerprint"),
                Column::new(
                    "mapFromArrays(arrayMap(x -> x.1, \
                     JSONExtractKeysAndValues(time_series.labels, 'String') \
                     as rawlbls), arrayMap(x -> x.2, rawlbls))",
                    "labels",
                ),
            ])
            .from(
                Source::table(ctx.dist_table(Table::TimeSeries))
                    .alias("time_series"),
            )
            .and_prewhere([Expr::ge(
                Expr::raw("time_series.date"),
                Expr::str(from_date),
            )])
            .and_prewhere(
                ctx.types_filter(SampleKind::Logs, "time_series.type"),
            ))
    }
}

/// Attach the label set of every row of `main`, looked up by fingerprint.
///
/// Outside of cluster mode the labels are joined. In cluster mode they are
/// read from a map built once from the matched time series, which avoids a
/// distributed join.
#[derive(Debug)]
pub struct LabelsJoin {
    pub main: BoxPlanner,
    /// Selects the fingerprints of the matched streams.
    pub fingerprints: SharedPlanner,
    pub offset: Option<Duration>,
    /// Columns of `main` carried over, besides the fingerprint.
    pub columns: &'static [&'static str],
}

pub const STREAM_COLUMNS: &[&str] = &["timestamp_ns", "string", "value"];
pub const MATRIX_COLUMNS: &[&str] = &["timestamp_ns", "value"];

impl Planner for LabelsJoin {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let time_series = WithConnector::new(
            Box::new(TimeSeriesInit { offset: self.offset }),
            Box::new(self.fingerprints.clone()),
            "fp_sel",
            "time_series.fingerprint",
        )
        .prewhere()
        .cached(CacheSlot::Fingerprints)
        .process(ctx)?;
        let main = Cte::new("main", self.main.process(ctx)?);
        let ts = Cte::new("_time_series", time_series);
        let ts = ctx.labels_cache.get_or_try_init(|| Ok(ts))?;

        let labels = if ctx.is_cluster {
            let map = Select::new()
                .select([Column::new(
                    "mapFromArrays(groupArray(fingerprint), groupArray(labels))",
                    "map",
                )])
                .from(Source::cte(ts.alias.as_str()));
            Expr::func(
                "arrayElement",
                vec![Expr::subquery(map), Expr::raw("main.fingerprint")],
            )
        } else {
            Expr::raw("_time_series.labels")
        };
        let mut columns = vec![Column::new("main.fingerprint", "fingerprint")];
        for name in self.columns {
            columns.push(Column::new(format!("main.{name}"), *name));
            if *name == "timestamp_ns" {
                columns.push(Column::new(labels.clone(), "labels"));
            }
        }
        let mut res = Select::new()
            .select(columns)
            .from(Source::cte("main"))
            .with(main)
            .with(ts);
        if !ctx.is_cluster {
            res = res.join(Join::new(
                JoinKind::AnyLeft,
                Source::cte("_time_series"),
                Expr::eq(
                    Expr::raw("main.fingerprint"),
                    Expr::raw("_time_series.fingerprint"),
                ),
            ));
        }
        Ok(res)
    }
}

/// Count log lines per fingerprint from the 15 second rollup, for `rate`
/// and `count_over_time`.
#[derive(Debug)]
pub struct Metrics15sInit {
    pub range: Duration,
    /// Divide by the range, for `rate`.
    pub per_second: bool,
    pub offset: Option<Duration>,
}

impl Planner for Metrics15sInit {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let (_, from, to) = shifted(ctx, self.offset);
        let range_ns = self.range.as_nanos();
        let shift = self.offset.map(|o| o.as_nanos()).unwrap_or(0);
        let mut value =
            String::from("toFloat64(countMerge(metrics_15s.count))");
        if self.per_second {
            value = format!("{value} / {}", self.range.as_secs_f64());
        }
        Ok(Select::new()
            .select([
                Column::new("metrics_15s.fingerprint", "fingerprint"),
                Column::new(
                    format!(
                        "intDiv(metrics_15s.timestamp_ns, {range_ns}) * {range_ns} + {shift}"
                    ),
                    "timestamp_ns",
                ),
                Column::new(value, "value"),
            ])
            .from(
                Source::table(ctx.dist_table(Table::Metrics15s))
                    .alias("metrics_15s"),
            )
            .and_prewhere([
                Expr::ge(
                    Expr::raw("metrics_15s.timestamp_ns"),
                    Expr::int(from),
                ),
                Expr::lt(
                    Expr::raw("metrics_15s.timestamp_ns"),
                    Expr::int(to),
                ),
            ])
            .and_prewhere(
                ctx.types_filter(SampleKind::Logs, "metrics_15s.type"),
            )
            .group_by([Expr::raw("fingerprint"), Expr::raw("timestamp_ns")]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::cluster_config;
    use crate::test_util::test_context;
    use crate::test_util::test_context_with;
    use crate::test_util::MemoryDb;
    use std::sync::Arc;

    fn matchers(m: &[(&str, MatchOp, &str)]) -> Vec<LabelMatcher> {
        m.iter().map(|(n, op, v)| LabelMatcher::new(n, *op, v)).collect()
    }

    #[test]
    fn test_stream_select() {
        let ctx = test_context();
        let p = StreamSelect {
            matchers: matchers(&[
                ("app", MatchOp::Eq, "api"),
                ("env", MatchOp::Re, "prod|dev"),
            ]),
            offset: None,
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "SELECT fingerprint FROM time_series_gin \
             WHERE (date >= '2024-01-01' AND type IN (0,1) AND \
             ((key = 'app' AND val = 'api') OR \
             (key = 'env' AND match(val, '^(?:prod|dev)$') = 1))) \
             GROUP BY fingerprint \
             HAVING groupBitOr(plus(\
             bitShiftLeft((key = 'app' AND val = 'api'), 0), \
             bitShiftLeft(\
             (key = 'env' AND match(val, '^(?:prod|dev)$') = 1), 1))) = 3"
        );
    }

    #[test]
    fn test_stream_select_empty_label() {
        let ctx = test_context();
        let p = StreamSelect {
            matchers: matchers(&[
                ("app", MatchOp::Eq, "api"),
                ("trace", MatchOp::Eq, ""),
            ]),
            offset: None,
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with(
            "WITH fp_pre_req AS (SELECT fingerprint FROM time_series_gin"
        ));
        assert!(sql.contains("simpleJSONHas(labels, 'trace') = 0"));
        assert!(sql.contains("fingerprint IN fp_pre_req"));

        let only_empty = StreamSelect {
            matchers: matchers(&[("trace", MatchOp::Eq, "")]),
            offset: None,
        };
        let sql = ctx.render(&only_empty.process(&ctx).unwrap()).unwrap();
        assert!(!sql.contains("fp_pre_req"));
        let none = StreamSelect { matchers: vec![], offset: None };
        assert!(matches!(none.process(&ctx), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_samples_init_with_offset() {
        let ctx = test_context();
        let p = SamplesInit { offset: Some(Duration::from_secs(60)) };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.starts_with(
            "SELECT samples.timestamp_ns + 60000000000 AS timestamp_ns"
        ));
        assert!(sql.contains("samples.timestamp_ns >= 1704067140000000000"));
        assert!(sql.contains("samples.type IN (0,1)"));
    }

    #[test]
    fn test_labels_join_local_and_cluster() {
        let fp = || -> SharedPlanner {
            Arc::new(StreamSelect {
                matchers: vec![LabelMatcher::new("app", MatchOp::Eq, "api")],
                offset: None,
            })
        };
        let join = |ctx: &PlannerContext| {
            let p = LabelsJoin {
                main: Box::new(SamplesInit { offset: None }),
                fingerprints: fp(),
                offset: None,
                columns: STREAM_COLUMNS,
            };
            ctx.render(&p.process(ctx).unwrap()).unwrap()
        };

        let sql = join(&test_context());
        assert!(sql.contains(
            "ANY LEFT JOIN _time_series \
             ON main.fingerprint = _time_series.fingerprint"
        ));
        assert!(sql.contains("time_series.fingerprint IN fp_sel"));
        assert!(sql.contains(
            "SELECT main.fingerprint AS fingerprint, \
             main.timestamp_ns AS timestamp_ns, \
             _time_series.labels AS labels, main.string AS string, \
             main.value AS value"
        ));

        let ctx =
            test_context_with(Arc::new(MemoryDb::new()), &cluster_config());
        let sql = join(&ctx);
        assert!(!sql.contains("JOIN"));
        assert!(sql.contains(
            "arrayElement((SELECT mapFromArrays(groupArray(fingerprint), \
             groupArray(labels)) AS map FROM _time_series), \
             main.fingerprint) AS labels"
        ));
        assert!(sql.contains("`qryn`.samples_v3_dist AS samples"));
    }

    #[test]
    fn test_metrics_15s() {
        let ctx = test_context();
        let p = Metrics15sInit {
            range: Duration::from_secs(60),
            per_second: true,
            offset: None,
        };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.contains(
            "toFloat64(countMerge(metrics_15s.count)) / 60 AS value"
        ));
        assert!(sql.contains("FROM metrics_15s AS metrics_15s"));
        assert!(sql.ends_with("GROUP BY fingerprint, timestamp_ns"));
    }
}
