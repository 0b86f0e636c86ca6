// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata requests over log streams.

// Copyright 2024 Oxide Computer Company

use super::Executor;
use crate::client::query_all;
use crate::client::Row;
use crate::context::PlannerContext;
use crate::entry::Labels;
use crate::logql;
use crate::logql::ast::Grouping;
use crate::logql::ast::LogQuery;
use crate::logql::ast::RangeAggregation;
use crate::logql::ast::RangeFn;
use crate::logql::ast::StrSelector;
use crate::logql::ast::VectorAggregation;
use crate::logql::ast::VectorOp;
use crate::logql::planner::fingerprints;
use crate::logql::planner::DetectLabelsPlanner;
use crate::logql::planner::LabelNamesPlanner;
use crate::logql::planner::LabelValuesPlanner;
use crate::logql::planner::PatternsPlanner;
use crate::logql::planner::SeriesPlanner;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::residual::drain;
use crate::residual::Processor;
use crate::Error;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use slog::trace;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Rows read for a volume request.
const VOLUME_LIMIT: i64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DetectedLabel {
    pub label: String,
    pub cardinality: i64,
}

/// A log pattern with its number of lines per step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Pattern {
    pub pattern: String,
    /// `[timestamp_s, count]` pairs.
    pub samples: Vec<[i64; 2]>,
}

/// The bytes of log lines of a group of streams.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VolumeSeries {
    pub metric: Labels,
    /// `(timestamp_s, value)`, the value formatted like sample values.
    pub value: (i64, String),
}

fn fp_planner(selector: Option<&StrSelector>) -> Option<BoxPlanner> {
    selector.map(|s| -> BoxPlanner { Box::new(fingerprints(s, None)) })
}

async fn run(
    ctx: &PlannerContext,
    planner: &dyn Planner,
) -> Result<Vec<Row>, Error> {
    fetch(ctx, ctx.render(&planner.process(ctx)?)?).await
}

// Read through a statement whose CTEs are inlined in cluster mode.
async fn run_inlined(
    ctx: &PlannerContext,
    planner: &dyn Planner,
) -> Result<Vec<Row>, Error> {
    fetch(ctx, ctx.render_inlined(&planner.process(ctx)?)?).await
}

async fn fetch(ctx: &PlannerContext, sql: String) -> Result<Vec<Row>, Error> {
    trace!(ctx.log, "reading metadata"; "sql" => &sql);
    query_all(ctx.db.as_ref(), &ctx.cancel, sql).await
}

fn strings(rows: &[Row], column: &str) -> Result<Vec<String>, Error> {
    rows.iter().map(|r| Ok(r.str(column)?.to_string())).collect()
}

/// Join pattern tokens, collapsing runs of the `<_>` placeholder.
pub fn assemble_pattern<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    let mut prev = None;
    for token in tokens.iter().map(AsRef::as_ref) {
        if token == "<_>" && prev == Some("<_>") {
            continue;
        }
        out.push_str(token);
        prev = Some(token);
    }
    out
}

fn pattern_samples(value: &[Value]) -> Vec<[i64; 2]> {
    value
        .iter()
        .filter_map(|pair| {
            let int = |v: &Value| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            match pair {
                Value::Array(a) if a.len() == 2 => {
                    Some([int(&a[0])?, int(&a[1])?])
                }
                Value::Object(o) => {
                    Some([int(o.get("timestamp_s")?)?, int(o.get("count")?)?])
                }
                _ => None,
            }
        })
        .collect()
}

impl Executor {
    /// The distinct label sets of the streams matched by any of
    /// `selectors`.
    pub async fn series(
        &self,
        selectors: &[StrSelector],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Labels>, Error> {
        let ctx = self.context(from, to, Duration::ZERO).with_limit(limit);
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for selector in selectors {
            let planner = SeriesPlanner {
                fingerprints: Box::new(fingerprints(selector, None)),
            };
            for row in run(&ctx, &planner).await? {
                let labels = row.labels("labels")?;
                if seen.insert(labels.clone()) {
                    out.push(labels);
                }
            }
        }
        Ok(out)
    }

    /// The names of the labels of the matched streams, or of all streams.
    pub async fn labels(
        &self,
        selector: Option<&StrSelector>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>, Error> {
        let ctx = self.context(from, to, Duration::ZERO);
        let planner =
            LabelNamesPlanner { fingerprints: fp_planner(selector) };
        let mut names = strings(&run(&ctx, &planner).await?, "key")?;
        names.sort();
        Ok(names)
    }

    /// The values of the label `key`.
    pub async fn label_values(
        &self,
        key: &str,
        selector: Option<&StrSelector>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ctx = self.context(from, to, Duration::ZERO).with_limit(limit);
        let planner = LabelValuesPlanner {
            fingerprints: fp_planner(selector),
            key: key.to_string(),
        };
        let mut values = strings(&run(&ctx, &planner).await?, "val")?;
        values.sort();
        Ok(values)
    }

    /// Every label with the number of its distinct values.
    pub async fn detected_labels(
        &self,
        selector: Option<&StrSelector>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DetectedLabel>, Error> {
        let ctx = self.context(from, to, Duration::ZERO);
        let planner =
            DetectLabelsPlanner { fingerprints: fp_planner(selector) };
        run_inlined(&ctx, &planner)
            .await?
            .iter()
            .map(|row| {
                Ok(DetectedLabel {
                    label: row.str("key")?.to_string(),
                    cardinality: row.i64("cardinality")?,
                })
            })
            .collect()
    }

    /// The most frequent log patterns of the matched streams.
    pub async fn patterns(
        &self,
        selector: &StrSelector,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        limit: i64,
    ) -> Result<Vec<Pattern>, Error> {
        let ctx = self.context(from, to, step).with_limit(limit);
        let planner = PatternsPlanner {
            fingerprints: Box::new(fingerprints(selector, None)),
        };
        run_inlined(&ctx, &planner)
            .await?
            .iter()
            .map(|row| {
                let tokens = row
                    .array("tokens")?
                    .iter()
                    .map(|t| t.as_str().unwrap_or_default())
                    .collect::<Vec<_>>();
                Ok(Pattern {
                    pattern: assemble_pattern(&tokens),
                    samples: pattern_samples(row.array("samples")?),
                })
            })
            .collect()
    }

    /// The bytes of log lines in the time range, summed by `by`, or by the
    /// labels the selector matches on when `by` is empty.
    pub async fn volume(
        &self,
        selector: &StrSelector,
        by: Vec<String>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<VolumeSeries>, Error> {
        let by = if by.is_empty() {
            selector.matchers.iter().map(|m| m.name.clone()).collect()
        } else {
            by
        };
        let query = LogQuery::Vector(VectorAggregation {
            op: VectorOp::Sum,
            grouping: Some(Grouping::By(by)),
            inner: RangeAggregation {
                func: RangeFn::BytesOverTime,
                selector: selector.clone(),
                range: step,
                offset: None,
                grouping: None,
                comparison: None,
            },
            comparison: None,
        });
        let processor = logql::plan(&query, &self.factory)?;
        let ctx = self
            .context(from, to, step)
            .with_limit(VOLUME_LIMIT)
            .with_order_asc(true);
        let (entries, err) = drain(processor.process(&Arc::new(ctx))?).await;
        if let Some(msg) = err {
            return Err(Error::Pipeline(msg));
        }
        let mut groups: IndexMap<u64, (Labels, f64)> = IndexMap::new();
        for entry in entries.into_iter().filter(|e| e.err.is_none()) {
            let group = groups
                .entry(entry.fingerprint)
                .or_insert_with(|| (entry.labels.clone(), 0.0));
            group.1 += entry.value;
        }
        let ts = to.timestamp();
        Ok(groups
            .into_values()
            .map(|(metric, total)| VolumeSeries {
                metric,
                value: (ts, crate::output::format_value(total)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::api_selector;
    use super::super::tests::executor;
    use super::*;
    use crate::test_util::cluster_config;
    use crate::test_util::row;
    use crate::test_util::test_logger;
    use crate::test_util::MemoryDb;
    use chrono::TimeZone;
    use serde_json::json;

    fn hour() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_assemble_pattern() {
        let tokens = ["GET ", "<_>", "<_>", " 200 ", "<_>"];
        assert_eq!(assemble_pattern(&tokens), "GET <_> 200 <_>");
        assert_eq!(assemble_pattern::<&str>(&[]), "");
    }

    #[tokio::test]
    async fn test_series_are_deduplicated() {
        let db = Arc::new(MemoryDb::new().respond(
            "SELECT DISTINCT labels",
            vec![row(&[("labels", json!(r#"{"app":"api"}"#))])],
        ));
        let (from, to) = hour();
        let selectors = [api_selector(), api_selector()];
        let series = executor(db.clone())
            .series(&selectors, from, to, 0)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0]["app"], "api");
        assert_eq!(db.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_labels_and_values() {
        let db = Arc::new(
            MemoryDb::new()
                .respond(
                    "SELECT DISTINCT key",
                    vec![
                        row(&[("key", json!("job"))]),
                        row(&[("key", json!("app"))]),
                    ],
                )
                .respond(
                    "SELECT DISTINCT val",
                    vec![row(&[("val", json!("api"))])],
                ),
        );
        let (from, to) = hour();
        let exec = executor(db.clone());
        let names = exec.labels(None, from, to).await.unwrap();
        assert_eq!(names, vec!["app", "job"]);
        let values = exec
            .label_values("app", Some(&api_selector()), from, to, 10)
            .await
            .unwrap();
        assert_eq!(values, vec!["api"]);
        assert!(db.queries()[1].contains("fingerprint IN fp_sel"));
    }

    #[tokio::test]
    async fn test_detected_labels() {
        let db = Arc::new(MemoryDb::new().respond(
            "cardinality",
            vec![row(&[("key", json!("app")), ("cardinality", json!("3"))])],
        ));
        let (from, to) = hour();
        let out = executor(db).detected_labels(None, from, to).await.unwrap();
        assert_eq!(
            out,
            vec![DetectedLabel { label: "app".into(), cardinality: 3 }]
        );
    }

    #[tokio::test]
    async fn test_patterns() {
        let db = Arc::new(MemoryDb::new().respond(
            "pregroup",
            vec![row(&[
                ("tokens", json!(["GET ", "<_>", "<_>", " ok"])),
                ("samples", json!([[1704067200, 3], [1704067215, "2"]])),
            ])],
        ));
        let (from, to) = hour();
        let out = executor(db)
            .patterns(&api_selector(), from, to, Duration::from_secs(15), 10)
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![Pattern {
                pattern: "GET <_> ok".into(),
                samples: vec![[1704067200, 3], [1704067215, 2]],
            }]
        );
    }

    #[tokio::test]
    async fn test_cluster_metadata_inlines_ctes() {
        let db = Arc::new(
            MemoryDb::new()
                .respond(
                    "cardinality",
                    vec![row(&[
                        ("key", json!("app")),
                        ("cardinality", json!(1)),
                    ])],
                )
                .respond(
                    "_iteration_id",
                    vec![row(&[
                        ("tokens", json!(["a ", "<_>"])),
                        ("samples", json!([[1704067200, 2]])),
                    ])],
                ),
        );
        let exec = Executor::new(cluster_config(), db.clone(), &test_logger());
        let (from, to) = hour();
        let selector = api_selector();
        let labels =
            exec.detected_labels(Some(&selector), from, to).await.unwrap();
        assert_eq!(labels.len(), 1);
        let patterns = exec
            .patterns(&selector, from, to, Duration::from_secs(15), 10)
            .await
            .unwrap();
        assert_eq!(patterns[0].pattern, "a <_>");

        let queries = db.queries();
        assert_eq!(queries.len(), 2);
        let gin = "IN (SELECT fingerprint FROM `qryn`.time_series_gin_dist";
        for sql in queries.iter() {
            assert!(!sql.starts_with("WITH"), "{sql}");
            assert!(sql.contains(gin), "{sql}");
        }
        assert!(!queries[0].contains("IN fp"), "{}", queries[0]);
        assert!(
            queries[1].contains("FROM (SELECT pattern_id"),
            "{}",
            queries[1]
        );
        assert!(!queries[1].contains("pregroup"), "{}", queries[1]);
    }

    #[tokio::test]
    async fn test_volume() {
        let labels = json!({"app": "api"});
        let db = Arc::new(MemoryDb::new().respond(
            "SELECT",
            vec![
                row(&[
                    ("fingerprint", json!(5)),
                    ("timestamp_ns", json!(1)),
                    ("labels", labels.clone()),
                    ("value", json!(100)),
                ]),
                row(&[
                    ("fingerprint", json!(5)),
                    ("timestamp_ns", json!(2)),
                    ("labels", labels),
                    ("value", json!(20.5)),
                ]),
            ],
        ));
        let (from, to) = hour();
        let out = executor(db.clone())
            .volume(&api_selector(), vec![], from, to, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metric["app"], "api");
        assert_eq!(out[0].value, (1704070800, String::from("120.5")));
        let sql = &db.queries()[0];
        assert!(sql.contains("toFloat64(sum(length("), "{sql}");
    }
}
