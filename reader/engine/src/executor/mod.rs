// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run queries and stream their results.
//!
//! The [`Executor`] owns the database handle and the configuration. Each
//! request gets its own [`PlannerContext`], tagged with a query ID in the
//! logs, and its own cancellation token. Log queries answer with a channel
//! of response chunks, see [`crate::output`]; every other request answers
//! with typed values.

// Copyright 2024 Oxide Computer Company

mod meta;
mod tail;

pub use meta::DetectedLabel;
pub use meta::Pattern;
pub use meta::VolumeSeries;
pub use tail::Watcher;

use crate::client::query_all;
use crate::client::Row;
use crate::config::Config;
use crate::context::PlannerContext;
use crate::entry::Labels;
use crate::logql;
use crate::logql::ast::LogQuery;
use crate::output;
use crate::output::ResultType;
use crate::planner::Planner;
use crate::planner::PlannerFactory;
use crate::promql;
use crate::promql::ast::LabelMatcher;
use crate::promql::ast::SelectHints;
use crate::promql::optimizer::Optimized;
use crate::promql::planner::MetadataPlanner;
use crate::residual::Processor;
use crate::traceql;
use crate::traceql::ast::TraceQuery;
use crate::traceql::TraceResult;
use crate::Database;
use crate::Error;
use bytes::Bytes;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The window an instant log query looks back over.
pub const INSTANT_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// Parameters of a range query.
#[derive(Clone, Copy, Debug)]
pub struct RangeParams {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub step: Duration,
    /// Zero means no limit.
    pub limit: i64,
    /// Return log lines oldest first.
    pub forward: bool,
}

/// A series read by a PromQL selector.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PromSeries {
    pub labels: Labels,
    /// `(timestamp_ms, value)` pairs, in time order.
    pub samples: Vec<(i64, f64)>,
}

/// The metadata of a metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricMetadata {
    pub metric_name: String,
    pub metadata: serde_json::Value,
}

#[derive(Clone)]
pub struct Executor {
    config: Config,
    db: Arc<dyn Database>,
    factory: PlannerFactory,
    log: Logger,
}

impl Executor {
    pub fn new(config: Config, db: Arc<dyn Database>, log: &Logger) -> Self {
        Self {
            config,
            db,
            factory: PlannerFactory::default(),
            log: log.new(o!("component" => "executor")),
        }
    }

    /// Use alternate planners for the raw tables.
    pub fn with_factory(mut self, factory: PlannerFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn context(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
    ) -> PlannerContext {
        let query_id = Uuid::new_v4();
        let log = self.log.new(o!("query_id" => query_id.to_string()));
        PlannerContext::new(&self.config, self.db.clone(), &log, from, to, step)
    }

    // Start the pipeline of `processor` and encode its output in a task of
    // its own. Dropping the returned receiver cancels the request.
    fn respond(
        &self,
        ctx: PlannerContext,
        processor: &dyn Processor,
        result_type: ResultType,
    ) -> Result<mpsc::Receiver<Bytes>, Error> {
        let ctx = Arc::new(ctx);
        let rx = processor.process(&ctx)?;
        let (tx, body) = mpsc::channel(ctx.channel_capacity.max(1));
        tokio::spawn(async move {
            let res =
                output::write_response(rx, tx, result_type, &ctx.log).await;
            match res {
                Ok(()) => debug!(ctx.log, "query complete"),
                Err(Error::Cancelled) => {
                    debug!(ctx.log, "query cancelled")
                }
                Err(e) => {
                    warn!(ctx.log, "query failed"; "error" => %e)
                }
            }
            // Stop any stage still running.
            ctx.cancel.cancel();
        });
        Ok(body)
    }

    /// Run a log query over a time range.
    ///
    /// Planning errors are returned before anything runs. Must be called
    /// from within a tokio runtime.
    pub fn query_range(
        &self,
        query: &LogQuery,
        params: &RangeParams,
    ) -> Result<mpsc::Receiver<Bytes>, Error> {
        let processor = logql::plan(query, &self.factory)?;
        let ctx = self
            .context(params.from, params.to, params.step)
            .with_limit(params.limit)
            .with_order_asc(params.forward);
        debug!(
            ctx.log,
            "range query";
            "query" => ?query,
            "stages" => processor.stages().len(),
        );
        let result_type = ResultType::range(processor.is_matrix());
        self.respond(ctx, &processor, result_type)
    }

    /// Run a log query at an instant. Metric queries answer with the last
    /// sample of every series in the preceding [`INSTANT_LOOKBACK`].
    pub fn query_instant(
        &self,
        query: &LogQuery,
        time: DateTime<Utc>,
        step: Duration,
        limit: i64,
    ) -> Result<mpsc::Receiver<Bytes>, Error> {
        let processor = logql::plan(query, &self.factory)?;
        let from = time - to_delta(INSTANT_LOOKBACK);
        let ctx = self.context(from, time, step).with_limit(limit);
        debug!(ctx.log, "instant query"; "query" => ?query);
        let result_type = ResultType::instant(processor.is_matrix());
        self.respond(ctx, &processor, result_type)
    }

    fn prom_context(&self, hints: &SelectHints) -> PlannerContext {
        let step = Duration::from_millis(hints.step.max(0) as u64);
        self.context(millis(hints.start), millis(hints.end), step)
    }

    /// Read the series matching `matchers`, reduced according to `hints`.
    pub async fn prom_select(
        &self,
        hints: SelectHints,
        matchers: Vec<LabelMatcher>,
        downsample: bool,
    ) -> Result<Vec<PromSeries>, Error> {
        let ctx = self.prom_context(&hints);
        let planner =
            promql::plan_select(hints, matchers, downsample, &self.factory);
        let sql = ctx.render(&planner.process(&ctx)?)?;
        trace!(ctx.log, "selecting series"; "sql" => &sql);
        collect_series(&query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?)
    }

    /// Run the requests of the subtrees pushed down by
    /// [`promql::optimizer::optimize`], keyed by substitute metric name.
    pub async fn prom_substitutes(
        &self,
        optimized: &Optimized,
        hints: &SelectHints,
    ) -> Result<BTreeMap<String, Vec<PromSeries>>, Error> {
        let ctx = self.prom_context(hints);
        let mut out = BTreeMap::new();
        for (name, sub) in optimized.substitutes.iter() {
            let sql = ctx.render(&sub.request.process(&ctx)?)?;
            trace!(
                ctx.log,
                "running pushed down subtree";
                "name" => name,
                "sql" => &sql,
            );
            let rows = query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?;
            out.insert(name.clone(), collect_series(&rows)?);
        }
        Ok(out)
    }

    /// The latest metadata of every metric, or of `metric` only.
    pub async fn prom_metadata(
        &self,
        metric: Option<String>,
        limit: i64,
    ) -> Result<Vec<MetricMetadata>, Error> {
        let now = Utc::now();
        let ctx = self.context(now, now, Duration::ZERO).with_limit(limit);
        let sql = ctx.render(&MetadataPlanner { metric }.process(&ctx)?)?;
        trace!(ctx.log, "reading metric metadata"; "sql" => &sql);
        let rows = query_all(ctx.db.as_ref(), &ctx.cancel, sql).await?;
        rows.iter()
            .map(|row| {
                let json = row.str("metadata_json")?;
                let metadata = serde_json::from_str(json).map_err(|e| {
                    Error::Database(format!("invalid metric metadata: {e}"))
                })?;
                Ok(MetricMetadata {
                    metric_name: row.str("metric_name")?.to_string(),
                    metadata,
                })
            })
            .collect()
    }

    /// Search traces, or compute a metric over the matched spans.
    pub async fn trace_search(
        &self,
        query: &TraceQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        limit: i64,
    ) -> Result<TraceResult, Error> {
        let ctx = self.context(from, to, step).with_limit(limit);
        debug!(ctx.log, "trace search"; "query" => ?query);
        traceql::search(&ctx, query).await
    }

    /// The attribute names of the spans matched by `query`, or of every
    /// span in the time range.
    pub async fn trace_tag_names(
        &self,
        query: Option<&TraceQuery>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ctx = self.context(from, to, Duration::ZERO).with_limit(limit);
        let planner = traceql::plan_tag_names(query)?;
        traceql::run_tags(&ctx, &planner, "key").await
    }

    /// The values of the attribute `key`.
    pub async fn trace_tag_values(
        &self,
        key: &str,
        query: Option<&TraceQuery>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ctx = self.context(from, to, Duration::ZERO).with_limit(limit);
        let planner = traceql::plan_tag_values(query, key)?;
        traceql::run_tags(&ctx, &planner, "val").await
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ms.saturating_mul(1_000_000))
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Assemble the rows of a PromQL select into series.
///
/// Samples arrive as rows of `type` 1 and label sets as rows of `type` 2,
/// both ordered by fingerprint.
pub fn collect_series(rows: &[Row]) -> Result<Vec<PromSeries>, Error> {
    let mut series: IndexMap<u64, PromSeries> = IndexMap::new();
    for row in rows {
        let entry = series.entry(row.u64("fingerprint")?).or_default();
        match row.i64("type")? {
            1 => entry
                .samples
                .push((row.i64("timestamp_ms")?, row.f64("val")?)),
            2 => entry.labels = row.labels("labels")?,
            other => {
                return Err(Error::Database(format!(
                    "unexpected row type {other}"
                )))
            }
        }
    }
    // Series without samples carry no information.
    Ok(series.into_values().filter(|s| !s.samples.is_empty()).collect())
}
