// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The residual pipeline: stages of a query the database cannot run.
//!
//! A pipeline is a chain of tasks connected by bounded channels. The leaf
//! task reads rows from the database, and every other task transforms the
//! batches of the task below it. A slow consumer throttles the whole chain
//! through the channel bounds.
//!
//! Every task ends its output with exactly one marker entry: either
//! [`EntryError::EndOfStream`] or a single [`EntryError::Fatal`] fault.

// Copyright 2024 Oxide Computer Company

mod aggregate;
mod logfmt;
mod matrix;
mod stages;

use crate::client::Row;
use crate::context::PlannerContext;
use crate::entry::EntryError;
use crate::entry::Labels;
use crate::entry::LogEntry;
use crate::logql::ast::Comparison;
use crate::logql::ast::DropParam;
use crate::logql::ast::Grouping;
use crate::logql::ast::LabelFilter;
use crate::logql::ast::LabelFormatOp;
use crate::logql::ast::LineFilter;
use crate::logql::ast::Parser;
use crate::logql::ast::RangeFn;
use crate::logql::ast::VectorOp;
use crate::planner::BoxPlanner;
use crate::Error;
use futures::FutureExt;
use slog::debug;
use slog::error;
use slog::o;
use slog::trace;
use slog::Logger;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Entries travel between stages in batches.
pub type Batch = Vec<LogEntry>;

/// Rows read from the database per batch.
pub const BATCH_SIZE: usize = 1000;

/// Something producing a stream of entry batches for a request.
pub trait Processor: Send + Sync + fmt::Debug {
    /// Return true if the output is a matrix of samples rather than log
    /// lines.
    fn is_matrix(&self) -> bool;

    /// Start the pipeline and return the channel its batches arrive on.
    ///
    /// Planning errors are returned here, before any task is spawned. Must
    /// be called from within a tokio runtime.
    fn process(
        &self,
        ctx: &Arc<PlannerContext>,
    ) -> Result<mpsc::Receiver<Batch>, Error>;
}

/// A single stage of the residual pipeline, fed one entry at a time.
///
/// Entries carrying a row error and marker entries never reach a transform;
/// the driver forwards them.
pub(crate) trait Transform: Send {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error>;

    /// Called once after the last entry.
    fn finish(&mut self, _out: &mut Batch) -> Result<(), Error> {
        Ok(())
    }

    /// Return true once the stage needs no more input.
    fn done(&self) -> bool {
        false
    }
}

/// Read the rows selected by a planner into entries.
#[derive(Debug)]
pub struct ClickhouseGetter {
    pub planner: BoxPlanner,
    pub matrix: bool,
}

impl Processor for ClickhouseGetter {
    fn is_matrix(&self) -> bool {
        self.matrix
    }

    fn process(
        &self,
        ctx: &Arc<PlannerContext>,
    ) -> Result<mpsc::Receiver<Batch>, Error> {
        let sql = ctx.render(&self.planner.process(ctx)?)?;
        let (tx, rx) = mpsc::channel(ctx.channel_capacity.max(1));
        let log = ctx.log.new(o!("component" => "clickhouse-getter"));
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(read_rows(&ctx, &log, sql, &tx))
                .catch_unwind()
                .await;
            if let Some(msg) = fault_message(run) {
                error!(log, "reading rows failed"; "error" => &msg);
                let _ = tx.send(vec![LogEntry::fatal(msg)]).await;
            }
        });
        Ok(rx)
    }
}

async fn read_rows(
    ctx: &PlannerContext,
    log: &Logger,
    sql: String,
    tx: &mpsc::Sender<Batch>,
) -> Result<(), Error> {
    trace!(log, "reading rows"; "sql" => &sql);
    let mut rows = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        rows = ctx.db.query(sql) => rows?,
    };
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut count = 0usize;
    loop {
        let row = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            row = rows.next_row() => row?,
        };
        let Some(row) = row else {
            break;
        };
        count += 1;
        batch.push(entry_from_row(&row).unwrap_or_else(|e| LogEntry {
            err: Some(EntryError::Row(e.to_string())),
            ..Default::default()
        }));
        if batch.len() >= BATCH_SIZE {
            let full = std::mem::replace(
                &mut batch,
                Vec::with_capacity(BATCH_SIZE),
            );
            if !send(&ctx.cancel, tx, full).await? {
                return Ok(());
            }
        }
    }
    debug!(log, "read all rows"; "rows" => count);
    batch.push(LogEntry::end_of_stream());
    send(&ctx.cancel, tx, batch).await?;
    Ok(())
}

/// Convert a result row into an entry. `labels`, `string` and `value` are
/// optional.
pub(crate) fn entry_from_row(row: &Row) -> Result<LogEntry, Error> {
    let labels = match row.get("labels") {
        Some(_) => row.labels("labels")?,
        None => Labels::new(),
    };
    let message = match row.get("string") {
        Some(_) => row.str("string")?.to_string(),
        None => String::new(),
    };
    let value = match row.get("value") {
        Some(_) => row.f64("value")?,
        None => 0.0,
    };
    Ok(LogEntry {
        fingerprint: row.u64("fingerprint")?,
        timestamp_ns: row.i64("timestamp_ns")?,
        message,
        labels,
        value,
        err: None,
    })
}

// Send a batch downstream. Returns false if the consumer has gone away.
async fn send(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Batch>,
    batch: Batch,
) -> Result<bool, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        sent = tx.send(batch) => Ok(sent.is_ok()),
    }
}

fn fault_message(
    run: Result<Result<(), Error>, Box<dyn Any + Send>>,
) -> Option<String> {
    match run {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(
            panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .map(|s| format!("stage panicked: {s}"))
                .unwrap_or_else(|| String::from("stage panicked")),
        ),
    }
}

/// Run a transform over an input channel in its own task.
///
/// Any error or panic inside the transform ends the task after one
/// [`EntryError::Fatal`] entry. A fatal entry arriving from upstream is
/// forwarded as is.
pub(crate) fn spawn_stage(
    ctx: &PlannerContext,
    name: &'static str,
    input: mpsc::Receiver<Batch>,
    stage: Box<dyn Transform>,
) -> mpsc::Receiver<Batch> {
    let (tx, rx) = mpsc::channel(ctx.channel_capacity.max(1));
    let log = ctx.log.new(o!("component" => "residual-stage", "stage" => name));
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        let mut input = input;
        let mut stage = stage;
        let run = AssertUnwindSafe(run_stage(
            &cancel,
            &mut input,
            &tx,
            stage.as_mut(),
        ))
        .catch_unwind()
        .await;
        if let Some(msg) = fault_message(run) {
            error!(log, "residual stage failed"; "error" => &msg);
            let _ = tx.send(vec![LogEntry::fatal(msg)]).await;
        }
    });
    rx
}

async fn run_stage(
    cancel: &CancellationToken,
    input: &mut mpsc::Receiver<Batch>,
    tx: &mpsc::Sender<Batch>,
    stage: &mut dyn Transform,
) -> Result<(), Error> {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            batch = input.recv() => batch,
        };
        let Some(batch) = batch else {
            return Err(Error::planning("upstream ended without a marker"));
        };
        let mut out = Vec::with_capacity(batch.len());
        let mut end = false;
        for entry in batch {
            match entry.err {
                Some(EntryError::EndOfStream) => {
                    end = true;
                    break;
                }
                Some(EntryError::Fatal(_)) => {
                    out.push(entry);
                    send(cancel, tx, out).await?;
                    return Ok(());
                }
                Some(EntryError::Row(_)) => out.push(entry),
                None => stage.entry(entry, &mut out)?,
            }
            if stage.done() {
                end = true;
                break;
            }
        }
        if end {
            stage.finish(&mut out)?;
            out.push(LogEntry::end_of_stream());
            send(cancel, tx, out).await?;
            return Ok(());
        }
        if !out.is_empty() && !send(cancel, tx, out).await? {
            return Ok(());
        }
    }
}

/// A residual stage of a log query.
#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    LineFilter(LineFilter),
    LabelFilter(LabelFilter),
    Parser(Parser),
    LineFormat(String),
    LabelFormat(Vec<LabelFormatOp>),
    Drop(Vec<DropParam>),
    Unwrap(String),
    /// Stop after the request limit of log lines.
    Limit,
    RangeAggregation {
        func: RangeFn,
        range: Duration,
        grouping: Option<Grouping>,
        /// The labels of the series reported by `absent_over_time`.
        absent_labels: Labels,
    },
    VectorAggregation {
        op: VectorOp,
        grouping: Option<Grouping>,
    },
    Comparison(Comparison),
    /// Drop samples with a zero value.
    ZeroEater,
    /// Align samples to the steps of the request.
    FixPeriod {
        duration: Duration,
    },
}

impl StageKind {
    fn name(&self) -> &'static str {
        match self {
            StageKind::LineFilter(_) => "line_filter",
            StageKind::LabelFilter(_) => "label_filter",
            StageKind::Parser(_) => "parser",
            StageKind::LineFormat(_) => "line_format",
            StageKind::LabelFormat(_) => "label_format",
            StageKind::Drop(_) => "drop",
            StageKind::Unwrap(_) => "unwrap",
            StageKind::Limit => "limit",
            StageKind::RangeAggregation { .. } => "range_aggregation",
            StageKind::VectorAggregation { .. } => "vector_aggregation",
            StageKind::Comparison(_) => "comparison",
            StageKind::ZeroEater => "zero_eater",
            StageKind::FixPeriod { .. } => "fix_period",
        }
    }

    /// Whether the stage turns its input into a matrix. `None` keeps the
    /// shape of the input.
    fn is_matrix(&self) -> Option<bool> {
        match self {
            StageKind::RangeAggregation { .. }
            | StageKind::VectorAggregation { .. }
            | StageKind::ZeroEater
            | StageKind::FixPeriod { .. } => Some(true),
            _ => None,
        }
    }

    fn build(&self, ctx: &PlannerContext) -> Result<Box<dyn Transform>, Error> {
        Ok(match self {
            StageKind::LineFilter(f) => {
                Box::new(stages::LineFilterStage::new(f)?)
            }
            StageKind::LabelFilter(f) => {
                Box::new(stages::LabelFilterStage(f.clone()))
            }
            StageKind::Parser(p) => Box::new(stages::ParserStage::new(p)?),
            StageKind::LineFormat(t) => {
                Box::new(stages::LineFormatStage::new(t)?)
            }
            StageKind::LabelFormat(ops) => {
                Box::new(stages::LabelFormatStage::new(ops)?)
            }
            StageKind::Drop(params) => {
                Box::new(stages::DropStage(params.clone()))
            }
            StageKind::Unwrap(label) => {
                Box::new(stages::UnwrapStage(label.clone()))
            }
            StageKind::Limit => Box::new(stages::LimitStage::new(ctx.limit)),
            StageKind::RangeAggregation {
                func,
                range,
                grouping,
                absent_labels,
            } => Box::new(aggregate::RangeAggregator::new(
                ctx,
                *func,
                *range,
                grouping.clone(),
                absent_labels.clone(),
            )?),
            StageKind::VectorAggregation { op, grouping } => Box::new(
                aggregate::VectorAggregator::new(*op, grouping.clone()),
            ),
            StageKind::Comparison(c) => {
                Box::new(aggregate::ComparisonStage(*c))
            }
            StageKind::ZeroEater => Box::new(matrix::ZeroEater),
            StageKind::FixPeriod { duration } => {
                Box::new(matrix::FixPeriod::new(ctx, *duration))
            }
        })
    }
}

/// The root of a residual chain: a database read followed by stages.
#[derive(Debug)]
pub enum RequestProcessor {
    Source(ClickhouseGetter),
    Stage { main: Box<RequestProcessor>, stage: StageKind },
}

impl RequestProcessor {
    pub fn source(planner: BoxPlanner, matrix: bool) -> Self {
        RequestProcessor::Source(ClickhouseGetter { planner, matrix })
    }

    /// Append a stage to the chain.
    pub fn then(self, stage: StageKind) -> Self {
        RequestProcessor::Stage { main: Box::new(self), stage }
    }

    /// The database read at the root of the chain.
    pub fn getter(&self) -> &ClickhouseGetter {
        match self {
            RequestProcessor::Source(getter) => getter,
            RequestProcessor::Stage { main, .. } => main.getter(),
        }
    }

    /// The stages of the chain, from the source outwards.
    pub fn stages(&self) -> Vec<&StageKind> {
        match self {
            RequestProcessor::Source(_) => vec![],
            RequestProcessor::Stage { main, stage } => {
                let mut out = main.stages();
                out.push(stage);
                out
            }
        }
    }
}

impl Processor for RequestProcessor {
    fn is_matrix(&self) -> bool {
        match self {
            RequestProcessor::Source(getter) => getter.is_matrix(),
            RequestProcessor::Stage { main, stage } => {
                stage.is_matrix().unwrap_or_else(|| main.is_matrix())
            }
        }
    }

    fn process(
        &self,
        ctx: &Arc<PlannerContext>,
    ) -> Result<mpsc::Receiver<Batch>, Error> {
        match self {
            RequestProcessor::Source(getter) => getter.process(ctx),
            RequestProcessor::Stage { main, stage } => {
                let transform = stage.build(ctx)?;
                let input = main.process(ctx)?;
                Ok(spawn_stage(ctx, stage.name(), input, transform))
            }
        }
    }
}

/// Read every entry of a pipeline until its marker. Returns the entries and
/// the fatal error, if the pipeline failed.
pub async fn drain(
    mut rx: mpsc::Receiver<Batch>,
) -> (Vec<LogEntry>, Option<String>) {
    let mut out = Vec::new();
    while let Some(batch) = rx.recv().await {
        for entry in batch {
            match entry.err {
                Some(EntryError::EndOfStream) => return (out, None),
                Some(EntryError::Fatal(msg)) => return (out, Some(msg)),
                _ => out.push(entry),
            }
        }
    }
    (out, Some(String::from("pipeline ended without a marker")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entry::fingerprint;
    use crate::logql::ast::LineFilterOp;
    use crate::planner::tests::fixed;
    use crate::test_util::row;
    use crate::test_util::test_config;
    use crate::test_util::test_context_with;
    use crate::test_util::MemoryDb;
    use serde_json::json;

    pub(crate) fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    pub(crate) fn line(ts: i64, labels: Labels, message: &str) -> LogEntry {
        LogEntry {
            fingerprint: fingerprint(&labels),
            timestamp_ns: ts,
            message: message.to_string(),
            labels,
            value: 0.0,
            err: None,
        }
    }

    pub(crate) fn sample(ts: i64, labels: Labels, value: f64) -> LogEntry {
        LogEntry { value, ..line(ts, labels, "") }
    }

    /// Run entries through a single transform.
    pub(crate) fn run(
        stage: &mut dyn Transform,
        entries: Vec<LogEntry>,
    ) -> Vec<LogEntry> {
        let mut out = vec![];
        for entry in entries {
            stage.entry(entry, &mut out).unwrap();
        }
        stage.finish(&mut out).unwrap();
        out
    }

    #[derive(Debug)]
    struct Panics;

    impl Transform for Panics {
        fn entry(&mut self, _: LogEntry, _: &mut Batch) -> Result<(), Error> {
            panic!("bad entry");
        }
    }

    fn rows_db() -> Arc<MemoryDb> {
        Arc::new(MemoryDb::new().respond(
            "FROM rows",
            vec![
                row(&[
                    ("fingerprint", json!(1)),
                    ("timestamp_ns", json!(10)),
                    ("labels", json!({"app": "api"})),
                    ("string", json!("error here")),
                ]),
                row(&[
                    ("fingerprint", json!(1)),
                    ("timestamp_ns", json!(20)),
                    ("labels", json!({"app": "api"})),
                    ("string", json!("all good")),
                ]),
                row(&[
                    ("fingerprint", json!("x")),
                    ("timestamp_ns", json!(30)),
                ]),
            ],
        ))
    }

    #[tokio::test]
    async fn test_getter_and_stage() {
        let ctx = Arc::new(test_context_with(rows_db(), &test_config()));
        let p = RequestProcessor::source(fixed("rows"), false).then(
            StageKind::LineFilter(LineFilter {
                op: LineFilterOp::Contains,
                value: "error".into(),
            }),
        );
        assert!(!p.is_matrix());
        let (entries, err) = drain(p.process(&ctx).unwrap()).await;
        assert_eq!(err, None);
        // The bad row travels as a row error.
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "error here");
        assert_eq!(entries[0].labels, labels(&[("app", "api")]));
        assert!(matches!(entries[1].err, Some(EntryError::Row(_))));
    }

    #[tokio::test]
    async fn test_database_failure_is_fatal() {
        let db = Arc::new(
            MemoryDb::new().fail("FROM rows", Error::Database("boom".into())),
        );
        let ctx = Arc::new(test_context_with(db, &test_config()));
        let p = RequestProcessor::source(fixed("rows"), false)
            .then(StageKind::Unwrap("x".into()));
        let (entries, err) = drain(p.process(&ctx).unwrap()).await;
        assert!(entries.is_empty());
        assert!(err.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal_entry() {
        let ctx = test_context_with(rows_db(), &test_config());
        let ctx = Arc::new(ctx);
        let input = RequestProcessor::source(fixed("rows"), false)
            .process(&ctx)
            .unwrap();
        let rx = spawn_stage(&ctx, "panics", input, Box::new(Panics));
        let (entries, err) = drain(rx).await;
        assert!(entries.is_empty());
        assert_eq!(err.unwrap(), "stage panicked: bad entry");
    }

    #[tokio::test]
    async fn test_cancellation_ends_the_pipeline() {
        let ctx = Arc::new(test_context_with(rows_db(), &test_config()));
        ctx.cancel.cancel();
        let p = RequestProcessor::source(fixed("rows"), false)
            .then(StageKind::Limit);
        let (_, err) = drain(p.process(&ctx).unwrap()).await;
        assert_eq!(err.unwrap(), Error::Cancelled.to_string());
    }

    #[tokio::test]
    async fn test_limit_stops_early() {
        let ctx = test_context_with(rows_db(), &test_config()).with_limit(1);
        let ctx = Arc::new(ctx);
        let p = RequestProcessor::source(fixed("rows"), false)
            .then(StageKind::Limit);
        let (entries, err) = drain(p.process(&ctx).unwrap()).await;
        assert_eq!(err, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp_ns, 10);
    }

    #[test]
    fn test_is_matrix() {
        let p = RequestProcessor::source(fixed("rows"), false)
            .then(StageKind::Unwrap("x".into()))
            .then(StageKind::RangeAggregation {
                func: RangeFn::Rate,
                range: Duration::from_secs(60),
                grouping: None,
                absent_labels: Labels::new(),
            })
            .then(StageKind::Comparison(Comparison {
                op: crate::logql::ast::Comparator::Gt,
                value: 1.0,
            }));
        assert!(p.is_matrix());
        assert_eq!(p.stages().len(), 3);
    }

    #[test]
    fn test_planning_errors_are_returned_early() {
        let ctx = Arc::new(test_context_with(rows_db(), &test_config()));
        let p = RequestProcessor::source(fixed("rows"), false).then(
            StageKind::Parser(Parser::Regexp("(".into())),
        );
        assert!(matches!(p.process(&ctx), Err(Error::NotSupported(_))));
    }
}
