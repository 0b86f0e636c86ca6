// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Residual aggregations of log lines and samples.

// Copyright 2024 Oxide Computer Company

use super::Batch;
use super::Transform;
use crate::context::PlannerContext;
use crate::entry::fingerprint;
use crate::entry::Labels;
use crate::entry::LogEntry;
use crate::logql::ast::Comparison;
use crate::logql::ast::Grouping;
use crate::logql::ast::RangeFn;
use crate::logql::ast::VectorOp;
use crate::Error;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

/// Running statistics of the values in a bucket.
#[derive(Clone, Debug, Default)]
struct Acc {
    count: u64,
    bytes: u64,
    sum: f64,
    min: f64,
    max: f64,
    first: (i64, f64),
    last: (i64, f64),
    // Welford's running mean and sum of squared deviations.
    mean: f64,
    m2: f64,
}

impl Acc {
    fn push(&mut self, ts: i64, value: f64, bytes: usize) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.first = (ts, value);
            self.last = (ts, value);
        }
        self.count += 1;
        self.bytes += bytes as u64;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if ts < self.first.0 {
            self.first = (ts, value);
        }
        if ts >= self.last.0 {
            self.last = (ts, value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }
}

#[derive(Debug, Default)]
struct Series {
    labels: Labels,
    buckets: BTreeMap<i64, Acc>,
}

// Accumulated series, ordered by fingerprint.
type SeriesMap = BTreeMap<u64, Series>;

fn emit(
    series: &mut SeriesMap,
    out: &mut Batch,
    value: impl Fn(&Acc) -> f64,
) {
    for (fp, s) in std::mem::take(series) {
        for (ts, acc) in s.buckets {
            out.push(LogEntry {
                fingerprint: fp,
                timestamp_ns: ts,
                labels: s.labels.clone(),
                value: value(&acc),
                ..Default::default()
            });
        }
    }
}

fn group(labels: &Labels, grouping: Option<&Grouping>) -> Labels {
    match grouping {
        Some(g) => g.apply(labels),
        None => labels.clone(),
    }
}

/// A range aggregation over log lines, bucketed by the range.
pub(crate) struct RangeAggregator {
    func: RangeFn,
    range_ns: i64,
    grouping: Option<Grouping>,
    series: SeriesMap,
    // `absent_over_time` only.
    absent_labels: Labels,
    seen: BTreeSet<i64>,
    from_ns: i64,
    to_ns: i64,
}

impl RangeAggregator {
    pub fn new(
        ctx: &PlannerContext,
        func: RangeFn,
        range: Duration,
        grouping: Option<Grouping>,
        absent_labels: Labels,
    ) -> Result<Self, Error> {
        let range_ns = i64::try_from(range.as_nanos())
            .ok()
            .filter(|r| *r > 0)
            .ok_or_else(|| Error::not_supported("invalid range"))?;
        Ok(Self {
            func,
            range_ns,
            grouping,
            series: SeriesMap::new(),
            absent_labels,
            seen: BTreeSet::new(),
            from_ns: ctx.from_ns(),
            to_ns: ctx.to_ns(),
        })
    }

    fn value(&self, acc: &Acc) -> f64 {
        let secs = self.range_ns as f64 / 1e9;
        match self.func {
            RangeFn::Rate => acc.count as f64 / secs,
            RangeFn::CountOverTime => acc.count as f64,
            RangeFn::BytesRate => acc.bytes as f64 / secs,
            RangeFn::BytesOverTime => acc.bytes as f64,
            RangeFn::SumOverTime => acc.sum,
            RangeFn::AvgOverTime => acc.sum / acc.count as f64,
            RangeFn::MinOverTime => acc.min,
            RangeFn::MaxOverTime => acc.max,
            RangeFn::FirstOverTime => acc.first.1,
            RangeFn::LastOverTime => acc.last.1,
            RangeFn::StddevOverTime => acc.variance().sqrt(),
            RangeFn::StdvarOverTime => acc.variance(),
            RangeFn::AbsentOverTime => 1.0,
        }
    }
}

impl Transform for RangeAggregator {
    fn entry(&mut self, entry: LogEntry, _: &mut Batch) -> Result<(), Error> {
        let bucket =
            entry.timestamp_ns.div_euclid(self.range_ns) * self.range_ns;
        if self.func == RangeFn::AbsentOverTime {
            self.seen.insert(bucket);
            return Ok(());
        }
        let labels = group(&entry.labels, self.grouping.as_ref());
        let fp = match self.grouping {
            Some(_) => fingerprint(&labels),
            None => entry.fingerprint,
        };
        let series = self
            .series
            .entry(fp)
            .or_insert_with(|| Series { labels, ..Default::default() });
        series.buckets.entry(bucket).or_default().push(
            entry.timestamp_ns,
            entry.value,
            entry.message.len(),
        );
        Ok(())
    }

    fn finish(&mut self, out: &mut Batch) -> Result<(), Error> {
        if self.func == RangeFn::AbsentOverTime {
            let fp = fingerprint(&self.absent_labels);
            let mut bucket =
                self.from_ns.div_euclid(self.range_ns) * self.range_ns;
            while bucket <= self.to_ns {
                if !self.seen.contains(&bucket) {
                    out.push(LogEntry {
                        fingerprint: fp,
                        timestamp_ns: bucket,
                        labels: self.absent_labels.clone(),
                        value: 1.0,
                        ..Default::default()
                    });
                }
                bucket += self.range_ns;
            }
            return Ok(());
        }
        let mut series = std::mem::take(&mut self.series);
        emit(&mut series, out, |acc| self.value(acc));
        Ok(())
    }
}

/// Aggregate samples across the series sharing the grouped labels.
pub(crate) struct VectorAggregator {
    op: VectorOp,
    grouping: Option<Grouping>,
    series: SeriesMap,
}

impl VectorAggregator {
    pub fn new(op: VectorOp, grouping: Option<Grouping>) -> Self {
        Self { op, grouping, series: SeriesMap::new() }
    }
}

impl Transform for VectorAggregator {
    fn entry(&mut self, entry: LogEntry, _: &mut Batch) -> Result<(), Error> {
        // Without a grouping everything folds into one series.
        let labels = match &self.grouping {
            Some(g) => g.apply(&entry.labels),
            None => Labels::new(),
        };
        let fp = fingerprint(&labels);
        self.series
            .entry(fp)
            .or_insert_with(|| Series { labels, ..Default::default() })
            .buckets
            .entry(entry.timestamp_ns)
            .or_default()
            .push(entry.timestamp_ns, entry.value, 0);
        Ok(())
    }

    fn finish(&mut self, out: &mut Batch) -> Result<(), Error> {
        let op = self.op;
        emit(&mut self.series, out, |acc| match op {
            VectorOp::Sum => acc.sum,
            VectorOp::Min => acc.min,
            VectorOp::Max => acc.max,
            VectorOp::Avg => acc.sum / acc.count as f64,
            VectorOp::Count => acc.count as f64,
            VectorOp::Stddev => acc.variance().sqrt(),
            VectorOp::Stdvar => acc.variance(),
        });
        Ok(())
    }
}

/// Keep the samples whose value satisfies a comparison.
pub(crate) struct ComparisonStage(pub Comparison);

impl Transform for ComparisonStage {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        if self.0.op.apply(entry.value, self.0.value) {
            out.push(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logql::ast::Comparator;
    use crate::residual::tests::labels;
    use crate::residual::tests::line;
    use crate::residual::tests::run;
    use crate::residual::tests::sample;
    use crate::test_util::test_context;

    const MIN: i64 = 60_000_000_000;

    fn lra(func: RangeFn, grouping: Option<Grouping>) -> RangeAggregator {
        RangeAggregator::new(
            &test_context(),
            func,
            Duration::from_secs(60),
            grouping,
            Labels::new(),
        )
        .unwrap()
    }

    fn lines() -> Vec<LogEntry> {
        let a = labels(&[("app", "api"), ("pod", "a")]);
        let b = labels(&[("app", "api"), ("pod", "b")]);
        vec![
            LogEntry { value: 1.0, ..line(5, a.clone(), "ab") },
            LogEntry { value: 3.0, ..line(MIN - 1, a.clone(), "abcd") },
            LogEntry { value: 5.0, ..line(MIN, a, "") },
            LogEntry { value: 7.0, ..line(10, b, "x") },
        ]
    }

    #[test]
    fn test_count_and_bytes() {
        let out = run(&mut lra(RangeFn::CountOverTime, None), lines());
        assert_eq!(out.len(), 3);
        let first: Vec<_> = out
            .iter()
            .filter(|e| e.labels.get("pod").map(String::as_str) == Some("a"))
            .map(|e| (e.timestamp_ns, e.value))
            .collect();
        assert_eq!(first, vec![(0, 2.0), (MIN, 1.0)]);

        let out = run(&mut lra(RangeFn::BytesRate, None), lines());
        let a = out.iter().find(|e| e.timestamp_ns == 0 && e.value > 0.05);
        assert_eq!(a.unwrap().value, 6.0 / 60.0);
    }

    #[test]
    fn test_unwrapped_functions() {
        let by_app = Some(Grouping::By(vec!["app".into()]));
        let cases = [
            (RangeFn::SumOverTime, 11.0),
            (RangeFn::AvgOverTime, 11.0 / 3.0),
            (RangeFn::MinOverTime, 1.0),
            (RangeFn::MaxOverTime, 7.0),
            (RangeFn::FirstOverTime, 1.0),
            (RangeFn::LastOverTime, 3.0),
        ];
        for (func, expected) in cases {
            let out = run(&mut lra(func, by_app.clone()), lines());
            assert_eq!(out[0].labels, labels(&[("app", "api")]));
            assert_eq!(out[0].timestamp_ns, 0);
            assert_eq!(out[0].value, expected, "{func:?}");
        }
        let out = run(&mut lra(RangeFn::StdvarOverTime, by_app), lines());
        // Values 1, 3, 7: mean 11/3.
        let mean = 11.0 / 3.0;
        let var = [1.0, 3.0, 7.0]
            .iter()
            .map(|v: &f64| (v - mean).powi(2))
            .sum::<f64>()
            / 3.0;
        assert!((out[0].value - var).abs() < 1e-9);
    }

    #[test]
    fn test_absent_over_time() {
        let ctx = test_context();
        let mut p = RangeAggregator::new(
            &ctx,
            RangeFn::AbsentOverTime,
            Duration::from_secs(1800),
            None,
            labels(&[("app", "api")]),
        )
        .unwrap();
        let from = ctx.from_ns();
        let out = run(&mut p, vec![line(from + 10, labels(&[("x", "y")]), "")]);
        let ts: Vec<_> = out.iter().map(|e| e.timestamp_ns - from).collect();
        assert_eq!(ts, vec![1_800_000_000_000, 3_600_000_000_000]);
        assert!(out.iter().all(|e| e.value == 1.0));
        assert_eq!(out[0].labels, labels(&[("app", "api")]));
    }

    #[test]
    fn test_vector_aggregation() {
        let samples = vec![
            sample(0, labels(&[("app", "a"), ("pod", "1")]), 1.0),
            sample(0, labels(&[("app", "a"), ("pod", "2")]), 2.0),
            sample(0, labels(&[("app", "b"), ("pod", "3")]), 4.0),
            sample(MIN, labels(&[("app", "a"), ("pod", "1")]), 8.0),
        ];
        let mut p = VectorAggregator::new(
            VectorOp::Sum,
            Some(Grouping::By(vec!["app".into()])),
        );
        let mut out: Vec<_> = run(&mut p, samples.clone())
            .into_iter()
            .map(|e| (e.labels["app"].clone(), e.timestamp_ns, e.value))
            .collect();
        out.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            out,
            vec![
                ("a".to_string(), 0, 3.0),
                ("a".to_string(), MIN, 8.0),
                ("b".to_string(), 0, 4.0),
            ]
        );

        let mut p = VectorAggregator::new(VectorOp::Count, None);
        let out = run(&mut p, samples);
        assert_eq!(out.len(), 2);
        assert!(out[0].labels.is_empty());
        assert_eq!(out[0].value, 3.0);
    }

    #[test]
    fn test_comparison() {
        let mut p =
            ComparisonStage(Comparison { op: Comparator::Gt, value: 2.0 });
        let out = run(
            &mut p,
            vec![sample(0, labels(&[]), 1.0), sample(1, labels(&[]), 3.0)],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
    }
}
