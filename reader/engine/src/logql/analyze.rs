// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding how much of a log query runs in the database.

// Copyright 2024 Oxide Computer Company

use super::ast::LogQuery;
use super::ast::Parser;
use super::ast::RangeFn;
use super::ast::Stage;
use super::ast::StrSelector;
use super::ast::TopKInner;
use crate::Error;
use std::time::Duration;

/// The point of a log query where SQL stops and the residual pipeline
/// starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Breakpoint {
    /// The whole query compiles to SQL.
    None,
    /// Pipeline stages from this index on run in the residual pipeline.
    Stage(usize),
    /// The selector compiles to SQL, the range aggregation runs in the
    /// residual pipeline.
    RangeAggregation,
}

/// Remove `| json | logfmt` pairs from the pipeline. The second parser
/// never finds anything in a line the first one has already decoded.
pub fn cancel_json_and_logfmt(query: &mut LogQuery) {
    let pipeline = &mut query.selector_mut().pipeline;
    if pipeline.len() < 2 {
        return;
    }
    let mut i = pipeline.len() - 2;
    loop {
        if i + 1 < pipeline.len()
            && matches!(pipeline[i], Stage::Parser(Parser::Json(_)))
            && matches!(pipeline[i + 1], Stage::Parser(Parser::Logfmt(_)))
        {
            pipeline.drain(i..i + 2);
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }
}

/// Find the breakpoint of a query.
pub fn breakpoint(query: &LogQuery) -> Breakpoint {
    match query {
        LogQuery::Stream(selector) => selector_breakpoint(selector),
        LogQuery::QuantileOverTime(q) => selector_breakpoint(&q.selector),
        LogQuery::Range(r) => range_breakpoint(r.func, &r.selector),
        LogQuery::Vector(v) => {
            range_breakpoint(v.inner.func, &v.inner.selector)
        }
        LogQuery::TopK(t) => match t.inner.as_ref() {
            TopKInner::QuantileOverTime(q) => selector_breakpoint(&q.selector),
            TopKInner::Vector(v) => {
                range_breakpoint(v.inner.func, &v.inner.selector)
            }
            TopKInner::Range(r) => range_breakpoint(r.func, &r.selector),
        },
    }
}

fn range_breakpoint(func: RangeFn, selector: &StrSelector) -> Breakpoint {
    match selector_breakpoint(selector) {
        Breakpoint::None if func == RangeFn::AbsentOverTime => {
            Breakpoint::RangeAggregation
        }
        bp => bp,
    }
}

fn selector_breakpoint(selector: &StrSelector) -> Breakpoint {
    selector
        .pipeline
        .iter()
        .position(Stage::needs_residual)
        .map_or(Breakpoint::None, Breakpoint::Stage)
}

/// Return true if the query is a `rate` or `count_over_time` of at least 15
/// seconds over an unparsed stream, answerable from the 15 second rollup.
pub fn metrics_15s_shortcut(query: &LogQuery) -> bool {
    let Some(lra) = query.range_aggregation() else {
        return false;
    };
    if !matches!(lra.func, RangeFn::Rate | RangeFn::CountOverTime) {
        return false;
    }
    if lra.range < Duration::from_secs(15) {
        return false;
    }
    let pipeline = &lra.selector.pipeline;
    if matches!(pipeline.last(), Some(Stage::Unwrap(_))) {
        return false;
    }
    pipeline.iter().all(|stage| match stage {
        Stage::Parser(_) | Stage::Drop(_) => false,
        Stage::LineFilter(f) => f.value.is_empty(),
        _ => true,
    })
}

/// Split a query at its breakpoint into the part compiled to SQL and the
/// part run in the residual pipeline.
///
/// The SQL part is always a plain log query. The residual part is the
/// original query with the SQL stages removed from its selector.
pub fn split_at_breakpoint(
    query: &LogQuery,
    bp: Breakpoint,
) -> Result<(LogQuery, Option<LogQuery>), Error> {
    match query {
        LogQuery::TopK(_) => {
            return Err(Error::not_supported(
                "TopK is not supported for this query",
            ))
        }
        LogQuery::QuantileOverTime(_) => {
            return Err(Error::not_supported(
                "QuantileOverTime is not supported for this query",
            ))
        }
        _ => (),
    }
    let selector = query.selector();
    match bp {
        Breakpoint::None => Ok((query.clone(), None)),
        Breakpoint::Stage(i) => {
            let sql = LogQuery::Stream(StrSelector {
                matchers: selector.matchers.clone(),
                pipeline: selector.pipeline[..i].to_vec(),
            });
            let mut residual = query.clone();
            residual.selector_mut().pipeline.drain(..i);
            Ok((sql, Some(residual)))
        }
        Breakpoint::RangeAggregation => {
            let sql = LogQuery::Stream(selector.clone());
            let mut residual = query.clone();
            residual.selector_mut().pipeline.clear();
            Ok((sql, Some(residual)))
        }
    }
}
