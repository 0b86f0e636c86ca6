// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Push parts of a PromQL expression down to the database.
//!
//! Subtrees the database can compute are cut out of the expression and
//! replaced with a selector of a synthetic metric. The evaluator then reads
//! that metric from the result of the corresponding [`Substitute`] request
//! instead of computing the subtree itself.

// Copyright 2024 Oxide Computer Company

use super::ast::AggOp;
use super::ast::Grouping;
use super::ast::PromExpr;
use super::ast::VectorSelector;
use super::planner::AggPlanner;
use super::planner::DownsampleValuesPlanner;
use super::planner::FingerprintsPlanner;
use super::planner::LabelsPlanner;
use super::planner::RatePlanner;
use super::planner::ValuesPlanner;
use crate::planner::BoxPlanner;
use crate::Error;
use std::collections::BTreeMap;

/// Names of synthetic metrics start with this prefix.
pub const SUBSTITUTE_PREFIX: &str = "__metric_subst__";

/// A subtree replaced by a database request.
#[derive(Debug)]
pub struct Substitute {
    /// The subtree, as written.
    pub node: PromExpr,
    /// Returns value rows and labels rows for every resulting series.
    pub request: BoxPlanner,
}

#[derive(Debug)]
pub struct Optimized {
    pub expr: PromExpr,
    /// Keyed by the name of the synthetic metric.
    pub substitutes: BTreeMap<String, Substitute>,
}

struct Pending {
    node: PromExpr,
    request: BoxPlanner,
    // Whether `request` still lacks the labels rows.
    needs_labels: bool,
}

#[derive(Default)]
struct Optimizer {
    pending: BTreeMap<String, Pending>,
    next: usize,
}

impl Optimizer {
    fn substitute(&mut self, pending: Pending) -> PromExpr {
        let name = format!("{SUBSTITUTE_PREFIX}{}", self.next);
        self.next += 1;
        self.pending.insert(name.clone(), pending);
        PromExpr::Vector(VectorSelector::metric(&name))
    }

    fn visit(&mut self, node: PromExpr) -> Result<PromExpr, Error> {
        match node {
            PromExpr::Call { ref func, ref args } if func == "rate" => {
                let [PromExpr::Matrix { selector, range }] = args.as_slice()
                else {
                    return Ok(node);
                };
                let request = Box::new(RatePlanner {
                    fingerprints: Box::new(FingerprintsPlanner {
                        matchers: selector.matchers.clone(),
                    }),
                    range: *range,
                });
                Ok(self.substitute(Pending {
                    node,
                    request,
                    needs_labels: true,
                }))
            }
            PromExpr::Aggregate {
                op:
                    op @ (AggOp::Sum
                    | AggOp::Min
                    | AggOp::Max
                    | AggOp::Avg
                    | AggOp::Count),
                ref grouping,
                ref expr,
                param: None,
            } => {
                let PromExpr::Vector(selector) = expr.as_ref() else {
                    return Ok(node);
                };
                let written = grouping.clone();
                let grouping =
                    written.clone().unwrap_or(Grouping::By(Vec::new()));
                let (inner, main) = match selector
                    .metric_name()
                    .and_then(|name| self.pending.remove(name))
                {
                    Some(pending) => (pending.node, pending.request),
                    None => {
                        let values = ValuesPlanner {
                            fingerprints: Box::new(FingerprintsPlanner {
                                matchers: selector.matchers.clone(),
                            }),
                        };
                        let main: BoxPlanner =
                            Box::new(DownsampleValuesPlanner { values });
                        (expr.as_ref().clone(), main)
                    }
                };
                let request = Box::new(AggPlanner { main, op, grouping });
                let node = PromExpr::Aggregate {
                    op,
                    grouping: written,
                    expr: Box::new(inner),
                    param: None,
                };
                Ok(self.substitute(Pending {
                    node,
                    request,
                    needs_labels: false,
                }))
            }
            node => Ok(node),
        }
    }
}

/// Replace every pushable subtree of `expr` with a synthetic selector.
pub fn optimize(expr: PromExpr) -> Result<Optimized, Error> {
    let mut optimizer = Optimizer::default();
    let expr = expr.rewrite(&mut |node| optimizer.visit(node))?;
    let substitutes = optimizer
        .pending
        .into_iter()
        .map(|(name, p)| {
            let request: BoxPlanner = if p.needs_labels {
                Box::new(LabelsPlanner { main: p.request })
            } else {
                p.request
            };
            (name, Substitute { node: p.node, request })
        })
        .collect();
    Ok(Optimized { expr, substitutes })
}
