// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The planner composition layer.
//!
//! A [`Planner`] turns the request context into a single [`Select`]. Most
//! planners own a `main` planner, process it first, and then wrap or patch
//! the statement it returned. Chaining planners this way builds the final
//! statement from the innermost table scan outwards.

// Copyright 2024 Oxide Computer Company

use crate::context::CteCache;
use crate::context::PlannerContext;
use crate::Error;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::Select;
use sql_select::SetOp;
use sql_select::Source;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Something producing a SQL statement for a request.
pub trait Planner: Send + Sync + fmt::Debug {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error>;
}

pub type BoxPlanner = Box<dyn Planner>;

/// A planner referenced from several places of a plan.
pub type SharedPlanner = Arc<dyn Planner>;

impl<P: Planner + ?Sized> Planner for Box<P> {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        (**self).process(ctx)
    }
}

impl<P: Planner + ?Sized> Planner for Arc<P> {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        (**self).process(ctx)
    }
}

/// A shared slot of the context holding a CTE computed once per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheSlot {
    Fingerprints,
    Labels,
}

impl CacheSlot {
    fn get<'a>(&self, ctx: &'a PlannerContext) -> &'a CteCache {
        match self {
            CacheSlot::Fingerprints => &ctx.fp_cache,
            CacheSlot::Labels => &ctx.labels_cache,
        }
    }
}

/// The clause a connector condition is added to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Clause {
    Where,
    Prewhere,
}

/// Turn the output of `with` into a CTE of the statement returned by `main`
/// and restrict `main` with a condition referencing it, usually
/// `fingerprint IN alias`.
#[derive(Debug)]
pub struct WithConnector {
    pub main: BoxPlanner,
    pub with: BoxPlanner,
    pub alias: String,
    /// The column of `main` matched against the CTE.
    pub column: String,
    pub clause: Clause,
    pub cache: Option<CacheSlot>,
}

impl WithConnector {
    pub fn new(
        main: BoxPlanner,
        with: BoxPlanner,
        alias: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            main,
            with,
            alias: alias.into(),
            column: column.into(),
            clause: Clause::Where,
            cache: None,
        }
    }

    pub fn prewhere(mut self) -> Self {
        self.clause = Clause::Prewhere;
        self
    }

    pub fn cached(mut self, slot: CacheSlot) -> Self {
        self.cache = Some(slot);
        self
    }
}

impl Planner for WithConnector {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let build =
            || Ok(Cte::new(self.alias.clone(), self.with.process(ctx)?));
        let cte = match self.cache {
            Some(slot) => slot.get(ctx).get_or_try_init(build)?,
            None => build()?,
        };
        let cond = Expr::in_(Expr::raw(self.column.as_str()), cte.reference());
        let main = main.with(cte);
        Ok(match self.clause {
            Clause::Where => main.and_where([cond]),
            Clause::Prewhere => main.and_prewhere([cond]),
        })
    }
}

/// Apply the request's row limit, if any.
#[derive(Debug)]
pub struct LimitPlanner {
    pub main: BoxPlanner,
}

impl Planner for LimitPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        if ctx.limit > 0 {
            return Ok(main.limit(ctx.limit));
        }
        Ok(main)
    }
}

/// `SELECT * FROM ((a) UNION ALL (b) ...)` over the statements of several
/// planners.
#[derive(Debug)]
pub struct UnionAll {
    pub mains: Vec<BoxPlanner>,
}

impl Planner for UnionAll {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let selects = self
            .mains
            .iter()
            .map(|p| p.process(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        match selects.len() {
            0 => Err(Error::planning("union of no statements")),
            1 => Ok(selects.into_iter().next().unwrap_or_default()),
            _ => Ok(Select::new()
                .select([Column::raw("*")])
                .from(Source::new(Expr::set_op(SetOp::UnionAll, selects)))),
        }
    }
}

/// Builds the initial samples planner of a log query from its offset.
pub type SamplesInitFn =
    Arc<dyn Fn(Option<Duration>) -> BoxPlanner + Send + Sync>;

/// Builds the initial planner of a downsampled metrics query.
pub type DownsampleInitFn = Arc<dyn Fn() -> BoxPlanner + Send + Sync>;

/// Optional replacements for the planners reading raw tables.
///
/// Deployments with a different storage layout inject their own initial
/// planners here; everything layered on top of them is unchanged.
#[derive(Clone, Default)]
pub struct PlannerFactory {
    pub samples_init: Option<SamplesInitFn>,
    pub downsample_init: Option<DownsampleInitFn>,
}

impl fmt::Debug for PlannerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerFactory")
            .field("samples_init", &self.samples_init.is_some())
            .field("downsample_init", &self.downsample_init.is_some())
            .finish()
    }
}

impl PlannerFactory {
    pub fn samples_init(&self, offset: Option<Duration>) -> BoxPlanner {
        match &self.samples_init {
            Some(f) => f(offset),
            None => Box::new(crate::logql::planner::SamplesInit { offset }),
        }
    }

    pub fn downsample_init(&self) -> BoxPlanner {
        match &self.downsample_init {
            Some(f) => f(),
            None => Box::new(crate::promql::planner::DownsampleInit),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_util::test_context;

    /// A planner returning a fixed statement.
    #[derive(Debug)]
    pub(crate) struct Fixed(pub Select);

    impl Planner for Fixed {
        fn process(&self, _: &PlannerContext) -> Result<Select, Error> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn fixed(table: &str) -> BoxPlanner {
        Box::new(Fixed(
            Select::new().select([Column::simple("fingerprint")]).from(table),
        ))
    }

    #[test]
    fn test_with_connector() {
        let ctx = test_context();
        let p = WithConnector::new(
            fixed("samples"),
            fixed("gin"),
            "fp_sel",
            "fingerprint",
        );
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "WITH fp_sel AS (SELECT fingerprint FROM gin) \
             SELECT fingerprint FROM samples WHERE fingerprint IN fp_sel"
        );
    }

    #[test]
    fn test_with_connector_cache_is_shared() {
        let ctx = test_context();
        let first = WithConnector::new(
            fixed("a"),
            fixed("gin"),
            "fp_sel",
            "fingerprint",
        )
        .prewhere()
        .cached(CacheSlot::Fingerprints);
        let second = WithConnector::new(
            fixed("b"),
            fixed("other"),
            "fp_sel",
            "fingerprint",
        )
        .cached(CacheSlot::Fingerprints);
        first.process(&ctx).unwrap();
        let sql = ctx.render(&second.process(&ctx).unwrap()).unwrap();
        assert!(
            sql.contains("fp_sel AS (SELECT fingerprint FROM gin)"),
            "{sql}"
        );
    }

    #[test]
    fn test_limit_and_union() {
        let ctx = test_context().with_limit(10);
        let p = LimitPlanner { main: fixed("samples") };
        let sql = ctx.render(&p.process(&ctx).unwrap()).unwrap();
        assert!(sql.ends_with("LIMIT 10"));

        let u = UnionAll { mains: vec![fixed("a"), fixed("b")] };
        let sql = ctx.render(&u.process(&ctx).unwrap()).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM ((SELECT fingerprint FROM a) UNION ALL \
             (SELECT fingerprint FROM b))"
        );
        assert!(UnionAll { mains: vec![] }.process(&ctx).is_err());
    }
}
