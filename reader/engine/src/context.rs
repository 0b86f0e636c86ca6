// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request state shared by every planner of a query.

// Copyright 2024 Oxide Computer Company

use crate::client::Database;
use crate::config::Config;
use crate::config::Table;
use crate::config::TableNames;
use chrono::DateTime;
use chrono::Utc;
use slog::Logger;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::RenderCtx;
use sql_select::RenderOptions;
use sql_select::Select;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The schema feature adding the `type` discriminator column to the samples
/// and time-series tables.
pub const FEATURE_TYPES: &str = "v3_2";

/// Which kind of samples a planner reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Logs,
    Metrics,
}

/// Schema features available on the server, each with the time from which
/// data written with that feature exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo(BTreeMap<String, i64>);

impl VersionInfo {
    pub fn new(features: BTreeMap<String, i64>) -> Self {
        Self(features)
    }

    /// Return true if every row at or after `from_ns` carries `feature`.
    pub fn is_supported(&self, feature: &str, from_ns: i64) -> bool {
        self.0.get(feature).is_some_and(|since| *since <= from_ns)
    }
}

/// A lazily computed CTE shared between sibling planners.
///
/// The first planner to need the CTE computes it. Later planners read the
/// same value.
#[derive(Debug, Default)]
pub struct CteCache(OnceLock<Cte>);

impl CteCache {
    pub fn get(&self) -> Option<&Cte> {
        self.0.get()
    }

    pub fn get_or_try_init<F>(&self, f: F) -> Result<Cte, crate::Error>
    where
        F: FnOnce() -> Result<Cte, crate::Error>,
    {
        if let Some(cte) = self.0.get() {
            return Ok(cte.clone());
        }
        let cte = f()?;
        // A concurrent writer may have won; keep whichever landed first.
        Ok(self.0.get_or_init(|| cte).clone())
    }
}

/// Everything a planner needs to know about the request being served.
#[derive(Debug)]
pub struct PlannerContext {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub step: Duration,
    /// Maximum number of rows, or streams, to return. Zero means no limit.
    pub limit: i64,
    /// Return log lines oldest first.
    pub order_asc: bool,
    pub is_cluster: bool,
    pub tables: TableNames,
    pub version: VersionInfo,
    pub cancel: CancellationToken,
    pub db: Arc<dyn Database>,
    pub log: Logger,
    pub channel_capacity: usize,
    ids: AtomicU64,
    /// The CTE selecting the fingerprints matched by the stream selector.
    pub fp_cache: CteCache,
    /// The CTE selecting the label sets of the matched fingerprints.
    pub labels_cache: CteCache,
}

impl PlannerContext {
    pub fn new(
        config: &Config,
        db: Arc<dyn Database>,
        log: &Logger,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
    ) -> Self {
        Self {
            from,
            to,
            step,
            limit: 0,
            order_asc: false,
            is_cluster: config.is_cluster(),
            tables: config.table_names(),
            version: VersionInfo::new(config.features.clone()),
            cancel: CancellationToken::new(),
            db,
            log: log.clone(),
            channel_capacity: config.channel_capacity,
            ids: AtomicU64::new(0),
            fp_cache: CteCache::default(),
            labels_cache: CteCache::default(),
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_order_asc(mut self, asc: bool) -> Self {
        self.order_asc = asc;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A fresh context for another time range of the same request, with
    /// empty caches and a child cancellation token.
    pub fn renew(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            step: self.step,
            limit: self.limit,
            order_asc: self.order_asc,
            is_cluster: self.is_cluster,
            tables: self.tables.clone(),
            version: self.version.clone(),
            cancel: self.cancel.child_token(),
            db: self.db.clone(),
            log: self.log.clone(),
            channel_capacity: self.channel_capacity,
            ids: AtomicU64::new(0),
            fp_cache: CteCache::default(),
            labels_cache: CteCache::default(),
        }
    }

    /// Return a unique alias for an anonymous subquery.
    pub fn next_alias(&self, prefix: &str) -> String {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{id}")
    }

    pub fn from_ns(&self) -> i64 {
        timestamp_ns(&self.from)
    }

    pub fn to_ns(&self) -> i64 {
        timestamp_ns(&self.to)
    }

    pub fn step_ms(&self) -> i64 {
        i64::try_from(self.step.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    pub fn from_date(&self) -> String {
        self.from.format("%Y-%m-%d").to_string()
    }

    pub fn to_date(&self) -> String {
        self.to.format("%Y-%m-%d").to_string()
    }

    /// The local name of a table.
    pub fn table(&self, table: Table) -> &str {
        self.tables.local(table)
    }

    /// The name of a table to read from, distributed in cluster mode.
    pub fn dist_table(&self, table: Table) -> &str {
        self.tables.dist(table)
    }

    /// The condition restricting rows to the given kind of samples, when the
    /// schema supports it over the whole time range.
    pub fn types_filter(&self, kind: SampleKind, column: &str) -> Option<Expr> {
        if !self.version.is_supported(FEATURE_TYPES, self.from_ns()) {
            return None;
        }
        let types = match kind {
            SampleKind::Logs => "(0,1)",
            SampleKind::Metrics => "(0,2)",
        };
        Some(Expr::in_(Expr::raw(column), Expr::raw(types)))
    }

    /// Render a statement for this request.
    pub fn render(&self, select: &Select) -> Result<String, crate::Error> {
        Ok(select.render(&RenderCtx::default(), RenderOptions::default())?)
    }

    /// Render a statement that every shard must receive whole. In cluster
    /// mode each CTE reference is replaced with the body of the CTE.
    pub fn render_inlined(
        &self,
        select: &Select,
    ) -> Result<String, crate::Error> {
        let opts = if self.is_cluster {
            RenderOptions::inline()
        } else {
            RenderOptions::default()
        };
        Ok(select.render(&RenderCtx::default(), opts)?)
    }
}

pub(crate) fn timestamp_ns(t: &DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::cluster_config;
    use crate::test_util::test_context;
    use crate::test_util::test_context_with;
    use crate::test_util::MemoryDb;
    use sql_select::Column;

    #[test]
    fn test_version_info() {
        let v = VersionInfo::new(BTreeMap::from([(String::from("v3_2"), 100)]));
        assert!(v.is_supported("v3_2", 100));
        assert!(v.is_supported("v3_2", 200));
        assert!(!v.is_supported("v3_2", 99));
        assert!(!v.is_supported("v5", 200));
    }

    #[test]
    fn test_aliases_are_unique() {
        let ctx = test_context();
        let a = ctx.next_alias("sel");
        let b = ctx.next_alias("sel");
        assert_ne!(a, b);
        let renewed = ctx.renew(ctx.from, ctx.to);
        assert_eq!(renewed.next_alias("sel"), "sel_0");
    }

    #[test]
    fn test_cache_is_written_once() {
        let cache = CteCache::default();
        let first = cache
            .get_or_try_init(|| Ok(Cte::new("fp_sel", Select::new())))
            .unwrap();
        let second = cache
            .get_or_try_init(|| Ok(Cte::new("other", Select::new())))
            .unwrap();
        assert_eq!(first.alias, "fp_sel");
        assert_eq!(second.alias, "fp_sel");
        let failed = CteCache::default()
            .get_or_try_init(|| Err(crate::Error::planning("boom")));
        assert!(failed.is_err());
    }

    #[test]
    fn test_types_filter() {
        let ctx = test_context();
        assert!(ctx.types_filter(SampleKind::Logs, "type").is_some());
        let mut ctx = test_context();
        ctx.version = VersionInfo::default();
        assert!(ctx.types_filter(SampleKind::Logs, "type").is_none());
    }

    #[test]
    fn test_render_inlined_in_cluster() {
        let fp = Cte::new(
            "fp",
            Select::new().select([Column::simple("fingerprint")]).from("gin"),
        );
        let select = Select::new()
            .select([Column::simple("fingerprint")])
            .from("samples")
            .and_where([Expr::in_(Expr::raw("fingerprint"), fp.reference())])
            .with(fp);

        let declared = "WITH fp AS (SELECT fingerprint FROM gin) \
                        SELECT fingerprint FROM samples \
                        WHERE fingerprint IN fp";
        let ctx = test_context();
        assert_eq!(ctx.render(&select).unwrap(), declared);
        assert_eq!(ctx.render_inlined(&select).unwrap(), declared);

        let ctx =
            test_context_with(Arc::new(MemoryDb::new()), &cluster_config());
        assert_eq!(ctx.render(&select).unwrap(), declared);
        assert_eq!(
            ctx.render_inlined(&select).unwrap(),
            "SELECT fingerprint FROM samples \
             WHERE fingerprint IN (SELECT fingerprint FROM gin)"
        );
    }

    #[test]
    fn test_dates() {
        let ctx = test_context();
        assert_eq!(ctx.from_date(), "2024-01-01");
        assert_eq!(ctx.to_date(), "2024-01-01");
    }
}
