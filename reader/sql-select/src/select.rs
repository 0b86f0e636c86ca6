// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `SELECT` statement builder.

// Copyright 2024 Oxide Computer Company

use crate::render::render_list;
use crate::render::Renderer;
use crate::Error;
use crate::Expr;
use crate::LogicalOp;
use crate::RenderCtx;
use crate::RenderOptions;
use std::collections::BTreeMap;

/// One entry of the column list, with an optional alias.
///
/// Planners may later locate a column by its alias and replace it, see
/// [`Select::patch_field`].
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Column {
    pub fn new(expr: impl Into<Expr>, alias: impl Into<String>) -> Self {
        Self { expr: expr.into(), alias: Some(alias.into()) }
    }

    /// A column named the same as the raw expression, e.g. `fingerprint`.
    pub fn simple(name: &str) -> Self {
        Self::new(Expr::raw(name), name)
    }

    /// A column without an alias, e.g. `*`.
    pub fn raw(expr: impl Into<Expr>) -> Self {
        Self { expr: expr.into(), alias: None }
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        let expr = self.expr.render(r)?;
        match &self.alias {
            Some(alias)
                if !matches!(&self.expr, Expr::Raw(s) if s == alias) =>
            {
                Ok(format!("{} AS {}", expr, alias))
            }
            _ => Ok(expr),
        }
    }
}

/// A `FROM` or `JOIN` target.
#[derive(Clone, Debug, PartialEq)]
pub struct Source {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Source {
    pub fn table(name: impl Into<String>) -> Self {
        Self { expr: Expr::Raw(name.into()), alias: None }
    }

    pub fn cte(alias: impl Into<String>) -> Self {
        Self { expr: Expr::CteRef(alias.into()), alias: None }
    }

    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        let expr = self.expr.render(r)?;
        let expr = match &self.expr {
            // A set operation renders as `(a) UNION ALL (b)` and needs one
            // more pair of parentheses to become a table expression.
            Expr::SetOp { .. } => format!("({})", expr),
            _ => expr,
        };
        match &self.alias {
            Some(alias) => Ok(format!("{} AS {}", expr, alias)),
            None => Ok(expr),
        }
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        Source::table(name)
    }
}

/// Kinds of joins supported by the builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    AnyLeft,
    Left,
    Inner,
    Array,
    LeftArray,
}

impl JoinKind {
    fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::AnyLeft => "ANY LEFT",
            JoinKind::Left => "LEFT",
            JoinKind::Inner => "INNER",
            JoinKind::Array => "ARRAY",
            JoinKind::LeftArray => "LEFT ARRAY",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: Source,
    pub on: Option<Expr>,
}

impl Join {
    pub fn new(kind: JoinKind, source: Source, on: Expr) -> Self {
        Self { kind, source, on: Some(on) }
    }

    /// An `ARRAY JOIN` over an array column.
    pub fn array(column: impl Into<Expr>) -> Self {
        Self {
            kind: JoinKind::Array,
            source: Source::new(column.into()),
            on: None,
        }
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        let mut out =
            format!(" {} JOIN {}", self.kind.as_sql(), self.source.render(r)?);
        if let Some(on) = &self.on {
            out.push_str(" ON ");
            out.push_str(&on.render(r)?);
        }
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub dir: Direction,
}

impl OrderBy {
    pub fn asc(expr: impl Into<Expr>) -> Self {
        Self { expr: expr.into(), dir: Direction::Asc }
    }

    pub fn desc(expr: impl Into<Expr>) -> Self {
        Self { expr: expr.into(), dir: Direction::Desc }
    }

    pub fn new(expr: impl Into<Expr>, asc: bool) -> Self {
        if asc {
            Self::asc(expr)
        } else {
            Self::desc(expr)
        }
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        let dir = match self.dir {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        Ok(format!("{} {}", self.expr.render(r)?, dir))
    }
}

/// One end of a window frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(i64),
    CurrentRow,
    Following(i64),
}

impl FrameBound {
    fn as_sql(&self) -> String {
        match self {
            FrameBound::UnboundedPreceding => {
                String::from("UNBOUNDED PRECEDING")
            }
            FrameBound::Preceding(n) => format!("{} PRECEDING", n),
            FrameBound::CurrentRow => String::from("CURRENT ROW"),
            FrameBound::Following(n) => format!("{} FOLLOWING", n),
        }
    }
}

/// A window frame. `RANGE` frames are keyed on the ordering value, not on
/// row counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    Range(FrameBound, FrameBound),
    Rows(FrameBound, FrameBound),
}

impl Frame {
    fn as_sql(&self) -> String {
        match self {
            Frame::Range(start, end) => {
                format!("RANGE BETWEEN {} AND {}", start.as_sql(), end.as_sql())
            }
            Frame::Rows(start, end) => {
                format!("ROWS BETWEEN {} AND {}", start.as_sql(), end.as_sql())
            }
        }
    }
}

/// A named window declared in the `WINDOW` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    pub alias: String,
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub frame: Option<Frame>,
}

impl Window {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            partition_by: vec![],
            order_by: vec![],
            frame: None,
        }
    }

    pub fn partition_by(mut self, exprs: Vec<Expr>) -> Self {
        self.partition_by = exprs;
        self
    }

    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        self.order_by = order;
        self
    }

    pub fn frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    pub(crate) fn render(&self, r: &Renderer<'_>) -> Result<String, Error> {
        let mut parts = vec![];
        if !self.partition_by.is_empty() {
            parts.push(format!(
                "PARTITION BY {}",
                render_list(r, &self.partition_by)?
            ));
        }
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|o| o.render(r))
                .collect::<Result<Vec<_>, _>>()?;
            parts.push(format!("ORDER BY {}", order.join(", ")));
        }
        if let Some(frame) = &self.frame {
            parts.push(frame.as_sql());
        }
        Ok(format!("{} AS ({})", self.alias, parts.join(" ")))
    }
}

/// A named common table expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Cte {
    pub alias: String,
    pub source: Select,
}

impl Cte {
    pub fn new(alias: impl Into<String>, source: Select) -> Self {
        Self { alias: alias.into(), source }
    }

    /// A reference to this CTE, usable anywhere an expression is.
    pub fn reference(&self) -> Expr {
        Expr::CteRef(self.alias.clone())
    }
}

/// A single `SELECT` statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Select {
    pub(crate) distinct: bool,
    pub(crate) columns: Vec<Column>,
    pub(crate) from: Option<Source>,
    pub(crate) prewhere: Option<Expr>,
    pub(crate) where_: Option<Expr>,
    pub(crate) having: Option<Expr>,
    pub(crate) group_by: Vec<Expr>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<Expr>,
    pub(crate) offset: Option<Expr>,
    pub(crate) ctes: Vec<Cte>,
    pub(crate) joins: Vec<Join>,
    pub(crate) windows: Vec<Window>,
    pub(crate) settings: BTreeMap<String, String>,
}

// Append conditions to an optional condition with `op`, flattening into an
// existing node of the same kind.
fn append_logical(
    slot: &mut Option<Expr>,
    op: LogicalOp,
    conds: impl IntoIterator<Item = Expr>,
) {
    let mut conds: Vec<Expr> = conds.into_iter().collect();
    if conds.is_empty() {
        return;
    }
    *slot = Some(match slot.take() {
        None if conds.len() == 1 => conds.remove(0),
        None => Expr::Logical { op, operands: conds },
        Some(Expr::Logical { op: existing, mut operands })
            if existing == op =>
        {
            operands.extend(conds);
            Expr::Logical { op, operands }
        }
        Some(other) => {
            let mut operands = vec![other];
            operands.extend(conds);
            Expr::Logical { op, operands }
        }
    });
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Replace the column list.
    pub fn select(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns = columns.into_iter().collect();
        self
    }

    pub fn add_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn from(mut self, source: impl Into<Source>) -> Self {
        self.from = Some(source.into());
        self
    }

    pub fn and_where(mut self, conds: impl IntoIterator<Item = Expr>) -> Self {
        append_logical(&mut self.where_, LogicalOp::And, conds);
        self
    }

    pub fn or_where(mut self, conds: impl IntoIterator<Item = Expr>) -> Self {
        append_logical(&mut self.where_, LogicalOp::Or, conds);
        self
    }

    pub fn and_prewhere(
        mut self,
        conds: impl IntoIterator<Item = Expr>,
    ) -> Self {
        append_logical(&mut self.prewhere, LogicalOp::And, conds);
        self
    }

    pub fn and_having(mut self, conds: impl IntoIterator<Item = Expr>) -> Self {
        append_logical(&mut self.having, LogicalOp::And, conds);
        self
    }

    /// Replace the `GROUP BY` list.
    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.group_by = exprs.into_iter().collect();
        self
    }

    /// Replace the `ORDER BY` list.
    pub fn order_by(
        mut self,
        order: impl IntoIterator<Item = OrderBy>,
    ) -> Self {
        self.order_by = order.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: impl Into<Expr>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn offset(mut self, offset: impl Into<Expr>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn window(mut self, window: Window) -> Self {
        self.windows.push(window);
        self
    }

    pub fn setting(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Declare a CTE on this statement.
    ///
    /// CTEs already declared by the CTE's own source statement are hoisted to
    /// this statement first. A CTE whose alias is already declared is
    /// skipped, so adding the same alias twice declares it once.
    pub fn with(mut self, cte: Cte) -> Self {
        self.add_with(cte);
        self
    }

    pub fn add_with(&mut self, cte: Cte) {
        for nested in cte.source.ctes.iter() {
            self.add_with(nested.clone());
        }
        if self.cte(&cte.alias).is_none() {
            self.ctes.push(cte);
        }
    }

    pub fn drop_with(mut self, alias: &str) -> Self {
        self.ctes.retain(|c| c.alias != alias);
        self
    }

    /// Replace the column with the given alias, leaving the list unchanged
    /// if no such column exists.
    pub fn patch_field(mut self, alias: &str, column: Column) -> Self {
        if let Some(existing) = self
            .columns
            .iter_mut()
            .find(|c| c.alias.as_deref() == Some(alias))
        {
            *existing = column;
        }
        self
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, alias: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.alias.as_deref() == Some(alias))
    }

    pub fn ctes(&self) -> &[Cte] {
        &self.ctes
    }

    pub fn cte(&self, alias: &str) -> Option<&Cte> {
        self.ctes.iter().find(|c| c.alias == alias)
    }

    pub fn source(&self) -> Option<&Source> {
        self.from.as_ref()
    }

    pub fn where_clause(&self) -> Option<&Expr> {
        self.where_.as_ref()
    }

    pub fn prewhere_clause(&self) -> Option<&Expr> {
        self.prewhere.as_ref()
    }

    pub fn having_clause(&self) -> Option<&Expr> {
        self.having.as_ref()
    }

    pub fn group_by_exprs(&self) -> &[Expr] {
        &self.group_by
    }

    pub fn order_by_exprs(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit_expr(&self) -> Option<&Expr> {
        self.limit.as_ref()
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Render the statement to SQL text.
    pub fn render(
        &self,
        ctx: &RenderCtx,
        opts: RenderOptions,
    ) -> Result<String, Error> {
        Renderer::root(ctx, opts).render_select(self)
    }
}
