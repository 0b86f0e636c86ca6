// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering a statement tree into SQL text.

// Copyright 2024 Oxide Computer Company

use crate::Cte;
use crate::Error;
use crate::Expr;
use crate::Select;
use std::collections::BTreeMap;

/// Values shared by every node rendered for a single request.
#[derive(Clone, Debug, Default)]
pub struct RenderCtx {
    /// Named parameters, substituted for [`Expr::Param`] nodes.
    pub params: BTreeMap<String, Expr>,
}

/// Options controlling how CTEs are emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Do not emit this statement's own `WITH` clause.
    ///
    /// Set when the statement is the body of a CTE whose nested CTEs have
    /// been hoisted to the enclosing statement.
    pub skip_with: bool,

    /// Never declare CTEs; every reference is replaced with the
    /// parenthesised body of the CTE it names.
    ///
    /// Used against distributed tables, where each shard must receive the
    /// full text of the subquery.
    pub inline_with: bool,
}

impl RenderOptions {
    pub fn inline() -> Self {
        Self { skip_with: false, inline_with: true }
    }

    fn nested(self) -> Self {
        Self { skip_with: true, ..self }
    }
}

// The CTEs visible from the statement being rendered, innermost first.
#[derive(Clone, Copy)]
struct Scope<'a> {
    ctes: &'a [Cte],
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, alias: &str) -> Option<&'a Cte> {
        self.ctes
            .iter()
            .find(|c| c.alias == alias)
            .or_else(|| self.parent.and_then(|p| p.lookup(alias)))
    }
}

pub(crate) struct Renderer<'a> {
    ctx: &'a RenderCtx,
    opts: RenderOptions,
    scope: Scope<'a>,
}

impl<'a> Renderer<'a> {
    pub(crate) fn root(ctx: &'a RenderCtx, opts: RenderOptions) -> Self {
        Self { ctx, opts, scope: Scope { ctes: &[], parent: None } }
    }

    pub(crate) fn ctx(&self) -> &RenderCtx {
        self.ctx
    }

    #[cfg(test)]
    pub(crate) fn render_expr(&self, e: &Expr) -> Result<String, Error> {
        e.render(self)
    }

    // Render a CTE reference, inlining the CTE body when requested.
    pub(crate) fn render_cte_ref(&self, alias: &str) -> Result<String, Error> {
        if !self.opts.inline_with {
            return Ok(alias.to_string());
        }
        let cte = self
            .scope
            .lookup(alias)
            .ok_or_else(|| Error::UnknownCte(alias.to_string()))?;
        Ok(format!("({})", self.render_nested(&cte.source)?))
    }

    // Render a statement nested inside the current one (a subquery or a
    // set-operation member). CTEs of the enclosing statement stay visible,
    // and the nested statement declares its own CTEs unless inlining.
    pub(crate) fn render_nested(
        &self,
        select: &Select,
    ) -> Result<String, Error> {
        let opts = RenderOptions { skip_with: false, ..self.opts };
        let child = Renderer { ctx: self.ctx, opts, scope: self.scope };
        child.render_select(select)
    }

    pub(crate) fn render_select(&self, s: &Select) -> Result<String, Error> {
        if s.columns.is_empty() {
            return Err(Error::NoSelect);
        }
        let scope = Scope { ctes: &s.ctes, parent: Some(&self.scope) };
        let r = Renderer { ctx: self.ctx, opts: self.opts, scope };
        let mut out = String::new();

        let declare = !self.opts.skip_with && !self.opts.inline_with;
        if declare && !s.ctes.is_empty() {
            let nested = Renderer { opts: self.opts.nested(), ..r.reborrow() };
            let withs = s
                .ctes
                .iter()
                .map(|c| {
                    nested
                        .render_select(&c.source)
                        .map(|body| format!("{} AS ({})", c.alias, body))
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.push_str("WITH ");
            out.push_str(&withs.join(", "));
            out.push(' ');
        }

        out.push_str("SELECT ");
        if s.distinct {
            out.push_str("DISTINCT ");
        }
        let columns = s
            .columns
            .iter()
            .map(|c| c.render(&r))
            .collect::<Result<Vec<_>, _>>()?;
        out.push_str(&columns.join(", "));

        if let Some(from) = &s.from {
            out.push_str(" FROM ");
            out.push_str(&from.render(&r)?);
        }
        for join in s.joins.iter() {
            out.push_str(&join.render(&r)?);
        }
        if let Some(prewhere) = &s.prewhere {
            out.push_str(" PREWHERE ");
            out.push_str(&prewhere.render(&r)?);
        }
        if let Some(where_) = &s.where_ {
            out.push_str(" WHERE ");
            out.push_str(&where_.render(&r)?);
        }
        if !s.group_by.is_empty() {
            out.push_str(" GROUP BY ");
            out.push_str(&render_list(&r, &s.group_by)?);
        }
        if let Some(having) = &s.having {
            out.push_str(" HAVING ");
            out.push_str(&having.render(&r)?);
        }
        let windows = s
            .windows
            .iter()
            .map(|w| w.render(&r))
            .collect::<Result<Vec<_>, _>>()?;
        if !windows.is_empty() {
            out.push_str(" WINDOW ");
            out.push_str(&windows.join(", "));
        }
        if !s.order_by.is_empty() {
            let order = s
                .order_by
                .iter()
                .map(|o| o.render(&r))
                .collect::<Result<Vec<_>, _>>()?;
            out.push_str(" ORDER BY ");
            out.push_str(&order.join(", "));
        }
        if let Some(limit) = &s.limit {
            out.push_str(" LIMIT ");
            out.push_str(&limit.render(&r)?);
        }
        if let Some(offset) = &s.offset {
            out.push_str(" OFFSET ");
            out.push_str(&offset.render(&r)?);
        }
        if !s.settings.is_empty() {
            out.push_str(" SETTINGS ");
            let settings = s
                .settings
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>();
            out.push_str(&settings.join(", "));
        }
        Ok(out)
    }

    fn reborrow(&self) -> Renderer<'a> {
        Renderer { ctx: self.ctx, opts: self.opts, scope: self.scope }
    }
}

pub(crate) fn render_list(
    r: &Renderer<'_>,
    exprs: &[Expr],
) -> Result<String, Error> {
    Ok(exprs
        .iter()
        .map(|e| e.render(r))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}
