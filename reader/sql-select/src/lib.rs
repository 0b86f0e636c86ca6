// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A composable representation of a single ClickHouse `SELECT` statement.
//!
//! Planners build a [`Select`] piece by piece, wrap the output of other
//! planners in common table expressions, patch columns in place, and finally
//! render the whole tree to SQL text with [`Select::render`]. Rendering is
//! deterministic: two renders of an unmodified tree with the same options
//! produce byte-identical SQL.

// Copyright 2024 Oxide Computer Company

mod expr;
mod render;
mod select;

pub use expr::CmpOp;
pub use expr::Expr;
pub use expr::LogicalOp;
pub use expr::quote;
pub use expr::SetOp;
pub use render::RenderCtx;
pub use render::RenderOptions;
pub use select::Column;
pub use select::Cte;
pub use select::Direction;
pub use select::Frame;
pub use select::FrameBound;
pub use select::Join;
pub use select::JoinKind;
pub use select::OrderBy;
pub use select::Select;
pub use select::Source;
pub use select::Window;

/// Errors raised while rendering a statement.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The statement has no column list.
    #[error("no 'SELECT' part")]
    NoSelect,

    /// A CTE reference could not be resolved while inlining.
    #[error("unknown CTE alias '{0}'")]
    UnknownCte(String),

    /// A named parameter was not provided in the render context.
    #[error("unknown SQL parameter '{0}'")]
    UnknownParam(String),

    /// An `AND` / `OR` node without operands.
    #[error("logical {0} without operands")]
    EmptyCondition(LogicalOp),
}
