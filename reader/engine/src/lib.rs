// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Query engine translating LogQL, PromQL and TraceQL into ClickHouse SQL.
//!
//! Each dialect front end turns a query AST into a tree of [`Planner`]s,
//! which compose into a single [`sql_select::Select`]. Log queries whose
//! pipelines cannot be expressed in SQL are split at a breakpoint, with the
//! remaining stages run as a streaming residual pipeline over the rows
//! returned by the database. The [`executor`] drives the whole thing and
//! serializes results incrementally.

// Copyright 2024 Oxide Computer Company

pub mod client;
pub mod config;
pub mod context;
pub mod entry;
pub mod executor;
pub mod logql;
pub mod output;
pub mod planner;
pub mod promql;
pub mod residual;
pub mod traceql;

pub use client::Client;
pub use client::Database;
pub use config::Config;
pub use context::PlannerContext;
pub use entry::LogEntry;
pub use planner::Planner;
pub use residual::Processor;

/// Errors raised while planning or executing a query.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The query uses a construct the engine cannot compile.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A planner found the statement in an unexpected shape.
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Failed to render SQL: {0}")]
    Render(#[from] sql_select::Error),

    /// An error interacting with the database.
    #[error("Error interacting with the database: {0}")]
    Database(String),

    /// The database could not be reached.
    #[error("Database is unavailable: {0}")]
    DatabaseUnavailable(String),

    /// A residual stage failed after the query started streaming.
    #[error("Query pipeline failed: {0}")]
    Pipeline(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    pub(crate) fn planning(msg: impl Into<String>) -> Self {
        Error::Planning(msg.into())
    }

    /// Return true if the error was caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }

    /// The HTTP status code a caller should report for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotSupported(_) => 400,
            Error::Cancelled => 499,
            Error::DatabaseUnavailable(_) => 503,
            Error::Planning(_)
            | Error::Render(_)
            | Error::Database(_)
            | Error::Pipeline(_)
            | Error::Config(_) => 500,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util;
