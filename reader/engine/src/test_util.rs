// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test helpers: an in-memory database and a canned planner context.

// Copyright 2024 Oxide Computer Company

use crate::client::Database;
use crate::client::Row;
use crate::client::Rows;
use crate::config::Config;
use crate::context::PlannerContext;
use crate::Error;
use async_trait::async_trait;
use chrono::TimeZone;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// A `Database` answering queries with canned rows.
///
/// Each response is registered with a fragment of SQL; the first response
/// whose fragment appears in the query is used. Queries matching nothing
/// return no rows.
#[derive(Debug, Default)]
pub struct MemoryDb {
    responses: Mutex<Vec<(String, Result<Vec<Row>, Error>)>>,
    queries: Mutex<Vec<String>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, fragment: &str, rows: Vec<Row>) -> Self {
        self.lock_responses().push((fragment.to_string(), Ok(rows)));
        self
    }

    pub fn fail(self, fragment: &str, err: Error) -> Self {
        self.lock_responses().push((fragment.to_string(), Err(err)));
        self
    }

    /// Every query received so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn lock_responses(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(String, Result<Vec<Row>, Error>)>>
    {
        self.responses.lock().unwrap()
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn query(&self, sql: String) -> Result<Box<dyn Rows>, Error> {
        let response = self
            .lock_responses()
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone());
        self.queries.lock().unwrap().push(sql);
        match response {
            Some(Ok(rows)) => Ok(Box::new(MemoryRows(rows.into()))),
            Some(Err(e)) => Err(e),
            None => Ok(Box::new(MemoryRows(VecDeque::new()))),
        }
    }
}

struct MemoryRows(VecDeque<Row>);

#[async_trait]
impl Rows for MemoryRows {
    async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        Ok(self.0.pop_front())
    }
}

/// Build a row from column / value pairs.
pub fn row(columns: &[(&str, Value)]) -> Row {
    Row(columns.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.features.insert(String::from("v3_2"), 0);
    config
}

/// A context over `2024-01-01T00:00:00Z .. 01:00:00Z` with a 15s step.
pub fn test_context() -> PlannerContext {
    test_context_with(Arc::new(MemoryDb::new()), &test_config())
}

pub fn test_context_with(
    db: Arc<dyn Database>,
    config: &Config,
) -> PlannerContext {
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
    PlannerContext::new(
        config,
        db,
        &test_logger(),
        from,
        to,
        Duration::from_secs(15),
    )
}

/// A cluster-mode configuration over database `qryn`.
pub fn cluster_config() -> Config {
    let mut config = test_config();
    config.db.cluster_name = String::from("main");
    config
}
