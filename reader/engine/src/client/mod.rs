// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rust client to ClickHouse database

// Copyright 2024 Oxide Computer Company

pub mod query_summary;

use crate::config::DbConfig;
use crate::entry::Labels;
use crate::Error;
use async_trait::async_trait;
use query_summary::QuerySummary;
use serde_json::Map;
use serde_json::Value;
use slog::debug;
use slog::trace;
use slog::Logger;
use std::fmt;
use std::time::Duration;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A single row of a `JSONEachRow` result, keyed by column name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row(pub Map<String, Value>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    fn require(&self, column: &str) -> Result<&Value, Error> {
        self.0.get(column).ok_or_else(|| {
            Error::Database(format!("missing column '{column}' in result"))
        })
    }

    pub fn str(&self, column: &str) -> Result<&str, Error> {
        self.require(column)?.as_str().ok_or_else(|| {
            Error::Database(format!("column '{column}' is not a string"))
        })
    }

    // 64-bit integers may be quoted, depending on the server settings.
    pub fn u64(&self, column: &str) -> Result<u64, Error> {
        match self.require(column)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::Database(format!(
                "column '{column}' is not an unsigned integer"
            ))
        })
    }

    pub fn i64(&self, column: &str) -> Result<i64, Error> {
        match self.require(column)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::Database(format!("column '{column}' is not an integer"))
        })
    }

    pub fn f64(&self, column: &str) -> Result<f64, Error> {
        match self.require(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            Value::Null => Some(f64::NAN),
            _ => None,
        }
        .ok_or_else(|| {
            Error::Database(format!("column '{column}' is not a number"))
        })
    }

    pub fn array(&self, column: &str) -> Result<&[Value], Error> {
        self.require(column)?.as_array().map(Vec::as_slice).ok_or_else(|| {
            Error::Database(format!("column '{column}' is not an array"))
        })
    }

    /// Read a label set, stored either as a `Map(String, String)` or as a
    /// JSON object serialized to a string.
    pub fn labels(&self, column: &str) -> Result<Labels, Error> {
        let value = self.require(column)?;
        let parsed;
        let object = match value {
            Value::Object(o) => o,
            Value::String(s) if s.is_empty() => return Ok(Labels::new()),
            Value::String(s) => {
                parsed = serde_json::from_str::<Map<String, Value>>(s)
                    .map_err(|e| {
                        Error::Database(format!(
                            "column '{column}' is not a label set: {e}"
                        ))
                    })?;
                &parsed
            }
            Value::Null => return Ok(Labels::new()),
            _ => {
                return Err(Error::Database(format!(
                    "column '{column}' is not a label set"
                )))
            }
        };
        Ok(object
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect())
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Row {
    fn from(columns: [(&str, Value); N]) -> Self {
        Row(columns.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// A cursor over the rows of a result set.
#[async_trait]
pub trait Rows: Send {
    /// Return the next row, or `None` when the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>, Error>;
}

/// The connection layer, executing rendered SQL.
#[async_trait]
pub trait Database: Send + Sync + fmt::Debug {
    async fn query(&self, sql: String) -> Result<Box<dyn Rows>, Error>;
}

/// A `Client` to the ClickHouse HTTP interface.
#[derive(Debug)]
pub struct Client {
    _id: Uuid,
    log: Logger,
    url: String,
    database: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl Client {
    pub fn new(config: &DbConfig, log: &Logger) -> Self {
        let id = Uuid::new_v4();
        let log = log.new(slog::o!(
            "component" => "clickhouse-client",
            "id" => id.to_string(),
        ));
        Self {
            _id: id,
            log,
            url: config.url.clone(),
            database: config.database.clone(),
            client: reqwest::Client::new(),
            request_timeout: config.request_timeout,
        }
    }

    /// Return the url the client is trying to connect to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ping the ClickHouse server to verify connectivity.
    pub async fn ping(&self) -> Result<(), Error> {
        handle_db_response(
            self.client
                .get(format!("{}/ping", self.url))
                .send()
                .await
                .map_err(|err| Error::DatabaseUnavailable(err.to_string()))?,
        )
        .await?;
        debug!(self.log, "successful ping of ClickHouse server");
        Ok(())
    }
}

#[async_trait]
impl Database for Client {
    async fn query(&self, sql: String) -> Result<Box<dyn Rows>, Error> {
        trace!(self.log, "executing SQL query"; "sql" => &sql);
        let start = Instant::now();
        let body = format!("{sql} FORMAT JSONEachRow");
        let response = self
            .client
            .post(&self.url)
            .timeout(self.request_timeout)
            .query(&[
                ("output_format_json_quote_64bit_integers", "0"),
                ("database", self.database.as_str()),
            ])
            .body(body)
            .send()
            .await
            .map_err(|err| Error::DatabaseUnavailable(err.to_string()))?;
        let response = handle_db_response(response).await?;
        let summary =
            QuerySummary::from_headers(start.elapsed(), response.headers())?;
        debug!(
            self.log,
            "query started";
            "query_id" => ?summary.id,
            "elapsed" => ?summary.elapsed,
            "read_rows" => summary.io.read.rows,
        );
        Ok(Box::new(HttpRows { response, buf: Vec::new(), done: false }))
    }
}

// Rows read incrementally from a streaming HTTP body, one JSON object per
// line.
struct HttpRows {
    response: reqwest::Response,
    buf: Vec<u8>,
    done: bool,
}

impl HttpRows {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

#[async_trait]
impl Rows for HttpRows {
    async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                return parse_row(&line).map(Some);
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buf);
                return parse_row(&line).map(Some);
            }
            match self
                .response
                .chunk()
                .await
                .map_err(|e| Error::Database(e.to_string()))?
            {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.done = true,
            }
        }
    }
}

fn parse_row(line: &[u8]) -> Result<Row, Error> {
    serde_json::from_slice(line)
        .map(Row)
        .map_err(|e| Error::Database(format!("invalid row: {e}")))
}

// Return Ok if the response indicates success, otherwise return the body of
// the actual error retrieved from ClickHouse.
async fn handle_db_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_else(|e| e.to_string());
        Err(Error::Database(format!("Query failed: {body}")))
    }
}

/// Read every row of a result set.
pub async fn collect_rows(mut rows: Box<dyn Rows>) -> Result<Vec<Row>, Error> {
    let mut out = Vec::new();
    while let Some(row) = rows.next_row().await? {
        out.push(row);
    }
    Ok(out)
}

/// Run a query and read all of its rows, giving up once `cancel` fires.
pub async fn query_all(
    db: &dyn Database,
    cancel: &CancellationToken,
    sql: String,
) -> Result<Vec<Row>, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        rows = async { collect_rows(db.query(sql).await?).await } => rows,
    }
}
