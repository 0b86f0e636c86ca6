// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types representing summaries of queries against the database.

// Copyright 2024 Oxide Computer Company

use crate::Error;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// A count of bytes / rows accessed during a query.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IoCount {
    pub bytes: u64,
    pub rows: u64,
}

/// Summary of the I/O resources used by a query.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IoSummary {
    pub read: IoCount,
    pub result: IoCount,
}

// ClickHouse quotes every number in the summary header.
#[derive(Debug, Deserialize)]
struct SummaryHeader {
    #[serde(default, deserialize_with = "quoted_u64")]
    read_rows: u64,
    #[serde(default, deserialize_with = "quoted_u64")]
    read_bytes: u64,
    #[serde(default, deserialize_with = "quoted_u64")]
    result_rows: u64,
    #[serde(default, deserialize_with = "quoted_u64")]
    result_bytes: u64,
}

fn quoted_u64<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Basic metadata about the resource usage of a single SQL query.
#[derive(Clone, Debug)]
pub struct QuerySummary {
    /// The ID assigned to the query by the database, if any.
    pub id: Option<Uuid>,
    /// The time it took to receive the response headers.
    pub elapsed: Duration,
    pub io: IoSummary,
}

impl QuerySummary {
    /// Construct a summary from the headers of a ClickHouse response.
    ///
    /// A missing summary header is not an error, some proxies strip it.
    pub fn from_headers(
        elapsed: Duration,
        headers: &HeaderMap,
    ) -> Result<Self, Error> {
        let id = headers
            .get("X-ClickHouse-Query-Id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let io = match headers.get("X-ClickHouse-Summary") {
            None => IoSummary::default(),
            Some(value) => {
                let text = value.to_str().map_err(|e| {
                    Error::Database(format!("invalid summary header: {e}"))
                })?;
                let summary: SummaryHeader =
                    serde_json::from_str(text).map_err(|e| {
                        Error::Database(format!("invalid summary header: {e}"))
                    })?;
                IoSummary {
                    read: IoCount {
                        bytes: summary.read_bytes,
                        rows: summary.read_rows,
                    },
                    result: IoCount {
                        bytes: summary.result_bytes,
                        rows: summary.result_rows,
                    },
                }
            }
        };
        Ok(Self { id, elapsed, io })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-ClickHouse-Query-Id",
            HeaderValue::from_static("6e4d4e5e-1e6f-4f7a-9c1c-0b8e3f2a1d00"),
        );
        headers.insert(
            "X-ClickHouse-Summary",
            HeaderValue::from_static(
                r#"{"read_rows":"10","read_bytes":"2048","written_rows":"0","result_rows":"2","result_bytes":"64"}"#,
            ),
        );
        let summary =
            QuerySummary::from_headers(Duration::from_millis(3), &headers)
                .unwrap();
        assert!(summary.id.is_some());
        assert_eq!(summary.io.read, IoCount { bytes: 2048, rows: 10 });
        assert_eq!(summary.io.result, IoCount { bytes: 64, rows: 2 });
    }

    #[test]
    fn test_missing_headers() {
        let summary =
            QuerySummary::from_headers(Duration::ZERO, &HeaderMap::new())
                .unwrap();
        assert!(summary.id.is_none());
        assert_eq!(summary.io, IoSummary::default());
    }
}
