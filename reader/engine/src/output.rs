// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental JSON encoding of query results.
//!
//! Results are written as `Bytes` chunks on a channel, so a response can be
//! sent before the query completes. A chunk is flushed whenever a series
//! ends, and within a series whenever the buffer grows past
//! [`FLUSH_THRESHOLD`].
//!
//! An error raised before the first chunk went out replaces the response
//! with an error payload. After that, the response is cut short: callers
//! see an unterminated JSON document.

// Copyright 2024 Oxide Computer Company

use crate::entry::EntryError;
use crate::entry::Labels;
use crate::entry::LogEntry;
use crate::residual::Batch;
use crate::Error;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use serde::Serialize;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub const FLUSH_THRESHOLD: usize = 64 * 1024;

const NS_PER_SEC: i64 = 1_000_000_000;

/// The shape of a query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultType {
    /// Log lines grouped by stream.
    Streams,
    /// Samples grouped by series.
    Matrix,
    /// The last sample of every series.
    Vector,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Streams => "streams",
            ResultType::Matrix => "matrix",
            ResultType::Vector => "vector",
        }
    }

    /// The result type of a range query.
    pub fn range(is_matrix: bool) -> Self {
        if is_matrix {
            ResultType::Matrix
        } else {
            ResultType::Streams
        }
    }

    /// The result type of an instant query.
    pub fn instant(is_matrix: bool) -> Self {
        if is_matrix {
            ResultType::Vector
        } else {
            ResultType::Streams
        }
    }
}

/// Format a sample value without trailing zeros.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return String::from("NaN");
    }
    if value.is_infinite() {
        return String::from(if value > 0.0 { "+Inf" } else { "-Inf" });
    }
    // Display never uses an exponent and prints whole numbers bare.
    format!("{value}")
}

/// Format a nanosecond timestamp as seconds, with as many decimals as it
/// needs.
pub fn format_seconds(ns: i64) -> String {
    let secs = ns.div_euclid(NS_PER_SEC);
    let frac = ns.rem_euclid(NS_PER_SEC);
    if frac == 0 {
        return secs.to_string();
    }
    let frac = format!("{frac:09}");
    format!("{secs}.{}", frac.trim_end_matches('0'))
}

fn put(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
}

fn put_json<T: Serialize + ?Sized>(
    buf: &mut BytesMut,
    v: &T,
) -> Result<(), Error> {
    serde_json::to_writer(buf.writer(), v)
        .map_err(|e| Error::Pipeline(format!("failed to encode: {e}")))
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    status: &'static str,
    #[serde(rename = "errorType")]
    error_type: &'static str,
    error: &'a str,
}

/// Buffers a response and sends it in chunks.
#[derive(Debug)]
pub struct ResponseWriter {
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
    flushed: bool,
}

impl ResponseWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, buf: BytesMut::new(), flushed: false }
    }

    fn put(&mut self, s: &str) {
        put(&mut self.buf, s);
    }

    fn put_json<T: Serialize + ?Sized>(&mut self, v: &T) -> Result<(), Error> {
        put_json(&mut self.buf, v)
    }

    /// Send whatever is buffered. Fails with [`Error::Cancelled`] once the
    /// receiver has gone away.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.tx.send(chunk).await.map_err(|_| Error::Cancelled)?;
        self.flushed = true;
        Ok(())
    }

    async fn maybe_flush(&mut self) -> Result<(), Error> {
        if self.buf.len() >= FLUSH_THRESHOLD {
            return self.flush().await;
        }
        Ok(())
    }

    /// End the response after `err`.
    pub async fn fail(mut self, err: &Error) {
        if self.flushed {
            // Dropping the sender truncates the response.
            return;
        }
        self.buf.clear();
        let payload = ErrorPayload {
            status: "error",
            error_type: if err.is_client_error() {
                "bad_data"
            } else {
                "internal"
            },
            error: &err.to_string(),
        };
        if self.put_json(&payload).is_ok() {
            let _ = self.flush().await;
        }
    }
}

// Returns the data entry, or `None` if the entry is to be skipped. Errors
// end the response; row errors only lose their row.
fn check_entry(
    log: &Logger,
    entry: LogEntry,
) -> Result<Option<LogEntry>, Error> {
    match entry.err {
        None => Ok(Some(entry)),
        Some(EntryError::EndOfStream) => Ok(None),
        Some(EntryError::Row(ref msg)) => {
            warn!(log, "skipping a malformed row"; "error" => msg);
            Ok(None)
        }
        Some(EntryError::Fatal(msg)) => Err(Error::Pipeline(msg)),
    }
}

fn header(w: &mut ResponseWriter, result_type: ResultType) {
    w.put(r#"{"status":"success","data":{"resultType":""#);
    w.put(result_type.as_str());
    w.put(r#"","result":["#);
}

fn write_stream_value(
    buf: &mut BytesMut,
    entry: &LogEntry,
) -> Result<(), Error> {
    put(buf, "[\"");
    put(buf, &entry.timestamp_ns.to_string());
    put(buf, "\",");
    put_json(buf, entry.message.as_str())?;
    put(buf, "]");
    Ok(())
}

fn write_matrix_value(buf: &mut BytesMut, entry: &LogEntry) {
    put(buf, "[");
    put(buf, &format_seconds(entry.timestamp_ns));
    put(buf, ",\"");
    put(buf, &format_value(entry.value));
    put(buf, "\"]");
}

fn open_group(
    buf: &mut BytesMut,
    key: &str,
    labels: &Labels,
) -> Result<(), Error> {
    put(buf, "{\"");
    put(buf, key);
    put(buf, "\":");
    put_json(buf, labels)?;
    put(buf, ",\"values\":[");
    Ok(())
}

// Write entries grouped by consecutive fingerprint.
async fn encode_groups(
    rx: &mut mpsc::Receiver<Batch>,
    w: &mut ResponseWriter,
    result_type: ResultType,
    log: &Logger,
) -> Result<(), Error> {
    let key = match result_type {
        ResultType::Streams => "stream",
        _ => "metric",
    };
    header(w, result_type);
    let mut current = None;
    while let Some(batch) = rx.recv().await {
        for entry in batch {
            let end = entry.is_end_of_stream();
            let Some(entry) = check_entry(log, entry)? else {
                if end {
                    if current.is_some() {
                        w.put("]}");
                    }
                    w.put("]}}");
                    return w.flush().await;
                }
                continue;
            };
            if current == Some(entry.fingerprint) {
                w.put(",");
            } else {
                if current.is_some() {
                    w.put("]},");
                    w.flush().await?;
                }
                current = Some(entry.fingerprint);
                open_group(&mut w.buf, key, &entry.labels)?;
            }
            match result_type {
                ResultType::Streams => write_stream_value(&mut w.buf, &entry)?,
                _ => write_matrix_value(&mut w.buf, &entry),
            }
            w.maybe_flush().await?;
        }
    }
    Err(Error::Pipeline(String::from("pipeline ended without a marker")))
}

async fn encode_vector(
    rx: &mut mpsc::Receiver<Batch>,
    w: &mut ResponseWriter,
    log: &Logger,
) -> Result<(), Error> {
    let mut last: BTreeMap<u64, LogEntry> = BTreeMap::new();
    'read: while let Some(batch) = rx.recv().await {
        for entry in batch {
            let end = entry.is_end_of_stream();
            let Some(entry) = check_entry(log, entry)? else {
                if end {
                    break 'read;
                }
                continue;
            };
            match last.get(&entry.fingerprint) {
                Some(prev) if prev.timestamp_ns >= entry.timestamp_ns => {}
                _ => {
                    last.insert(entry.fingerprint, entry);
                }
            }
        }
    }
    header(w, ResultType::Vector);
    for (i, entry) in last.values().enumerate() {
        if i > 0 {
            w.put(",");
        }
        w.put("{\"metric\":");
        w.put_json(&entry.labels)?;
        w.put(",\"value\":[");
        w.put(&entry.timestamp_ns.div_euclid(NS_PER_SEC).to_string());
        w.put(",\"");
        w.put(&format_value(entry.value));
        w.put("\"]}");
        w.maybe_flush().await?;
    }
    w.put("]}}");
    w.flush().await
}

/// Encode the output of a pipeline as a query response on `tx`.
///
/// On error the response ends as described in the module documentation
/// and the error is returned.
pub async fn write_response(
    mut rx: mpsc::Receiver<Batch>,
    tx: mpsc::Sender<Bytes>,
    result_type: ResultType,
    log: &Logger,
) -> Result<(), Error> {
    let mut w = ResponseWriter::new(tx);
    let res = match result_type {
        ResultType::Vector => encode_vector(&mut rx, &mut w, log).await,
        _ => encode_groups(&mut rx, &mut w, result_type, log).await,
    };
    if let Err(ref err) = res {
        w.fail(err).await;
    }
    res
}

/// Encode one frame of a tail response: `{"streams":[...]}`.
pub fn tail_frame(entries: &[LogEntry]) -> Result<Bytes, Error> {
    let mut buf = BytesMut::new();
    put(&mut buf, r#"{"streams":["#);
    let mut current = None;
    for entry in entries {
        if current == Some(entry.fingerprint) {
            put(&mut buf, ",");
        } else {
            if current.is_some() {
                put(&mut buf, "]},");
            }
            current = Some(entry.fingerprint);
            open_group(&mut buf, "stream", &entry.labels)?;
        }
        write_stream_value(&mut buf, entry)?;
    }
    if current.is_some() {
        put(&mut buf, "]}");
    }
    put(&mut buf, "]}");
    Ok(buf.freeze())
}
