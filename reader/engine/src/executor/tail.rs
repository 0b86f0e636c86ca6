// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Follow a log query as new lines arrive.

// Copyright 2024 Oxide Computer Company

use super::to_delta;
use super::Executor;
use crate::logql;
use crate::logql::ast::LogQuery;
use crate::output;
use crate::residual::drain;
use crate::residual::Processor;
use crate::residual::RequestProcessor;
use crate::Error;
use bytes::Bytes;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How far back the first poll of a tail reads.
pub const TAIL_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// A running tail. Frames arrive until the watcher is closed, the
/// receiver of frames is dropped, or the query fails.
#[derive(Debug)]
pub struct Watcher {
    frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Watcher {
    /// Wait for the next frame. `None` once the tail has stopped.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    /// Stop polling. Frames already sent can still be read.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Executor {
    /// Re-run a log query every `tail_interval` and send the lines not sent
    /// before, one frame per poll.
    pub fn tail(&self, query: &LogQuery) -> Result<Watcher, Error> {
        let processor = logql::plan(query, &self.factory)?;
        if processor.is_matrix() {
            return Err(Error::not_supported("tailing a metric query"));
        }
        let (tx, frames) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let tail = Tail {
            executor: self.clone(),
            processor,
            from: Utc::now() - to_delta(TAIL_LOOKBACK),
            cancel: cancel.clone(),
            log: self.log.new(o!("component" => "tail")),
        };
        tokio::spawn(tail.run(tx));
        Ok(Watcher { frames, cancel })
    }
}

struct Tail {
    executor: Executor,
    processor: RequestProcessor,
    // Lower bound of the next poll.
    from: DateTime<Utc>,
    cancel: CancellationToken,
    log: Logger,
}

impl Tail {
    async fn run(mut self, tx: mpsc::Sender<Bytes>) {
        let mut ticker =
            tokio::time::interval(self.executor.config.tail_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let frame = match self.poll(Utc::now()).await {
                Ok(frame) => frame,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    warn!(self.log, "tail poll failed"; "error" => %e);
                    break;
                }
            };
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = tx.send(frame) => sent,
            };
            if sent.is_err() {
                break;
            }
        }
        debug!(self.log, "tail stopped");
    }

    // Read the lines in `[from, now]` and advance `from` past the newest.
    async fn poll(&mut self, now: DateTime<Utc>) -> Result<Bytes, Error> {
        let ctx = self
            .executor
            .context(self.from, now, Duration::from_secs(1))
            .with_cancel(self.cancel.child_token());
        let rx = self.processor.process(&Arc::new(ctx))?;
        let (entries, err) = drain(rx).await;
        if let Some(msg) = err {
            return Err(Error::Pipeline(msg));
        }
        let entries: Vec<_> =
            entries.into_iter().filter(|e| e.err.is_none()).collect();
        if let Some(newest) = entries.iter().map(|e| e.timestamp_ns).max() {
            let next = Utc.timestamp_nanos(newest.saturating_add(1));
            if next > self.from {
                self.from = next;
            }
        }
        output::tail_frame(&entries)
    }
}
