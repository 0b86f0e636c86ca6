// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Final shaping of residual matrices.

// Copyright 2024 Oxide Computer Company

use super::Batch;
use super::Transform;
use crate::context::PlannerContext;
use crate::entry::LogEntry;
use crate::Error;
use std::time::Duration;

/// Drop samples with a zero value.
pub(crate) struct ZeroEater;

impl Transform for ZeroEater {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        if entry.value != 0.0 {
            out.push(entry);
        }
        Ok(())
    }
}

/// Move samples bucketed by a range onto the steps of the request.
///
/// Input must be ordered by fingerprint, then timestamp. When the step is no
/// longer than the range, a bucket is reported at every step it covers.
/// Otherwise each bucket snaps down to a step, and the last bucket landing on
/// a step wins.
pub(crate) struct FixPeriod {
    from_ns: i64,
    to_ns: i64,
    step_ns: i64,
    duration_ns: i64,
    pending: Option<LogEntry>,
}

impl FixPeriod {
    pub fn new(ctx: &PlannerContext, duration: Duration) -> Self {
        let nanos =
            |d: Duration| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        Self {
            from_ns: ctx.from_ns(),
            to_ns: ctx.to_ns(),
            step_ns: nanos(ctx.step).max(1),
            duration_ns: nanos(duration).max(1),
            pending: None,
        }
    }

    fn push(&mut self, entry: LogEntry, out: &mut Batch) {
        if let Some(prev) = self.pending.take() {
            if prev.fingerprint != entry.fingerprint
                || prev.timestamp_ns != entry.timestamp_ns
            {
                out.push(prev);
            }
        }
        self.pending = Some(entry);
    }
}

impl Transform for FixPeriod {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        let bucket = entry.timestamp_ns;
        if self.step_ns <= self.duration_ns {
            let first = (bucket - self.from_ns).max(0);
            let k = (first + self.step_ns - 1) / self.step_ns;
            let mut t = self.from_ns + k * self.step_ns;
            while t < bucket + self.duration_ns && t <= self.to_ns {
                self.push(LogEntry { timestamp_ns: t, ..entry.clone() }, out);
                t += self.step_ns;
            }
            return Ok(());
        }
        let t = self.from_ns
            + (bucket - self.from_ns).div_euclid(self.step_ns) * self.step_ns;
        if t >= self.from_ns && t <= self.to_ns {
            self.push(LogEntry { timestamp_ns: t, ..entry }, out);
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Batch) -> Result<(), Error> {
        out.extend(self.pending.take());
        Ok(())
    }
}
