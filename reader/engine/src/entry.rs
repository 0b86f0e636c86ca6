// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unit of data passed between residual pipeline stages.

// Copyright 2024 Oxide Computer Company

use highway::HighwayHasher;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::hash::Hasher;

/// A set of labels, ordered by name.
pub type Labels = BTreeMap<String, String>;

/// A non-fatal marker or fault carried on the stream in place of data.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum EntryError {
    /// The upstream stage has produced all of its entries.
    #[error("end of stream")]
    EndOfStream,

    /// A single row could not be processed.
    #[error("row error: {0}")]
    Row(String),

    /// A stage failed. Nothing follows this entry.
    #[error("pipeline error: {0}")]
    Fatal(String),
}

/// A single log line or sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogEntry {
    /// Stable hash of `labels`, identifying the stream.
    pub fingerprint: u64,
    pub timestamp_ns: i64,
    pub message: String,
    pub labels: Labels,
    /// The numeric value, for metric pipelines.
    pub value: f64,
    pub err: Option<EntryError>,
}

impl LogEntry {
    pub fn end_of_stream() -> Self {
        Self { err: Some(EntryError::EndOfStream), ..Default::default() }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self { err: Some(EntryError::Fatal(msg.into())), ..Default::default() }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.err, Some(EntryError::EndOfStream))
    }

    /// Return true if this entry carries an error other than the end marker.
    pub fn is_error(&self) -> bool {
        matches!(self.err, Some(ref e) if *e != EntryError::EndOfStream)
    }

    /// Recompute the fingerprint after the labels changed.
    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = fingerprint(&self.labels);
    }
}

/// Compute the fingerprint of a label set.
///
/// Labels are hashed in name order, so two maps with the same pairs always
/// produce the same fingerprint.
pub fn fingerprint(labels: &Labels) -> u64 {
    let mut hasher = HighwayHasher::default();
    for (k, v) in labels.iter() {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = labels(&[("app", "api"), ("env", "prod")]);
        let mut b = Labels::new();
        b.insert("env".to_string(), "prod".to_string());
        b.insert("app".to_string(), "api".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(
            fingerprint(&a),
            fingerprint(&labels(&[("app", "api"), ("env", "dev")]))
        );
    }

    #[test]
    fn test_fingerprint_separates_keys_and_values() {
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_markers() {
        let eos = LogEntry::end_of_stream();
        assert!(eos.is_end_of_stream());
        assert!(!eos.is_error());
        let fatal = LogEntry::fatal("boom");
        assert!(fatal.is_error());
        assert!(!LogEntry::default().is_error());
    }
}
