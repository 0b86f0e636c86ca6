// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The subset of Go templates accepted by `line_format` and `label_format`.
//!
//! Only label substitution is supported: `{{.label}}`, `{{ .label }}` and
//! `{{ __line__ }}` for the log line itself. Anything else in braces is
//! rejected.

// Copyright 2024 Oxide Computer Company

use crate::entry::Labels;
use crate::Error;

/// The name standing for the log line in a template.
pub const LINE: &str = "__line__";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    Label(String),
    Line,
}

/// A parsed template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template(pub Vec<Piece>);

impl Template {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut pieces = Vec::new();
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                pieces.push(Piece::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                Error::not_supported(format!("unterminated template: {s}"))
            })?;
            let action = after[..end].trim();
            let action = action.trim_start_matches('-').trim_end_matches('-');
            let action = action.trim();
            if action == LINE {
                pieces.push(Piece::Line);
            } else if let Some(label) = action.strip_prefix('.') {
                if label.is_empty()
                    || !label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(Error::not_supported(format!(
                        "template action {{{{{action}}}}}"
                    )));
                }
                pieces.push(Piece::Label(label.to_string()));
            } else {
                return Err(Error::not_supported(format!(
                    "template action {{{{{action}}}}}"
                )));
            }
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            pieces.push(Piece::Text(rest.to_string()));
        }
        Ok(Self(pieces))
    }

    /// Expand the template. Missing labels expand to nothing.
    pub fn render(&self, labels: &Labels, line: &str) -> String {
        let mut out = String::new();
        for piece in self.0.iter() {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Label(l) => {
                    if let Some(v) = labels.get(l) {
                        out.push_str(v);
                    }
                }
                Piece::Line => out.push_str(line),
            }
        }
        out
    }
}
