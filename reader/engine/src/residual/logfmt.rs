// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Split a logfmt line into key / value pairs.

// Copyright 2024 Oxide Computer Company

#[derive(Debug, PartialEq, Eq)]
pub struct UnterminatedQuote;

/// Parse `key=value key2="quoted \" value" flag`. A bare key has an empty
/// value. Text that is not a key is skipped.
pub fn parse(line: &str) -> Result<Vec<(String, String)>, UnterminatedQuote> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == '=').is_some() {}
        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=')
        {
            if c != '"' {
                key.push(c);
            }
        }
        if key.is_empty() {
            break;
        }
        if chars.next_if_eq(&'=').is_none() {
            out.push((key, String::new()));
            continue;
        }
        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some(c) => value.push(c),
                        None => return Err(UnterminatedQuote),
                    },
                    Some(c) => value.push(c),
                    None => return Err(UnterminatedQuote),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        out.push((key, value));
    }
    Ok(out)
}
