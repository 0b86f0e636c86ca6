// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Residual stages over single log lines.

// Copyright 2024 Oxide Computer Company

use super::logfmt;
use super::Batch;
use super::Transform;
use crate::entry::Labels;
use crate::entry::LogEntry;
use crate::logql::ast::parse_duration;
use crate::logql::ast::DropParam;
use crate::logql::ast::LabelFilter;
use crate::logql::ast::LabelFormatOp;
use crate::logql::ast::LabelFormatValue;
use crate::logql::ast::LineFilter;
use crate::logql::ast::LineFilterOp;
use crate::logql::ast::Parser;
use crate::logql::ast::ParserParam;
use crate::logql::ast::UNWRAP_ENTRY;
use crate::logql::json_path;
use crate::logql::template::Template;
use crate::Error;
use regex::Regex;
use serde_json::Value;

/// The label set on lines a parser could not decode.
pub const ERROR_LABEL: &str = "__error__";

fn compile(re: &str) -> Result<Regex, Error> {
    Regex::new(re).map_err(|e| {
        Error::not_supported(format!("invalid regular expression: {e}"))
    })
}

// The regular expression of a `|>` pattern: every `<name>` placeholder
// matches any text, the rest matches literally.
fn pattern_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?s)^");
    let mut rest = pattern;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let slashes =
            rest[..start].chars().rev().take_while(|c| *c == '\\').count();
        let placeholder = slashes % 2 == 0
            && !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if slashes % 2 == 1 {
            out.push_str(&regex::escape(&rest[..start - 1]));
            out.push('<');
            rest = &rest[start + 1..];
        } else if placeholder {
            out.push_str(&regex::escape(&rest[..start]));
            out.push_str(".*?");
            rest = &rest[start + len + 1..];
        } else {
            out.push_str(&regex::escape(&rest[..start + 1]));
            rest = &rest[start + 1..];
        }
    }
    out.push_str(&regex::escape(rest));
    out.push('$');
    out
}

pub(crate) struct LineFilterStage {
    op: LineFilterOp,
    value: String,
    re: Option<Regex>,
}

impl LineFilterStage {
    pub fn new(filter: &LineFilter) -> Result<Self, Error> {
        let re = match filter.op {
            LineFilterOp::Regex | LineFilterOp::NotRegex => {
                Some(compile(&filter.value)?)
            }
            LineFilterOp::Pattern => {
                Some(compile(&pattern_to_regex(&filter.value))?)
            }
            LineFilterOp::Contains | LineFilterOp::NotContains => None,
        };
        Ok(Self { op: filter.op, value: filter.value.clone(), re })
    }

    fn keep(&self, line: &str) -> bool {
        if self.value.is_empty() {
            return true;
        }
        let found = match &self.re {
            Some(re) => re.is_match(line),
            None => line.contains(self.value.as_str()),
        };
        match self.op {
            LineFilterOp::NotContains | LineFilterOp::NotRegex => !found,
            _ => found,
        }
    }
}

impl Transform for LineFilterStage {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        if self.keep(&entry.message) {
            out.push(entry);
        }
        Ok(())
    }
}

/// Evaluate a label filter against a label set. Numeric and duration
/// comparisons over values that do not parse are false.
pub(crate) fn label_filter_matches(
    filter: &LabelFilter,
    labels: &Labels,
) -> Result<bool, Error> {
    let value = |name: &str| labels.get(name).map(String::as_str).unwrap_or("");
    Ok(match filter {
        LabelFilter::Match(m) => m.op.matches(&m.value, value(&m.name))?,
        LabelFilter::Number { label, op, value: expected } => value(label)
            .parse::<f64>()
            .is_ok_and(|v| op.apply(v, *expected)),
        LabelFilter::Duration { label, op, value: expected } => {
            parse_duration(value(label)).is_ok_and(|d| {
                op.apply(d.as_secs_f64(), expected.as_secs_f64())
            })
        }
        LabelFilter::And(a, b) => {
            label_filter_matches(a, labels)? && label_filter_matches(b, labels)?
        }
        LabelFilter::Or(a, b) => {
            label_filter_matches(a, labels)? || label_filter_matches(b, labels)?
        }
    })
}

pub(crate) struct LabelFilterStage(pub LabelFilter);

impl Transform for LabelFilterStage {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        if label_filter_matches(&self.0, &entry.labels)? {
            out.push(entry);
        }
        Ok(())
    }
}

// Label names may only contain ASCII letters, digits and underscores.
fn sanitize_label(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn flatten_json(
    prefix: &str,
    object: &serde_json::Map<String, Value>,
    labels: &mut Labels,
) {
    for (key, value) in object.iter() {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match value {
            Value::Object(inner) => flatten_json(&name, inner, labels),
            Value::String(s) if s.is_empty() => (),
            Value::String(s) => {
                labels.insert(sanitize_label(&name), s.clone());
            }
            Value::Number(_) | Value::Bool(_) => {
                labels.insert(sanitize_label(&name), value.to_string());
            }
            Value::Array(_) | Value::Null => (),
        }
    }
}

enum LineParser {
    Json,
    JsonPaths(Vec<(String, Vec<json_path::Segment>)>),
    Logfmt,
    LogfmtKeys(Vec<ParserParam>),
    Regexp(Regex),
}

/// `| json`, `| logfmt` and `| regexp`, with or without named fields.
pub(crate) struct ParserStage(LineParser);

impl ParserStage {
    pub fn new(parser: &Parser) -> Result<Self, Error> {
        Ok(Self(match parser {
            Parser::Json(params) if params.is_empty() => LineParser::Json,
            Parser::Json(params) => LineParser::JsonPaths(
                params
                    .iter()
                    .map(|p| Ok((p.label.clone(), json_path::parse(p.path())?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Parser::Logfmt(params) if params.is_empty() => LineParser::Logfmt,
            Parser::Logfmt(params) => LineParser::LogfmtKeys(params.clone()),
            Parser::Regexp(re) => {
                let re = compile(re)?;
                if re.capture_names().flatten().next().is_none() {
                    return Err(Error::not_supported(
                        "regexp parser without named capture groups",
                    ));
                }
                LineParser::Regexp(re)
            }
        }))
    }

    fn parse(&self, line: &str, labels: &mut Labels) {
        match &self.0 {
            LineParser::Json => match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(object)) => flatten_json("", &object, labels),
                Ok(_) => (),
                Err(_) => {
                    labels.insert(ERROR_LABEL.into(), "JSONParserErr".into());
                }
            },
            LineParser::JsonPaths(paths) => {
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    labels.insert(ERROR_LABEL.into(), "JSONParserErr".into());
                    return;
                };
                for (label, path) in paths.iter() {
                    if let Some(text) = json_path::lookup(&value, path)
                        .and_then(json_path::scalar_text)
                    {
                        labels.insert(label.clone(), text);
                    }
                }
            }
            LineParser::Logfmt | LineParser::LogfmtKeys(_) => {
                let Ok(pairs) = logfmt::parse(line) else {
                    labels.insert(ERROR_LABEL.into(), "LogfmtParserErr".into());
                    return;
                };
                for (key, value) in pairs {
                    match &self.0 {
                        LineParser::LogfmtKeys(params) => {
                            for p in params.iter().filter(|p| p.path() == key) {
                                labels.insert(p.label.clone(), value.clone());
                            }
                        }
                        _ => {
                            labels.insert(sanitize_label(&key), value);
                        }
                    }
                }
            }
            LineParser::Regexp(re) => {
                let Some(caps) = re.captures(line) else {
                    return;
                };
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name).filter(|m| !m.is_empty()) {
                        labels.insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
        }
    }
}

impl Transform for ParserStage {
    fn entry(
        &mut self,
        mut entry: LogEntry,
        out: &mut Batch,
    ) -> Result<(), Error> {
        self.parse(&entry.message, &mut entry.labels);
        entry.refresh_fingerprint();
        out.push(entry);
        Ok(())
    }
}

pub(crate) struct LineFormatStage(Template);

impl LineFormatStage {
    pub fn new(template: &str) -> Result<Self, Error> {
        Ok(Self(Template::parse(template)?))
    }
}

impl Transform for LineFormatStage {
    fn entry(
        &mut self,
        mut entry: LogEntry,
        out: &mut Batch,
    ) -> Result<(), Error> {
        entry.message = self.0.render(&entry.labels, &entry.message);
        out.push(entry);
        Ok(())
    }
}

enum FormatValue {
    Rename(String),
    Template(Template),
}

/// `| label_format dst=src, dst2="{{.a}}"`. Renamed source labels are
/// removed, and empty results drop the label.
pub(crate) struct LabelFormatStage(Vec<(String, FormatValue)>);

impl LabelFormatStage {
    pub fn new(ops: &[LabelFormatOp]) -> Result<Self, Error> {
        let ops = ops
            .iter()
            .map(|op| {
                let value = match &op.value {
                    LabelFormatValue::Rename(src) => {
                        FormatValue::Rename(src.clone())
                    }
                    LabelFormatValue::Template(t) => {
                        FormatValue::Template(Template::parse(t)?)
                    }
                };
                Ok((op.label.clone(), value))
            })
            .collect::<Result<_, Error>>()?;
        Ok(Self(ops))
    }
}

impl Transform for LabelFormatStage {
    fn entry(
        &mut self,
        mut entry: LogEntry,
        out: &mut Batch,
    ) -> Result<(), Error> {
        // Every value is computed from the labels before the stage.
        let mut updates = Vec::with_capacity(self.0.len());
        let mut renamed = Vec::new();
        for (dst, value) in self.0.iter() {
            let v = match value {
                FormatValue::Rename(src) => {
                    renamed.push(src.as_str());
                    entry.labels.get(src).cloned().unwrap_or_default()
                }
                FormatValue::Template(t) => {
                    t.render(&entry.labels, &entry.message)
                }
            };
            updates.push((dst.clone(), v));
        }
        for src in renamed {
            entry.labels.remove(src);
        }
        for (dst, v) in updates {
            if v.is_empty() {
                entry.labels.remove(&dst);
            } else {
                entry.labels.insert(dst, v);
            }
        }
        entry.refresh_fingerprint();
        out.push(entry);
        Ok(())
    }
}

pub(crate) struct DropStage(pub Vec<DropParam>);

impl Transform for DropStage {
    fn entry(
        &mut self,
        mut entry: LogEntry,
        out: &mut Batch,
    ) -> Result<(), Error> {
        entry.labels.retain(|k, v| {
            !self.0.iter().any(|p| {
                p.label == *k && p.value.as_ref().map_or(true, |x| x == v)
            })
        });
        entry.refresh_fingerprint();
        out.push(entry);
        Ok(())
    }
}

/// Read the sample value from a label, or from the line for `_entry`.
/// Values that do not parse are zero.
pub(crate) struct UnwrapStage(pub String);

impl Transform for UnwrapStage {
    fn entry(
        &mut self,
        mut entry: LogEntry,
        out: &mut Batch,
    ) -> Result<(), Error> {
        let raw = if self.0 == UNWRAP_ENTRY {
            entry.message.as_str()
        } else {
            entry.labels.get(&self.0).map(String::as_str).unwrap_or("")
        };
        entry.value = raw.trim().parse().unwrap_or(0.0);
        out.push(entry);
        Ok(())
    }
}

/// Pass the first `limit` lines. Zero passes everything.
pub(crate) struct LimitStage {
    limit: u64,
    seen: u64,
}

impl LimitStage {
    pub fn new(limit: i64) -> Self {
        Self { limit: u64::try_from(limit).unwrap_or(0), seen: 0 }
    }
}

impl Transform for LimitStage {
    fn entry(&mut self, entry: LogEntry, out: &mut Batch) -> Result<(), Error> {
        self.seen += 1;
        out.push(entry);
        Ok(())
    }

    fn done(&self) -> bool {
        self.limit > 0 && self.seen >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logql::ast::Comparator;
    use crate::logql::ast::LabelMatcher;
    use crate::logql::ast::MatchOp;
    use crate::residual::tests::labels;
    use crate::residual::tests::line;
    use crate::residual::tests::run;
    use std::time::Duration;

    fn filter(op: LineFilterOp, value: &str) -> LineFilterStage {
        LineFilterStage::new(&LineFilter { op, value: value.into() }).unwrap()
    }

    #[test]
    fn test_line_filters() {
        assert!(filter(LineFilterOp::Contains, "err").keep("an error"));
        assert!(!filter(LineFilterOp::NotContains, "err").keep("an error"));
        assert!(filter(LineFilterOp::Regex, "e.r").keep("an error"));
        assert!(filter(LineFilterOp::NotRegex, "^x").keep("an error"));
        assert!(filter(LineFilterOp::Contains, "").keep("anything"));
        let p = filter(LineFilterOp::Pattern, "<_> took <ms>ms");
        assert!(p.keep("GET / took 12ms"));
        assert!(!p.keep("GET / took 12ms later"));
        assert!(filter(LineFilterOp::Pattern, r"a \<b>").keep("a <b>"));
        assert!(LineFilterStage::new(&LineFilter {
            op: LineFilterOp::Regex,
            value: "(".into()
        })
        .is_err());
    }

    #[test]
    fn test_label_filter() {
        let l = labels(&[("status", "503"), ("took", "1.5s"), ("app", "api")]);
        let f = LabelFilter::And(
            Box::new(LabelFilter::Number {
                label: "status".into(),
                op: Comparator::Ge,
                value: 500.0,
            }),
            Box::new(LabelFilter::Duration {
                label: "took".into(),
                op: Comparator::Gt,
                value: Duration::from_secs(1),
            }),
        );
        assert!(label_filter_matches(&f, &l).unwrap());
        let f = LabelFilter::Match(LabelMatcher::new("app", MatchOp::Re, "a"));
        assert!(!label_filter_matches(&f, &l).unwrap());
        let f = LabelFilter::Number {
            label: "app".into(),
            op: Comparator::Ne,
            value: 0.0,
        };
        assert!(!label_filter_matches(&f, &l).unwrap());
        let f = LabelFilter::Match(LabelMatcher::new(
            "missing",
            MatchOp::Eq,
            "",
        ));
        assert!(label_filter_matches(&f, &l).unwrap());
    }

    #[test]
    fn test_json_parser() {
        let mut p = ParserStage::new(&Parser::Json(vec![])).unwrap();
        let out = run(
            &mut p,
            vec![
                line(
                    1,
                    labels(&[("app", "api")]),
                    r#"{"a":{"b-c":1},"s":"x","l":[1],"e":""}"#,
                ),
                line(2, labels(&[]), "not json"),
            ],
        );
        assert_eq!(
            out[0].labels,
            labels(&[("app", "api"), ("a_b_c", "1"), ("s", "x")])
        );
        assert_eq!(
            out[0].fingerprint,
            crate::entry::fingerprint(&out[0].labels)
        );
        assert_eq!(
            out[1].labels.get(ERROR_LABEL).map(String::as_str),
            Some("JSONParserErr")
        );
    }

    #[test]
    fn test_json_parser_with_paths() {
        let mut p = ParserStage::new(&Parser::Json(vec![
            ParserParam {
                label: "user".into(),
                path: Some("req.users[1]".into()),
            },
            ParserParam { label: "code".into(), path: None },
        ]))
        .unwrap();
        let out = run(
            &mut p,
            vec![line(
                1,
                labels(&[]),
                r#"{"req":{"users":["a","b"]},"code":200}"#,
            )],
        );
        assert_eq!(out[0].labels, labels(&[("user", "b"), ("code", "200")]));
    }

    #[test]
    fn test_logfmt_and_regexp_parsers() {
        let mut p = ParserStage::new(&Parser::Logfmt(vec![])).unwrap();
        let out = run(
            &mut p,
            vec![line(
                1,
                labels(&[]),
                r#"level=info msg="hello world" dur-ms=5"#,
            )],
        );
        assert_eq!(
            out[0].labels,
            labels(&[
                ("level", "info"),
                ("msg", "hello world"),
                ("dur_ms", "5"),
            ])
        );

        let mut p = ParserStage::new(&Parser::Logfmt(vec![ParserParam {
            label: "lvl".into(),
            path: Some("level".into()),
        }]))
        .unwrap();
        let out = run(&mut p, vec![line(1, labels(&[]), "level=warn x=y")]);
        assert_eq!(out[0].labels, labels(&[("lvl", "warn")]));

        let mut p = ParserStage::new(&Parser::Regexp(
            r"(?P<method>\w+) (?P<path>\S*)".into(),
        ))
        .unwrap();
        let out = run(&mut p, vec![line(1, labels(&[]), "GET /")]);
        assert_eq!(out[0].labels, labels(&[("method", "GET"), ("path", "/")]));
        assert!(ParserStage::new(&Parser::Regexp("(a)".into())).is_err());
    }

    #[test]
    fn test_formatting() {
        let mut p = LineFormatStage::new("{{.level}}: {{ __line__ }}").unwrap();
        let out = run(&mut p, vec![line(1, labels(&[("level", "warn")]), "x")]);
        assert_eq!(out[0].message, "warn: x");

        let mut p = LabelFormatStage::new(&[
            LabelFormatOp {
                label: "dst".into(),
                value: LabelFormatValue::Rename("src".into()),
            },
            LabelFormatOp {
                label: "both".into(),
                value: LabelFormatValue::Template("{{.a}}-{{.src}}".into()),
            },
            LabelFormatOp {
                label: "a".into(),
                value: LabelFormatValue::Template("{{.missing}}".into()),
            },
        ])
        .unwrap();
        let out =
            run(&mut p, vec![line(1, labels(&[("src", "s"), ("a", "1")]), "")]);
        assert_eq!(out[0].labels, labels(&[("dst", "s"), ("both", "1-s")]));

        let mut p = DropStage(vec![
            DropParam { label: "a".into(), value: None },
            DropParam { label: "b".into(), value: Some("x".into()) },
        ]);
        let out = run(
            &mut p,
            vec![line(1, labels(&[("a", "1"), ("b", "x"), ("c", "2")]), "")],
        );
        assert_eq!(out[0].labels, labels(&[("c", "2")]));
    }

    #[test]
    fn test_unwrap_and_limit() {
        let mut p = UnwrapStage("ms".into());
        let out = run(
            &mut p,
            vec![
                line(1, labels(&[("ms", "12.5")]), ""),
                line(2, labels(&[("ms", "n/a")]), ""),
            ],
        );
        assert_eq!(out[0].value, 12.5);
        assert_eq!(out[1].value, 0.0);
        let mut p = UnwrapStage(UNWRAP_ENTRY.into());
        let out = run(&mut p, vec![line(1, labels(&[]), " 7 ")]);
        assert_eq!(out[0].value, 7.0);

        let mut limit = LimitStage::new(2);
        let mut out = vec![];
        limit.entry(line(1, labels(&[]), ""), &mut out).unwrap();
        assert!(!limit.done());
        limit.entry(line(2, labels(&[]), ""), &mut out).unwrap();
        assert!(limit.done());
        assert!(!LimitStage::new(0).done());
    }
}
