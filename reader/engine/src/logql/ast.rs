// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AST for the log query language.
//!
//! Queries arrive already parsed, serialized as JSON. Every node is a closed
//! enum or struct, so walking the tree is an exhaustive match.

// Copyright 2024 Oxide Computer Company

use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use sql_select::CmpOp;
use std::time::Duration;

/// A label matcher of a stream selector, `name op "value"`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(name: &str, op: MatchOp, value: &str) -> Self {
        Self { name: name.to_string(), op, value: value.to_string() }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum MatchOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "=~")]
    Re,
    #[serde(rename = "!~")]
    NotRe,
}

impl MatchOp {
    /// Evaluate the matcher against a value. Regular expressions match the
    /// whole value.
    pub fn matches(&self, pattern: &str, value: &str) -> Result<bool, Error> {
        match self {
            MatchOp::Eq => Ok(value == pattern),
            MatchOp::Ne => Ok(value != pattern),
            MatchOp::Re | MatchOp::NotRe => {
                let re = anchored_regex(pattern)?;
                Ok(re.is_match(value) == (*self == MatchOp::Re))
            }
        }
    }
}

pub(crate) fn anchored_regex(pattern: &str) -> Result<regex::Regex, Error> {
    regex::Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        Error::not_supported(format!("invalid regular expression: {e}"))
    })
}

/// `{matchers} | pipeline...`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StrSelector {
    pub matchers: Vec<LabelMatcher>,
    #[serde(default)]
    pub pipeline: Vec<Stage>,
}

/// A stage of the log pipeline.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LineFilter(LineFilter),
    LabelFilter(LabelFilter),
    Parser(Parser),
    /// `| line_format "template"`
    LineFormat(String),
    LabelFormat(Vec<LabelFormatOp>),
    Unwrap(Unwrap),
    Drop(Vec<DropParam>),
}

impl Stage {
    pub fn is_parser(&self) -> bool {
        matches!(self, Stage::Parser(_))
    }

    /// Return true if this stage can only run over the raw line in the
    /// residual pipeline: a structured parser with no field names, or a
    /// line reformat.
    pub fn needs_residual(&self) -> bool {
        match self {
            Stage::Parser(Parser::Json(params)) => params.is_empty(),
            Stage::Parser(Parser::Logfmt(_)) => true,
            Stage::LineFormat(_) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LineFilter {
    pub op: LineFilterOp,
    pub value: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum LineFilterOp {
    #[serde(rename = "|=")]
    Contains,
    #[serde(rename = "!=")]
    NotContains,
    #[serde(rename = "|~")]
    Regex,
    #[serde(rename = "!~")]
    NotRegex,
    /// A pattern with `<_>` placeholders matching any text.
    #[serde(rename = "|>")]
    Pattern,
}

/// A boolean expression over labels.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelFilter {
    /// A string matcher.
    Match(LabelMatcher),
    /// A numeric comparison.
    Number { label: String, op: Comparator, value: f64 },
    /// A comparison against a duration, with the label parsed as one.
    Duration {
        label: String,
        op: Comparator,
        #[serde(with = "duration_str")]
        value: Duration,
    },
    And(Box<LabelFilter>, Box<LabelFilter>),
    Or(Box<LabelFilter>, Box<LabelFilter>),
}

/// A structured parser stage.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parser {
    Json(Vec<ParserParam>),
    Logfmt(Vec<ParserParam>),
    /// A regular expression with named capture groups.
    Regexp(String),
}

/// `label="path"` restricting a parser to named fields.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParserParam {
    pub label: String,
    /// The field path, `a.b[0]` for JSON. Defaults to the label.
    #[serde(default)]
    pub path: Option<String>,
}

impl ParserParam {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LabelFormatOp {
    pub label: String,
    pub value: LabelFormatValue,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelFormatValue {
    /// `dst=src`, renaming a label.
    Rename(String),
    /// `dst="{{.a}}-{{.b}}"`
    Template(String),
}

/// The label to read numeric values from. `_entry` means the line itself.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Unwrap {
    pub label: String,
}

pub const UNWRAP_ENTRY: &str = "_entry";

/// A label to drop, optionally only when it has the given value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DropParam {
    pub label: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// `==`, `!=`, `>`, `>=`, `<`, `<=`
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Comparator {
    pub fn as_cmp_op(&self) -> CmpOp {
        match self {
            Comparator::Eq => CmpOp::Eq,
            Comparator::Ne => CmpOp::Ne,
            Comparator::Gt => CmpOp::Gt,
            Comparator::Ge => CmpOp::Ge,
            Comparator::Lt => CmpOp::Lt,
            Comparator::Le => CmpOp::Le,
        }
    }

    pub fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Eq => left == right,
            Comparator::Ne => left != right,
            Comparator::Gt => left > right,
            Comparator::Ge => left >= right,
            Comparator::Lt => left < right,
            Comparator::Le => left <= right,
        }
    }
}

/// A filter over the values of a metric query, `> 10`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Comparison {
    pub op: Comparator,
    pub value: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    By(Vec<String>),
    Without(Vec<String>),
}

impl Grouping {
    /// Keep the labels selected by this grouping.
    pub fn apply(&self, labels: &crate::entry::Labels) -> crate::entry::Labels {
        labels
            .iter()
            .filter(|(k, _)| match self {
                Grouping::By(names) => names.contains(k),
                Grouping::Without(names) => !names.contains(k),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Functions aggregating a log stream over a range.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[serde(rename_all = "snake_case")]
pub enum RangeFn {
    Rate,
    CountOverTime,
    BytesRate,
    BytesOverTime,
    AbsentOverTime,
    SumOverTime,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    FirstOverTime,
    LastOverTime,
    StddevOverTime,
    StdvarOverTime,
}

impl RangeFn {
    pub fn name(&self) -> &'static str {
        match self {
            RangeFn::Rate => "rate",
            RangeFn::CountOverTime => "count_over_time",
            RangeFn::BytesRate => "bytes_rate",
            RangeFn::BytesOverTime => "bytes_over_time",
            RangeFn::AbsentOverTime => "absent_over_time",
            RangeFn::SumOverTime => "sum_over_time",
            RangeFn::AvgOverTime => "avg_over_time",
            RangeFn::MinOverTime => "min_over_time",
            RangeFn::MaxOverTime => "max_over_time",
            RangeFn::FirstOverTime => "first_over_time",
            RangeFn::LastOverTime => "last_over_time",
            RangeFn::StddevOverTime => "stddev_over_time",
            RangeFn::StdvarOverTime => "stdvar_over_time",
        }
    }

    /// Return true if the function reads unwrapped values.
    pub fn is_unwrapped(&self) -> bool {
        !matches!(
            self,
            RangeFn::Rate
                | RangeFn::CountOverTime
                | RangeFn::BytesRate
                | RangeFn::BytesOverTime
                | RangeFn::AbsentOverTime
        )
    }
}

/// `fn(selector [range] offset x) by (...) > cmp`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RangeAggregation {
    pub func: RangeFn,
    pub selector: StrSelector,
    #[serde(with = "duration_str")]
    pub range: Duration,
    #[serde(default, with = "opt_duration_str")]
    pub offset: Option<Duration>,
    #[serde(default)]
    pub grouping: Option<Grouping>,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[serde(rename_all = "snake_case")]
pub enum VectorOp {
    Sum,
    Min,
    Max,
    Avg,
    Count,
    Stddev,
    Stdvar,
}

/// `op by (...) (range aggregation) > cmp`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VectorAggregation {
    pub op: VectorOp,
    #[serde(default)]
    pub grouping: Option<Grouping>,
    pub inner: RangeAggregation,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopKOp {
    Topk,
    Bottomk,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopKInner {
    Range(RangeAggregation),
    Vector(VectorAggregation),
    QuantileOverTime(QuantileOverTime),
}

/// `topk(k, inner)`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TopK {
    pub op: TopKOp,
    pub param: u64,
    pub inner: Box<TopKInner>,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

/// `quantile_over_time(q, selector | unwrap x [range]) by (...)`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QuantileOverTime {
    pub quantile: f64,
    pub selector: StrSelector,
    #[serde(with = "duration_str")]
    pub range: Duration,
    #[serde(default)]
    pub grouping: Option<Grouping>,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

/// A complete log query.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogQuery {
    Stream(StrSelector),
    Range(RangeAggregation),
    Vector(VectorAggregation),
    TopK(TopK),
    QuantileOverTime(QuantileOverTime),
}

impl LogQuery {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::not_supported(format!("invalid query: {e}")))
    }

    /// Return true if the query produces a matrix rather than log streams.
    pub fn is_matrix(&self) -> bool {
        !matches!(self, LogQuery::Stream(_))
    }

    /// The stream selector the query reads from.
    pub fn selector(&self) -> &StrSelector {
        match self {
            LogQuery::Stream(s) => s,
            LogQuery::Range(r) => &r.selector,
            LogQuery::Vector(v) => &v.inner.selector,
            LogQuery::TopK(t) => t.inner.selector(),
            LogQuery::QuantileOverTime(q) => &q.selector,
        }
    }

    pub fn selector_mut(&mut self) -> &mut StrSelector {
        match self {
            LogQuery::Stream(s) => s,
            LogQuery::Range(r) => &mut r.selector,
            LogQuery::Vector(v) => &mut v.inner.selector,
            LogQuery::TopK(t) => t.inner.selector_mut(),
            LogQuery::QuantileOverTime(q) => &mut q.selector,
        }
    }

    /// The innermost range aggregation, if any.
    pub fn range_aggregation(&self) -> Option<&RangeAggregation> {
        match self {
            LogQuery::Stream(_) | LogQuery::QuantileOverTime(_) => None,
            LogQuery::Range(r) => Some(r),
            LogQuery::Vector(v) => Some(&v.inner),
            LogQuery::TopK(t) => match t.inner.as_ref() {
                TopKInner::Range(r) => Some(r),
                TopKInner::Vector(v) => Some(&v.inner),
                TopKInner::QuantileOverTime(_) => None,
            },
        }
    }

    /// The range of the query, zero for log queries.
    pub fn duration(&self) -> Duration {
        match self {
            LogQuery::Stream(_) => Duration::ZERO,
            LogQuery::QuantileOverTime(q) => q.range,
            LogQuery::TopK(t) => match t.inner.as_ref() {
                TopKInner::QuantileOverTime(q) => q.range,
                TopKInner::Range(r) => r.range,
                TopKInner::Vector(v) => v.inner.range,
            },
            LogQuery::Range(r) => r.range,
            LogQuery::Vector(v) => v.inner.range,
        }
    }

    pub fn offset(&self) -> Option<Duration> {
        self.range_aggregation().and_then(|r| r.offset)
    }
}

impl TopKInner {
    fn selector(&self) -> &StrSelector {
        match self {
            TopKInner::Range(r) => &r.selector,
            TopKInner::Vector(v) => &v.inner.selector,
            TopKInner::QuantileOverTime(q) => &q.selector,
        }
    }

    fn selector_mut(&mut self) -> &mut StrSelector {
        match self {
            TopKInner::Range(r) => &mut r.selector,
            TopKInner::Vector(v) => &mut v.inner.selector,
            TopKInner::QuantileOverTime(q) => &mut q.selector,
        }
    }
}

/// Parse a duration such as `5m`, `1h30m` or `250ms`.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let invalid = || Error::not_supported(format!("invalid duration '{s}'"));
    if s.is_empty() {
        return Err(invalid());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "d" => 86400e9,
            "w" => 7.0 * 86400e9,
            "y" => 365.0 * 86400e9,
            _ => return Err(invalid()),
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Format a duration the way the query languages write it.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 || ms == 0 {
        return format!("{ms}ms");
    }
    let secs = ms / 1000;
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

pub(crate) mod duration_str {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_duration_str {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(d)?
            .map(|s| {
                super::parse_duration(&s).map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
