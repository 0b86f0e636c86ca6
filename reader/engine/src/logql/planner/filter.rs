// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line filters, label filters and the pipeline stages evaluated in SQL over
//! joined label sets.

// Copyright 2024 Oxide Computer Company

use super::select::match_cond;
use crate::context::PlannerContext;
use crate::logql::ast::DropParam;
use crate::logql::ast::LabelFilter;
use crate::logql::ast::LabelFormatOp;
use crate::logql::ast::LabelFormatValue;
use crate::logql::ast::LineFilter;
use crate::logql::ast::LineFilterOp;
use crate::logql::ast::Parser;
use crate::logql::ast::ParserParam;
use crate::logql::ast::Stage;
use crate::logql::ast::UNWRAP_ENTRY;
use crate::logql::json_path;
use crate::logql::template::Piece;
use crate::logql::template::Template;
use crate::planner::BoxPlanner;
use crate::planner::Planner;
use crate::Error;
use sql_select::quote;
use sql_select::Column;
use sql_select::Cte;
use sql_select::Expr;
use sql_select::Select;
use sql_select::Source;

const REGEX_META: &[char] =
    &['\\', '.', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$'];

const EMPTY_MAP: &str = "CAST(map(), 'Map(String, String)')";

// Durations ClickHouse's parseTimeDelta understands.
const DURATION_RE: &str = r"^([0-9]+(\.[0-9]+)?(ns|us|µs|ms|s|m|h|d|w))+$";

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// The `LIKE` pattern of a `|>` pattern filter. Every `<name>` placeholder,
/// including `<_>`, matches any text. `\<` is a literal `<`.
pub(crate) fn pattern_to_like(pattern: &str) -> String {
    let mut out = String::new();
    let mut rest = pattern;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let slashes =
            rest[..start].chars().rev().take_while(|c| *c == '\\').count();
        if slashes % 2 == 1 {
            out.push_str(&escape_like(&rest[..start - 1]));
            out.push('<');
            rest = &rest[start + 1..];
            continue;
        }
        if name.is_empty()
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            out.push_str(&escape_like(&rest[..start + 1]));
            rest = &rest[start + 1..];
            continue;
        }
        out.push_str(&escape_like(&rest[..start]));
        if !out.ends_with('%') || out.ends_with("\\%") {
            out.push('%');
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(&escape_like(rest));
    out
}

// A regular expression matching a plain string can be a LIKE.
fn regex_literal(re: &str) -> Option<(bool, &str)> {
    let (insensitive, body) = match re.strip_prefix("(?i)") {
        Some(body) => (true, body),
        None => (false, re),
    };
    (!body.is_empty() && !body.contains(REGEX_META))
        .then_some((insensitive, body))
}

/// The condition of a line filter over `column`, or nothing if the filter
/// keeps every line.
pub(crate) fn line_filter_cond(
    filter: &LineFilter,
    column: &str,
) -> Option<Expr> {
    let col = || Expr::raw(column);
    let contains = |func: &str, value: &str| {
        let pattern = format!("%{}%", escape_like(value));
        Expr::func(func, vec![col(), Expr::str(pattern)])
    };
    if filter.value.is_empty() {
        return None;
    }
    Some(match filter.op {
        LineFilterOp::Contains => contains("like", &filter.value),
        LineFilterOp::NotContains => contains("notLike", &filter.value),
        LineFilterOp::Regex | LineFilterOp::NotRegex => {
            let negate = filter.op == LineFilterOp::NotRegex;
            match regex_literal(&filter.value) {
                Some((insensitive, lit)) => {
                    let func = match (insensitive, negate) {
                        (false, false) => "like",
                        (false, true) => "notLike",
                        (true, false) => "ilike",
                        (true, true) => "notILike",
                    };
                    contains(func, lit)
                }
                None => Expr::eq(
                    Expr::func(
                        "match",
                        vec![col(), Expr::str(filter.value.as_str())],
                    ),
                    Expr::int(if negate { 0 } else { 1 }),
                ),
            }
        }
        LineFilterOp::Pattern => Expr::func(
            "like",
            vec![col(), Expr::str(pattern_to_like(&filter.value))],
        ),
    })
}

/// The condition of a label filter, reading label values with `label`.
pub(crate) fn label_filter_cond(
    filter: &LabelFilter,
    label: &dyn Fn(&str) -> Expr,
) -> Expr {
    match filter {
        LabelFilter::Match(m) => match_cond(label(&m.name), m.op, &m.value),
        LabelFilter::Number { label: name, op, value } => Expr::cmp(
            op.as_cmp_op(),
            Expr::func("toFloat64OrNull", vec![label(name)]),
            Expr::float(*value),
        ),
        LabelFilter::Duration { label: name, op, value } => {
            let secs = Expr::func(
                "if",
                vec![
                    Expr::eq(
                        Expr::func(
                            "match",
                            vec![label(name), Expr::str(DURATION_RE)],
                        ),
                        Expr::int(1),
                    ),
                    Expr::func("parseTimeDelta", vec![label(name)]),
                    Expr::raw("NULL"),
                ],
            );
            Expr::cmp(op.as_cmp_op(), secs, Expr::float(value.as_secs_f64()))
        }
        LabelFilter::And(a, b) => Expr::and(vec![
            label_filter_cond(a, label),
            label_filter_cond(b, label),
        ]),
        LabelFilter::Or(a, b) => Expr::or(vec![
            label_filter_cond(a, label),
            label_filter_cond(b, label),
        ]),
    }
}

/// Keep the rows of `main` matching a line filter.
#[derive(Debug)]
pub struct LineFilterPlanner {
    pub main: BoxPlanner,
    pub filter: LineFilter,
    pub column: String,
}

impl Planner for LineFilterPlanner {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        Ok(main.and_where(line_filter_cond(&self.filter, &self.column)))
    }
}

/// Evaluate one pipeline stage over rows carrying their labels.
///
/// The rows of `main` have the columns `fingerprint`, `timestamp_ns`,
/// `labels`, `string` and `value`, and so does the result. Stages changing
/// the labels also recompute the fingerprint.
#[derive(Debug)]
pub struct JoinedStage {
    pub main: BoxPlanner,
    pub stage: Stage,
}

struct Row<'a> {
    alias: &'a str,
}

impl Row<'_> {
    fn column(&self, name: &str) -> Expr {
        Expr::raw(format!("{}.{}", self.alias, name))
    }

    fn label(&self, name: &str) -> Expr {
        Expr::raw(format!("{}.labels[{}]", self.alias, quote(name)))
    }

    // Merge non-empty values into the labels.
    fn update_labels(&self, kv: Vec<Expr>) -> Expr {
        Expr::func(
            "mapUpdate",
            vec![
                self.column("labels"),
                Expr::func(
                    "mapFilter",
                    vec![Expr::raw("(k, v) -> v != ''"), Expr::func("map", kv)],
                ),
            ],
        )
    }
}

impl Planner for JoinedStage {
    fn process(&self, ctx: &PlannerContext) -> Result<Select, Error> {
        let main = self.main.process(ctx)?;
        let alias = ctx.next_alias("stage");
        let row = Row { alias: &alias };
        let mut conds = Vec::new();
        let mut labels = None;
        let mut value = row.column("value");
        match &self.stage {
            Stage::LineFilter(f) => {
                conds.extend(line_filter_cond(f, &format!("{alias}.string")));
            }
            Stage::LabelFilter(f) => {
                conds.push(label_filter_cond(f, &|name| row.label(name)));
            }
            Stage::Parser(Parser::Json(params)) if !params.is_empty() => {
                labels = Some(json_labels(&row, params)?);
            }
            Stage::Parser(Parser::Regexp(re)) => {
                labels = Some(regexp_labels(&row, re)?);
            }
            Stage::LabelFormat(ops) => {
                labels = Some(label_format(&row, ops)?);
            }
            Stage::Drop(params) => {
                if !params.is_empty() {
                    labels = Some(drop_labels(&row, params));
                }
            }
            Stage::Unwrap(u) => {
                let src = if u.label == UNWRAP_ENTRY {
                    row.column("string")
                } else {
                    row.label(&u.label)
                };
                value = Expr::func("toFloat64OrZero", vec![src]);
            }
            stage @ (Stage::Parser(_) | Stage::LineFormat(_)) => {
                return Err(Error::planning(format!(
                    "stage {stage:?} cannot be evaluated in SQL"
                )));
            }
        }
        let (fingerprint, labels) = match labels {
            Some(labels) => {
                (Expr::func("cityHash64", vec![labels.clone()]), labels)
            }
            None => (row.column("fingerprint"), row.column("labels")),
        };
        Ok(Select::new()
            .select([
                Column::new(fingerprint, "fingerprint"),
                Column::new(row.column("timestamp_ns"), "timestamp_ns"),
                Column::new(labels, "labels"),
                Column::new(row.column("string"), "string"),
                Column::new(value, "value"),
            ])
            .from(Source::cte(alias.as_str()))
            .and_where(conds)
            .with(Cte::new(alias.as_str(), main)))
    }
}

// `JSONExtractString` yields nothing for numbers and booleans, so those are
// read as raw JSON text.
fn json_extract(row: &Row<'_>, param: &ParserParam) -> Result<Expr, Error> {
    let mut args = vec![row.column("string")];
    for seg in json_path::parse(param.path())? {
        args.push(match seg {
            json_path::Segment::Key(k) => Expr::str(k),
            json_path::Segment::Index(i) => Expr::int(i as i64 + 1),
        });
    }
    Ok(Expr::func(
        "if",
        vec![
            Expr::eq(Expr::func("JSONType", args.clone()), Expr::str("String")),
            Expr::func("JSONExtractString", args.clone()),
            Expr::func("JSONExtractRaw", args),
        ],
    ))
}

fn json_labels(row: &Row<'_>, params: &[ParserParam]) -> Result<Expr, Error> {
    let mut kv = Vec::new();
    for p in params {
        kv.push(Expr::str(p.label.as_str()));
        kv.push(json_extract(row, p)?);
    }
    Ok(row.update_labels(kv))
}

fn regexp_labels(row: &Row<'_>, re: &str) -> Result<Expr, Error> {
    let compiled = regex::Regex::new(re)
        .map_err(|e| Error::not_supported(format!("invalid regexp: {e}")))?;
    let names = compiled
        .capture_names()
        .skip(1)
        .map(|n| n.unwrap_or(""))
        .collect::<Vec<_>>();
    if names.iter().all(|n| n.is_empty()) {
        return Err(Error::not_supported("regexp without named groups"));
    }
    let groups = || {
        Expr::func(
            "extractAllGroups",
            vec![row.column("string"), Expr::str(re)],
        )
    };
    let names = names.iter().map(|n| quote(n)).collect::<Vec<_>>();
    let extracted = Expr::func(
        "if",
        vec![
            Expr::gt(Expr::func("length", vec![groups()]), Expr::int(0)),
            Expr::func(
                "mapFromArrays",
                vec![
                    Expr::raw(format!("[{}]", names.join(", "))),
                    Expr::func("arrayElement", vec![groups(), Expr::int(1)]),
                ],
            ),
            Expr::raw(EMPTY_MAP),
        ],
    );
    Ok(Expr::func(
        "mapUpdate",
        vec![
            row.column("labels"),
            Expr::func(
                "mapFilter",
                vec![Expr::raw("(k, v) -> k != '' AND v != ''"), extracted],
            ),
        ],
    ))
}

fn template_expr(row: &Row<'_>, template: &str) -> Result<Expr, Error> {
    let mut parts = Template::parse(template)?
        .0
        .into_iter()
        .map(|piece| match piece {
            Piece::Text(t) => Expr::str(t),
            Piece::Label(l) => row.label(&l),
            Piece::Line => row.column("string"),
        })
        .collect::<Vec<_>>();
    Ok(match parts.len() {
        0 => Expr::str(""),
        1 => parts.remove(0),
        _ => Expr::func("concat", parts),
    })
}

// Every operation reads the labels as they were before the stage.
fn label_format(row: &Row<'_>, ops: &[LabelFormatOp]) -> Result<Expr, Error> {
    let mut kv = Vec::new();
    let mut renamed = Vec::new();
    for op in ops {
        kv.push(Expr::str(op.label.as_str()));
        match &op.value {
            LabelFormatValue::Rename(src) => {
                kv.push(row.label(src));
                if src != &op.label {
                    renamed.push(quote(src));
                }
            }
            LabelFormatValue::Template(t) => kv.push(template_expr(row, t)?),
        }
    }
    let updated = row.update_labels(kv);
    if renamed.is_empty() {
        return Ok(updated);
    }
    Ok(Expr::func(
        "mapFilter",
        vec![
            Expr::raw(format!("(k, v) -> k NOT IN ({})", renamed.join(", "))),
            updated,
        ],
    ))
}

fn drop_labels(row: &Row<'_>, params: &[DropParam]) -> Expr {
    let conds = params
        .iter()
        .map(|p| match &p.value {
            Some(v) => {
                format!("(k = {} AND v = {})", quote(&p.label), quote(v))
            }
            None => format!("k = {}", quote(&p.label)),
        })
        .collect::<Vec<_>>();
    Expr::func(
        "mapFilter",
        vec![
            Expr::raw(format!("(k, v) -> NOT ({})", conds.join(" OR "))),
            row.column("labels"),
        ],
    )
}
