//! Line protocol codec.
//!
//! Each non-empty line holds one metric:
//!
//! ```text
//! measurement[,tag_key=tag_value...] field_key=field_value[,field_key=field_value...] [timestamp]
//! ```
//!
//! Field values are floats (`1.5`), signed integers (`-3i`), unsigned integers (`3u`), booleans (`t`, `true`, `F`,
//! ...) or double-quoted strings. Lines starting with `#` are comments.
use std::{borrow::Cow, fmt::Write as _};

use harbor_core::{
    data_model::{FieldValue, Metric},
    ingest::Parser,
};
use harbor_error::{generic_error, GenericError};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, i64 as parse_i64, space0, space1, u64 as parse_u64},
    combinator::{map, opt, value},
    error::{Error, ErrorKind},
    multi::{many0, separated_list1},
    number::complete::double,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser as _,
};
use serde::Deserialize;

const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
const KEY_SPECIALS: &[char] = &[',', '=', ' '];

/// Unit of the timestamps in a line protocol payload.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum Precision {
    /// Nanoseconds.
    #[default]
    #[serde(rename = "ns")]
    Nanoseconds,

    /// Microseconds.
    #[serde(rename = "us")]
    Microseconds,

    /// Milliseconds.
    #[serde(rename = "ms")]
    Milliseconds,

    /// Seconds.
    #[serde(rename = "s")]
    Seconds,
}

impl Precision {
    const fn nanos_per_unit(&self) -> u64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
        }
    }
}

/// Line protocol parser.
///
/// Parsing is all-or-nothing: if any line is invalid, the whole payload is rejected and the error names the offending
/// line.
#[derive(Clone, Debug, Default)]
pub struct LineProtocolParser {
    precision: Precision,
}

impl LineProtocolParser {
    /// Creates a new `LineProtocolParser` that reads timestamps as nanoseconds.
    pub const fn new() -> Self {
        Self {
            precision: Precision::Nanoseconds,
        }
    }

    /// Sets the unit of payload timestamps.
    pub const fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

impl Parser for LineProtocolParser {
    fn parse(&self, payload: &[u8]) -> Result<Vec<Metric>, GenericError> {
        let payload = std::str::from_utf8(payload).map_err(|e| generic_error!("Payload is not valid UTF-8: {}", e))?;

        let mut metrics = Vec::new();
        for (index, line) in payload.lines().enumerate() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let metric = parse_line(line, self.precision)
                .map_err(|reason| generic_error!("Invalid line protocol on line {}: {}", index + 1, reason))?;
            metrics.push(metric);
        }

        Ok(metrics)
    }
}

struct RawLine<'a> {
    measurement: Cow<'a, str>,
    tags: Vec<(Cow<'a, str>, Cow<'a, str>)>,
    fields: Vec<(Cow<'a, str>, FieldValue)>,
    timestamp: Option<u64>,
}

fn parse_line(line: &str, precision: Precision) -> Result<Metric, String> {
    let column = |rest: &str| line.len() - rest.len() + 1;

    let raw = match terminated(metric_line, space0).parse(line) {
        Ok(("", raw)) => raw,
        Ok((rest, _)) => return Err(format!("unexpected input at column {}", column(rest))),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(format!("unexpected input at column {}", column(e.input)))
        }
        Err(nom::Err::Incomplete(_)) => return Err("line is incomplete".to_string()),
    };

    let mut metric = Metric::new(raw.measurement);
    for (key, value) in raw.tags {
        metric.insert_tag(key, value);
    }
    for (key, value) in raw.fields {
        metric = metric.with_field(key, value);
    }
    if let Some(timestamp) = raw.timestamp {
        let timestamp_ns = timestamp
            .checked_mul(precision.nanos_per_unit())
            .ok_or_else(|| format!("timestamp {} is out of range", timestamp))?;
        metric.set_timestamp(timestamp_ns);
    }

    Ok(metric)
}

fn metric_line(input: &str) -> IResult<&str, RawLine<'_>> {
    let (input, measurement) = measurement(input)?;
    let (input, tags) = many0(preceded(char(','), separated_pair(key, char('='), key))).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, fields) = separated_list1(char(','), separated_pair(key, char('='), field_value)).parse(input)?;
    let (input, timestamp) = opt(preceded(space1, parse_u64)).parse(input)?;

    Ok((
        input,
        RawLine {
            measurement,
            tags,
            fields,
            timestamp,
        },
    ))
}

#[inline]
fn measurement(input: &str) -> IResult<&str, Cow<'_, str>> {
    escaped_token(input, MEASUREMENT_SPECIALS)
}

#[inline]
fn key(input: &str) -> IResult<&str, Cow<'_, str>> {
    escaped_token(input, KEY_SPECIALS)
}

fn field_value(input: &str) -> IResult<&str, FieldValue> {
    alt((
        map(string_value, FieldValue::String),
        map(terminated(parse_i64, char('i')), FieldValue::Integer),
        map(terminated(parse_u64, char('u')), FieldValue::UnsignedInteger),
        map(boolean, FieldValue::Boolean),
        map(double, FieldValue::Float),
    ))
    .parse(input)
}

fn boolean(input: &str) -> IResult<&str, bool> {
    alt((
        value(true, alt((tag("true"), tag("True"), tag("TRUE"), tag("t"), tag("T")))),
        value(false, alt((tag("false"), tag("False"), tag("FALSE"), tag("f"), tag("F")))),
    ))
    .parse(input)
}

/// Parses a double-quoted string, unescaping `\"` and `\\`.
fn string_value(input: &str) -> IResult<&str, String> {
    let (body, _) = char('"').parse(input)?;

    let mut unescaped = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&body[i + 1..], unescaped)),
            '\\' => match chars.next_if(|&(_, next)| next == '"' || next == '\\') {
                Some((_, escaped)) => unescaped.push(escaped),
                None => unescaped.push('\\'),
            },
            c => unescaped.push(c),
        }
    }

    Err(nom::Err::Error(Error::new(input, ErrorKind::Char)))
}

/// Takes a non-empty token that ends at the first unescaped character in `specials`.
///
/// A backslash escapes any character in `specials`, and itself. Any other backslash is kept as-is. The token is only
/// allocated when it contains escapes.
fn escaped_token<'a>(input: &'a str, specials: &[char]) -> IResult<&'a str, Cow<'a, str>> {
    let mut unescaped: Option<String> = None;
    let mut end = input.len();

    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            if let Some((_, escaped)) = chars.next_if(|&(_, next)| next == '\\' || specials.contains(&next)) {
                unescaped.get_or_insert_with(|| input[..i].to_string()).push(escaped);
                continue;
            }
        } else if specials.contains(&c) {
            end = i;
            break;
        }

        if let Some(unescaped) = unescaped.as_mut() {
            unescaped.push(c);
        }
    }

    if end == 0 {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::TakeWhile1)));
    }

    let token = match unescaped {
        Some(unescaped) => Cow::Owned(unescaped),
        None => Cow::Borrowed(&input[..end]),
    };
    Ok((&input[end..], token))
}

/// Appends `metric` to `out` as a single line of line protocol, including the trailing newline.
///
/// Tags with an empty key or value are skipped, as are non-finite floats, since neither can be represented. Returns
/// `false`, leaving `out` untouched, if the metric has no representable fields.
pub fn encode_metric(metric: &Metric, out: &mut String) -> bool {
    let mut fields = metric
        .fields()
        .iter()
        .filter(|(key, value)| !key.is_empty() && !matches!(value, FieldValue::Float(f) if !f.is_finite()))
        .peekable();
    if fields.peek().is_none() || metric.name().is_empty() {
        return false;
    }

    escape_into(out, metric.name(), MEASUREMENT_SPECIALS);
    for (key, value) in metric.tags() {
        if key.is_empty() || value.is_empty() {
            continue;
        }
        out.push(',');
        escape_into(out, key, KEY_SPECIALS);
        out.push('=');
        escape_into(out, value, KEY_SPECIALS);
    }

    let mut separator = ' ';
    for (key, value) in fields {
        out.push(separator);
        separator = ',';

        escape_into(out, key, KEY_SPECIALS);
        out.push('=');
        // Writing into a `String` cannot fail.
        let _ = match value {
            FieldValue::Float(f) => write!(out, "{}", f),
            FieldValue::Integer(i) => write!(out, "{}i", i),
            FieldValue::UnsignedInteger(u) => write!(out, "{}u", u),
            FieldValue::Boolean(b) => write!(out, "{}", b),
            FieldValue::String(s) => {
                out.push('"');
                escape_into(out, s, &['"']);
                out.push('"');
                Ok(())
            }
        };
    }

    if let Some(timestamp) = metric.timestamp() {
        let _ = write!(out, " {}", timestamp);
    }
    out.push('\n');

    true
}

fn escape_into(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        if c == '\\' || specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
