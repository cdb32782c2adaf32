//! Interval payload interpreter.
//!
//! Publishers use one of three wire formats on the interval topic:
//!
//! 1. canonical JSON carrying a completed interval
//!    (`intervalEnd`, `pulseCount`, `kWh`, `kW`, optional `total_kWh`,
//!    `r17Exclude`, `kyzInvalidAlarm`);
//! 2. packed `key=value` text such as `d=42,t=1234567` (or the terse `d=42,1234567`);
//! 3. a minimal JSON object with the same pulse keys as the packed text.
//!
//! Formats 2 and 3 only carry pulse counts; the interval boundary and energy
//! values are derived later by [`crate::transform::IntervalMath`].

use std::collections::HashMap;

use kyz_client::domain::IntervalReading;
use serde_json::{Map, Value};
use time::{macros::format_description, PrimitiveDateTime};

use crate::error::PayloadError;

const CANONICAL_FIELDS: [&str; 4] = ["intervalEnd", "pulseCount", "kWh", "kW"];
const DELTA_KEYS: [&str; 2] = ["d", "pulseDelta"];
const TOTAL_KEYS: [&str; 3] = ["t", "pulseTotal", "c"];
const R17_KEYS: [&str; 1] = ["r17Exclude"];
const ALARM_KEYS: [&str; 1] = ["kyzInvalidAlarm"];

/// Pulse counts reported by a packed or minimal payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseSample {
    pub delta: Option<i64>,
    pub total: Option<i64>,
    pub r17_exclude: Option<bool>,
    pub kyz_invalid_alarm: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Canonical,
    KeyValue,
    MinimalJson,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Canonical => "canonical",
            PayloadFormat::KeyValue => "key_value",
            PayloadFormat::MinimalJson => "minimal_json",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    /// The publisher stated the completed interval; nothing is re-derived.
    Interval(IntervalReading),
    Pulses(PulseSample),
}

struct RawPayload<'a> {
    text: &'a str,
    json: Option<Value>,
}

/// `Ok(None)` means "not this format, try the next one".
type FormatParser = fn(&RawPayload<'_>) -> Result<Option<ParsedPayload>, PayloadError>;

const FORMATS: [(PayloadFormat, FormatParser); 3] = [
    (PayloadFormat::Canonical, parse_canonical),
    (PayloadFormat::KeyValue, parse_key_value),
    (PayloadFormat::MinimalJson, parse_minimal_json),
];

/// Interpret a raw message body. Invalid UTF-8 is replaced, not rejected.
pub fn parse_payload(body: &[u8]) -> Result<(PayloadFormat, ParsedPayload), PayloadError> {
    let text = String::from_utf8_lossy(body);
    parse_text(&text)
}

pub fn parse_text(text: &str) -> Result<(PayloadFormat, ParsedPayload), PayloadError> {
    let raw = RawPayload {
        text,
        json: serde_json::from_str(text).ok(),
    };

    for (format, parser) in FORMATS {
        if let Some(parsed) = parser(&raw)? {
            return Ok((format, parsed));
        }
    }

    Err(PayloadError::Unrecognized)
}

fn parse_canonical(raw: &RawPayload<'_>) -> Result<Option<ParsedPayload>, PayloadError> {
    let Some(Value::Object(map)) = &raw.json else {
        return Ok(None);
    };
    if !CANONICAL_FIELDS.iter().all(|f| map.contains_key(*f)) {
        return Ok(None);
    }

    let interval_end = parse_interval_end(&map["intervalEnd"])?;

    let pulse_count = map["pulseCount"]
        .as_i64()
        .ok_or_else(|| PayloadError::invalid("pulseCount", "must be an integer"))?;
    if pulse_count < 0 {
        return Err(PayloadError::invalid("pulseCount", "must be non-negative"));
    }

    let kwh = required_number(map, "kWh")?;
    let kw = required_number(map, "kW")?;
    let total_kwh = optional_number(map, "total_kWh")?;
    let r17_exclude = optional_bool(map, "r17Exclude")?;
    let kyz_invalid_alarm = optional_bool(map, "kyzInvalidAlarm")?;

    Ok(Some(ParsedPayload::Interval(IntervalReading {
        interval_end,
        pulse_count,
        kwh,
        kw,
        total_kwh,
        r17_exclude,
        kyz_invalid_alarm,
    })))
}

fn parse_key_value(raw: &RawPayload<'_>) -> Result<Option<ParsedPayload>, PayloadError> {
    if raw.json.is_some() {
        return Ok(None);
    }

    let tokens: Vec<&str> = raw
        .text
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Err(PayloadError::Empty);
    }

    let mut fields: HashMap<&str, &str> = HashMap::new();
    for (index, &token) in tokens.iter().enumerate() {
        if let Some((key, value)) = token.split_once('=') {
            fields.insert(key.trim(), value.trim());
            continue;
        }

        // Terse publishers send `d=<delta>,<total>`; only the second position counts.
        if index == 1 && fields.contains_key("d") && is_integer_token(token) {
            fields.insert("t", token);
            continue;
        }

        return Err(PayloadError::UnsupportedToken(token.to_string()));
    }

    let sample = build_sample(|k| fields.get(k).copied(), int_from_text, flag_from_text)?;
    Ok(Some(ParsedPayload::Pulses(sample)))
}

fn parse_minimal_json(raw: &RawPayload<'_>) -> Result<Option<ParsedPayload>, PayloadError> {
    match &raw.json {
        None => Ok(None),
        Some(Value::Object(map)) => {
            let sample = build_sample(
                |k| map.get(k).filter(|v| !v.is_null()),
                int_from_json,
                flag_from_json,
            )?;
            Ok(Some(ParsedPayload::Pulses(sample)))
        }
        Some(_) => Err(PayloadError::NotAnObject),
    }
}

fn build_sample<'a, V: ?Sized + 'a>(
    get: impl Fn(&str) -> Option<&'a V>,
    parse_int: fn(&str, &V) -> Result<i64, PayloadError>,
    parse_flag: fn(&str, &V) -> Result<bool, PayloadError>,
) -> Result<PulseSample, PayloadError> {
    let lookup = |names: &[&'static str]| names.iter().find_map(|&n| get(n).map(|v| (n, v)));

    let count = |names: &[&'static str]| -> Result<Option<i64>, PayloadError> {
        match lookup(names) {
            Some((name, value)) => {
                let n = parse_int(name, value)?;
                if n < 0 {
                    return Err(PayloadError::invalid(name, "must be non-negative"));
                }
                Ok(Some(n))
            }
            None => Ok(None),
        }
    };
    let flag = |names: &[&'static str]| -> Result<Option<bool>, PayloadError> {
        lookup(names)
            .map(|(name, value)| parse_flag(name, value))
            .transpose()
    };

    let delta = count(&DELTA_KEYS)?;
    let total = count(&TOTAL_KEYS)?;
    if delta.is_none() && total.is_none() {
        return Err(PayloadError::NoPulseFields);
    }

    Ok(PulseSample {
        delta,
        total,
        r17_exclude: flag(&R17_KEYS)?,
        kyz_invalid_alarm: flag(&ALARM_KEYS)?,
    })
}

fn parse_interval_end(value: &Value) -> Result<PrimitiveDateTime, PayloadError> {
    let expected = "must be a string in format YYYY-MM-DD HH:MM:SS";
    let s = value
        .as_str()
        .ok_or_else(|| PayloadError::invalid("intervalEnd", expected))?;
    PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map_err(|_| PayloadError::invalid("intervalEnd", expected))
}

fn required_number(map: &Map<String, Value>, name: &str) -> Result<f64, PayloadError> {
    map.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| PayloadError::invalid(name, "must be numeric"))
}

fn optional_number(map: &Map<String, Value>, name: &str) -> Result<Option<f64>, PayloadError> {
    match map.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| PayloadError::invalid(name, "must be numeric when provided")),
    }
}

fn optional_bool(map: &Map<String, Value>, name: &str) -> Result<Option<bool>, PayloadError> {
    match map.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(PayloadError::invalid(name, "must be boolean when provided")),
    }
}

fn is_integer_token(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn int_from_text(name: &str, value: &str) -> Result<i64, PayloadError> {
    let value = value.trim();
    if !is_integer_token(value) {
        return Err(PayloadError::invalid(name, "must be an integer"));
    }
    value
        .parse()
        .map_err(|_| PayloadError::invalid(name, "must be an integer"))
}

fn int_from_json(name: &str, value: &Value) -> Result<i64, PayloadError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| PayloadError::invalid(name, "must be an integer")),
        Value::String(s) => int_from_text(name, s),
        _ => Err(PayloadError::invalid(name, "must be an integer")),
    }
}

fn flag_from_text(name: &str, value: &str) -> Result<bool, PayloadError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PayloadError::invalid(name, "must be a boolean flag")),
    }
}

fn flag_from_json(name: &str, value: &Value) -> Result<bool, PayloadError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(PayloadError::invalid(name, "must be a boolean flag")),
        },
        Value::String(s) => flag_from_text(name, s),
        _ => Err(PayloadError::invalid(name, "must be a boolean flag")),
    }
}
