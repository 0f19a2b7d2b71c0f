use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Upper bound for a believable match length.
pub const MAX_DURATION_MINUTES: i64 = 300;

/// How to interpret a duration field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationStrategy {
    Minutes,
    Seconds,
    Millis,
    /// Free-form text such as "35:12", "1:02:00", "42 min" or "90s".
    Text,
}

#[derive(Debug, Clone)]
pub struct DurationAlias {
    pub field: &'static str,
    pub strategy: DurationStrategy,
}

impl DurationAlias {
    pub const fn new(field: &'static str, strategy: DurationStrategy) -> Self {
        Self { field, strategy }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    /// Present but not numeric.
    NotNumeric(&'static str),
    Negative(&'static str),
    TooLarge(&'static str),
}

/// Resolves the first matching duration alias into whole minutes.
#[derive(Debug, Default, Clone)]
pub struct DurationMapper {
    aliases: Vec<DurationAlias>,
}

impl DurationMapper {
    pub fn with_defaults() -> Self {
        Self::default()
            .register(DurationAlias::new("duration_minutes", DurationStrategy::Minutes))
            .register(DurationAlias::new("duration_seconds", DurationStrategy::Seconds))
            .register(DurationAlias::new("duration_millis", DurationStrategy::Millis))
            .register(DurationAlias::new("duration", DurationStrategy::Text))
    }

    /// Append an alias; earlier registrations win when several are present.
    pub fn register(mut self, alias: DurationAlias) -> Self {
        self.aliases.push(alias);
        self
    }

    /// `Ok(None)` when no alias is present.
    pub fn map(&self, payload: &Map<String, Value>) -> Result<Option<i64>, FieldError> {
        for alias in &self.aliases {
            let Some(value) = payload.get(alias.field).filter(|v| !v.is_null()) else {
                continue;
            };
            let minutes = match alias.strategy {
                DurationStrategy::Minutes => parse_number(value).map(|n| n.trunc() as i64),
                DurationStrategy::Seconds => {
                    parse_number(value).map(|n| (n / 60.0).trunc() as i64)
                }
                DurationStrategy::Millis => {
                    parse_number(value).map(|n| (n / 60_000.0).trunc() as i64)
                }
                DurationStrategy::Text => match value {
                    Value::String(s) => parse_duration_text(s),
                    other => parse_number(other).map(|n| n.trunc() as i64),
                },
            }
            .ok_or(FieldError::NotNumeric(alias.field))?;
            if minutes < 0 {
                return Err(FieldError::Negative(alias.field));
            }
            if minutes > MAX_DURATION_MINUTES {
                return Err(FieldError::TooLarge(alias.field));
            }
            return Ok(Some(minutes));
        }
        Ok(None)
    }
}

fn clock_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):([0-5]\d)(?::([0-5]\d))?$").ok())
        .as_ref()
}

fn unit_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^(-?\d+(?:\.\d+)?)\s*",
            r"(h|hr|hrs|hours?|m|min|mins|minutes?|s|sec|secs|seconds?)?$",
        ))
        .ok()
    })
    .as_ref()
}

/// Parse "mm:ss", "hh:mm:ss", or a number with an optional unit (minutes by default).
pub fn parse_duration_text(raw: &str) -> Option<i64> {
    let s = raw.trim().to_ascii_lowercase();
    if let Some(c) = clock_re()?.captures(&s) {
        let a: i64 = c.get(1)?.as_str().parse().ok()?;
        let b: i64 = c.get(2)?.as_str().parse().ok()?;
        return match c.get(3) {
            // hh:mm:ss
            Some(_) => a.checked_mul(60)?.checked_add(b),
            // mm:ss
            None => Some(a),
        };
    }
    let c = unit_re()?.captures(&s)?;
    let n: f64 = c.get(1)?.as_str().parse().ok()?;
    let minutes = match c.get(2).map(|m| m.as_str().chars().next()) {
        Some(Some('h')) => n * 60.0,
        Some(Some('s')) => n / 60.0,
        _ => n,
    };
    Some(minutes.trunc() as i64)
}

/// Lenient numeric read: numbers and numeric strings.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Read a non-negative counter. Absent or null reads as `default`; floats are truncated.
pub fn read_counter(
    payload: &Map<String, Value>,
    field: &'static str,
    default: Option<i64>,
    max: i64,
) -> Result<Option<i64>, FieldError> {
    let Some(value) = payload.get(field).filter(|v| !v.is_null()) else {
        return Ok(default);
    };
    let n = parse_number(value).ok_or(FieldError::NotNumeric(field))?;
    let n = n.trunc() as i64;
    if n < 0 {
        return Err(FieldError::Negative(field));
    }
    if n > max {
        return Err(FieldError::TooLarge(field));
    }
    Ok(Some(n))
}

/// Non-empty trimmed string, accepting numbers as their decimal text.
pub fn read_text(payload: &Map<String, Value>, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
