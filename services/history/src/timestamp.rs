//! Timestamp normalization for inbound events.
//!
//! Devices and upstream services report time as epoch seconds, epoch
//! milliseconds, fractional milliseconds or calendar strings. Everything is
//! reduced to a UTC instant before it is written.

use crate::error::{HistoryError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Integers above this value are epoch milliseconds, the rest epoch seconds.
pub const SECONDS_CEILING: i64 = i32::MAX as i64;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d/%m/%Y"];

/// Normalize an optional JSON timestamp into a UTC instant.
///
/// Absent or `null` input yields the current instant.
pub fn normalize(raw: Option<&Value>) -> Result<DateTime<Utc>> {
    match raw {
        None | Some(Value::Null) => Ok(Utc::now()),
        Some(Value::Number(number)) => {
            let instant = if let Some(value) = number.as_i64() {
                from_integer(value)
            } else if let Some(value) = number.as_f64() {
                from_float(value)
            } else {
                None
            };
            instant.ok_or_else(|| HistoryError::MalformedTimestamp(number.to_string()))
        }
        Some(Value::String(text)) => normalize_str(text),
        Some(other) => Err(HistoryError::MalformedTimestamp(other.to_string())),
    }
}

/// Normalize a textual timestamp: integer, then float, then calendar formats.
pub fn normalize_str(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();

    let instant = if let Ok(value) = trimmed.parse::<i64>() {
        from_integer(value)
    } else if let Some(value) = trimmed.parse::<f64>().ok().filter(|v| v.is_finite()) {
        from_fractional_millis(value)
    } else {
        parse_calendar(trimmed)
    };

    instant.ok_or_else(|| HistoryError::MalformedTimestamp(raw.to_string()))
}

/// Parse ISO-8601 and the common calendar variants. Naive values are UTC.
pub fn parse_calendar(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Some(parsed) = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(parsed.with_timezone(&Utc));
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    if let Some(parsed) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
    {
        return Some(parsed.and_utc());
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

fn from_integer(value: i64) -> Option<DateTime<Utc>> {
    if value > SECONDS_CEILING {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// JSON floats follow the integer rule on their whole part and keep the fraction.
fn from_float(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    if value.trunc() > SECONDS_CEILING as f64 {
        micros_to_instant(value * 1_000.0)
    } else {
        micros_to_instant(value * 1_000_000.0)
    }
}

fn from_fractional_millis(millis: f64) -> Option<DateTime<Utc>> {
    micros_to_instant(millis * 1_000.0)
}

fn micros_to_instant(micros: f64) -> Option<DateTime<Utc>> {
    let micros = micros.round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}
