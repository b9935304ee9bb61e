//! Translation of history API parameters into storage query descriptors.

use crate::error::{HistoryError, Result};
use crate::timestamp;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Value samples equal to this are treated as blank and never returned.
pub const BLANK_VALUE: &str = " ";

/// Fields excluded from every read: the storage identifier and two legacy
/// pipeline-metadata fields.
pub const HIDDEN_FIELDS: [&str; 3] = ["_id", "@timestamp", "@version"];

/// Notification reads without a date bound or explicit limit return this many.
pub const DEFAULT_NOTIFICATION_LIMIT: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Inclusive bounds on `ts`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRange {
    pub gte: Option<DateTime<Utc>>,
    pub lte: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn is_empty(&self) -> bool {
        self.gte.is_none() && self.lte.is_none()
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.gte.map_or(true, |gte| *ts >= gte) && self.lte.map_or(true, |lte| *ts <= lte)
    }
}

/// Query over one device partition
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub attr: Option<String>,
    pub time_range: TimeRange,
    pub sort: SortOrder,
    /// `None` reads every matching sample.
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn for_attr(&self, attr: &str) -> Self {
        Self {
            attr: Some(attr.to_string()),
            ..self.clone()
        }
    }
}

/// Raw device-history request parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryParams {
    /// Every `attr` value, in request order.
    pub attrs: Vec<String>,
    pub first_n: Option<String>,
    pub last_n: Option<String>,
    pub h_limit: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl HistoryParams {
    /// Collect parameters from decoded query-string pairs. Repeated `attr`
    /// keys accumulate; other repeated keys keep the last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.into();
            match key.as_ref() {
                "attr" => params.attrs.push(value),
                "firstN" => params.first_n = Some(value),
                "lastN" => params.last_n = Some(value),
                "hLimit" => params.h_limit = Some(value),
                "dateFrom" => params.date_from = Some(value),
                "dateTo" => params.date_to = Some(value),
                _ => {}
            }
        }
        params
    }
}

/// Build the storage query for one attribute (or all samples when `attr` is
/// `None`).
///
/// Limit precedence is `firstN` (ascending), then `lastN`, then `hLimit`
/// (both descending). Without any of them the read is unbounded.
pub fn translate(params: &HistoryParams, attr: Option<&str>) -> Result<HistoryQuery> {
    let (sort, limit) = if let Some(raw) = &params.first_n {
        (SortOrder::Ascending, Some(parse_limit("firstN", raw)?))
    } else if let Some(raw) = &params.last_n {
        (SortOrder::Descending, Some(parse_limit("lastN", raw)?))
    } else if let Some(raw) = &params.h_limit {
        (SortOrder::Descending, Some(parse_limit("hLimit", raw)?))
    } else {
        (SortOrder::Descending, None)
    };

    let time_range = TimeRange {
        gte: params
            .date_from
            .as_deref()
            .map(|raw| parse_date("dateFrom", raw))
            .transpose()?,
        lte: params
            .date_to
            .as_deref()
            .map(|raw| parse_date("dateTo", raw))
            .transpose()?,
    };

    Ok(HistoryQuery {
        attr: attr.map(str::to_string),
        time_range,
        sort,
        limit,
    })
}

/// Typed equality filter value for notification queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Int(i64),
    Text(String),
}

impl FilterValue {
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int(expected), Value::Number(actual)) => actual.as_i64() == Some(*expected),
            (Self::Text(expected), Value::String(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// Query over a tenant's notification partition. Always sorted by `ts`
/// descending.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationQuery {
    /// Dotted field path and expected value.
    pub filters: Vec<(String, FilterValue)>,
    pub time_range: TimeRange,
    pub limit: Option<i64>,
}

/// Build a notification query from arbitrary request parameters.
///
/// `dateFrom`, `dateTo` and `limit` are reserved. `subject` filters the
/// top-level field; every other key filters `metaAttrsFilter.<key>`.
pub fn translate_notifications<I, K, V>(pairs: I) -> Result<NotificationQuery>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut filters: Vec<(String, FilterValue)> = Vec::new();
    let mut time_range = TimeRange::default();
    let mut limit = 0;

    for (key, value) in pairs {
        let (key, value) = (key.as_ref(), value.as_ref());
        match key {
            "dateFrom" => time_range.gte = Some(parse_date(key, value)?),
            "dateTo" => time_range.lte = Some(parse_date(key, value)?),
            "limit" => limit = parse_limit(key, value)?,
            _ => {
                let field = if key == "subject" {
                    key.to_string()
                } else {
                    format!("metaAttrsFilter.{}", key)
                };
                let value = classify_value(key, value)?;
                filters.retain(|(existing, _)| *existing != field);
                filters.push((field, value));
            }
        }
    }

    let limit = match limit {
        0 if time_range.is_empty() => Some(DEFAULT_NOTIFICATION_LIMIT),
        0 => None,
        n => Some(n),
    };

    Ok(NotificationQuery {
        filters,
        time_range,
        limit,
    })
}

/// Values wrapped in double quotes are strings (quotes removed); anything
/// else must be an integer.
pub fn classify_value(name: &str, raw: &str) -> Result<FilterValue> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(FilterValue::Text(raw.replace('"', "")));
    }

    raw.trim()
        .parse::<i64>()
        .map(FilterValue::Int)
        .map_err(|_| {
            HistoryError::invalid_parameter(name, "Must be an integer or a double-quoted string.")
        })
}

fn parse_limit(name: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| HistoryError::invalid_parameter(name, "Must be integer."))
}

fn parse_date(name: &str, raw: &str) -> Result<DateTime<Utc>> {
    timestamp::parse_calendar(raw.trim())
        .ok_or_else(|| HistoryError::invalid_parameter(name, "Must be a valid date."))
}
