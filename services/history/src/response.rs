//! Response rendering for the history API: content negotiation, JSON
//! bodies, flattened CSV and the legacy NGSI envelope.

use crate::error::{HistoryError, Result};
use crate::store::{AttributeSample, NotificationRecord};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Timelike, Utc};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Representation chosen from the `Accept` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Csv,
}

impl ResponseFormat {
    /// JSON wins whenever it is acceptable; CSV is used only when asked for
    /// and JSON is not.
    pub fn negotiate(accept: Option<&str>) -> Result<Self> {
        let ranges: Vec<String> = accept
            .unwrap_or_default()
            .split(',')
            .filter_map(|range| range.split(';').next())
            .map(|range| range.trim().to_ascii_lowercase())
            .filter(|range| !range.is_empty())
            .collect();

        if ranges.is_empty() {
            return Ok(Self::Json);
        }

        let accepts = |candidates: &[&str]| {
            ranges
                .iter()
                .any(|range| candidates.contains(&range.as_str()))
        };

        if accepts(&["application/json", "application/*", "*/*"]) {
            Ok(Self::Json)
        } else if accepts(&["text/csv", "text/*"]) {
            Ok(Self::Csv)
        } else {
            Err(HistoryError::NotAcceptable)
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

/// ISO-8601 UTC with a trailing `Z`; the microsecond fraction is only
/// written when non-zero.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    let seconds = ts.format("%Y-%m-%dT%H:%M:%S");
    let micros = ts.nanosecond() / 1_000;
    if micros == 0 {
        format!("{}Z", seconds)
    } else {
        format!("{}.{:06}Z", seconds, micros)
    }
}

/// Ordered top-level fields of one response record
type Record = Vec<(String, Value)>;

fn sample_record(sample: &AttributeSample) -> Record {
    vec![
        ("attr".to_string(), Value::String(sample.attr.clone())),
        ("value".to_string(), sample.value.clone()),
        ("device_id".to_string(), Value::String(sample.device_id.clone())),
        ("ts".to_string(), Value::String(format_ts(&sample.ts))),
        ("metadata".to_string(), Value::Object(sample.metadata.clone())),
    ]
}

fn notification_record(record: &NotificationRecord) -> Record {
    let mut fields: Record = record
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    fields.push(("ts".to_string(), Value::String(format_ts(&record.ts))));
    fields
}

pub fn sample_json(sample: &AttributeSample) -> Value {
    Value::Object(sample_record(sample).into_iter().collect())
}

pub fn notification_json(record: &NotificationRecord) -> Value {
    Value::Object(notification_record(record).into_iter().collect())
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_into(name: String, value: &Value, row: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(format!("{}.{}", name, key), nested, row);
            }
        }
        other => row.push((name, cell(other))),
    }
}

/// Flatten records into CSV: nested objects become dotted columns, empty
/// objects vanish, columns keep first-seen order and every field is quoted.
pub fn to_csv<I>(records: I) -> Result<String>
where
    I: IntoIterator<Item = Record>,
{
    let rows: Vec<Vec<(String, String)>> = records
        .into_iter()
        .map(|record| {
            let mut row = Vec::new();
            for (name, value) in record {
                flatten_into(name, &value, &mut row);
            }
            row
        })
        .collect();

    let mut columns: Vec<String> = Vec::new();
    for (name, _) in rows.iter().flatten() {
        if !columns.contains(name) {
            columns.push(name.clone());
        }
    }

    if columns.is_empty() {
        return Ok(String::new());
    }

    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(&columns)?;
    for row in &rows {
        let cells: HashMap<&str, &str> = row
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        writer.write_record(
            columns
                .iter()
                .map(|column| cells.get(column.as_str()).copied().unwrap_or_default()),
        )?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| HistoryError::Render(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| HistoryError::Render(e.to_string()))
}

fn respond(format: ResponseFormat, body: String) -> Response {
    ([(CONTENT_TYPE, format.content_type())], body).into_response()
}

fn respond_json(value: &Value) -> Result<Response> {
    Ok(respond(ResponseFormat::Json, serde_json::to_string(value)?))
}

/// A single attribute's samples, in storage order.
pub fn render_samples(format: ResponseFormat, samples: &[AttributeSample]) -> Result<Response> {
    match format {
        ResponseFormat::Json => respond_json(&Value::Array(
            samples.iter().map(sample_json).collect(),
        )),
        ResponseFormat::Csv => Ok(respond(format, to_csv(samples.iter().map(sample_record))?)),
    }
}

/// Samples keyed by attribute. CSV concatenates the lists in key order.
pub fn render_keyed(
    format: ResponseFormat,
    history: &[(String, Vec<AttributeSample>)],
) -> Result<Response> {
    match format {
        ResponseFormat::Json => {
            let body: Map<String, Value> = history
                .iter()
                .map(|(attr, samples)| {
                    (
                        attr.clone(),
                        Value::Array(samples.iter().map(sample_json).collect()),
                    )
                })
                .collect();
            respond_json(&Value::Object(body))
        }
        ResponseFormat::Csv => {
            let records = history
                .iter()
                .flat_map(|(_, samples)| samples.iter().map(sample_record));
            Ok(respond(format, to_csv(records)?))
        }
    }
}

/// `{"notifications": [..]}` as JSON, one row per notification as CSV.
pub fn render_notifications(
    format: ResponseFormat,
    records: &[NotificationRecord],
) -> Result<Response> {
    match format {
        ResponseFormat::Json => respond_json(&json!({
            "notifications": records.iter().map(notification_json).collect::<Vec<_>>(),
        })),
        ResponseFormat::Csv => Ok(respond(
            format,
            to_csv(records.iter().map(notification_record))?,
        )),
    }
}

/// Legacy NGSI `contextResponses` envelope. Values are reported in reverse
/// storage order, oldest first for the default descending read.
pub fn sth_envelope(
    device_type: &str,
    device_id: &str,
    attr: &str,
    samples: &[AttributeSample],
) -> Value {
    let values: Vec<Value> = samples
        .iter()
        .rev()
        .map(|sample| {
            json!({
                "attrType": device_type,
                "attrValue": sample.value,
                "recvTime": format_ts(&sample.ts),
            })
        })
        .collect();

    json!({
        "contextResponses": [{
            "contextElement": {
                "attributes": [{
                    "name": attr,
                    "values": values,
                }],
                "id": device_id,
                "isPattern": false,
                "type": device_type,
            },
            "statusCode": {"code": "200", "reasonPhrase": "OK"},
        }]
    })
}

pub fn render_sth(envelope: &Value) -> Result<Response> {
    respond_json(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(attr: &str, value: Value, millis: i64) -> AttributeSample {
        AttributeSample {
            attr: attr.to_string(),
            value,
            device_id: "teste".to_string(),
            ts: Utc.timestamp_millis_opt(millis).unwrap(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(ResponseFormat::negotiate(None).unwrap(), ResponseFormat::Json);
        assert_eq!(
            ResponseFormat::negotiate(Some("application/json")).unwrap(),
            ResponseFormat::Json
        );
        assert_eq!(
            ResponseFormat::negotiate(Some("*/*")).unwrap(),
            ResponseFormat::Json
        );
        assert_eq!(
            ResponseFormat::negotiate(Some("text/csv")).unwrap(),
            ResponseFormat::Csv
        );
        assert_eq!(
            ResponseFormat::negotiate(Some("text/csv, application/json;q=0.5")).unwrap(),
            ResponseFormat::Json
        );
        assert_eq!(
            ResponseFormat::negotiate(Some("text/*")).unwrap(),
            ResponseFormat::Csv
        );
        assert!(matches!(
            ResponseFormat::negotiate(Some("application/xml")),
            Err(HistoryError::NotAcceptable)
        ));
    }

    #[test]
    fn test_format_ts() {
        let with_fraction = Utc.timestamp_millis_opt(1628021893389).unwrap();
        assert_eq!(format_ts(&with_fraction), "2021-08-03T20:38:13.389000Z");

        let whole = Utc.timestamp_opt(1628021893, 0).unwrap();
        assert_eq!(format_ts(&whole), "2021-08-03T20:38:13Z");
    }

    #[test]
    fn test_sample_csv() {
        let csv = to_csv([sample_record(&sample(
            "attr1",
            json!("teste"),
            1628021893389,
        ))])
        .unwrap();

        assert_eq!(
            csv,
            "\"attr\",\"value\",\"device_id\",\"ts\"\n\"attr1\",\"teste\",\"teste\",\"2021-08-03T20:38:13.389000Z\"\n"
        );
    }

    #[test]
    fn test_csv_flattens_nested_objects_in_first_seen_order() {
        let mut located = sample("position", json!({"lat": -22.8, "lng": -47.0}), 0);
        located
            .metadata
            .insert("shouldPersist".to_string(), json!(true));
        let plain = sample("temperature", json!(21), 1000);

        let csv = to_csv([sample_record(&plain), sample_record(&located)]).unwrap();
        let mut lines = csv.lines();

        assert_eq!(
            lines.next().unwrap(),
            "\"attr\",\"value\",\"device_id\",\"ts\",\"value.lat\",\"value.lng\",\"metadata.shouldPersist\""
        );
        assert_eq!(
            lines.next().unwrap(),
            "\"temperature\",\"21\",\"teste\",\"1970-01-01T00:00:01Z\",\"\",\"\",\"\""
        );
        assert_eq!(
            lines.next().unwrap(),
            "\"position\",\"\",\"teste\",\"1970-01-01T00:00:00Z\",\"-22.8\",\"-47.0\",\"true\""
        );
    }

    #[test]
    fn test_empty_csv() {
        assert_eq!(to_csv(Vec::<Record>::new()).unwrap(), "");
    }

    #[test]
    fn test_sample_json_fields() {
        let value = sample_json(&sample("attr1", json!(10), 1628021893389));
        assert_eq!(
            value,
            json!({
                "attr": "attr1",
                "value": 10,
                "device_id": "teste",
                "ts": "2021-08-03T20:38:13.389000Z",
                "metadata": {}
            })
        );
    }

    #[test]
    fn test_notification_json_replaces_timestamp() {
        let mut fields = Map::new();
        fields.insert("msgID".to_string(), json!("0001"));
        fields.insert(
            "metaAttrsFilter".to_string(),
            json!({"shouldPersist": true, "level": 3}),
        );
        let record = NotificationRecord {
            ts: Utc.timestamp_opt(1628021893, 0).unwrap(),
            fields,
        };

        let value = notification_json(&record);
        assert_eq!(value["ts"], json!("2021-08-03T20:38:13Z"));
        assert_eq!(value["metaAttrsFilter"]["level"], json!(3));
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn test_sth_envelope_reverses_storage_order() {
        let newest_first = vec![
            sample("temperature", json!(23), 3000),
            sample("temperature", json!(22), 2000),
            sample("temperature", json!(21), 1000),
        ];

        let envelope = sth_envelope("thermometer", "dev1", "temperature", &newest_first);
        let element = &envelope["contextResponses"][0]["contextElement"];

        assert_eq!(element["id"], json!("dev1"));
        assert_eq!(element["isPattern"], json!(false));
        let values = element["attributes"][0]["values"].as_array().unwrap();
        let observed: Vec<i64> = values
            .iter()
            .map(|v| v["attrValue"].as_i64().unwrap())
            .collect();
        assert_eq!(observed, vec![21, 22, 23]);
        assert_eq!(values[0]["attrType"], json!("thermometer"));
        assert_eq!(
            envelope["contextResponses"][0]["statusCode"],
            json!({"code": "200", "reasonPhrase": "OK"})
        );

        let oldest_first = vec![
            sample("temperature", json!(21), 1000),
            sample("temperature", json!(22), 2000),
        ];
        let envelope = sth_envelope("thermometer", "dev1", "temperature", &oldest_first);
        let values = envelope["contextResponses"][0]["contextElement"]["attributes"][0]["values"]
            .as_array()
            .unwrap();
        let observed: Vec<i64> = values
            .iter()
            .map(|v| v["attrValue"].as_i64().unwrap())
            .collect();
        assert_eq!(observed, vec![22, 21]);
    }
}
