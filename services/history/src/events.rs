//! Typed views of the messages published on the device, device-data,
//! notification and tenancy channels.

use crate::error::{HistoryError, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Metadata keys that duplicate top-level sample fields and are never stored.
pub const REDUNDANT_METADATA_KEYS: [&str; 3] = ["deviceid", "timestamp", "tenant"];

/// Kind of a device lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Create,
    Update,
    Configure,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Device lifecycle event, as produced by the device manager
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleEvent {
    #[serde(default, rename = "event")]
    pub kind: LifecycleKind,
    #[serde(default)]
    pub meta: Option<LifecycleMeta>,
    #[serde(default)]
    pub data: Option<LifecycleData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleMeta {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleData {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub attrs: Option<Value>,
}

impl LifecycleEvent {
    /// Tenant that owns the device (`meta.service`)
    pub fn service(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.service.as_deref())
    }

    /// Device identifier (`data.id`)
    pub fn device_id(&self) -> Option<String> {
        self.data.as_ref().and_then(|d| d.id.as_ref()).and_then(identifier)
    }

    /// Rewrite a `configure` event into the device-data shape.
    ///
    /// `data.attrs` becomes `attrs`; `data.id`, `meta.service` and
    /// `meta.timestamp` (or the current time in milliseconds) become the
    /// `deviceid`, `tenant` and `timestamp` metadata entries.
    pub fn into_data_event(self) -> Result<DataEvent> {
        let meta = self.meta.ok_or(HistoryError::MissingField("meta"))?;
        let data = self.data.ok_or(HistoryError::MissingField("data"))?;

        let timestamp = meta
            .timestamp
            .filter(|ts| !ts.is_null())
            .unwrap_or_else(|| Value::from(Utc::now().timestamp_millis()));

        let mut metadata = Map::new();
        metadata.insert("timestamp".to_string(), timestamp);
        metadata.insert("deviceid".to_string(), data.id.unwrap_or(Value::Null));
        metadata.insert(
            "tenant".to_string(),
            meta.service.map(Value::String).unwrap_or(Value::Null),
        );

        Ok(DataEvent {
            metadata: Some(metadata),
            attrs: data.attrs,
        })
    }
}

/// Device data event: a bag of attribute values plus routing metadata
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataEvent {
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub attrs: Option<Value>,
}

/// Why a device data event was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingMetadata,
    MissingDeviceId,
    MissingAttrs,
    /// `attrs` is present but is not a string-keyed mapping.
    AttrsNotMapping(&'static str),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMetadata => write!(f, "event has no metadata associated with it"),
            Self::MissingDeviceId => write!(f, "event cannot be traced to a valid device"),
            Self::MissingAttrs => write!(f, "event has no attrs associated with it"),
            Self::AttrsNotMapping(kind) => {
                write!(f, "expected attribute dictionary, got {}", kind)
            }
        }
    }
}

/// A device data event that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDataEvent {
    pub device_id: String,
    pub timestamp: Option<Value>,
    /// Metadata without the redundant `deviceid`/`timestamp`/`tenant` keys.
    pub metadata: Map<String, Value>,
    pub attrs: Map<String, Value>,
}

impl DataEvent {
    pub fn validate(self) -> std::result::Result<ValidDataEvent, Rejection> {
        let metadata = self.metadata.ok_or(Rejection::MissingMetadata)?;
        let device_id = metadata
            .get("deviceid")
            .and_then(identifier)
            .ok_or(Rejection::MissingDeviceId)?;

        let attrs = match self.attrs {
            None | Some(Value::Null) => return Err(Rejection::MissingAttrs),
            Some(Value::Object(attrs)) => attrs,
            Some(other) => return Err(Rejection::AttrsNotMapping(json_kind(&other))),
        };

        let timestamp = metadata.get("timestamp").cloned();
        let metadata = metadata
            .into_iter()
            .filter(|(key, _)| !REDUNDANT_METADATA_KEYS.contains(&key.as_str()))
            .collect();

        Ok(ValidDataEvent {
            device_id,
            timestamp,
            metadata,
            attrs,
        })
    }
}

/// Notification event. Everything except `timestamp` is stored as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub timestamp: Value,
    pub should_persist: bool,
    /// Remaining fields, `metaAttrsFilter` included.
    pub fields: Map<String, Value>,
}

impl NotificationEvent {
    pub fn from_object(mut fields: Map<String, Value>) -> Result<Self> {
        let timestamp = fields
            .remove("timestamp")
            .ok_or(HistoryError::MissingField("timestamp"))?;

        let filter = match fields.get_mut("metaAttrsFilter") {
            Some(Value::Object(filter)) => filter,
            Some(other) => {
                return Err(HistoryError::Decode(format!(
                    "metaAttrsFilter must be an object, got {}",
                    json_kind(other)
                )))
            }
            None => return Err(HistoryError::MissingField("metaAttrsFilter")),
        };

        let should_persist = filter
            .get("shouldPersist")
            .map(should_persist_flag)
            .unwrap_or(false);
        if filter.contains_key("shouldPersist") {
            filter.insert("shouldPersist".to_string(), Value::Bool(should_persist));
        }

        Ok(Self {
            timestamp,
            should_persist,
            fields,
        })
    }
}

/// Tenancy lifecycle event published by the auth service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenancyEvent {
    pub tenant: String,
}

/// `shouldPersist` accepts boolean `true` and the legacy string `"True"`.
pub fn should_persist_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => text == "True",
        _ => false,
    }
}

pub fn decode_lifecycle(payload: &[u8]) -> Result<LifecycleEvent> {
    let object = decode_object(payload)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

pub fn decode_data(payload: &[u8]) -> Result<DataEvent> {
    let object = decode_object(payload)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

pub fn decode_notification(payload: &[u8]) -> Result<NotificationEvent> {
    NotificationEvent::from_object(decode_object(payload)?)
}

pub fn decode_tenancy(payload: &[u8]) -> Result<TenancyEvent> {
    let object = decode_object(payload)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Strict JSON-object parse of a raw bus payload
pub fn decode_object(payload: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(object) => Ok(object),
        other => Err(HistoryError::Decode(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Device identifiers arrive as strings, occasionally as numbers.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
