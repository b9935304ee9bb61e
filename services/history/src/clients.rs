//! HTTP collaborators: tenant directory (auth), topic resolution (data
//! broker) and attribute discovery (device manager).

use crate::error::{HistoryError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// Lists the tenants known at startup
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<String>>;
}

/// Maps a (tenant, subject) pair to a Kafka topic
#[async_trait]
pub trait TopicResolver: Send + Sync {
    async fn topic(&self, tenant: &str, subject: &str, global: bool) -> Result<String>;
}

/// Lists the attribute labels configured for a device
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn attrs(&self, device_id: &str, token: &str) -> Result<Vec<String>>;
}

/// Unsigned token carrying `service` as tenant, accepted by internal services.
pub fn internal_token(service: &str) -> String {
    let userinfo = serde_json::json!({
        "username": "history",
        "service": service,
    });
    format!(
        "{}.{}.{}",
        STANDARD.encode("model"),
        STANDARD.encode(userinfo.to_string()),
        STANDARD.encode("signature")
    )
}

/// Every `label` of a device-manager device: `attrs` maps template ids to
/// lists of attribute objects.
pub fn attribute_labels(device: &Value) -> Vec<String> {
    let Some(templates) = device.get("attrs").and_then(Value::as_object) else {
        return Vec::new();
    };

    templates
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|attr| attr.get("label").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| HistoryError::Configuration(format!("HTTP client: {}", e)))
}

fn success(response: reqwest::Response, target: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(HistoryError::Upstream(format!(
            "{} answered {}",
            target, status
        )));
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct TenantList {
    tenants: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TopicResponse {
    topic: String,
}

#[derive(Clone)]
pub struct AuthClient {
    base_url: String,
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl TenantDirectory for AuthClient {
    #[instrument(skip(self))]
    async fn list_tenants(&self) -> Result<Vec<String>> {
        let target = format!("{}/admin/tenants", self.base_url);
        let response = self.http.get(&target).send().await?;
        let payload: TenantList = success(response, &target)?.json().await?;
        debug!(count = payload.tenants.len(), "Retrieved tenant list");
        Ok(payload.tenants)
    }
}

#[derive(Clone)]
pub struct DataBrokerClient {
    base_url: String,
    http: reqwest::Client,
}

impl DataBrokerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl TopicResolver for DataBrokerClient {
    #[instrument(skip(self))]
    async fn topic(&self, tenant: &str, subject: &str, global: bool) -> Result<String> {
        let options = if global { "?global=true" } else { "" };
        let target = format!("{}/topic/{}{}", self.base_url, subject, options);
        let response = self
            .http
            .get(&target)
            .header("authorization", internal_token(tenant))
            .send()
            .await?;
        let payload: TopicResponse = success(response, &target)?.json().await?;
        debug!(topic = %payload.topic, "Resolved topic");
        Ok(payload.topic)
    }
}

#[derive(Clone)]
pub struct DeviceManagerClient {
    base_url: String,
    http: reqwest::Client,
}

impl DeviceManagerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl DeviceRegistry for DeviceManagerClient {
    #[instrument(skip(self, token))]
    async fn attrs(&self, device_id: &str, token: &str) -> Result<Vec<String>> {
        let target = format!("{}/device/{}", self.base_url, device_id);
        let response = self
            .http
            .get(&target)
            .header("Authorization", token)
            .send()
            .await?;
        let device: Value = success(response, &target)?.json().await?;
        Ok(attribute_labels(&device))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub DeviceRegistry {}

        #[async_trait]
        impl DeviceRegistry for DeviceRegistry {
            async fn attrs(&self, device_id: &str, token: &str) -> Result<Vec<String>>;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_internal_token_layout() {
        let token = internal_token("admin");
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(STANDARD.decode(parts[0]).unwrap(), b"model");
        assert_eq!(STANDARD.decode(parts[2]).unwrap(), b"signature");

        let claims: Value = serde_json::from_slice(&STANDARD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims, json!({"username": "history", "service": "admin"}));
    }

    #[test]
    fn test_attribute_labels() {
        let device = json!({
            "id": "3bb9",
            "attrs": {
                "1": [
                    {"label": "temperature", "type": "dynamic"},
                    {"label": "pressure", "type": "dynamic"}
                ],
                "2": [
                    {"type": "static"},
                    {"label": "location", "type": "static"}
                ]
            }
        });

        let mut labels = attribute_labels(&device);
        labels.sort();
        assert_eq!(labels, vec!["location", "pressure", "temperature"]);
    }

    #[test]
    fn test_attribute_labels_without_attrs() {
        assert!(attribute_labels(&json!({"id": "3bb9"})).is_empty());
        assert!(attribute_labels(&json!({"attrs": []})).is_empty());
    }
}
