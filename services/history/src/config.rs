use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the history service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub mongo: MongoConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub subjects: SubjectsConfig,
    pub services: ServicesConfig,
    #[serde(default)]
    pub persister: PersisterConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Initial log level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Document store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    /// Connection string, e.g. `mongodb://mongodb:27017`
    pub url: String,
    pub replica_set: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    /// Retention of stored samples and notifications, in seconds
    #[serde(default = "default_data_expiration_secs")]
    pub data_expiration_secs: u64,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_ca_location: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

/// Logical subjects resolved to Kafka topics through the data broker
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectsConfig {
    #[serde(default = "default_tenancy_subject")]
    pub tenancy: String,
    #[serde(default = "default_devices_subject")]
    pub devices: String,
    #[serde(default = "default_device_data_subject")]
    pub device_data: String,
    #[serde(default = "default_notifications_subject")]
    pub notifications: String,
    /// Tenant whose identity is used to resolve global subjects
    #[serde(default = "default_management_service")]
    pub management_service: String,
}

/// External HTTP collaborators
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub auth_url: String,
    pub data_broker_url: String,
    pub device_manager_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersisterConfig {
    /// Consume only tenancy and notification channels
    #[serde(default)]
    pub notifications_only: bool,
}

/// History API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_service_name() -> String {
    "history".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database() -> String {
    "device_history".to_string()
}

fn default_data_expiration_secs() -> u64 {
    604800 // 7 days
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_consumer_group() -> String {
    "history".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_tenancy_subject() -> String {
    "dojot.tenancy".to_string()
}

fn default_devices_subject() -> String {
    "dojot.device-manager.device".to_string()
}

fn default_device_data_subject() -> String {
    "device-data".to_string()
}

fn default_notifications_subject() -> String {
    "dojot.notifications".to_string()
}

fn default_management_service() -> String {
    "dojot-management".to_string()
}

fn default_request_timeout_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", default_metrics_port())?
            .add_source(config::File::with_name("config/history").required(false))
            .add_source(config::File::with_name("/etc/history/history").required(false))
            // HISTORY__MONGO__URL -> mongo.url
            .add_source(
                config::Environment::with_prefix("HISTORY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn data_expiration(&self) -> Duration {
        Duration::from_secs(self.mongo.data_expiration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.services.request_timeout_secs)
    }
}

impl MongoConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for SubjectsConfig {
    fn default() -> Self {
        Self {
            tenancy: default_tenancy_subject(),
            devices: default_devices_subject(),
            device_data: default_device_data_subject(),
            notifications: default_notifications_subject(),
            management_service: default_management_service(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = from_json(serde_json::json!({
            "mongo": {"url": "mongodb://mongodb:27017"},
            "kafka": {"bootstrap_servers": "kafka:9092"},
            "services": {
                "auth_url": "http://auth:5000",
                "data_broker_url": "http://data-broker",
                "device_manager_url": "http://device-manager:5000"
            }
        }));

        assert_eq!(config.mongo.database, "device_history");
        assert_eq!(config.data_expiration(), Duration::from_secs(604800));
        assert_eq!(config.kafka.consumer_group, "history");
        assert_eq!(config.kafka.auto_offset_reset, "latest");
        assert_eq!(config.subjects.tenancy, "dojot.tenancy");
        assert_eq!(config.subjects.devices, "dojot.device-manager.device");
        assert_eq!(config.subjects.device_data, "device-data");
        assert_eq!(config.subjects.notifications, "dojot.notifications");
        assert_eq!(config.subjects.management_service, "dojot-management");
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert!(!config.persister.notifications_only);
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.service.log_level, "INFO");
    }

    #[test]
    fn test_overrides() {
        let config = from_json(serde_json::json!({
            "mongo": {"url": "mongodb://m", "replica_set": "rs0", "data_expiration_secs": 60},
            "kafka": {"bootstrap_servers": "kafka:9092", "auto_offset_reset": "earliest"},
            "services": {
                "auth_url": "http://auth",
                "data_broker_url": "http://broker",
                "device_manager_url": "http://dm",
                "request_timeout_secs": 5
            },
            "persister": {"notifications_only": true}
        }));

        assert_eq!(config.mongo.replica_set.as_deref(), Some("rs0"));
        assert_eq!(config.data_expiration(), Duration::from_secs(60));
        assert_eq!(config.kafka.auto_offset_reset, "earliest");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(config.persister.notifications_only);
    }
}
