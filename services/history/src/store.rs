//! Storage seam between the persister/API and the document store.

use crate::error::Result;
use crate::partition::PartitionKey;
use crate::query::{HistoryQuery, NotificationQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

/// Direction of one index key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDirection {
    Ascending,
    Descending,
    Hashed,
}

impl IndexDirection {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Ascending => "1",
            Self::Descending => "-1",
            Self::Hashed => "hashed",
        }
    }
}

/// Declarative index definition, applied per partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<(String, IndexDirection)>,
    /// Documents are removed once `ts` is older than this.
    pub expire_after: Option<Duration>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(keys: &[(&str, IndexDirection)]) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|(field, direction)| (field.to_string(), *direction))
                .collect(),
            expire_after: None,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    /// Name derived from the key pattern, e.g. `attr_-1_ts_-1`
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction.suffix()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// One stored value of one device attribute
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSample {
    pub attr: String,
    pub value: Value,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// One stored notification. `fields` holds everything except `ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub ts: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Document store operations used by the persister and the history API
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create one index on a partition. Re-creating an identical index is a no-op.
    async fn create_index(&self, partition: &PartitionKey, index: &IndexSpec) -> Result<()>;

    /// Enable sharding on the database and shard `partition` on a hashed key.
    async fn enable_sharding(&self, partition: &PartitionKey, shard_key: &str) -> Result<()>;

    /// Unordered batch insert; returns the number of documents written.
    async fn insert_samples(
        &self,
        partition: &PartitionKey,
        samples: &[AttributeSample],
    ) -> Result<usize>;

    async fn insert_notification(
        &self,
        partition: &PartitionKey,
        record: &NotificationRecord,
    ) -> Result<()>;

    async fn partition_exists(&self, partition: &PartitionKey) -> Result<bool>;

    async fn find_samples(
        &self,
        partition: &PartitionKey,
        query: &HistoryQuery,
    ) -> Result<Vec<AttributeSample>>;

    async fn find_notifications(
        &self,
        partition: &PartitionKey,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>>;
}
