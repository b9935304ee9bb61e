//! MongoDB implementation of [`HistoryStore`].

use crate::config::MongoConfig;
use crate::error::{HistoryError, Result};
use crate::partition::PartitionKey;
use crate::query::{
    FilterValue, HistoryQuery, NotificationQuery, SortOrder, TimeRange, BLANK_VALUE,
    HIDDEN_FIELDS,
};
use crate::store::{
    AttributeSample, HistoryStore, IndexDirection, IndexSpec, NotificationRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions, InsertManyOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

/// Document store client, constructed once at startup and shared by the
/// persister and the API.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        info!(url = %config.url, database = %config.database, "Connecting to MongoDB");

        let mut options = ClientOptions::parse(&config.url).await?;
        if let Some(replica_set) = &config.replica_set {
            options.repl_set_name = Some(replica_set.clone());
        }
        options.max_pool_size = Some(config.max_pool_size);
        options.connect_timeout = Some(config.connect_timeout());
        options.app_name = Some("history".to_string());

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);

        Ok(Self { client, database })
    }

    /// Round-trip to the server, used at startup and by readiness checks.
    pub async fn ping(&self) -> Result<()> {
        self.database.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.client.shutdown().await;
        info!("MongoDB client closed");
    }

    fn collection(&self, partition: &PartitionKey) -> Collection<Document> {
        self.database.collection(partition.as_str())
    }
}

fn index_model(index: &IndexSpec) -> IndexModel {
    let mut keys = Document::new();
    for (field, direction) in &index.keys {
        let value = match direction {
            IndexDirection::Ascending => Bson::Int32(1),
            IndexDirection::Descending => Bson::Int32(-1),
            IndexDirection::Hashed => Bson::String("hashed".to_string()),
        };
        keys.insert(field.clone(), value);
    }

    let options = IndexOptions::builder()
        .unique(index.unique.then_some(true))
        .expire_after(index.expire_after)
        .build();

    IndexModel::builder().keys(keys).options(options).build()
}

fn to_bson_datetime(ts: DateTime<Utc>) -> Bson {
    Bson::DateTime(mongodb::bson::DateTime::from_millis(ts.timestamp_millis()))
}

fn time_filter(range: &TimeRange) -> Option<Document> {
    let mut filter = Document::new();
    if let Some(gte) = range.gte {
        filter.insert("$gte", to_bson_datetime(gte));
    }
    if let Some(lte) = range.lte {
        filter.insert("$lte", to_bson_datetime(lte));
    }
    (!filter.is_empty()).then_some(filter)
}

fn projection() -> Document {
    let mut projection = Document::new();
    for field in HIDDEN_FIELDS {
        projection.insert(field, 0);
    }
    projection
}

fn json_to_bson(value: &Value) -> Result<Bson> {
    to_bson(value).map_err(|e| HistoryError::Decode(e.to_string()))
}

fn sample_document(sample: &AttributeSample) -> Result<Document> {
    Ok(doc! {
        "attr": sample.attr.as_str(),
        "value": json_to_bson(&sample.value)?,
        "device_id": sample.device_id.as_str(),
        "ts": to_bson_datetime(sample.ts),
        "metadata": json_to_bson(&Value::Object(sample.metadata.clone()))?,
    })
}

fn take_ts(document: &mut Document) -> Result<DateTime<Utc>> {
    match document.remove("ts") {
        Some(Bson::DateTime(ts)) => DateTime::from_timestamp_millis(ts.timestamp_millis())
            .ok_or_else(|| HistoryError::Storage("ts out of range".to_string())),
        _ => Err(HistoryError::Storage("document has no ts".to_string())),
    }
}

fn into_json_map(document: Document) -> Map<String, Value> {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

fn sample_from_document(mut document: Document) -> Result<AttributeSample> {
    let ts = take_ts(&mut document)?;
    let mut fields = into_json_map(document);

    let text = |value: Option<Value>| match value {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    Ok(AttributeSample {
        attr: text(fields.remove("attr")),
        device_id: text(fields.remove("device_id")),
        value: fields.remove("value").unwrap_or(Value::Null),
        metadata: match fields.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            _ => Map::new(),
        },
        ts,
    })
}

fn notification_from_document(mut document: Document) -> Result<NotificationRecord> {
    let ts = take_ts(&mut document)?;
    Ok(NotificationRecord {
        ts,
        fields: into_json_map(document),
    })
}

#[async_trait]
impl HistoryStore for MongoStore {
    #[instrument(skip(self, index), fields(index = %index.name()))]
    async fn create_index(&self, partition: &PartitionKey, index: &IndexSpec) -> Result<()> {
        self.collection(partition)
            .create_index(index_model(index))
            .await
            .map_err(|e| HistoryError::StorageAdmin {
                partition: partition.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn enable_sharding(&self, partition: &PartitionKey, shard_key: &str) -> Result<()> {
        let admin = self.client.database("admin");
        let admin_error = |e: mongodb::error::Error| HistoryError::StorageAdmin {
            partition: partition.to_string(),
            message: e.to_string(),
        };

        admin
            .run_command(doc! { "enableSharding": self.database.name() })
            .await
            .map_err(admin_error)?;
        admin
            .run_command(doc! {
                "shardCollection": format!("{}.{}", self.database.name(), partition),
                "key": { shard_key: "hashed" },
            })
            .await
            .map_err(admin_error)?;

        info!(partition = %partition, shard_key, "Partition sharded");
        Ok(())
    }

    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn insert_samples(
        &self,
        partition: &PartitionKey,
        samples: &[AttributeSample],
    ) -> Result<usize> {
        let documents = samples
            .iter()
            .map(sample_document)
            .collect::<Result<Vec<_>>>()?;

        let options = InsertManyOptions::builder().ordered(false).build();
        let result = self
            .collection(partition)
            .insert_many(documents)
            .with_options(options)
            .await
            .map_err(|e| HistoryError::StorageWrite {
                partition: partition.to_string(),
                message: e.to_string(),
            })?;

        debug!(partition = %partition, inserted = result.inserted_ids.len(), "Samples inserted");
        Ok(result.inserted_ids.len())
    }

    async fn insert_notification(
        &self,
        partition: &PartitionKey,
        record: &NotificationRecord,
    ) -> Result<()> {
        let mut document = match json_to_bson(&Value::Object(record.fields.clone()))? {
            Bson::Document(document) => document,
            _ => Document::new(),
        };
        document.insert("ts", to_bson_datetime(record.ts));

        self.collection(partition)
            .insert_one(document)
            .await
            .map_err(|e| HistoryError::StorageWrite {
                partition: partition.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn partition_exists(&self, partition: &PartitionKey) -> Result<bool> {
        let names = self
            .database
            .list_collection_names()
            .filter(doc! { "name": partition.as_str() })
            .await?;
        Ok(!names.is_empty())
    }

    #[instrument(skip(self, query))]
    async fn find_samples(
        &self,
        partition: &PartitionKey,
        query: &HistoryQuery,
    ) -> Result<Vec<AttributeSample>> {
        let mut filter = doc! { "value": { "$ne": BLANK_VALUE } };
        if let Some(attr) = &query.attr {
            filter.insert("attr", attr.as_str());
        }
        if let Some(range) = time_filter(&query.time_range) {
            filter.insert("ts", range);
        }

        let direction = match query.sort {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        let options = FindOptions::builder()
            .projection(projection())
            .sort(doc! { "ts": direction })
            .limit(query.limit)
            .build();

        let cursor = self
            .collection(partition)
            .find(filter)
            .with_options(options)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        documents.into_iter().map(sample_from_document).collect()
    }

    #[instrument(skip(self, query))]
    async fn find_notifications(
        &self,
        partition: &PartitionKey,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>> {
        let mut filter = Document::new();
        for (field, value) in &query.filters {
            let value = match value {
                FilterValue::Int(number) => Bson::Int64(*number),
                FilterValue::Text(text) => Bson::String(text.clone()),
            };
            filter.insert(field.clone(), value);
        }
        if let Some(range) = time_filter(&query.time_range) {
            filter.insert("ts", range);
        }

        let options = FindOptions::builder()
            .projection(projection())
            .sort(doc! { "ts": -1 })
            .limit(query.limit)
            .build();

        let cursor = self
            .collection(partition)
            .find(filter)
            .with_options(options)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        documents
            .into_iter()
            .map(notification_from_document)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_index_model_keys_and_options() {
        let ttl = IndexSpec::new(&[("ts", IndexDirection::Ascending)])
            .expire_after(Duration::from_secs(604800));
        let model = index_model(&ttl);
        assert_eq!(model.keys, doc! { "ts": 1 });
        let options = model.options.unwrap();
        assert_eq!(options.expire_after, Some(Duration::from_secs(604800)));
        assert_eq!(options.unique, None);

        let compound = IndexSpec::new(&[
            ("attr", IndexDirection::Descending),
            ("ts", IndexDirection::Descending),
        ])
        .unique();
        let model = index_model(&compound);
        assert_eq!(model.keys, doc! { "attr": -1, "ts": -1 });
        assert_eq!(model.options.unwrap().unique, Some(true));

        let hashed = index_model(&IndexSpec::new(&[("attr", IndexDirection::Hashed)]));
        assert_eq!(hashed.keys, doc! { "attr": "hashed" });
    }

    #[test]
    fn test_sample_document_round_trip() {
        let sample = AttributeSample {
            attr: "temperature".to_string(),
            value: json!("22.12"),
            device_id: "d1".to_string(),
            ts: Utc.timestamp_millis_opt(1528226137452).unwrap(),
            metadata: json!({"shouldPersist": true}).as_object().cloned().unwrap(),
        };

        let document = sample_document(&sample).unwrap();
        assert!(matches!(document.get("ts"), Some(Bson::DateTime(_))));
        assert_eq!(sample_from_document(document).unwrap(), sample);
    }

    #[test]
    fn test_time_filter_bounds() {
        assert!(time_filter(&TimeRange::default()).is_none());

        let range = TimeRange {
            gte: Some(Utc.timestamp_opt(10, 0).unwrap()),
            lte: None,
        };
        let filter = time_filter(&range).unwrap();
        assert!(filter.contains_key("$gte"));
        assert!(!filter.contains_key("$lte"));
    }

    #[test]
    fn test_projection_hides_internal_fields() {
        assert_eq!(
            projection(),
            doc! { "_id": 0, "@timestamp": 0, "@version": 0 }
        );
    }
}
