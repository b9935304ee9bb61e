use crate::error::Result;
use crate::partition::PartitionKey;
use crate::store::{HistoryStore, IndexDirection, IndexSpec};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field used as the hashed shard key of device partitions.
pub const SHARD_KEY: &str = "attr";

/// Ensures the per-partition index set exists before data lands in it.
///
/// Index creation is idempotent in the store, so there is no local record
/// of which partitions were already prepared.
#[derive(Clone)]
pub struct IndexManager {
    store: Arc<dyn HistoryStore>,
    expiration: Duration,
}

impl IndexManager {
    pub fn new(store: Arc<dyn HistoryStore>, expiration: Duration) -> Self {
        Self { store, expiration }
    }

    /// `ts` descending, unique `(attr, ts)` and the `ts` TTL index.
    pub fn index_set(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::new(&[("ts", IndexDirection::Descending)]),
            IndexSpec::new(&[
                ("attr", IndexDirection::Descending),
                ("ts", IndexDirection::Descending),
            ])
            .unique(),
            IndexSpec::new(&[("ts", IndexDirection::Ascending)]).expire_after(self.expiration),
        ]
    }

    /// Notification documents carry no `attr`, so the compound index is not
    /// unique there: two notifications may share a `ts`.
    pub fn notification_index_set(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::new(&[("ts", IndexDirection::Descending)]),
            IndexSpec::new(&[
                ("attr", IndexDirection::Descending),
                ("ts", IndexDirection::Descending),
            ]),
            IndexSpec::new(&[("ts", IndexDirection::Ascending)]).expire_after(self.expiration),
        ]
    }

    /// Create every index of the device set, one at a time. Failures are
    /// logged and counted, never returned; the number of indexes confirmed is.
    pub async fn ensure_indexes(&self, partition: &PartitionKey) -> usize {
        self.ensure(partition, self.index_set()).await
    }

    /// Same as [`ensure_indexes`](Self::ensure_indexes) for a tenant's
    /// notification partition.
    pub async fn ensure_notification_indexes(&self, partition: &PartitionKey) -> usize {
        self.ensure(partition, self.notification_index_set()).await
    }

    async fn ensure(&self, partition: &PartitionKey, indexes: Vec<IndexSpec>) -> usize {
        let mut ensured = 0;
        for index in indexes {
            match self.store.create_index(partition, &index).await {
                Ok(()) => {
                    ensured += 1;
                    metrics::counter!("history.indexes.ensured").increment(1);
                }
                Err(e) => {
                    warn!(
                        partition = %partition,
                        index = %index.name(),
                        error = %e,
                        "Failed to create index"
                    );
                    metrics::counter!("history.storage.errors").increment(1);
                }
            }
        }
        debug!(partition = %partition, ensured, "Indexes ensured");
        ensured
    }

    /// Hashed `attr` index followed by the sharding commands. Administrative
    /// only: never called for regular traffic.
    pub async fn enable_sharding(&self, partition: &PartitionKey) -> Result<()> {
        let hashed = IndexSpec::new(&[(SHARD_KEY, IndexDirection::Hashed)]);
        self.store.create_index(partition, &hashed).await?;
        self.store.enable_sharding(partition, SHARD_KEY).await?;
        info!(partition = %partition, "Sharding enabled");
        Ok(())
    }
}
