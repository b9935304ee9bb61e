//! Event handlers turning bus messages into stored samples and notifications.
//!
//! Every handler is terminal for the message it receives: decode problems,
//! malformed timestamps and write failures are logged and reported as an
//! [`Outcome`], never propagated. The only exceptions are notifications
//! without `timestamp`/`metaAttrsFilter` and undecodable tenancy events,
//! which surface as errors for the listener to log.

use crate::consumer::{IncomingMessage, MessageHandler};
use crate::error::{HistoryError, Result};
use crate::events::{self, DataEvent, LifecycleKind, NotificationEvent};
use crate::index_manager::IndexManager;
use crate::partition::PartitionKey;
use crate::store::{AttributeSample, HistoryStore, NotificationRecord};
use crate::timestamp;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Written { partition: PartitionKey, count: usize },
    Indexed { partition: PartitionKey },
    /// Valid message that intentionally produced no write.
    Skipped(&'static str),
    /// Invalid message or failed write.
    Dropped(String),
}

fn dropped(reason: impl Into<String>) -> Outcome {
    metrics::counter!("history.messages.dropped").increment(1);
    Outcome::Dropped(reason.into())
}

pub struct Persister {
    store: Arc<dyn HistoryStore>,
    indexes: IndexManager,
}

impl Persister {
    pub fn new(store: Arc<dyn HistoryStore>, indexes: IndexManager) -> Self {
        Self { store, indexes }
    }

    /// Device lifecycle: `create`/`update` prepare the device partition,
    /// `configure` is stored as a data event, anything else is ignored.
    #[instrument(skip(self, payload))]
    pub async fn handle_device_event(&self, tenant: &str, payload: &[u8]) -> Outcome {
        let event = match events::decode_lifecycle(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to decode device event");
                return dropped(e.to_string());
            }
        };
        debug!(kind = ?event.kind, "Received device event");

        match event.kind {
            LifecycleKind::Create | LifecycleKind::Update => {
                let (Some(service), Some(device_id)) = (event.service(), event.device_id())
                else {
                    warn!("Device event without meta.service or data.id");
                    return dropped("device event without meta.service or data.id");
                };
                let partition = PartitionKey::resolve(service, &device_id);
                self.indexes.ensure_indexes(&partition).await;
                Outcome::Indexed { partition }
            }
            LifecycleKind::Configure => match event.into_data_event() {
                Ok(data) => self.persist_data_event(tenant, data).await,
                Err(e) => {
                    warn!(error = %e, "Failed to convert configure event");
                    dropped(e.to_string())
                }
            },
            LifecycleKind::Unknown => Outcome::Skipped("device event kind is not handled"),
        }
    }

    #[instrument(skip(self, payload))]
    pub async fn handle_data_event(&self, tenant: &str, payload: &[u8]) -> Outcome {
        match events::decode_data(payload) {
            Ok(event) => self.persist_data_event(tenant, event).await,
            Err(e) => {
                error!(error = %e, "Received event is not valid JSON, ignoring");
                dropped(e.to_string())
            }
        }
    }

    /// Expand a data event into one sample per attribute and write them as
    /// one batch into the `(tenant, device)` partition.
    pub async fn persist_data_event(&self, tenant: &str, event: DataEvent) -> Outcome {
        let event = match event.validate() {
            Ok(event) => event,
            Err(rejection) => {
                warn!(tenant, reason = %rejection, "Ignoring data event");
                return dropped(rejection.to_string());
            }
        };

        let ts = match timestamp::normalize(event.timestamp.as_ref()) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(tenant, device_id = %event.device_id, error = %e, "Ignoring data event");
                return dropped(e.to_string());
            }
        };

        let samples: Vec<AttributeSample> = event
            .attrs
            .into_iter()
            .map(|(attr, value)| AttributeSample {
                attr,
                value,
                device_id: event.device_id.clone(),
                ts,
                metadata: event.metadata.clone(),
            })
            .collect();

        if samples.is_empty() {
            debug!(tenant, device_id = %event.device_id, "Data event without attributes");
            return Outcome::Skipped("data event has no attributes");
        }

        let partition = PartitionKey::resolve(tenant, &event.device_id);
        match self.store.insert_samples(&partition, &samples).await {
            Ok(count) => {
                metrics::counter!("history.samples.written").increment(count as u64);
                debug!(partition = %partition, count, "Samples persisted");
                Outcome::Written { partition, count }
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Failed to persist received information");
                metrics::counter!("history.storage.errors").increment(1);
                dropped(e.to_string())
            }
        }
    }

    /// Persist a notification when `metaAttrsFilter.shouldPersist` is set.
    ///
    /// Invalid JSON is dropped. A missing `timestamp` or `metaAttrsFilter`
    /// is an error.
    #[instrument(skip(self, payload))]
    pub async fn handle_notification(&self, tenant: &str, payload: &[u8]) -> Result<Outcome> {
        let object = match events::decode_object(payload) {
            Ok(object) => object,
            Err(e) => {
                debug!(error = %e, "Invalid notification JSON");
                return Ok(dropped(e.to_string()));
            }
        };
        let notification = NotificationEvent::from_object(object)?;

        let ts = match timestamp::normalize(Some(&notification.timestamp)) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "Ignoring notification");
                return Ok(dropped(e.to_string()));
            }
        };

        if !notification.should_persist {
            debug!("Notification should not be persisted, discarding it");
            return Ok(Outcome::Skipped("notification should not be persisted"));
        }

        let partition = PartitionKey::notifications(tenant);
        let record = NotificationRecord {
            ts,
            fields: notification.fields,
        };
        match self.store.insert_notification(&partition, &record).await {
            Ok(()) => {
                metrics::counter!("history.notifications.written").increment(1);
                Ok(Outcome::Written {
                    partition,
                    count: 1,
                })
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Failed to persist notification");
                metrics::counter!("history.storage.errors").increment(1);
                Ok(dropped(e.to_string()))
            }
        }
    }

    /// Tenancy event: prepare the new tenant's notification partition.
    pub async fn handle_new_tenant(&self, payload: &[u8]) -> Result<String> {
        let event = events::decode_tenancy(payload)?;
        info!(tenant = %event.tenant, "Received a new tenant");
        self.ensure_tenant(&event.tenant).await;
        Ok(event.tenant)
    }

    pub async fn ensure_tenant(&self, tenant: &str) -> PartitionKey {
        let partition = PartitionKey::notifications(tenant);
        self.indexes.ensure_notification_indexes(&partition).await;
        partition
    }

    pub async fn bootstrap_tenants(&self, tenants: &[String]) {
        debug!(?tenants, "Creating notification indexes");
        for tenant in tenants {
            self.ensure_tenant(tenant).await;
        }
    }
}

/// Per-tenant channels the persister consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantChannel {
    Devices,
    DeviceData,
    Notifications,
}

/// Routes one tenant channel into the matching persister handler
pub struct ChannelHandler {
    persister: Arc<Persister>,
    tenant: String,
    channel: TenantChannel,
}

impl ChannelHandler {
    pub fn new(persister: Arc<Persister>, tenant: &str, channel: TenantChannel) -> Self {
        Self {
            persister,
            tenant: tenant.to_string(),
            channel,
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &IncomingMessage) -> Result<()> {
        let outcome = match self.channel {
            TenantChannel::Devices => {
                self.persister
                    .handle_device_event(&self.tenant, &message.payload)
                    .await
            }
            TenantChannel::DeviceData => {
                self.persister
                    .handle_data_event(&self.tenant, &message.payload)
                    .await
            }
            TenantChannel::Notifications => {
                self.persister
                    .handle_notification(&self.tenant, &message.payload)
                    .await?
            }
        };

        debug!(
            tenant = %self.tenant,
            channel = ?self.channel,
            offset = message.offset,
            outcome = ?outcome,
            "Message handled"
        );
        Ok(())
    }

    async fn on_error(&self, message: &IncomingMessage, error: HistoryError) {
        warn!(
            tenant = %self.tenant,
            channel = ?self.channel,
            topic = %message.topic,
            offset = message.offset,
            error = %error,
            "Failed to handle message"
        );
    }
}
