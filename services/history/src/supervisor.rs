//! Supervision of the per-tenant listeners.
//!
//! The tenancy listener runs first; every tenant known at startup, or
//! announced later on the tenancy channel, gets its own device, device-data
//! and notification listeners. All listeners live in one `JoinSet` so a
//! fatal bootstrap failure can tear them down together.

use crate::clients::{TenantDirectory, TopicResolver};
use crate::config::SubjectsConfig;
use crate::consumer::{Bus, IncomingMessage, MessageHandler};
use crate::error::{HistoryError, Result};
use crate::persister::{ChannelHandler, Persister, TenantChannel};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub subjects: SubjectsConfig,
    /// Consume only tenancy and notification channels
    pub notifications_only: bool,
}

pub struct Supervisor {
    bus: Arc<dyn Bus>,
    topics: Arc<dyn TopicResolver>,
    directory: Arc<dyn TenantDirectory>,
    persister: Arc<Persister>,
    settings: SupervisorSettings,
    tasks: Mutex<JoinSet<()>>,
    spawned: Mutex<HashSet<(String, String)>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        bus: Arc<dyn Bus>,
        topics: Arc<dyn TopicResolver>,
        directory: Arc<dyn TenantDirectory>,
        persister: Arc<Persister>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            topics,
            directory,
            persister,
            settings,
            tasks: Mutex::new(JoinSet::new()),
            spawned: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the tenancy listener, then bootstrap every known tenant.
    /// On failure every listener spawned so far is aborted.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let result = self.bootstrap().await;
        if let Err(e) = &result {
            error!(error = %e, "Bootstrap failed, aborting listeners");
            self.abort_all();
        }
        result
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let subjects = &self.settings.subjects;
        let topic = self
            .topics
            .topic(&subjects.management_service, &subjects.tenancy, true)
            .await
            .map_err(|e| {
                HistoryError::Configuration(format!("tenancy topic unavailable: {}", e))
            })?;

        let handler = Arc::new(TenancyHandler::new(self));
        self.spawn_listener(&subjects.management_service, &subjects.tenancy, &topic, handler)?;
        info!(topic = %topic, "Listening to tenancy events");

        self.bootstrap_tenants().await
    }

    /// List the existing tenants and start their listeners.
    pub async fn bootstrap_tenants(&self) -> Result<()> {
        let tenants = self.directory.list_tenants().await.map_err(|e| {
            HistoryError::Configuration(format!("failed to retrieve tenants: {}", e))
        })?;
        info!(count = tenants.len(), "Bootstrapping tenants");

        self.persister.bootstrap_tenants(&tenants).await;
        for tenant in &tenants {
            self.add_tenant(tenant).await?;
        }
        Ok(())
    }

    /// Start the listeners of one tenant. Channels already running are kept.
    pub async fn add_tenant(&self, tenant: &str) -> Result<()> {
        self.spawn_channel(tenant, TenantChannel::Notifications).await?;
        if !self.settings.notifications_only {
            self.spawn_channel(tenant, TenantChannel::Devices).await?;
            self.spawn_channel(tenant, TenantChannel::DeviceData).await?;
        }
        Ok(())
    }

    fn subject(&self, channel: TenantChannel) -> &str {
        let subjects = &self.settings.subjects;
        match channel {
            TenantChannel::Devices => &subjects.devices,
            TenantChannel::DeviceData => &subjects.device_data,
            TenantChannel::Notifications => &subjects.notifications,
        }
    }

    /// Returns `false` when the channel was already running.
    pub async fn spawn_channel(&self, tenant: &str, channel: TenantChannel) -> Result<bool> {
        let subject = self.subject(channel).to_string();
        let key = (tenant.to_string(), subject.clone());
        if !self.spawned.lock().insert(key.clone()) {
            debug!(tenant, subject = %subject, "Listener already running");
            return Ok(false);
        }

        let spawned: Result<()> = async {
            let topic = self.topics.topic(tenant, &subject, false).await?;
            let handler = Arc::new(ChannelHandler::new(self.persister.clone(), tenant, channel));
            self.start_task(&topic, handler)?;
            info!(tenant, subject = %subject, topic = %topic, "Listener started");
            Ok(())
        }
        .await;

        if let Err(e) = spawned {
            self.spawned.lock().remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    fn spawn_listener(
        &self,
        tenant: &str,
        subject: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.spawned
            .lock()
            .insert((tenant.to_string(), subject.to_string()));
        self.start_task(topic, handler)
    }

    fn start_task(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let listener = self
            .bus
            .listen(topic, handler, self.shutdown.child_token())?;
        self.tasks.lock().spawn(listener);
        Ok(())
    }

    pub fn is_running(&self, tenant: &str, subject: &str) -> bool {
        self.spawned
            .lock()
            .contains(&(tenant.to_string(), subject.to_string()))
    }

    pub fn listener_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel and abort every listener without waiting.
    pub fn abort_all(&self) {
        self.shutdown.cancel();
        self.tasks.lock().abort_all();
    }

    /// Ask every listener to stop and wait for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(error = %e, "Listener task failed");
                }
            }
        }
        info!("All listeners stopped");
    }
}

/// Starts listeners for tenants announced on the tenancy channel
pub struct TenancyHandler {
    supervisor: Weak<Supervisor>,
}

impl TenancyHandler {
    pub fn new(supervisor: &Arc<Supervisor>) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for TenancyHandler {
    async fn handle(&self, message: &IncomingMessage) -> Result<()> {
        let Some(supervisor) = self.supervisor.upgrade() else {
            return Ok(());
        };
        let tenant = supervisor.persister.handle_new_tenant(&message.payload).await?;
        supervisor.add_tenant(&tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::IndexManager;
    use crate::partition::PartitionKey;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBus {
        topics: Mutex<Vec<String>>,
    }

    impl Bus for FakeBus {
        fn listen(
            &self,
            topic: &str,
            _handler: Arc<dyn MessageHandler>,
            shutdown: CancellationToken,
        ) -> Result<BoxFuture<'static, ()>> {
            self.topics.lock().push(topic.to_string());
            Ok(async move { shutdown.cancelled().await }.boxed())
        }
    }

    struct FakeResolver {
        unavailable: Option<&'static str>,
    }

    #[async_trait]
    impl TopicResolver for FakeResolver {
        async fn topic(&self, tenant: &str, subject: &str, global: bool) -> Result<String> {
            if self.unavailable == Some(subject) {
                return Err(HistoryError::Upstream("data broker answered 500".to_string()));
            }
            let scope = if global { "global" } else { tenant };
            Ok(format!("{}.{}", scope, subject))
        }
    }

    struct FakeDirectory {
        tenants: Option<Vec<String>>,
    }

    #[async_trait]
    impl TenantDirectory for FakeDirectory {
        async fn list_tenants(&self) -> Result<Vec<String>> {
            self.tenants
                .clone()
                .ok_or_else(|| HistoryError::Upstream("auth timed out".to_string()))
        }
    }

    struct Fixture {
        bus: Arc<FakeBus>,
        store: Arc<MemoryStore>,
        supervisor: Arc<Supervisor>,
    }

    fn fixture(
        tenants: Option<Vec<&str>>,
        unavailable: Option<&'static str>,
        notifications_only: bool,
    ) -> Fixture {
        let bus = Arc::new(FakeBus::default());
        let store = Arc::new(MemoryStore::new());
        let indexes = IndexManager::new(store.clone(), Duration::from_secs(60));
        let persister = Arc::new(Persister::new(store.clone(), indexes));
        let supervisor = Supervisor::new(
            bus.clone(),
            Arc::new(FakeResolver { unavailable }),
            Arc::new(FakeDirectory {
                tenants: tenants.map(|t| t.into_iter().map(String::from).collect()),
            }),
            persister,
            SupervisorSettings {
                subjects: SubjectsConfig::default(),
                notifications_only,
            },
        );
        Fixture {
            bus,
            store,
            supervisor,
        }
    }

    #[tokio::test]
    async fn test_start_spawns_tenancy_and_tenant_listeners() {
        let f = fixture(Some(vec!["admin"]), None, false);
        f.supervisor.start().await.unwrap();

        let mut topics = f.bus.topics.lock().clone();
        topics.sort();
        assert_eq!(
            topics,
            vec![
                "admin.device-data",
                "admin.dojot.device-manager.device",
                "admin.dojot.notifications",
                "global.dojot.tenancy",
            ]
        );
        assert_eq!(f.supervisor.listener_count(), 4);
        assert_eq!(
            f.store.indexes(&PartitionKey::notifications("admin")).len(),
            3
        );

        f.supervisor.shutdown().await;
        assert_eq!(f.supervisor.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_spawns_are_ignored() {
        let f = fixture(Some(vec!["admin"]), None, false);
        f.supervisor.start().await.unwrap();

        f.supervisor.add_tenant("admin").await.unwrap();
        let spawned = f
            .supervisor
            .spawn_channel("admin", TenantChannel::Devices)
            .await
            .unwrap();

        assert!(!spawned);
        assert_eq!(f.bus.topics.lock().len(), 4);
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_notifications_only() {
        let f = fixture(Some(vec!["admin", "acme"]), None, true);
        f.supervisor.start().await.unwrap();

        assert_eq!(f.supervisor.listener_count(), 3);
        assert!(f.supervisor.is_running("acme", "dojot.notifications"));
        assert!(!f.supervisor.is_running("acme", "device-data"));
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_tenant_listing_failure_aborts_listeners() {
        let f = fixture(None, None, false);
        let result = f.supervisor.start().await;

        assert!(matches!(result, Err(HistoryError::Configuration(_))));
        assert_eq!(f.bus.topics.lock().len(), 1);
        assert!(f.supervisor.shutdown.is_cancelled());

        f.supervisor.shutdown().await;
        assert_eq!(f.supervisor.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_tenancy_topic_failure_is_fatal() {
        let f = fixture(Some(vec!["admin"]), Some("dojot.tenancy"), false);
        let result = f.supervisor.start().await;

        assert!(matches!(result, Err(HistoryError::Configuration(_))));
        assert!(f.bus.topics.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_channel_can_be_retried() {
        let f = fixture(Some(vec![]), Some("device-data"), false);
        f.supervisor.start().await.unwrap();

        assert!(f.supervisor.add_tenant("acme").await.is_err());
        assert!(f.supervisor.is_running("acme", "dojot.notifications"));
        assert!(!f.supervisor.is_running("acme", "device-data"));
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_tenancy_event_starts_new_tenant() {
        let f = fixture(Some(vec![]), None, false);
        f.supervisor.start().await.unwrap();
        assert_eq!(f.supervisor.listener_count(), 1);

        let handler = TenancyHandler::new(&f.supervisor);
        handler
            .handle(&IncomingMessage::new("global.dojot.tenancy", br#"{"tenant":"acme"}"#.to_vec()))
            .await
            .unwrap();

        assert_eq!(f.supervisor.listener_count(), 4);
        assert!(f.supervisor.is_running("acme", "dojot.device-manager.device"));
        assert_eq!(f.store.indexes(&PartitionKey::notifications("acme")).len(), 3);

        assert!(handler
            .handle(&IncomingMessage::new("global.dojot.tenancy", b"garbage".to_vec()))
            .await
            .is_err());
        f.supervisor.shutdown().await;
    }
}
