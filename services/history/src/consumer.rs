//! Kafka consumption: one listener per topic, one message at a time.

use crate::config::KafkaConfig;
use crate::error::{HistoryError, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A received message with payload and position
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            topic: topic.into(),
            partition: 0,
            offset: 0,
        }
    }

    fn from_kafka<M: Message>(message: &M) -> Self {
        Self {
            payload: message.payload().unwrap_or(&[]).to_vec(),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &IncomingMessage) -> Result<()>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: HistoryError) {
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Run one message through `handler`. Errors end at this boundary.
pub async fn dispatch(handler: &dyn MessageHandler, message: &IncomingMessage) -> bool {
    match handler.handle(message).await {
        Ok(()) => {
            metrics::counter!("history.messages.processed").increment(1);
            true
        }
        Err(e) => {
            metrics::counter!("history.messages.failed").increment(1);
            handler.on_error(message, e).await;
            false
        }
    }
}

/// Consumer bound to a single topic
pub struct KafkaListener {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaListener {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic])?;

        info!(
            topic = %topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }

    /// Consume until `shutdown` fires. The offset of every message is
    /// committed once it has been handled, successfully or not.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, shutdown: CancellationToken) {
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(topic = %self.topic, "Listener stopping");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let incoming = IncomingMessage::from_kafka(&message);
                        debug!(
                            topic = %incoming.topic,
                            partition = incoming.partition,
                            offset = incoming.offset,
                            "Received message"
                        );

                        dispatch(handler.as_ref(), &incoming).await;

                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            warn!(topic = %self.topic, error = %e, "Failed to commit offset");
                        }
                    }
                    Some(Err(e)) => {
                        error!(topic = %self.topic, error = %e, "Kafka consumer error");
                        metrics::counter!("history.kafka.errors").increment(1);
                    }
                    None => {
                        warn!(topic = %self.topic, "Kafka stream ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Source of topic listeners, so supervision can run without a broker.
pub trait Bus: Send + Sync {
    /// Subscribe to `topic` and return the consumption loop to be spawned.
    fn listen(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<BoxFuture<'static, ()>>;
}

pub struct KafkaBus {
    config: KafkaConfig,
}

impl KafkaBus {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl Bus for KafkaBus {
    fn listen(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<BoxFuture<'static, ()>> {
        let listener = KafkaListener::new(&self.config, topic)?;
        Ok(listener.run(handler, shutdown).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        handled: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, message: &IncomingMessage) -> Result<()> {
            self.handled.lock().push(message.payload.clone());
            if message.payload == b"boom" {
                return Err(HistoryError::MissingField("metaAttrsFilter"));
            }
            Ok(())
        }

        async fn on_error(&self, _message: &IncomingMessage, error: HistoryError) {
            self.errors.lock().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_dispatch_isolates_handler_errors() {
        let handler = Recording::default();

        assert!(dispatch(&handler, &IncomingMessage::new("t", "ok")).await);
        assert!(!dispatch(&handler, &IncomingMessage::new("t", "boom")).await);
        assert!(dispatch(&handler, &IncomingMessage::new("t", "after")).await);

        assert_eq!(handler.handled.lock().len(), 3);
        assert_eq!(
            handler.errors.lock().as_slice(),
            ["Missing required field: metaAttrsFilter".to_string()]
        );
    }
}
