//! Kafka consumer via rdkafka's `StreamConsumer`.
//!
//! Offsets are committed after every handler invocation, success or failure:
//! delivery is at-least-once at the broker boundary and best-effort at the
//! sink boundary.

use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::{MessageHandler, QueueConsumer, QueueError, Result};
use async_trait::async_trait;
use konsume_config::KafkaSettings;

pub struct KafkaConsumer {
    settings: KafkaSettings,
    consumer: Arc<RwLock<Option<Arc<StreamConsumer>>>>,
}

impl KafkaConsumer {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            consumer: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl QueueConsumer for KafkaConsumer {
    async fn connect(&self) -> Result<()> {
        debug!(
            brokers = ?self.settings.brokers,
            topic = %self.settings.topic,
            group = %self.settings.group,
            "connecting to Kafka"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &self.settings.group)
            .set("bootstrap.servers", self.settings.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| QueueError::Connect(format!("failed to create consumer: {e}")))?;

        *self.consumer.write().await = Some(Arc::new(consumer));
        info!(group = %self.settings.group, "connected to Kafka");
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let consumer = self
            .consumer
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotConnected)?;

        consumer
            .subscribe(&[queue])
            .map_err(|e| QueueError::Consume(format!("failed to subscribe: {e}")))?;

        debug!(topic = %queue, "starting to consume messages from Kafka");

        loop {
            match consumer.recv().await {
                Ok(message) => {
                    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    if let Err(e) = handler.handle(payload).await {
                        error!(topic = %queue, error = %e, "failed to process message");
                    }
                    // Commit regardless of the handler outcome.
                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        error!(topic = %queue, error = %e, "failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(topic = %queue, error = %e, "failed to read message from Kafka");
                    return Err(QueueError::Consume(e.to_string()));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(consumer) = self.consumer.write().await.take() {
            consumer.unsubscribe();
        }
        info!(group = %self.settings.group, "Kafka consumer closed");
        Ok(())
    }
}
