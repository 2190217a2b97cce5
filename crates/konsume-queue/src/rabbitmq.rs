//! RabbitMQ consumer via AMQP 0.9.1 (lapin).
//!
//! Queues are declared durable / non-exclusive / non-autodelete and consumed
//! with manual acknowledgment: handler success acks, handler error nacks
//! without requeue so broker-side dead-letter policy can take over.

use std::sync::Arc;

use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::{MessageHandler, QueueConsumer, QueueError, Result};
use async_trait::async_trait;
use konsume_config::AmqpSettings;

pub struct RabbitMqConsumer {
    settings: AmqpSettings,
    connection: Arc<RwLock<Option<Connection>>>,
    channel: Arc<RwLock<Option<Channel>>>,
}

impl RabbitMqConsumer {
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            connection: Arc::new(RwLock::new(None)),
            channel: Arc::new(RwLock::new(None)),
        }
    }

    fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/",
            self.settings.username, self.settings.password, self.settings.host, self.settings.port
        )
    }
}

#[async_trait]
impl QueueConsumer for RabbitMqConsumer {
    async fn connect(&self) -> Result<()> {
        let connection = Connection::connect(&self.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connect(format!("AMQP connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connect(format!("failed to create channel: {e}")))?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel);

        info!(host = %self.settings.host, port = self.settings.port, "connected to RabbitMQ");
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotConnected)?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("failed to declare queue: {e}")))?;

        let mut deliveries = channel
            .basic_consume(
                queue,
                &format!("konsume-{queue}"),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("failed to create consumer: {e}")))?;

        while let Some(delivery) = deliveries.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    error!(queue = %queue, error = %e, "error receiving delivery");
                    return Err(QueueError::Consume(e.to_string()));
                }
            };

            match handler.handle(delivery.data.clone()).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        error!(queue = %queue, error = %e, "failed to ack delivery");
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "handler failed, nacking without requeue");
                    if let Err(e) = delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await
                    {
                        error!(queue = %queue, error = %e, "failed to nack delivery");
                    }
                }
            }
        }

        debug!(queue = %queue, "delivery stream ended");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.write().await.take() {
            channel
                .close(200, "shutdown")
                .await
                .map_err(|e| QueueError::Close(e.to_string()))?;
        }
        if let Some(connection) = self.connection.write().await.take() {
            connection
                .close(200, "shutdown")
                .await
                .map_err(|e| QueueError::Close(e.to_string()))?;
        }
        info!(host = %self.settings.host, "RabbitMQ consumer closed");
        Ok(())
    }
}
