//! Broker consumer contracts and adapters.
//!
//! Each broker exposes the same capability set: connect, consume a named
//! destination with a callback, close. Ack discipline differs per broker and
//! is encoded inside each adapter, not in the dispatch engine:
//!
//! - RabbitMQ: manual ack; handler success acks, handler error nacks without
//!   requeue (dead-lettering is broker policy).
//! - Kafka: commit after every handler invocation, success or not.
//! - ActiveMQ (STOMP): auto-ack subscription.

use std::sync::Arc;

use async_trait::async_trait;

use konsume_config::{ProviderConfig, ProviderKind};

pub mod activemq;
pub mod error;
pub mod kafka;
pub mod rabbitmq;
mod stomp;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Error returned by a message handler.
///
/// Purely informational: the consumer decides the ack/nack outcome, the
/// error itself is never propagated to the broker as a payload.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Callback invoked for every delivery.
///
/// Implementations must not block on unbounded work and must not propagate
/// panics; the dispatch engine provides the isolation.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>) -> std::result::Result<(), HandlerError>;
}

/// Uniform consumer contract over the three brokers.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Establish the broker connection.
    async fn connect(&self) -> Result<()>;

    /// Consume `queue`, invoking `handler` for every delivery.
    ///
    /// For RabbitMQ and Kafka this runs the delivery loop on the calling
    /// task (the handler is awaited before the next delivery is fetched,
    /// which is what backpressures the broker). The STOMP adapter delivers
    /// from a background task and returns immediately.
    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Tear the connection down, unblocking any in-flight consume loop.
    async fn close(&self) -> Result<()>;
}

/// Build a consumer for a provider by its kind tag.
pub fn build_consumer(provider: &ProviderConfig) -> Result<Arc<dyn QueueConsumer>> {
    match provider.kind {
        ProviderKind::Rabbitmq => {
            let settings = provider.amqp.clone().ok_or_else(|| {
                QueueError::Config(format!("provider {}: amqp-config not defined", provider.name))
            })?;
            Ok(Arc::new(rabbitmq::RabbitMqConsumer::new(settings)))
        }
        ProviderKind::Kafka => {
            let settings = provider.kafka.clone().ok_or_else(|| {
                QueueError::Config(format!(
                    "provider {}: kafka-config not defined",
                    provider.name
                ))
            })?;
            Ok(Arc::new(kafka::KafkaConsumer::new(settings)))
        }
        ProviderKind::Activemq => {
            let settings = provider.stomp.clone().ok_or_else(|| {
                QueueError::Config(format!(
                    "provider {}: stomp-config not defined",
                    provider.name
                ))
            })?;
            Ok(Arc::new(activemq::ActiveMqConsumer::new(settings)))
        }
    }
}
