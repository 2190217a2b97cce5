//! Consumer and sink lifecycle.
//!
//! Startup: connect every configured sink (fixed 5s backoff, abort on
//! exhaustion), then spawn one task per queue that connects its consumer
//! with the provider's retry budget and binds the dispatch engine. A queue
//! whose connection attempts are exhausted is abandoned; the others keep
//! running. Shutdown closes consumers, lets in-flight fan-out drain to its
//! natural outcome under a grace period, then closes sinks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use konsume_config::{Config, DatabaseConfig, ProviderConfig};
use konsume_queue::QueueConsumer;
use konsume_sink::{create_sink, Sink};

use crate::engine::DispatchEngine;
use crate::metrics::DispatchMetrics;
use crate::requester::Requester;
use crate::{EngineError, Result};

const CONNECT_BACKOFF: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Supervisor {
    consumers: HashMap<String, Arc<dyn QueueConsumer>>,
    providers: HashMap<String, ProviderConfig>,
    sinks: Arc<HashMap<String, Arc<dyn Sink>>>,
    /// Engines started by `start_consumers`, kept so shutdown can drain
    /// their in-flight fan-out tasks.
    engines: Mutex<Vec<DispatchEngine>>,
}

impl Supervisor {
    pub fn new(
        consumers: HashMap<String, Arc<dyn QueueConsumer>>,
        providers: HashMap<String, ProviderConfig>,
        sinks: HashMap<String, Arc<dyn Sink>>,
    ) -> Self {
        Self {
            consumers,
            providers,
            sinks: Arc::new(sinks),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Connect every configured sink, retrying with a fixed backoff up to
    /// the database's retry budget. Any exhausted sink aborts startup.
    pub async fn connect_sinks(
        databases: &[DatabaseConfig],
    ) -> Result<HashMap<String, Arc<dyn Sink>>> {
        let mut sinks: HashMap<String, Arc<dyn Sink>> = HashMap::new();
        for db in databases {
            let sink = create_sink(db.kind.as_str())
                .map_err(|e| EngineError::SinkInit(e.to_string()))?;

            let mut attempt = 0;
            loop {
                match sink.connect(&db.connection_string, &db.database).await {
                    Ok(()) => break,
                    Err(e) => {
                        if attempt >= db.retry {
                            return Err(EngineError::SinkConnect(
                                db.name.clone(),
                                e.to_string(),
                            ));
                        }
                        attempt += 1;
                        warn!(
                            database = %db.name,
                            attempt,
                            error = %e,
                            "failed to connect to sink, retrying in 5s"
                        );
                        tokio::time::sleep(CONNECT_BACKOFF).await;
                    }
                }
            }

            info!(database = %db.name, kind = db.kind.as_str(), "sink connected");
            sinks.insert(db.name.clone(), sink);
        }
        Ok(sinks)
    }

    /// Start one consumer task per configured queue and join on all of
    /// them. Returns an error only when a queue references a provider with
    /// no consumer; runtime failures abandon the affected queue and are
    /// logged.
    pub async fn start_consumers(
        &self,
        config: &Config,
        requester: Arc<dyn Requester>,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();

        for queue in &config.queues {
            let consumer = self
                .consumers
                .get(&queue.provider)
                .cloned()
                .ok_or_else(|| EngineError::NoConsumer(queue.provider.clone()))?;
            let retries = self
                .providers
                .get(&queue.provider)
                .map(|p| p.retry)
                .unwrap_or(0);

            let engine = DispatchEngine::new(
                Arc::new(queue.clone()),
                requester.clone(),
                self.sinks.clone(),
                metrics.clone(),
            );
            self.engines.lock().await.push(engine.clone());
            let queue_name = queue.name.clone();

            tasks.spawn(async move {
                if let Err(e) =
                    listen_and_process(consumer, retries, &queue_name, engine).await
                {
                    error!(queue = %queue_name, error = %e, "queue abandoned");
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Close all consumers, wait for in-flight fan-out to drain (bounded
    /// by a shared grace period), then close all sinks. Sinks stay open
    /// during the drain because draining messages may still insert.
    pub async fn shutdown(&self) {
        for (name, consumer) in &self.consumers {
            if let Err(e) = consumer.close().await {
                error!(provider = %name, error = %e, "failed to close consumer");
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        for engine in self.engines.lock().await.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, engine.drain()).await.is_err() {
                warn!(
                    queue = %engine.queue_name(),
                    timeout_secs = DRAIN_TIMEOUT.as_secs(),
                    "in-flight fan-out did not drain within grace period"
                );
            }
        }

        for (name, sink) in self.sinks.iter() {
            if let Err(e) = sink.close().await {
                error!(database = %name, error = %e, "failed to close sink");
            }
        }
        info!("shut down gracefully");
    }
}

async fn listen_and_process(
    consumer: Arc<dyn QueueConsumer>,
    retries: u32,
    queue: &str,
    engine: DispatchEngine,
) -> Result<()> {
    connect_with_retry(consumer.as_ref(), retries).await?;
    consumer
        .consume(queue, Arc::new(engine))
        .await
        .map_err(|e| EngineError::Consume(e.to_string()))
}

/// Connect with up to `retries` attempts beyond the first, sleeping 5s
/// between attempts.
pub async fn connect_with_retry(consumer: &dyn QueueConsumer, retries: u32) -> Result<()> {
    let mut attempt = 0;
    loop {
        match consumer.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt >= retries {
                    return Err(EngineError::Connect(e.to_string()));
                }
                attempt += 1;
                warn!(attempt, error = %e, "failed to connect, retrying in 5s");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}
