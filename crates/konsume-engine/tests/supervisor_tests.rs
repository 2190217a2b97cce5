//! Supervisor lifecycle tests with mock consumers and sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use konsume_common::logging::LogFormat;
use konsume_common::MessageData;
use konsume_config::{Config, DatabaseRouteConfig, ProviderConfig, ProviderKind, QueueConfig};
use konsume_engine::supervisor::connect_with_retry;
use konsume_engine::{
    DispatchMetrics, EngineError, PreparedRequest, RequestError, Requester, ResponseInfo,
    Supervisor,
};
use konsume_queue::{MessageHandler, QueueConsumer, QueueError};
use konsume_sink::{Sink, SinkError};

/// Consumer whose connect fails a configurable number of times and whose
/// consume feeds one message to the handler.
struct MockConsumer {
    connect_failures: AtomicU32,
    connect_calls: AtomicU32,
    consume_calls: AtomicU32,
    closed: AtomicBool,
    payload: Vec<u8>,
}

impl MockConsumer {
    fn new(connect_failures: u32, payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            connect_failures: AtomicU32::new(connect_failures),
            connect_calls: AtomicU32::new(0),
            consume_calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            payload: payload.to_vec(),
        })
    }
}

#[async_trait]
impl QueueConsumer for MockConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connect_failures.load(Ordering::SeqCst) > 0 {
            self.connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Connect("connection failed".to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        let _ = handler.handle(self.payload.clone()).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysFailingConsumer {
    connect_calls: AtomicU32,
}

#[async_trait]
impl QueueConsumer for AlwaysFailingConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Err(QueueError::Connect("unreachable".to_string()))
    }

    async fn consume(
        &self,
        _queue: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        panic!("consume must not be called when connect never succeeds");
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

struct RecordingRequester {
    calls: AtomicU32,
}

#[async_trait]
impl Requester for RecordingRequester {
    async fn send(&self, _request: &PreparedRequest) -> Result<ResponseInfo, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ResponseInfo { status: 200 })
    }
}

/// Requester that completes slowly, so fan-out is still in flight when
/// shutdown begins.
struct SlowRequester {
    completed: Arc<AtomicU32>,
}

#[async_trait]
impl Requester for SlowRequester {
    async fn send(&self, _request: &PreparedRequest) -> Result<ResponseInfo, RequestError> {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ResponseInfo { status: 200 })
    }
}

/// Sink that records, at close time, whether the in-flight request had
/// already finished.
#[derive(Debug)]
struct DrainObservingSink {
    completed_requests: Arc<AtomicU32>,
    drained_before_close: AtomicBool,
}

#[async_trait]
impl Sink for DrainObservingSink {
    async fn connect(&self, _connection_string: &str, _database: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn insert(
        &self,
        _record: &MessageData,
        _route: &DatabaseRouteConfig,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.drained_before_close.store(
            self.completed_requests.load(Ordering::SeqCst) > 0,
            Ordering::SeqCst,
        );
        Ok(())
    }
}

#[derive(Debug)]
struct ClosableSink {
    closed: AtomicBool,
}

#[async_trait]
impl Sink for ClosableSink {
    async fn connect(&self, _connection_string: &str, _database: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn insert(
        &self,
        _record: &MessageData,
        _route: &DatabaseRouteConfig,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct NoMetrics;

impl DispatchMetrics for NoMetrics {
    fn message_consumed(&self) {}
    fn request_completed(&self, _status: Option<u16>) {}
}

fn provider(name: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        kind: ProviderKind::Rabbitmq,
        retry: 0,
        amqp: None,
        kafka: None,
        stomp: None,
    }
}

fn queue(name: &str, provider: &str) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        provider: provider.to_string(),
        retry: None,
        routes: vec![konsume_config::RouteConfig {
            name: "r".to_string(),
            url: "http://sink/hook".to_string(),
            method: "POST".to_string(),
            kind: konsume_config::RouteType::Rest,
            headers: Default::default(),
            body: Default::default(),
            query: Default::default(),
            timeout: std::time::Duration::from_secs(10),
        }],
        database_routes: Vec::new(),
    }
}

fn config(providers: Vec<ProviderConfig>, queues: Vec<QueueConfig>) -> Config {
    Config {
        providers,
        queues,
        databases: Vec::new(),
        metrics: None,
        debug: false,
        log: LogFormat::Text,
    }
}

#[tokio::test]
async fn connect_with_retry_succeeds_on_first_attempt() {
    let consumer = MockConsumer::new(0, b"{}");
    connect_with_retry(consumer.as_ref(), 1).await.unwrap();
    assert_eq!(consumer.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_with_retry_exhausts_after_retry_budget() {
    let consumer = Arc::new(AlwaysFailingConsumer {
        connect_calls: AtomicU32::new(0),
    });
    let result = connect_with_retry(consumer.as_ref(), 1).await;
    assert!(matches!(result, Err(EngineError::Connect(_))));
    // Initial attempt plus one retry.
    assert_eq!(consumer.connect_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_with_retry_recovers_within_budget() {
    let consumer = MockConsumer::new(2, b"{}");
    connect_with_retry(consumer.as_ref(), 3).await.unwrap();
    assert_eq!(consumer.connect_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn start_consumers_errors_for_unknown_provider() {
    let supervisor = Supervisor::new(HashMap::new(), HashMap::new(), HashMap::new());
    let cfg = config(Vec::new(), vec![queue("q1", "ghost")]);

    let result = supervisor
        .start_consumers(
            &cfg,
            Arc::new(RecordingRequester {
                calls: AtomicU32::new(0),
            }),
            Arc::new(NoMetrics),
        )
        .await;

    match result {
        Err(EngineError::NoConsumer(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected NoConsumer error, got {other:?}"),
    }
}

#[tokio::test]
async fn start_consumers_binds_engine_and_processes_messages() {
    let consumer = MockConsumer::new(0, br#"{"id": 1}"#);
    let mut consumers: HashMap<String, Arc<dyn QueueConsumer>> = HashMap::new();
    consumers.insert("p1".to_string(), consumer.clone());
    let mut providers = HashMap::new();
    providers.insert("p1".to_string(), provider("p1"));

    let supervisor = Supervisor::new(consumers, providers, HashMap::new());
    let requester = Arc::new(RecordingRequester {
        calls: AtomicU32::new(0),
    });
    let cfg = config(vec![provider("p1")], vec![queue("q1", "p1")]);

    supervisor
        .start_consumers(&cfg, requester.clone(), Arc::new(NoMetrics))
        .await
        .unwrap();

    assert_eq!(consumer.consume_calls.load(Ordering::SeqCst), 1);

    // The fan-out task is spawned; give it a moment to hit the requester.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while requester.calls.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "request never sent");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn abandoned_queue_does_not_cancel_others() {
    let failing = Arc::new(AlwaysFailingConsumer {
        connect_calls: AtomicU32::new(0),
    });
    let working = MockConsumer::new(0, br#"{"id": 1}"#);

    let mut consumers: HashMap<String, Arc<dyn QueueConsumer>> = HashMap::new();
    consumers.insert("down".to_string(), failing.clone());
    consumers.insert("up".to_string(), working.clone());
    let mut providers = HashMap::new();
    providers.insert("down".to_string(), provider("down"));
    providers.insert("up".to_string(), provider("up"));

    let supervisor = Supervisor::new(consumers, providers, HashMap::new());
    let cfg = config(
        vec![provider("down"), provider("up")],
        vec![queue("q-down", "down"), queue("q-up", "up")],
    );

    supervisor
        .start_consumers(
            &cfg,
            Arc::new(RecordingRequester {
                calls: AtomicU32::new(0),
            }),
            Arc::new(NoMetrics),
        )
        .await
        .unwrap();

    // The failing queue was abandoned after its connect attempt; the
    // healthy queue still consumed.
    assert_eq!(failing.connect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(working.consume_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_fanout_before_closing_sinks() {
    let consumer = MockConsumer::new(0, br#"{"id": 1}"#);
    let completed = Arc::new(AtomicU32::new(0));
    let sink = Arc::new(DrainObservingSink {
        completed_requests: completed.clone(),
        drained_before_close: AtomicBool::new(false),
    });

    let mut consumers: HashMap<String, Arc<dyn QueueConsumer>> = HashMap::new();
    consumers.insert("p1".to_string(), consumer.clone());
    let mut providers = HashMap::new();
    providers.insert("p1".to_string(), provider("p1"));
    let mut sinks: HashMap<String, Arc<dyn Sink>> = HashMap::new();
    sinks.insert("pg".to_string(), sink.clone());

    let supervisor = Supervisor::new(consumers, providers, sinks);
    let requester = Arc::new(SlowRequester {
        completed: completed.clone(),
    });
    let cfg = config(vec![provider("p1")], vec![queue("q1", "p1")]);

    // The consumer delivers one message; its fan-out task holds a permit
    // and is still mid-request when consume returns.
    supervisor
        .start_consumers(&cfg, requester, Arc::new(NoMetrics))
        .await
        .unwrap();

    supervisor.shutdown().await;

    // Shutdown waited for the in-flight request and only then closed the
    // sink.
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(sink.drained_before_close.load(Ordering::SeqCst));
}

#[tokio::test]
async fn shutdown_closes_consumers_and_sinks() {
    let consumer = MockConsumer::new(0, b"{}");
    let sink = Arc::new(ClosableSink {
        closed: AtomicBool::new(false),
    });

    let mut consumers: HashMap<String, Arc<dyn QueueConsumer>> = HashMap::new();
    consumers.insert("p1".to_string(), consumer.clone());
    let mut sinks: HashMap<String, Arc<dyn Sink>> = HashMap::new();
    sinks.insert("pg".to_string(), sink.clone());

    let supervisor = Supervisor::new(consumers, HashMap::new(), sinks);
    supervisor.shutdown().await;

    assert!(consumer.closed.load(Ordering::SeqCst));
    assert!(sink.closed.load(Ordering::SeqCst));
}
