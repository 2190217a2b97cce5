//! The konsume dispatch engine.
//!
//! - [`template`]: `{{field}}` substitution for REST body trees and GraphQL
//!   operation strings
//! - [`retry`]: per-queue retry policy (fixed / expo / random delays)
//! - [`requester`]: single HTTP request execution with timeout and metrics
//! - [`engine`]: per-queue bounded fan-out of messages to routes and sinks
//! - [`supervisor`]: one consumer task per queue, sink startup, shutdown
//! - [`metrics`]: Prometheus counters and the text-exposition endpoint

use thiserror::Error;

pub mod engine;
pub mod metrics;
pub mod requester;
pub mod retry;
pub mod supervisor;
pub mod template;

pub use engine::DispatchEngine;
pub use metrics::{DispatchMetrics, NoopMetrics, PrometheusMetrics};
pub use requester::{HttpRequester, PreparedRequest, RequestError, Requester, ResponseInfo};
pub use retry::RetryPolicy;
pub use supervisor::Supervisor;
pub use template::RenderError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no consumer found for provider: {0}")]
    NoConsumer(String),

    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("failed to initialize sink: {0}")]
    SinkInit(String),

    #[error("failed to connect to sink {0}: {1}")]
    SinkConnect(String, String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
