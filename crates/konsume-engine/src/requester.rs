//! Single HTTP request execution.
//!
//! The engine prepares one [`PreparedRequest`] per route per message (URL
//! with query parameters appended, rendered body, headers) and hands it to
//! the requester; retries re-send the same prepared request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::metrics::DispatchMetrics;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

/// A fully materialized outbound request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseInfo {
    pub status: u16,
}

#[async_trait]
pub trait Requester: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> Result<ResponseInfo, RequestError>;
}

/// reqwest-backed requester shared by every route.
pub struct HttpRequester {
    client: reqwest::Client,
    metrics: Arc<dyn DispatchMetrics>,
}

impl HttpRequester {
    pub fn new(metrics: Arc<dyn DispatchMetrics>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");
        Self { client, metrics }
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn send(&self, request: &PreparedRequest) -> Result<ResponseInfo, RequestError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| RequestError::Invalid(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Drain the body so the connection can be reused.
                let _ = response.bytes().await;
                self.metrics.request_completed(Some(status));
                Ok(ResponseInfo { status })
            }
            Err(e) => {
                self.metrics.request_completed(None);
                if e.is_timeout() {
                    Err(RequestError::Timeout(request.timeout))
                } else {
                    Err(RequestError::Transport(e.to_string()))
                }
            }
        }
    }
}
