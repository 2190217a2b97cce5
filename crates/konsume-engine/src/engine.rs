//! Per-queue dispatch engine.
//!
//! One instance per queue, driven as the consumer's message handler. Each
//! message acquires one permit from a bounded set (2 x logical CPUs by
//! default) before fan-out; the consume loop awaits the acquisition, which
//! backpressures the broker. Fan-out runs on its own task so a panic in one
//! message cannot take down the consume loop, and the permit is released
//! whatever happens.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use konsume_common::{parse_message, MessageData};
use konsume_config::{DatabaseRouteConfig, QueueConfig, RouteConfig, RouteType};
use konsume_queue::{HandlerError, MessageHandler};
use konsume_sink::Sink;

use crate::metrics::DispatchMetrics;
use crate::requester::{PreparedRequest, RequestError, Requester, ResponseInfo};
use crate::retry::RetryPolicy;
use crate::template;

/// Default fan-out permit count: 2 x logical CPUs.
pub fn default_permit_count() -> usize {
    2 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Clone)]
pub struct DispatchEngine {
    queue: Arc<QueueConfig>,
    retry: Option<RetryPolicy>,
    requester: Arc<dyn Requester>,
    sinks: Arc<HashMap<String, Arc<dyn Sink>>>,
    metrics: Arc<dyn DispatchMetrics>,
    permits: Arc<Semaphore>,
    permit_count: usize,
}

impl DispatchEngine {
    pub fn new(
        queue: Arc<QueueConfig>,
        requester: Arc<dyn Requester>,
        sinks: Arc<HashMap<String, Arc<dyn Sink>>>,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Self {
        Self::with_permits(queue, requester, sinks, metrics, default_permit_count())
    }

    pub fn with_permits(
        queue: Arc<QueueConfig>,
        requester: Arc<dyn Requester>,
        sinks: Arc<HashMap<String, Arc<dyn Sink>>>,
        metrics: Arc<dyn DispatchMetrics>,
        permits: usize,
    ) -> Self {
        let retry = queue.retry.as_ref().and_then(RetryPolicy::from_config);
        Self {
            queue,
            retry,
            requester,
            sinks,
            metrics,
            permits: Arc::new(Semaphore::new(permits)),
            permit_count: permits,
        }
    }

    /// Queue this engine dispatches for.
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Wait until every outstanding fan-out task has released its permit.
    /// Callers must have stopped feeding the engine first (consumers
    /// closed), otherwise new messages keep contending for permits.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.permit_count as u32).await {
            drop(all);
        }
    }

    /// Full per-message pipeline: parse, route fan-out, sink fan-out,
    /// consumed counter.
    async fn process(&self, payload: Vec<u8>) {
        debug!(queue = %self.queue.name, "received message");

        let message_data = match parse_message(&payload) {
            Ok(data) => Some(data),
            Err(e) => {
                error!(queue = %self.queue.name, error = %e, "failed to parse message");
                None
            }
        };

        for route in &self.queue.routes {
            self.dispatch_route(route, message_data.as_ref(), &payload)
                .await;
        }

        match &message_data {
            Some(data) => {
                for db_route in &self.queue.database_routes {
                    self.dispatch_sink_route(data, db_route).await;
                }
            }
            None => {
                if !self.queue.database_routes.is_empty() {
                    warn!(
                        queue = %self.queue.name,
                        "skipping database routes: message is not valid JSON"
                    );
                }
            }
        }

        self.metrics.message_consumed();
    }

    async fn dispatch_route(
        &self,
        route: &RouteConfig,
        data: Option<&MessageData>,
        raw: &[u8],
    ) {
        let body = match self.build_body(route, data, raw) {
            Some(body) => body,
            None => return,
        };

        // The URL is computed per message; the configured route is never
        // mutated.
        let request = PreparedRequest {
            url: append_query_params(&route.url, &route.query),
            method: route.method.clone(),
            headers: route.headers.clone(),
            body,
            timeout: route.timeout,
        };

        let mut outcome = self.requester.send(&request).await;
        log_outcome(&route.name, &outcome);

        if let Some(policy) = &self.retry {
            if policy.is_retriable(status_of(&outcome)) {
                for attempt in 1..=policy.max_retries {
                    let delay = policy.delay(attempt);
                    info!(
                        route = %route.name,
                        strategy = ?policy.strategy,
                        retry = attempt,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    outcome = self.requester.send(&request).await;
                    log_outcome(&route.name, &outcome);
                    if !policy.is_retriable(status_of(&outcome)) {
                        break;
                    }
                }
            }
        }
    }

    /// Build the request body for one route, or `None` when the route must
    /// be skipped. A route with no template uses the raw payload verbatim,
    /// even when the payload failed to parse; templated and GraphQL routes
    /// need the parsed message.
    fn build_body(
        &self,
        route: &RouteConfig,
        data: Option<&MessageData>,
        raw: &[u8],
    ) -> Option<Vec<u8>> {
        if route.kind == RouteType::Graphql {
            let Some(data) = data else {
                warn!(route = %route.name, "skipping graphql route: message is not valid JSON");
                return None;
            };
            let Some(operation) = template::graphql_operation(&route.body) else {
                error!(route = %route.name, "no query or mutation found in graphql body");
                return None;
            };
            let rendered = match template::render_graphql(operation, data) {
                Ok(rendered) => rendered,
                Err(e) => {
                    error!(route = %route.name, error = %e, "failed to prepare request body");
                    return None;
                }
            };
            // The wire body is {"query": ...} whether the source key was
            // query or mutation.
            return match serde_json::to_vec(&serde_json::json!({ "query": rendered })) {
                Ok(body) => Some(body),
                Err(e) => {
                    error!(route = %route.name, error = %e, "failed to serialize graphql body");
                    None
                }
            };
        }

        if !route.body.is_empty() {
            let Some(data) = data else {
                warn!(route = %route.name, "skipping route: body template requires parsed message");
                return None;
            };
            return match template::render_rest(&route.body, data) {
                Ok(body) => Some(body),
                Err(e) => {
                    error!(route = %route.name, error = %e, "failed to prepare request body");
                    None
                }
            };
        }

        Some(raw.to_vec())
    }

    async fn dispatch_sink_route(&self, data: &MessageData, db_route: &DatabaseRouteConfig) {
        let Some(sink) = self.sinks.get(&db_route.provider) else {
            warn!(
                route = %db_route.name,
                provider = %db_route.provider,
                "unknown sink, skipping"
            );
            return;
        };
        if let Err(e) = sink.insert(data, db_route).await {
            error!(route = %db_route.name, error = %e, "failed to insert record");
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchEngine {
    async fn handle(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Box::new(e) as HandlerError)?;

        let engine = self.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(engine.process(payload)).catch_unwind().await;
            if let Err(panic) = result {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(queue = %engine.queue.name, panic = %detail, "recovered panic in fan-out task");
            }
            drop(permit);
        });

        Ok(())
    }
}

fn status_of(outcome: &Result<ResponseInfo, RequestError>) -> Option<u16> {
    outcome.as_ref().ok().map(|r| r.status)
}

fn log_outcome(route: &str, outcome: &Result<ResponseInfo, RequestError>) {
    match outcome {
        Ok(response) => info!(route = %route, status = response.status, "received response"),
        Err(e) => warn!(route = %route, error = %e, "request failed"),
    }
}

/// Append `?k1=v1&k2=v2` in iteration order; an empty map leaves the URL
/// unchanged. Values are not re-encoded.
fn append_query_params(
    url: &str,
    query: &std::collections::BTreeMap<String, String>,
) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{url}?{}", pairs.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn empty_query_map_leaves_url_unchanged() {
        let query = BTreeMap::new();
        assert_eq!(
            append_query_params("http://localhost:8080", &query),
            "http://localhost:8080"
        );
    }

    #[test]
    fn query_params_appear_once_each_after_single_question_mark() {
        let mut query = BTreeMap::new();
        query.insert("key1".to_string(), "value1".to_string());
        query.insert("key2".to_string(), "value2".to_string());

        let url = append_query_params("http://localhost:8080", &query);
        assert_eq!(url, "http://localhost:8080?key1=value1&key2=value2");
        assert_eq!(url.matches('?').count(), 1);
    }
}
