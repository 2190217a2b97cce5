//! Prometheus counters and the metrics endpoint.
//!
//! The engine and requester only see the [`DispatchMetrics`] observer, so
//! tests can count outcomes without process-global state and disabling
//! metrics costs nothing.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

use konsume_config::MetricsConfig;

/// Observer for the engine's monotonic counters.
pub trait DispatchMetrics: Send + Sync {
    /// One inbound envelope fully processed.
    fn message_consumed(&self);

    /// One HTTP request finished; `status` is absent on transport errors,
    /// which count as made but neither succeeded nor failed.
    fn request_completed(&self, status: Option<u16>);
}

/// Used when the metrics endpoint is disabled.
pub struct NoopMetrics;

impl DispatchMetrics for NoopMetrics {
    fn message_consumed(&self) {}
    fn request_completed(&self, _status: Option<u16>) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    threshold_status: u16,
    messages_consumed: IntCounter,
    http_requests_made: IntCounter,
    http_requests_succeeded: IntCounter,
    http_requests_failed: IntCounter,
}

impl PrometheusMetrics {
    pub fn new(threshold_status: u16) -> Self {
        let registry = Registry::new();

        let messages_consumed = IntCounter::new(
            "konsume_messages_consumed_total",
            "Total number of messages consumed",
        )
        .expect("valid counter definition");
        let http_requests_made = IntCounter::new(
            "konsume_http_requests_made_total",
            "Total number of HTTP requests made",
        )
        .expect("valid counter definition");
        let http_requests_succeeded = IntCounter::new(
            "konsume_http_requests_succeeded_total",
            "Total number of HTTP requests succeeded",
        )
        .expect("valid counter definition");
        let http_requests_failed = IntCounter::new(
            "konsume_http_requests_failed_total",
            "Total number of HTTP requests failed",
        )
        .expect("valid counter definition");

        for counter in [
            &messages_consumed,
            &http_requests_made,
            &http_requests_succeeded,
            &http_requests_failed,
        ] {
            registry
                .register(Box::new(counter.clone()))
                .expect("register counter");
        }

        let build_info = IntGaugeVec::new(
            Opts::new("konsume_build_info", "Build information"),
            &["version"],
        )
        .expect("valid gauge definition");
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);
        registry
            .register(Box::new(build_info))
            .expect("register build info");

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .expect("register process collector");

        Self {
            registry,
            threshold_status,
            messages_consumed,
            http_requests_made,
            http_requests_succeeded,
            http_requests_failed,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("encode metrics");
        String::from_utf8(buffer).expect("metrics are valid UTF-8")
    }

    pub fn messages_consumed_total(&self) -> u64 {
        self.messages_consumed.get()
    }

    pub fn http_requests_made_total(&self) -> u64 {
        self.http_requests_made.get()
    }

    pub fn http_requests_succeeded_total(&self) -> u64 {
        self.http_requests_succeeded.get()
    }

    pub fn http_requests_failed_total(&self) -> u64 {
        self.http_requests_failed.get()
    }
}

impl DispatchMetrics for PrometheusMetrics {
    fn message_consumed(&self) {
        self.messages_consumed.inc();
    }

    fn request_completed(&self, status: Option<u16>) {
        self.http_requests_made.inc();
        if let Some(status) = status {
            if status >= self.threshold_status {
                self.http_requests_failed.inc();
            } else {
                self.http_requests_succeeded.inc();
            }
        }
    }
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve_metrics(
    config: &MetricsConfig,
    metrics: Arc<PrometheusMetrics>,
) -> std::io::Result<()> {
    let app = Router::new().route(
        &config.path,
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.encode() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, path = %config.path, "serving metrics");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_made_and_classifies_by_threshold() {
        let metrics = PrometheusMetrics::new(500);

        metrics.request_completed(Some(200));
        metrics.request_completed(Some(499));
        metrics.request_completed(Some(500));
        metrics.request_completed(Some(503));

        assert_eq!(metrics.http_requests_made_total(), 4);
        assert_eq!(metrics.http_requests_succeeded_total(), 2);
        assert_eq!(metrics.http_requests_failed_total(), 2);
    }

    #[test]
    fn transport_errors_count_as_made_only() {
        let metrics = PrometheusMetrics::new(500);

        metrics.request_completed(None);

        assert_eq!(metrics.http_requests_made_total(), 1);
        assert_eq!(metrics.http_requests_succeeded_total(), 0);
        assert_eq!(metrics.http_requests_failed_total(), 0);
    }

    #[test]
    fn exposition_contains_counters() {
        let metrics = PrometheusMetrics::new(500);
        metrics.message_consumed();

        let output = metrics.encode();
        assert!(output.contains("konsume_messages_consumed_total 1"));
        assert!(output.contains("konsume_http_requests_made_total 0"));
        assert!(output.contains("konsume_build_info"));
    }
}
