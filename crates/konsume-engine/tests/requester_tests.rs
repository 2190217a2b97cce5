//! HTTP requester tests against a local mock server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use konsume_engine::{
    HttpRequester, NoopMetrics, PreparedRequest, PrometheusMetrics, RequestError, Requester,
};

fn request(url: String, body: Vec<u8>) -> PreparedRequest {
    PreparedRequest {
        url,
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body,
        timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn sends_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("x-api-key", "secret"))
        .and(body_json(serde_json::json!({"id": 7})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let requester = HttpRequester::new(Arc::new(NoopMetrics));
    let mut prepared = request(format!("{}/hook", server.uri()), b"{\"id\":7}".to_vec());
    prepared
        .headers
        .insert("x-api-key".to_string(), "secret".to_string());

    let response = requester.send(&prepared).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn classifies_outcomes_into_metrics_counters() {
    let server = MockServer::start().await;
    Mock::given(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(path("/err"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let metrics = Arc::new(PrometheusMetrics::new(500));
    let requester = HttpRequester::new(metrics.clone());

    requester
        .send(&request(format!("{}/ok", server.uri()), Vec::new()))
        .await
        .unwrap();
    requester
        .send(&request(format!("{}/err", server.uri()), Vec::new()))
        .await
        .unwrap();

    assert_eq!(metrics.http_requests_made_total(), 2);
    assert_eq!(metrics.http_requests_succeeded_total(), 1);
    assert_eq!(metrics.http_requests_failed_total(), 1);
}

#[tokio::test]
async fn transport_error_counts_as_made_but_neither_succeeded_nor_failed() {
    let metrics = Arc::new(PrometheusMetrics::new(500));
    let requester = HttpRequester::new(metrics.clone());

    // Nothing listens on this port.
    let outcome = requester
        .send(&request("http://127.0.0.1:1/unreachable".to_string(), Vec::new()))
        .await;

    assert!(matches!(outcome, Err(RequestError::Transport(_))));
    assert_eq!(metrics.http_requests_made_total(), 1);
    assert_eq!(metrics.http_requests_succeeded_total(), 0);
    assert_eq!(metrics.http_requests_failed_total(), 0);
}

#[tokio::test]
async fn timeout_error_carries_the_route_timeout() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let requester = HttpRequester::new(Arc::new(NoopMetrics));
    let mut prepared = request(format!("{}/slow", server.uri()), Vec::new());
    prepared.timeout = Duration::from_millis(50);

    match requester.send(&prepared).await {
        Err(RequestError::Timeout(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_method_is_rejected() {
    let requester = HttpRequester::new(Arc::new(NoopMetrics));
    let mut prepared = request("http://localhost/".to_string(), Vec::new());
    prepared.method = "NOT A METHOD".to_string();

    assert!(matches!(
        requester.send(&prepared).await,
        Err(RequestError::Invalid(_))
    ));
}
