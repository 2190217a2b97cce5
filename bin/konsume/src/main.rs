//! konsume: a configuration-driven bridge between message brokers and
//! downstream HTTP endpoints and databases.
//!
//! Startup: load and validate the config file, initialize logging, build
//! one consumer per provider, connect sinks (fatal on exhaustion), start
//! the optional metrics endpoint, then run one consumer task per queue
//! until SIGINT/SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use konsume_common::logging::init_logging;
use konsume_engine::metrics::serve_metrics;
use konsume_engine::{
    DispatchMetrics, HttpRequester, NoopMetrics, PrometheusMetrics, Requester, Supervisor,
};
use konsume_queue::{build_consumer, QueueConsumer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = konsume_config::load().context("failed to load configuration")?;
    init_logging(config.log, config.debug);
    info!("starting konsume");

    let mut consumers: HashMap<String, Arc<dyn QueueConsumer>> = HashMap::new();
    let mut providers = HashMap::new();
    for provider in &config.providers {
        let consumer = build_consumer(provider)
            .with_context(|| format!("failed to initialize provider {}", provider.name))?;
        consumers.insert(provider.name.clone(), consumer);
        providers.insert(provider.name.clone(), provider.clone());
    }

    let sinks = Supervisor::connect_sinks(&config.databases)
        .await
        .context("failed to initialize sinks")?;

    let metrics: Arc<dyn DispatchMetrics> = match &config.metrics {
        Some(settings) if settings.enabled => {
            let prometheus = Arc::new(PrometheusMetrics::new(settings.threshold_status));
            let endpoint = prometheus.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_metrics(&settings, endpoint).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            });
            prometheus
        }
        _ => Arc::new(NoopMetrics),
    };

    let requester: Arc<dyn Requester> = Arc::new(HttpRequester::new(metrics.clone()));

    let supervisor = Arc::new(Supervisor::new(consumers, providers, sinks));
    let runner = supervisor.clone();
    let run_config = config.clone();
    let run_task = tokio::spawn(async move {
        if let Err(e) = runner
            .start_consumers(&run_config, requester, metrics)
            .await
        {
            error!(error = %e, "failed to start consumers");
            std::process::exit(1);
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    // Closing the consumers unblocks the consume loops and drains
    // in-flight fan-out before the sinks close.
    supervisor.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), run_task).await {
        Ok(_) => info!("consumer tasks completed gracefully"),
        Err(_) => warn!("consumer tasks did not complete within 30s timeout"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
