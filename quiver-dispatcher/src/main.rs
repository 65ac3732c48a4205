use std::sync::Arc;

use anyhow::Context;
use quiver_core::queue::{DurableQueue, RedisQueue};
use quiver_core::sink::QueueEventSink;
use quiver_dispatcher::attempt::{InvocationProcessor, RetryPolicy};
use quiver_dispatcher::config::DispatcherConfig;
use quiver_dispatcher::controller::ControllerClient;
use quiver_dispatcher::runtime::DispatchRuntime;
use quiver_dispatcher::stats::DispatcherStats;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    if let Err(err) = quiver_core::logging::init_tracing(None) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let config = DispatcherConfig::from_env().context("failed to load dispatcher configuration")?;

    let queue = Arc::new(
        RedisQueue::connect(&config.queue_url, config.node_name.clone())
            .await
            .context("failed to connect to the durable queue")?,
    );
    let subscription = queue
        .subscribe(&config.invocations_topic, &config.consumer_group)
        .await
        .context("failed to join the invocations consumer group")?;

    let sink = Arc::new(QueueEventSink::new(
        queue.clone() as Arc<dyn DurableQueue>,
        config.events_topic.clone(),
    ));

    let controller =
        Arc::new(ControllerClient::new(&config.controller_url).context("invalid controller URL")?);

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to build the backend HTTP client")?;

    let stats = DispatcherStats::new();
    let processor = Arc::new(InvocationProcessor::new(
        controller.clone(),
        controller,
        sink,
        http,
        RetryPolicy {
            max_attempts: config.max_attempts,
            backoff_step: config.backoff_step,
        },
        stats.clone(),
    ));

    let runtime = DispatchRuntime::start(
        processor,
        subscription,
        config.workers,
        config.intake_capacity,
        stats.clone(),
    );

    let api = quiver_dispatcher::api::router(stats.clone());
    let api_listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .context("failed to bind the stats endpoint")?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(api_listener, api).await {
            tracing::error!(?err, "stats endpoint terminated");
        }
    });

    info!(
        workers = config.workers,
        topic = %config.invocations_topic,
        group = %config.consumer_group,
        "quiver-dispatcher started"
    );

    shutdown_signal().await;
    info!("shutting down, waiting for in-flight attempts");
    runtime.shutdown().await;

    let counters = stats.snapshot();
    info!(?counters, "dispatcher stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
