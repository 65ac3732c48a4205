use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use quiver_core::queue::{DurableQueue, RedisQueue};
use quiver_core::sink::QueueEventSink;
use quiver_gateway::config::GatewayConfig;
use quiver_gateway::resolver::ControllerResolver;
use quiver_gateway::routing::build_app;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    if let Err(err) = quiver_core::logging::init_tracing(None) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let config = GatewayConfig::from_env().context("failed to load gateway configuration")?;

    let queue: Arc<dyn DurableQueue> = Arc::new(
        RedisQueue::connect(&config.queue_url, config.node_name.clone())
            .await
            .context("failed to connect to the durable queue")?,
    );
    let sink = Arc::new(QueueEventSink::new(
        queue.clone(),
        config.events_topic.clone(),
    ));
    let resolver =
        Arc::new(ControllerResolver::new(&config.controller_url).context("invalid controller URL")?);

    let app = build_app(resolver, queue, sink, &config.invocations_topic);

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .context("invalid bind address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read socket address")?;
    info!(%actual_addr, "starting quiver-gateway");

    if let Err(err) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(?err, "gateway server terminated with error");
    }

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
