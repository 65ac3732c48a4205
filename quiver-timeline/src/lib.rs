//! Timeline service: consumes the events topic, micro-batches rows into
//! Postgres and serves reconstructed invocation timelines.

pub mod api;
pub mod ingest;
pub mod reconstruct;
pub mod repository;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quiver_core::config::CoreConfig;
use quiver_core::errors::Result;
use quiver_core::queue::{DurableQueue, RedisQueue};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::ingest::BatchSettings;
use crate::repository::TimelineRepository;

/// Consumer group under which the ingestion pipeline tracks its cursor.
pub const INGEST_GROUP: &str = "timeline-ingest";

/// How often expired rows are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Boots the timeline service: ingestion pipeline, expiry sweeper and the
/// read API, all sharing one repository.
pub async fn run(config: CoreConfig) -> Result<()> {
    let repository = TimelineRepository::from_config(&config).await?;

    let queue = RedisQueue::connect(config.queue_url(), config.node_name.clone()).await?;
    let subscription = queue.subscribe(&config.events_topic, INGEST_GROUP).await?;

    let (handle, batcher) = ingest::spawn_batcher(
        Arc::new(repository.clone()),
        config.retention(),
        BatchSettings::default(),
    );
    let pump = ingest::spawn_pump(subscription, handle);
    spawn_expiry_sweeper(repository.clone());

    let bind_addr: SocketAddr = config
        .http_bind
        .clone()
        .unwrap_or_else(|| "0.0.0.0:8082".to_string())
        .parse()
        .map_err(|err| {
            quiver_core::QuiverError::ConfigError(format!("invalid bind address: {err}"))
        })?;

    let app = api::router(api::AppState::new(repository));
    let listener = TcpListener::bind(bind_addr).await?;
    let actual_addr = listener.local_addr()?;
    info!(%actual_addr, "starting quiver-timeline service");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pump.abort();
    batcher.abort();
    Ok(())
}

/// Periodically deletes rows past their expiry so they can no longer show
/// up in reconstructed timelines.
fn spawn_expiry_sweeper(repository: TimelineRepository) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match repository.delete_expired().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "swept expired event rows"),
                Err(err) => warn!(?err, "expiry sweep failed"),
            }
        }
    });
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
