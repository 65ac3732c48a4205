use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use quiver_core::cluster::ClusterResolver;
use quiver_core::queue::DurableQueue;
use quiver_core::sink::EventSink;
use tower_http::trace::TraceLayer;

use crate::enqueue::{router as enqueue_router, EnqueueState};
use crate::proxy::{router as proxy_router, ProxyState};

/// Assembles the gateway router from its collaborators.
///
/// The resolver, the queue and the event sink are passed by construction
/// so tests can swap in fakes.
pub fn build_app(
    resolver: Arc<dyn ClusterResolver>,
    queue: Arc<dyn DurableQueue>,
    sink: Arc<dyn EventSink>,
    invocations_topic: &str,
) -> Router {
    let client = reqwest::Client::new();

    let proxy_state = ProxyState::new(client, resolver, sink.clone());
    let enqueue_state = EnqueueState::new(queue, sink, invocations_topic);

    Router::new()
        .merge(proxy_router(proxy_state))
        .merge(enqueue_router(enqueue_state))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
