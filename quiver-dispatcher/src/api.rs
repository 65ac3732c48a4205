use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::stats::{Counters, DispatcherStats};

/// Small observation surface next to the worker pool: liveness and the
/// in-process counters.
pub fn router(stats: DispatcherStats) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(snapshot))
        .with_state(stats)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn snapshot(State(stats): State<DispatcherStats>) -> Json<Counters> {
    Json(stats.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_reflect_recorded_outcomes() {
        let stats = DispatcherStats::new();
        stats.record_dequeued();
        stats.record_finished();

        let Json(counters) = snapshot(State(stats)).await;
        assert_eq!(counters.dequeued, 1);
        assert_eq!(counters.finished, 1);
        assert_eq!(counters.exhausted, 0);
    }
}
