use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use quiver_core::errors::QuiverError;

use crate::reconstruct;
use crate::repository::TimelineRepository;

#[derive(Clone)]
pub struct AppState {
    repository: TimelineRepository,
}

impl AppState {
    pub fn new(repository: TimelineRepository) -> Self {
        Self { repository }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/v1/users/:user_id/requests/:request_id/timeline",
            get(get_timeline),
        )
        .route(
            "/v1/users/:user_id/requests/:request_id/logs",
            get(list_logs),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

type AppResult<T> = Result<T, AppError>;

/// Rebuilds the invocation narrative for one request on demand.
async fn get_timeline(
    State(state): State<AppState>,
    Path((user_id, request_id)): Path<(String, String)>,
) -> AppResult<Json<quiver_protocol::Timeline>> {
    let rows = state.repository.request_events(&user_id, &request_id).await?;
    let timeline = reconstruct::reconstruct(&rows, Utc::now())
        .ok_or_else(|| AppError::not_found(format!("no events for request {request_id}")))?;

    Ok(Json(timeline))
}

async fn list_logs(
    State(state): State<AppState>,
    Path((user_id, request_id)): Path<(String, String)>,
) -> AppResult<Json<Vec<crate::repository::EventLogRow>>> {
    let rows = state.repository.request_logs(&user_id, &request_id).await?;
    Ok(Json(rows))
}

#[derive(Debug, Clone)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found<M: Into<String>>(message: M) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal<M: Into<String>>(message: M) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<QuiverError> for AppError {
    fn from(err: QuiverError) -> Self {
        match err {
            QuiverError::TimelineNotFound(message) => AppError::not_found(message),
            other => AppError::internal(other.to_string()),
        }
    }
}
