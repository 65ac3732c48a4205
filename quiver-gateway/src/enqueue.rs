use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use chrono::Utc;
use http_body_util::BodyExt;
use quiver_core::queue::DurableQueue;
use quiver_core::sink::{EventRecorder, EventSink};
use quiver_protocol::invoke::{CALLBACK_HEADER, FUNCTION_NAME_HEADER, USER_HEADER};
use quiver_protocol::{EventKind, InvocationRequest, QueuedInvocation};
use serde_json::json;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::headers::forwardable_header_map;
use crate::proxy::{error_response, header_str, request_id_response, split_target};

/// State of the asynchronous ingress: durably enqueue, record the single
/// `queued` milestone, answer 202.
#[derive(Clone)]
pub struct EnqueueState {
    queue: Arc<dyn DurableQueue>,
    sink: Arc<dyn EventSink>,
    topic: String,
}

impl EnqueueState {
    pub fn new(queue: Arc<dyn DurableQueue>, sink: Arc<dyn EventSink>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            sink,
            topic: topic.into(),
        }
    }
}

pub fn router(state: EnqueueState) -> Router {
    Router::new()
        .route("/async-function/:function_id", any(enqueue_request))
        .route("/async-function/:function_id/*rest", any(enqueue_request))
        .with_state(state)
}

#[instrument(skip_all, fields(method = %method, function = tracing::field::Empty))]
async fn enqueue_request(
    State(state): State<EnqueueState>,
    method: Method,
    headers: HeaderMap,
    OriginalUri(original_uri): OriginalUri,
    body: Body,
) -> Response {
    let (function_id, backend_path) = match split_target(&original_uri) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    tracing::Span::current().record("function", tracing::field::display(&function_id));

    let user_id = header_str(&headers, USER_HEADER).unwrap_or("anonymous").to_string();
    let function_name = header_str(&headers, FUNCTION_NAME_HEADER)
        .unwrap_or(&function_id)
        .to_string();
    let callback_url = header_str(&headers, CALLBACK_HEADER).map(|value| value.to_string());
    let request_id = Uuid::new_v4().to_string();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let queued_at = Utc::now();
    let request = InvocationRequest {
        user_id: user_id.clone(),
        request_id: request_id.clone(),
        headers: forwardable_header_map(&headers),
        body: body_bytes,
        method: method.as_str().to_string(),
        path: backend_path,
        query: original_uri.query().unwrap_or("").to_string(),
        function_id: function_id.clone(),
        function_name: function_name.clone(),
        callback_url,
        queued_at,
    };

    let payload = match serde_json::to_vec(&QueuedInvocation::new(request)) {
        Ok(payload) => payload,
        Err(err) => {
            error!(?err, "failed to encode queued invocation");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode invocation",
                &request_id,
            );
        }
    };

    // Blocking-ack publish: the request must be durable before we answer.
    if let Err(err) = state.queue.publish(&state.topic, payload).await {
        error!(?err, "failed to enqueue invocation");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue unavailable",
            &request_id,
        );
    }

    // Exactly one queued milestone per asynchronous request; dwell time is
    // measured from here.
    let recorder = EventRecorder::new(
        state.sink.clone(),
        user_id,
        request_id.clone(),
        function_id,
        function_name,
        method.as_str(),
    );
    recorder
        .timeline(EventKind::Queued, recorder.function_name(), 202, 0)
        .await;

    request_id_response(
        StatusCode::ACCEPTED,
        Json(json!({ "request_id": request_id })),
        &request_id,
    )
}
