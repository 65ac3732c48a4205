use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{self, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use quiver_core::cluster::ClusterResolver;
use quiver_core::sink::{EventRecorder, EventSink};
use quiver_protocol::invoke::{ENVELOPE_HEADER, REQUEST_ID_HEADER, USER_HEADER};
use quiver_protocol::{is_error_status, EventKind, InvokeEnvelope};
use serde_json::json;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::headers::{forwardable_header_map, forwardable_headers, request_id_header};

/// State of the synchronous dispatch path: stateless proxying, no retry —
/// the caller owns retry semantics.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    resolver: Arc<dyn ClusterResolver>,
    sink: Arc<dyn EventSink>,
}

impl ProxyState {
    pub fn new(
        client: reqwest::Client,
        resolver: Arc<dyn ClusterResolver>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            resolver,
            sink,
        }
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/function/:function_id", any(dispatch_request))
        .route("/function/:function_id/*rest", any(dispatch_request))
        .with_state(state)
}

/// Splits `/<prefix>/<function_id>[/<rest>]` into the function id and the
/// path forwarded to the backend.
pub(crate) fn split_target(uri: &Uri) -> Result<(String, String), StatusCode> {
    let path = uri.path();
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let _prefix = segments.next().unwrap_or("");
    let function_id = segments.next().unwrap_or("");
    if function_id.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    let remainder = segments.next().unwrap_or("");
    Ok((function_id.to_string(), format!("/{remainder}")))
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[instrument(skip_all, fields(method = %method, function = tracing::field::Empty))]
async fn dispatch_request(
    State(state): State<ProxyState>,
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
    let function_name = header_str(&headers, quiver_protocol::invoke::FUNCTION_NAME_HEADER)
        .unwrap_or(&function_id)
        .to_string();
    let request_id = Uuid::new_v4().to_string();

    let recorder = EventRecorder::new(
        state.sink.clone(),
        user_id,
        request_id.clone(),
        function_id.clone(),
        function_name.clone(),
        method.as_str(),
    );
    let started = Utc::now();

    let address = match state.resolver.resolve(&function_id).await {
        Ok(address) => address,
        Err(err) => {
            recorder
                .timeline(EventKind::SystemError, &function_name, 503, elapsed_ms(started))
                .await;
            recorder.log("resolve", true, err.to_string(), json!(null)).await;
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no live instance available",
                &request_id,
            );
        }
    };

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let mut target_url = format!("{}{}", address.trim_end_matches('/'), backend_path);
    if let Some(query) = original_uri.query() {
        target_url.push('?');
        target_url.push_str(query);
    }

    let req_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(req_method) => req_method,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let mut builder = state.client.request(req_method, &target_url);
    for (name, value) in forwardable_headers(&headers) {
        builder = builder.header(name, value);
    }
    builder = builder.header(REQUEST_ID_HEADER, request_id.as_str());
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes.clone());
    }

    let envelope = match fetch_envelope(builder).await {
        Ok(envelope) => envelope,
        Err(message) => {
            recorder
                .timeline(EventKind::SystemError, &function_name, 502, elapsed_ms(started))
                .await;
            recorder.log("transport", true, message, json!(null)).await;
            return error_response(StatusCode::BAD_GATEWAY, "backend unreachable", &request_id);
        }
    };

    let duration = elapsed_ms(started);
    let status = envelope.status as i32;
    let failed = is_error_status(status);
    let kind = if failed {
        EventKind::Failed
    } else {
        EventKind::Finished
    };
    recorder.timeline(kind, &function_name, status, duration).await;
    recorder
        .log(
            "invocation",
            failed,
            format!("{method} {backend_path} answered {status}"),
            json!({
                "request": {
                    "method": method.as_str(),
                    "path": backend_path,
                    "headers": forwardable_header_map(&headers),
                    "body": String::from_utf8_lossy(&body_bytes),
                },
                "response": {
                    "status": envelope.status,
                    "headers": envelope.headers,
                    "body": String::from_utf8_lossy(&envelope.body),
                    "stdout": envelope.stdout,
                    "stderr": envelope.stderr,
                },
            }),
        )
        .await;

    backend_response(envelope, &request_id)
}

/// Sends the forwarded request and normalises the two backend response
/// shapes into one envelope.
async fn fetch_envelope(builder: reqwest::RequestBuilder) -> Result<InvokeEnvelope, String> {
    let response = builder.send().await.map_err(|err| err.to_string())?;

    let status = response.status().as_u16();
    let enveloped = response.headers().contains_key(ENVELOPE_HEADER);
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|err| err.to_string())?
        .to_vec();

    if enveloped {
        match serde_json::from_slice::<InvokeEnvelope>(&body) {
            Ok(envelope) => return Ok(envelope),
            Err(err) => {
                warn!(?err, "invoke envelope advertised but undecodable, using raw response");
            }
        }
    }

    Ok(InvokeEnvelope::raw(status, headers, body))
}

/// Rebuilds the backend response verbatim for the caller, with the
/// platform request id attached.
fn backend_response(envelope: InvokeEnvelope, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &envelope.headers {
        if name.eq_ignore_ascii_case(http::header::CONTENT_LENGTH.as_str())
            || name.eq_ignore_ascii_case(http::header::TRANSFER_ENCODING.as_str())
        {
            continue;
        }

        if let (Ok(header_name), Ok(header_value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(header_name, header_value);
        }
    }

    if let Some((name, value)) = request_id_header(request_id) {
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(envelope.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    request_id_response(status, Json(json!({ "error": message })), request_id)
}

/// Attaches the platform request id to any response, so callers can query
/// the timeline later.
pub(crate) fn request_id_response<B: IntoResponse>(
    status: StatusCode,
    body: B,
    request_id: &str,
) -> Response {
    let mut response = (status, body).into_response();
    if let Some((name, value)) = request_id_header(request_id) {
        response.headers_mut().insert(name, value);
    }
    response
}

pub(crate) fn elapsed_ms(started: DateTime<Utc>) -> i64 {
    (Utc::now() - started).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splitting_keeps_the_backend_path() {
        let uri: Uri = "/function/fn-1/api/echo?x=1".parse().unwrap();
        let (function_id, path) = split_target(&uri).unwrap();
        assert_eq!(function_id, "fn-1");
        assert_eq!(path, "/api/echo");
    }

    #[test]
    fn bare_function_call_forwards_the_root_path() {
        let uri: Uri = "/function/fn-1".parse().unwrap();
        let (function_id, path) = split_target(&uri).unwrap();
        assert_eq!(function_id, "fn-1");
        assert_eq!(path, "/");
    }

    #[test]
    fn missing_function_id_is_not_found() {
        let uri: Uri = "/function".parse().unwrap();
        assert_eq!(split_target(&uri), Err(StatusCode::NOT_FOUND));
    }
}
