use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quiver_core::cluster::{ClusterResolver, ScaleGate};
use quiver_core::errors::Result;
use quiver_core::sink::{EventRecorder, EventSink};
use quiver_core::QuiverError;
use quiver_protocol::invoke::{
    ENVELOPE_HEADER, FUNCTION_ID_HEADER, FUNCTION_NAME_HEADER, REQUEST_ID_HEADER, STATUS_HEADER,
};
use quiver_protocol::{is_error_status, EventKind, InvocationRequest, InvokeEnvelope};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::stats::DispatcherStats;

/// Attempt budget and backoff of the retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt k (k > 1) sleeps `(k-1) × backoff_step` first. The step is
    /// sized to cover scale-from-zero cold starts.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt.saturating_sub(1)
    }
}

/// Terminal state of one queued invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Finished,
    Exhausted,
}

enum AttemptOutcome {
    Finished(InvokeEnvelope),
    Retry,
}

/// Executes queued invocations: the `Queued → Dequeued → Attempting(n) →
/// {Finished | Failed | Exhausted}` state machine.
///
/// Every failure inside the loop is absorbed into timeline/log events and
/// answered with the next attempt; nothing propagates as a process error.
pub struct InvocationProcessor {
    resolver: Arc<dyn ClusterResolver>,
    gate: Arc<dyn ScaleGate>,
    sink: Arc<dyn EventSink>,
    http: reqwest::Client,
    policy: RetryPolicy,
    stats: DispatcherStats,
}

impl InvocationProcessor {
    pub fn new(
        resolver: Arc<dyn ClusterResolver>,
        gate: Arc<dyn ScaleGate>,
        sink: Arc<dyn EventSink>,
        http: reqwest::Client,
        policy: RetryPolicy,
        stats: DispatcherStats,
    ) -> Self {
        Self {
            resolver,
            gate,
            sink,
            http,
            policy,
            stats,
        }
    }

    /// Runs one invocation to its terminal state.
    pub async fn process(&self, request: InvocationRequest) -> InvocationOutcome {
        let recorder = EventRecorder::new(
            self.sink.clone(),
            request.user_id.clone(),
            request.request_id.clone(),
            request.function_id.clone(),
            request.function_name.clone(),
            request.method.clone(),
        );

        // Dwell time: how long the request sat queued before a worker
        // picked it up.
        let dwell_ms = (Utc::now() - request.queued_at).num_milliseconds().max(0);
        recorder
            .timeline(EventKind::Dequeued, &request.function_name, 200, dwell_ms)
            .await;
        self.stats.record_dequeued();

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                debug!(
                    request_id = %request.request_id,
                    attempt,
                    ?delay,
                    "backing off before next attempt"
                );
                tokio::time::sleep(delay).await;
            }

            match self.run_attempt(&request, attempt, &recorder).await {
                AttemptOutcome::Finished(envelope) => {
                    if let Some(callback_url) = &request.callback_url {
                        self.deliver_callback(callback_url, &request, &envelope, &recorder)
                            .await;
                    }
                    self.stats.record_finished();
                    return InvocationOutcome::Finished;
                }
                AttemptOutcome::Retry => {}
            }
        }

        // Exhaustion is silent: the per-attempt failure events already
        // recorded tell the whole story.
        info!(
            request_id = %request.request_id,
            attempts = self.policy.max_attempts,
            "invocation exhausted its attempt budget"
        );
        self.stats.record_exhausted();
        InvocationOutcome::Exhausted
    }

    async fn run_attempt(
        &self,
        request: &InvocationRequest,
        attempt: u32,
        recorder: &EventRecorder,
    ) -> AttemptOutcome {
        let name = format!("Attempt #{attempt}");
        let started = Utc::now();

        recorder
            .log(
                "attempt",
                false,
                format!("starting {name} for {}", request.function_name),
                json!({ "attempt": attempt }),
            )
            .await;
        recorder.timeline(EventKind::Running, &name, 0, 0).await;

        match self.gate.ensure_available(&request.function_id).await {
            Ok(decision) if !decision.found => {
                recorder
                    .timeline(EventKind::Failed, &name, 404, elapsed_ms(started))
                    .await;
                recorder
                    .log(
                        "scale",
                        true,
                        format!("function {} not found", request.function_id),
                        Value::Null,
                    )
                    .await;
                return AttemptOutcome::Retry;
            }
            Ok(decision) if !decision.available => {
                recorder
                    .timeline(EventKind::SystemError, &name, 503, elapsed_ms(started))
                    .await;
                recorder
                    .log(
                        "scale",
                        true,
                        format!(
                            "no instance of {} became available after {:?}",
                            request.function_id, decision.waited
                        ),
                        Value::Null,
                    )
                    .await;
                return AttemptOutcome::Retry;
            }
            Ok(_) => {}
            Err(err) => {
                recorder
                    .timeline(EventKind::SystemError, &name, 503, elapsed_ms(started))
                    .await;
                recorder
                    .log("scale", true, err.to_string(), Value::Null)
                    .await;
                return AttemptOutcome::Retry;
            }
        }

        let address = match self.resolver.resolve(&request.function_id).await {
            Ok(address) => address,
            Err(err) => {
                recorder
                    .timeline(EventKind::SystemError, &name, 503, elapsed_ms(started))
                    .await;
                recorder
                    .log("resolve", true, err.to_string(), Value::Null)
                    .await;
                return AttemptOutcome::Retry;
            }
        };

        let envelope = match self.invoke(&address, request).await {
            Ok(envelope) => envelope,
            Err(err) => {
                recorder
                    .timeline(EventKind::SystemError, &name, 503, elapsed_ms(started))
                    .await;
                recorder
                    .log("transport", true, err.to_string(), Value::Null)
                    .await;
                return AttemptOutcome::Retry;
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
        recorder.timeline(kind, &name, status, duration).await;
        recorder
            .log(
                "response",
                failed,
                format!(
                    "{} {} answered {status}",
                    request.method,
                    request.path_with_query()
                ),
                response_payload(&envelope),
            )
            .await;

        if failed {
            AttemptOutcome::Retry
        } else {
            AttemptOutcome::Finished(envelope)
        }
    }

    /// Issues the HTTP call to the resolved instance, forwarding the
    /// original method, path, query, body and headers, and unwrapping the
    /// optional invoke envelope.
    async fn invoke(&self, address: &str, request: &InvocationRequest) -> Result<InvokeEnvelope> {
        let url = join_address(address, &request.path_with_query());
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| QuiverError::TransportError(format!("invalid method {}", request.method)))?;

        let mut builder = self.http.request(method, url);
        for (header_name, header_value) in &request.headers {
            builder = builder.header(header_name.as_str(), header_value.as_str());
        }
        builder = builder.header(REQUEST_ID_HEADER, request.request_id.as_str());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| QuiverError::TransportError(err.to_string()))?;

        let status = response.status().as_u16();
        let enveloped = response.headers().contains_key(ENVELOPE_HEADER);
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| QuiverError::TransportError(err.to_string()))?
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

    /// Callback failures are logged and never retried; the invocation is
    /// already finished.
    async fn deliver_callback(
        &self,
        callback_url: &str,
        request: &InvocationRequest,
        envelope: &InvokeEnvelope,
        recorder: &EventRecorder,
    ) {
        let result = self
            .http
            .post(callback_url)
            .header(FUNCTION_NAME_HEADER, request.function_name.as_str())
            .header(FUNCTION_ID_HEADER, request.function_id.as_str())
            .header(STATUS_HEADER, envelope.status.to_string())
            .body(envelope.body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(request_id = %request.request_id, %callback_url, "callback delivered");
            }
            Ok(response) => {
                recorder
                    .log(
                        "callback_failed",
                        true,
                        format!("callback to {callback_url} answered {}", response.status()),
                        Value::Null,
                    )
                    .await;
            }
            Err(err) => {
                recorder
                    .log(
                        "callback_failed",
                        true,
                        format!("callback to {callback_url} failed: {err}"),
                        Value::Null,
                    )
                    .await;
            }
        }
    }
}

fn elapsed_ms(started: DateTime<Utc>) -> i64 {
    (Utc::now() - started).num_milliseconds().max(0)
}

fn join_address(address: &str, path_with_query: &str) -> String {
    let base = address.trim_end_matches('/');
    if path_with_query.starts_with('/') {
        format!("{base}{path_with_query}")
    } else {
        format!("{base}/{path_with_query}")
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn response_payload(envelope: &InvokeEnvelope) -> Value {
    json!({
        "status": envelope.status,
        "headers": envelope.headers,
        "body": String::from_utf8_lossy(&envelope.body),
        "stdout": envelope.stdout,
        "stderr": envelope.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_in_the_attempt_number() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_secs(180),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(180));
        assert_eq!(policy.delay_before(3), Duration::from_secs(360));
    }

    #[test]
    fn addresses_join_cleanly_with_paths() {
        assert_eq!(
            join_address("http://10.0.0.5:8080/", "/echo?x=1"),
            "http://10.0.0.5:8080/echo?x=1"
        );
        assert_eq!(
            join_address("http://10.0.0.5:8080", "echo"),
            "http://10.0.0.5:8080/echo"
        );
    }
}
