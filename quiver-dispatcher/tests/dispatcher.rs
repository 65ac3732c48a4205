use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;
use chrono::Utc;
use quiver_core::cluster::{ClusterResolver, ScaleDecision, ScaleGate};
use quiver_core::errors::Result as CoreResult;
use quiver_core::queue::{DurableQueue, MemoryQueue};
use quiver_core::sink::EventSink;
use quiver_dispatcher::attempt::{InvocationProcessor, RetryPolicy};
use quiver_dispatcher::runtime::DispatchRuntime;
use quiver_dispatcher::stats::DispatcherStats;
use quiver_protocol::{EventKind, EventMessage, InvocationRequest, QueuedInvocation};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

const WAIT_BUDGET: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<EventMessage>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, message: EventMessage) {
        self.events.lock().await.push(message);
    }
}

impl RecordingSink {
    async fn snapshot(&self) -> Vec<EventMessage> {
        self.events.lock().await.clone()
    }
}

async fn wait_for_events<F>(sink: &RecordingSink, condition: F) -> Vec<EventMessage>
where
    F: Fn(&[EventMessage]) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        let events = sink.snapshot().await;
        if condition(&events) {
            return events;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met in time, events so far: {events:#?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_stats<F>(stats: &DispatcherStats, condition: F)
where
    F: Fn(quiver_dispatcher::stats::Counters) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        if condition(stats.snapshot()) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("counters never converged: {:?}", stats.snapshot());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct FixedResolver {
    address: String,
}

#[async_trait]
impl ClusterResolver for FixedResolver {
    async fn resolve(&self, _function_id: &str) -> CoreResult<String> {
        Ok(self.address.clone())
    }
}

struct OpenGate;

#[async_trait]
impl ScaleGate for OpenGate {
    async fn ensure_available(&self, _function_id: &str) -> CoreResult<ScaleDecision> {
        Ok(ScaleDecision {
            found: true,
            available: true,
            waited: Duration::ZERO,
        })
    }
}

struct MissingGate;

#[async_trait]
impl ScaleGate for MissingGate {
    async fn ensure_available(&self, _function_id: &str) -> CoreResult<ScaleDecision> {
        Ok(ScaleDecision {
            found: false,
            available: false,
            waited: Duration::ZERO,
        })
    }
}

#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    path_and_query: String,
    request_id_header: Option<String>,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct BackendState {
    scripted: Arc<Mutex<VecDeque<(u16, &'static str)>>>,
    fallback: (u16, &'static str),
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl BackendState {
    fn new(scripted: Vec<(u16, &'static str)>, fallback: (u16, &'static str)) -> Self {
        Self {
            scripted: Arc::new(Mutex::new(scripted.into_iter().collect())),
            fallback,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn backend_handler(State(state): State<BackendState>, request: Request) -> impl axum::response::IntoResponse {
    let method = request.method().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|value| value.to_string())
        .unwrap_or_default();
    let request_id_header = request
        .headers()
        .get("x-quiver-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let body: Bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    state.seen.lock().await.push(SeenRequest {
        method,
        path_and_query,
        request_id_header,
        body: body.to_vec(),
    });

    let (status, body) = state
        .scripted
        .lock()
        .await
        .pop_front()
        .unwrap_or(state.fallback);
    (StatusCode::from_u16(status).unwrap(), body)
}

struct HttpService {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_http_service(router: Router) -> HttpService {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
            .ok();
    });

    HttpService {
        addr,
        _shutdown: tx,
    }
}

async fn spawn_backend(state: BackendState) -> HttpService {
    let router = Router::new()
        .route("/", any(backend_handler))
        .route("/*rest", any(backend_handler))
        .with_state(state);
    spawn_http_service(router).await
}

fn invocation(request_id: &str) -> InvocationRequest {
    InvocationRequest {
        user_id: "user-1".into(),
        request_id: request_id.into(),
        headers: [("content-type".to_string(), "text/plain".to_string())].into(),
        body: b"ping".to_vec(),
        method: "POST".into(),
        path: "/echo".into(),
        query: "verbose=1".into(),
        function_id: "fn-1".into(),
        function_name: "echo".into(),
        callback_url: None,
        queued_at: Utc::now() - chrono::Duration::seconds(2),
    }
}

async fn publish(queue: &MemoryQueue, request: InvocationRequest) {
    let payload = serde_json::to_vec(&QueuedInvocation::new(request)).unwrap();
    queue
        .publish(quiver_protocol::INVOCATIONS_TOPIC, payload)
        .await
        .unwrap();
}

struct Harness {
    queue: MemoryQueue,
    sink: Arc<RecordingSink>,
    stats: DispatcherStats,
    _runtime: DispatchRuntime,
}

async fn start_harness(
    backend_addr: SocketAddr,
    gate: Arc<dyn ScaleGate>,
    policy: RetryPolicy,
) -> Harness {
    let queue = MemoryQueue::new();
    let subscription = queue
        .subscribe(quiver_protocol::INVOCATIONS_TOPIC, "dispatch-workers")
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let stats = DispatcherStats::new();
    let processor = Arc::new(InvocationProcessor::new(
        Arc::new(FixedResolver {
            address: format!("http://{backend_addr}"),
        }),
        gate,
        sink.clone(),
        reqwest::Client::new(),
        policy,
        stats.clone(),
    ));

    let runtime = DispatchRuntime::start(processor, subscription, 2, 16, stats.clone());
    Harness {
        queue,
        sink,
        stats,
        _runtime: runtime,
    }
}

fn timeline_events<'a>(events: &'a [EventMessage], kind: EventKind) -> Vec<&'a EventMessage> {
    events
        .iter()
        .filter(|message| {
            message
                .timeline_log
                .as_ref()
                .map(|log| log.event_type == kind.as_str())
                .unwrap_or(false)
        })
        .collect()
}

fn attempt_start_logs(events: &[EventMessage]) -> usize {
    events
        .iter()
        .filter(|message| {
            message
                .event_log
                .as_ref()
                .map(|log| log.log_type == "attempt")
                .unwrap_or(false)
        })
        .count()
}

fn fast_policy(step_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_step: Duration::from_millis(step_ms),
    }
}

#[tokio::test]
async fn finishes_on_first_attempt_and_forwards_the_request() {
    let backend_state = BackendState::new(vec![], (200, "ok"));
    let backend = spawn_backend(backend_state.clone()).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(50)).await;

    publish(&harness.queue, invocation("req-1")).await;

    let events = wait_for_events(&harness.sink, |events| {
        !timeline_events(events, EventKind::Finished).is_empty()
    })
    .await;

    // Exactly one dequeued event, emitted before any attempt event, with
    // the dwell duration measured from queued_at.
    let dequeued = timeline_events(&events, EventKind::Dequeued);
    assert_eq!(dequeued.len(), 1);
    let dwell = dequeued[0].timeline_log.as_ref().unwrap().duration;
    assert!((1_500..10_000).contains(&dwell), "dwell was {dwell}ms");
    let first_timeline = events
        .iter()
        .find(|message| message.timeline_log.is_some())
        .unwrap();
    assert_eq!(
        first_timeline.timeline_log.as_ref().unwrap().event_type,
        EventKind::Dequeued.as_str()
    );

    // One attempt: one start log, one running row, one finished row.
    assert_eq!(attempt_start_logs(&events), 1);
    let running = timeline_events(&events, EventKind::Running);
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].timeline_log.as_ref().unwrap().event_name, "Attempt #1");
    let finished = timeline_events(&events, EventKind::Finished);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].timeline_log.as_ref().unwrap().response, 200);

    // Identity invariant: every event carries the request's user id.
    assert!(events.iter().all(|message| message.user_id == "user-1"));

    // The backend saw the original method, path, query, body and the
    // injected request id header.
    let seen = backend_state.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path_and_query, "/echo?verbose=1");
    assert_eq!(seen[0].request_id_header.as_deref(), Some("req-1"));
    assert_eq!(seen[0].body, b"ping");

    wait_for_stats(&harness.stats, |counters| counters.finished == 1).await;
}

#[tokio::test]
async fn retries_with_linear_backoff_until_success() {
    let backend_state = BackendState::new(vec![(503, "busy")], (200, "ok"));
    let backend = spawn_backend(backend_state.clone()).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(200)).await;

    publish(&harness.queue, invocation("req-2")).await;

    let events = wait_for_events(&harness.sink, |events| {
        !timeline_events(events, EventKind::Finished).is_empty()
    })
    .await;

    // Two attempt groups: the 503 and the success. Nothing after the first
    // finished outcome.
    assert_eq!(attempt_start_logs(&events), 2);
    let running = timeline_events(&events, EventKind::Running);
    assert_eq!(running.len(), 2);
    let failed = timeline_events(&events, EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].timeline_log.as_ref().unwrap().response, 503);
    assert_eq!(failed[0].timeline_log.as_ref().unwrap().event_name, "Attempt #1");
    let finished = timeline_events(&events, EventKind::Finished);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].timeline_log.as_ref().unwrap().event_name, "Attempt #2");

    // Backoff property: attempt 2 started at least one backoff step after
    // attempt 1 (timer tolerance aside).
    let gap = running[1].timeline_log.as_ref().unwrap().created_at
        - running[0].timeline_log.as_ref().unwrap().created_at;
    assert!(
        gap >= chrono::Duration::milliseconds(150),
        "gap was only {gap}"
    );
}

#[tokio::test]
async fn exhausts_silently_after_three_failed_attempts() {
    let backend_state = BackendState::new(vec![], (500, "boom"));
    let backend = spawn_backend(backend_state.clone()).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(10)).await;

    publish(&harness.queue, invocation("req-3")).await;

    wait_for_stats(&harness.stats, |counters| counters.exhausted == 1).await;
    let events = harness.sink.snapshot().await;

    assert_eq!(attempt_start_logs(&events), 3);
    assert_eq!(timeline_events(&events, EventKind::Running).len(), 3);
    assert_eq!(timeline_events(&events, EventKind::Failed).len(), 3);
    assert!(timeline_events(&events, EventKind::Finished).is_empty());

    let names: Vec<String> = timeline_events(&events, EventKind::Failed)
        .iter()
        .map(|message| message.timeline_log.as_ref().unwrap().event_name.clone())
        .collect();
    assert_eq!(names, vec!["Attempt #1", "Attempt #2", "Attempt #3"]);
}

#[tokio::test]
async fn malformed_message_is_dropped_without_events() {
    let backend_state = BackendState::new(vec![], (200, "ok"));
    let backend = spawn_backend(backend_state.clone()).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(10)).await;

    let mut missing = invocation("req-4");
    missing.function_id = String::new();
    publish(&harness.queue, missing).await;

    wait_for_stats(&harness.stats, |counters| counters.dropped_invalid == 1).await;

    // Consumed and acknowledged, but no timeline or log rows produced.
    assert!(harness.sink.snapshot().await.is_empty());
    assert!(backend_state.seen.lock().await.is_empty());
}

#[tokio::test]
async fn unknown_function_fails_every_attempt_with_not_found() {
    let backend_state = BackendState::new(vec![], (200, "ok"));
    let backend = spawn_backend(backend_state.clone()).await;
    let harness = start_harness(backend.addr, Arc::new(MissingGate), fast_policy(10)).await;

    publish(&harness.queue, invocation("req-5")).await;

    wait_for_stats(&harness.stats, |counters| counters.exhausted == 1).await;
    let events = harness.sink.snapshot().await;

    let failed = timeline_events(&events, EventKind::Failed);
    assert_eq!(failed.len(), 3);
    assert!(failed
        .iter()
        .all(|message| message.timeline_log.as_ref().unwrap().response == 404));

    // The backend was never reached.
    assert!(backend_state.seen.lock().await.is_empty());
}

#[derive(Clone, Default)]
struct CallbackState {
    received: Arc<Mutex<Vec<(Option<String>, Option<String>, Vec<u8>)>>>,
    status: u16,
}

async fn callback_handler(
    State(state): State<CallbackState>,
    request: Request,
) -> impl axum::response::IntoResponse {
    let name = request
        .headers()
        .get("x-quiver-function-name")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let status = request
        .headers()
        .get("x-quiver-status")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    state
        .received
        .lock()
        .await
        .push((name, status, body.to_vec()));
    StatusCode::from_u16(state.status).unwrap()
}

async fn spawn_callback_receiver(status: u16) -> (HttpService, CallbackState) {
    let state = CallbackState {
        received: Arc::new(Mutex::new(Vec::new())),
        status,
    };
    let router = Router::new()
        .route("/hooks/done", any(callback_handler))
        .with_state(state.clone());
    (spawn_http_service(router).await, state)
}

#[tokio::test]
async fn callback_carries_function_identity_and_final_status() {
    let backend_state = BackendState::new(vec![], (200, "result-body"));
    let backend = spawn_backend(backend_state.clone()).await;
    let (callback, callback_state) = spawn_callback_receiver(204).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(10)).await;

    let mut request = invocation("req-6");
    request.callback_url = Some(format!("http://{}/hooks/done", callback.addr));
    publish(&harness.queue, request).await;

    wait_for_stats(&harness.stats, |counters| counters.finished == 1).await;

    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        let received = callback_state.received.lock().await.clone();
        if !received.is_empty() {
            let (name, status, body) = &received[0];
            assert_eq!(name.as_deref(), Some("echo"));
            assert_eq!(status.as_deref(), Some("200"));
            assert_eq!(body, b"result-body");
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("callback never arrived");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn failed_callback_is_logged_but_does_not_change_the_outcome() {
    let backend_state = BackendState::new(vec![], (200, "ok"));
    let backend = spawn_backend(backend_state.clone()).await;
    let (callback, _callback_state) = spawn_callback_receiver(500).await;
    let harness = start_harness(backend.addr, Arc::new(OpenGate), fast_policy(10)).await;

    let mut request = invocation("req-7");
    request.callback_url = Some(format!("http://{}/hooks/done", callback.addr));
    publish(&harness.queue, request).await;

    let events = wait_for_events(&harness.sink, |events| {
        events.iter().any(|message| {
            message
                .event_log
                .as_ref()
                .map(|log| log.log_type == "callback_failed" && log.is_error)
                .unwrap_or(false)
        })
    })
    .await;

    // The invocation still counts as finished and no further attempts ran.
    assert_eq!(timeline_events(&events, EventKind::Finished).len(), 1);
    wait_for_stats(&harness.stats, |counters| counters.finished == 1).await;
}
