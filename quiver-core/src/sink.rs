use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use quiver_protocol::{EventKind, EventLog, EventMessage, TimelineLog};
use tracing::{error, warn};

use crate::queue::DurableQueue;

/// Destination for lifecycle events emitted by the dispatchers.
///
/// Passed by construction to whoever emits events; emission never blocks
/// dispatch and never fails the invocation being recorded.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, message: EventMessage);
}

/// The production sink: publishes event messages to the events topic.
///
/// Emission is decoupled from dispatch through an unbounded channel drained
/// by one background publisher, so `emit` never blocks an invocation and
/// events still reach the topic in emission order. Publish failures are
/// logged and the event is lost; the pipeline tolerates gaps.
pub struct QueueEventSink {
    tx: tokio::sync::mpsc::UnboundedSender<EventMessage>,
}

impl QueueEventSink {
    pub fn new(queue: Arc<dyn DurableQueue>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<EventMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let payload = match serde_json::to_vec(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(?err, request_id = %message.request_id, "failed to encode event");
                        continue;
                    }
                };
                if let Err(err) = queue.publish(&topic, payload).await {
                    error!(?err, request_id = %message.request_id, "failed to publish event");
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl EventSink for QueueEventSink {
    async fn emit(&self, message: EventMessage) {
        if !message.is_well_formed() {
            warn!(
                request_id = %message.request_id,
                "dropping event message without exactly one branch"
            );
            return;
        }

        if self.tx.send(message).is_err() {
            error!("event publisher stopped, event lost");
        }
    }
}

/// Emission helper bound to one invocation.
///
/// Every event referencing a request id must share that request's user id
/// and function id; stamping them once here keeps cross-user
/// contamination structurally impossible.
#[derive(Clone)]
pub struct EventRecorder {
    sink: Arc<dyn EventSink>,
    user_id: String,
    request_id: String,
    function_id: String,
    function_name: String,
    method: String,
}

impl EventRecorder {
    pub fn new(
        sink: Arc<dyn EventSink>,
        user_id: impl Into<String>,
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        function_name: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            user_id: user_id.into(),
            request_id: request_id.into(),
            function_id: function_id.into(),
            function_name: function_name.into(),
            method: method.into(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Emits one timeline milestone.
    pub async fn timeline(&self, kind: EventKind, event_name: &str, response: i32, duration: i64) {
        self.sink
            .emit(EventMessage::timeline(
                self.user_id.clone(),
                self.request_id.clone(),
                TimelineLog {
                    function_id: self.function_id.clone(),
                    event_name: event_name.to_string(),
                    event_type: kind.as_str().to_string(),
                    response,
                    method: self.method.clone(),
                    duration,
                    created_at: Utc::now(),
                },
            ))
            .await;
    }

    /// Emits one generic log record.
    pub async fn log(
        &self,
        log_type: &str,
        is_error: bool,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) {
        self.sink
            .emit(EventMessage::log(
                self.user_id.clone(),
                self.request_id.clone(),
                EventLog {
                    log_type: log_type.to_string(),
                    is_error,
                    function_name: self.function_name.clone(),
                    function_id: self.function_id.clone(),
                    message: message.into(),
                    payload,
                    generated_at: Utc::now(),
                },
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn published_events_reach_a_subscriber() {
        let queue = Arc::new(MemoryQueue::new());
        let mut sub = queue.subscribe("events", "ingest").await.unwrap();

        let sink = QueueEventSink::new(queue.clone(), "events");
        sink.emit(EventMessage::timeline(
            "user-1",
            "req-1",
            TimelineLog {
                function_id: "fn-1".into(),
                event_name: "echo".into(),
                event_type: EventKind::Queued.as_str().into(),
                response: 202,
                method: "POST".into(),
                duration: 0,
                created_at: chrono::Utc::now(),
            },
        ))
        .await;

        let delivery = loop {
            if let Some(delivery) = sub.next().await.unwrap() {
                break delivery;
            }
        };
        let decoded: EventMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(decoded.request_id, "req-1");
        assert!(decoded.is_well_formed());
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let queue = Arc::new(MemoryQueue::new());
        let mut sub = queue.subscribe("events", "ingest").await.unwrap();

        let sink = QueueEventSink::new(queue.clone(), "events");
        for attempt in 1..=3 {
            sink.emit(EventMessage::timeline(
                "user-1",
                "req-1",
                TimelineLog {
                    function_id: "fn-1".into(),
                    event_name: format!("Attempt #{attempt}"),
                    event_type: EventKind::Running.as_str().into(),
                    response: 0,
                    method: "POST".into(),
                    duration: 0,
                    created_at: chrono::Utc::now(),
                },
            ))
            .await;
        }

        let mut names = Vec::new();
        while names.len() < 3 {
            if let Some(delivery) = sub.next().await.unwrap() {
                let message: EventMessage = serde_json::from_slice(&delivery.payload).unwrap();
                names.push(message.timeline_log.unwrap().event_name);
            }
        }
        assert_eq!(names, vec!["Attempt #1", "Attempt #2", "Attempt #3"]);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let queue = Arc::new(MemoryQueue::new());
        let mut sub = queue.subscribe("events", "ingest").await.unwrap();

        let sink = QueueEventSink::new(queue.clone(), "events");
        let mut message = EventMessage::log(
            "user-1",
            "req-1",
            quiver_protocol::EventLog {
                log_type: "request".into(),
                is_error: false,
                function_name: "echo".into(),
                function_id: "fn-1".into(),
                message: String::new(),
                payload: serde_json::Value::Null,
                generated_at: chrono::Utc::now(),
            },
        );
        message.event_log = None;
        sink.emit(message).await;

        assert!(sub.next().await.unwrap().is_none());
    }
}
