use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as Retention;
use quiver_core::errors::Result;
use quiver_core::queue::QueueSubscription;
use quiver_protocol::{EventKind, EventMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::repository::{NewEventLog, NewTimelineEvent, TimelineRepository};

/// Flush destination of the micro-batcher.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    async fn store_batch(&self, events: Vec<NewTimelineEvent>, logs: Vec<NewEventLog>)
        -> Result<()>;
}

#[async_trait]
impl EventStore for TimelineRepository {
    async fn store_batch(
        &self,
        events: Vec<NewTimelineEvent>,
        logs: Vec<NewEventLog>,
    ) -> Result<()> {
        TimelineRepository::store_batch(self, &events, &logs).await
    }
}

/// Tuning knobs of the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Capacity of the intake queue. Producers block when it is full,
    /// pushing backpressure into the broker.
    pub intake_capacity: usize,
    /// Flush as soon as this many rows are buffered.
    pub flush_size: usize,
    /// Flush whatever is buffered when this much time elapsed.
    pub flush_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            intake_capacity: 1_024,
            flush_size: 500,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Sending half of the intake queue.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<EventMessage>,
}

impl IngestHandle {
    /// Hands one event to the batcher, waiting while the intake is full.
    pub async fn submit(&self, message: EventMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| quiver_core::QuiverError::IngestionError("pipeline stopped".into()))
    }
}

/// Spawns the micro-batching loop: drain the intake queue into an
/// in-memory batch, flush on the size threshold or the periodic timer,
/// whichever comes first.
pub fn spawn_batcher(
    store: Arc<dyn EventStore>,
    retention: Retention,
    settings: BatchSettings,
) -> (IngestHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EventMessage>(settings.intake_capacity);

    let worker = tokio::spawn(async move {
        let mut batch = Batch::default();
        let mut ticker = tokio::time::interval(settings.flush_interval);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(message) => {
                        batch.absorb(message, retention);
                        if batch.len() >= settings.flush_size {
                            batch.flush(store.as_ref()).await;
                        }
                    }
                    None => {
                        batch.flush(store.as_ref()).await;
                        info!("ingestion intake closed, batcher stopping");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    batch.flush(store.as_ref()).await;
                }
            }
        }
    });

    (IngestHandle { tx }, worker)
}

/// Spawns the pump feeding the intake queue from the events subscription.
/// Messages are acknowledged on receipt; a full intake queue blocks the
/// pump, which stops consuming and lets the broker hold the backlog.
pub fn spawn_pump(
    mut subscription: Box<dyn QueueSubscription>,
    handle: IngestHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscription.next().await {
                Ok(Some(delivery)) => {
                    if let Err(err) = subscription.ack(&delivery).await {
                        warn!(?err, "failed to acknowledge event message");
                    }

                    let message: EventMessage = match serde_json::from_slice(&delivery.payload) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(?err, "discarding undecodable event message");
                            continue;
                        }
                    };

                    if handle.submit(message).await.is_err() {
                        info!("ingestion pipeline stopped, pump exiting");
                        return;
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(?err, "event subscription read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

#[derive(Default)]
struct Batch {
    events: Vec<NewTimelineEvent>,
    logs: Vec<NewEventLog>,
}

impl Batch {
    fn len(&self) -> usize {
        self.events.len() + self.logs.len()
    }

    /// Converts one wire message into its storage row. Unknown kinds are
    /// logged and inserted anyway; the kind set is informative here.
    fn absorb(&mut self, message: EventMessage, retention: Retention) {
        let EventMessage {
            user_id,
            request_id,
            timeline_log,
            event_log,
            ..
        } = message;

        match (timeline_log, event_log) {
            (Some(log), None) => {
                if EventKind::parse(&log.event_type).is_none() {
                    warn!(
                        event_type = %log.event_type,
                        %request_id,
                        "unknown timeline event kind, storing anyway"
                    );
                }
                self.events.push(NewTimelineEvent::from_wire(
                    &user_id,
                    &request_id,
                    log,
                    retention,
                ));
            }
            (None, Some(log)) => {
                self.logs
                    .push(NewEventLog::from_wire(&user_id, &request_id, log, retention));
            }
            _ => warn!(%request_id, "event message without exactly one branch, skipping"),
        }
    }

    /// Writes the buffered rows and clears the batch. A failed flush drops
    /// the batch: the rows are not recoverable from memory.
    async fn flush(&mut self, store: &dyn EventStore) {
        if self.len() == 0 {
            return;
        }

        let events = std::mem::take(&mut self.events);
        let logs = std::mem::take(&mut self.logs);
        let (event_count, log_count) = (events.len(), logs.len());

        match store.store_batch(events, logs).await {
            Ok(()) => debug!(event_count, log_count, "flushed event batch"),
            Err(err) => error!(
                ?err,
                dropped_events = event_count,
                dropped_logs = log_count,
                "flush failed, batch dropped"
            ),
        }
    }
}
