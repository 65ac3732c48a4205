use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quiver_core::queue::QueueSubscription;
use quiver_protocol::QueuedInvocation;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::attempt::InvocationProcessor;
use crate::stats::DispatcherStats;

/// Worker-pool runtime of the asynchronous dispatcher.
///
/// One intake loop pulls from the durable subscription, acknowledges each
/// message on receipt and feeds a bounded channel; N worker loops execute
/// invocations. A full channel blocks the intake, which stops consuming
/// and lets the broker hold the backlog.
pub struct DispatchRuntime {
    intake: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl DispatchRuntime {
    pub fn start(
        processor: Arc<InvocationProcessor>,
        subscription: Box<dyn QueueSubscription>,
        worker_count: usize,
        intake_capacity: usize,
        stats: DispatcherStats,
    ) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(intake_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let intake = tokio::spawn(intake_loop(
            subscription,
            tx,
            stats,
            shutting_down.clone(),
        ));

        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let rx = rx.clone();
            let processor = processor.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_index, rx, processor).await;
            }));
        }

        Self {
            intake,
            workers,
            shutting_down,
        }
    }

    /// Stops consuming, lets the workers drain what was already dequeued
    /// and joins them. In-flight attempts run to completion.
    pub async fn shutdown(self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if let Err(err) = self.intake.await {
            error!("intake loop crashed: {err:?}");
        }
        for handle in self.workers {
            if let Err(err) = handle.await {
                error!("worker crashed: {err:?}");
            }
        }
    }
}

async fn intake_loop(
    mut subscription: Box<dyn QueueSubscription>,
    tx: mpsc::Sender<quiver_protocol::InvocationRequest>,
    stats: DispatcherStats,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        if shutting_down.load(Ordering::Relaxed) {
            // Dropping the sender lets the workers finish their backlog.
            break;
        }

        match subscription.next().await {
            Ok(Some(delivery)) => {
                // Delivery is handled once dequeued: acknowledge before
                // execution so slow functions cannot cause redelivery
                // storms.
                if let Err(err) = subscription.ack(&delivery).await {
                    warn!(?err, "failed to acknowledge invocation message");
                }

                let invocation: QueuedInvocation = match serde_json::from_slice(&delivery.payload)
                {
                    Ok(invocation) => invocation,
                    Err(err) => {
                        warn!(?err, "dropping undecodable invocation message");
                        stats.record_dropped_invalid();
                        continue;
                    }
                };

                let request = invocation.into_inner();
                if let Some(field) = request.missing_field() {
                    // Malformed messages are never retried.
                    warn!(
                        request_id = %request.request_id,
                        missing = field,
                        "dropping invocation message failing validation"
                    );
                    stats.record_dropped_invalid();
                    continue;
                }

                if tx.send(request).await.is_err() {
                    info!("worker pool stopped, intake exiting");
                    return;
                }
            }
            Ok(None) => continue,
            Err(err) => {
                error!(?err, "invocation subscription read failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn worker_loop(
    worker_index: usize,
    rx: Arc<Mutex<mpsc::Receiver<quiver_protocol::InvocationRequest>>>,
    processor: Arc<InvocationProcessor>,
) {
    loop {
        let request = { rx.lock().await.recv().await };
        match request {
            Some(request) => {
                info!(
                    worker = worker_index,
                    request_id = %request.request_id,
                    function = %request.function_name,
                    "executing invocation"
                );
                let outcome = processor.process(request).await;
                tracing::debug!(worker = worker_index, ?outcome, "invocation settled");
            }
            None => break,
        }
    }
}
