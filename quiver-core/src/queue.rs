use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::errors::{QuiverError, Result};

/// Field under which message bytes are stored in a stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// How long a consumer read blocks before yielding an idle `None`.
const BLOCK_MILLIS: usize = 5_000;

const READ_COUNT: usize = 16;

/// One message handed to a consumer, with the broker-assigned id used to
/// acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Durable cursor over one topic for one named consumer group.
///
/// `next` blocks for a bounded interval and returns `Ok(None)` when no
/// message arrived, so callers can interleave shutdown checks.
#[async_trait]
pub trait QueueSubscription: Send {
    async fn next(&mut self) -> Result<Option<Delivery>>;
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;
}

/// Topic-based publish/subscribe with durable, named consumer groups.
///
/// Delivery is at-least-once: a message stays pending until acknowledged.
/// Publish order is preserved per topic; there is no global order across
/// consumers.
#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Publishes and waits for the broker acknowledgement.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Fire-and-forget publish; failures are logged, never surfaced.
    fn publish_forget(&self, topic: &str, payload: Vec<u8>);

    /// Opens (or joins) a durable consumer group on the topic.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn QueueSubscription>>;
}

/// Redis Streams implementation of the durable queue.
///
/// Topics are streams, consumer groups are stream groups created with
/// `MKSTREAM` at position `0` so a group observes messages published before
/// it first subscribed.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    consumer: String,
}

impl RedisQueue {
    pub async fn connect(queue_url: &str, consumer: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(queue_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            consumer: consumer.into(),
        })
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.xadd::<_, _, _, _, String>(topic, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        Ok(())
    }

    fn publish_forget(&self, topic: &str, payload: Vec<u8>) {
        let mut conn = self.manager.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(err) = conn
                .xadd::<_, _, _, _, String>(&topic, "*", &[(PAYLOAD_FIELD, payload)])
                .await
            {
                warn!(%topic, ?err, "fire-and-forget publish failed");
            }
        });
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn QueueSubscription>> {
        let mut conn = self.manager.clone();
        if let Err(err) = conn
            .xgroup_create_mkstream::<_, _, _, ()>(topic, group, "0")
            .await
        {
            // BUSYGROUP means the durable cursor already exists.
            if err.code() != Some("BUSYGROUP") {
                return Err(err.into());
            }
        }

        Ok(Box::new(RedisSubscription {
            manager: self.manager.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: self.consumer.clone(),
            buffer: VecDeque::new(),
        }))
    }
}

struct RedisSubscription {
    manager: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    buffer: VecDeque<Delivery>,
}

#[async_trait]
impl QueueSubscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        if let Some(delivery) = self.buffer.pop_front() {
            return Ok(Some(delivery));
        }

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT)
            .block(BLOCK_MILLIS);

        let mut conn = self.manager.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[self.topic.as_str()], &[">"], &options)
            .await?;

        for key in reply.keys {
            for entry in key.ids {
                let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                self.buffer.push_back(Delivery {
                    id: entry.id.clone(),
                    payload,
                });
            }
        }

        Ok(self.buffer.pop_front())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.xack::<_, _, _, i64>(&self.topic, &self.group, &[delivery.id.as_str()])
            .await?;
        Ok(())
    }
}

/// In-memory queue with the same consumer-group semantics, used by tests
/// and local development.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryInner>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct MemoryInner {
    // Full per-topic log, so groups created later still observe messages.
    retained: HashMap<String, Vec<Vec<u8>>>,
    pending: HashMap<(String, String), VecDeque<(u64, Vec<u8>)>>,
    sequence: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, topic: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        inner.sequence += 1;
        let sequence = inner.sequence;
        inner
            .retained
            .entry(topic.to_string())
            .or_default()
            .push(payload.clone());
        for ((pending_topic, _), queue) in inner.pending.iter_mut() {
            if pending_topic == topic {
                queue.push_back((sequence, payload.clone()));
            }
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.push(topic, payload).await;
        Ok(())
    }

    fn publish_forget(&self, topic: &str, payload: Vec<u8>) {
        let queue = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            queue.push(&topic, payload).await;
        });
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn QueueSubscription>> {
        let key = (topic.to_string(), group.to_string());
        let mut inner = self.inner.lock().await;
        if !inner.pending.contains_key(&key) {
            let seeded: VecDeque<(u64, Vec<u8>)> = inner
                .retained
                .get(topic)
                .map(|log| {
                    log.iter()
                        .enumerate()
                        .map(|(index, payload)| (index as u64, payload.clone()))
                        .collect()
                })
                .unwrap_or_default();
            inner.pending.insert(key.clone(), seeded);
        }

        Ok(Box::new(MemorySubscription {
            queue: self.clone(),
            key,
        }))
    }
}

struct MemorySubscription {
    queue: MemoryQueue,
    key: (String, String),
}

#[async_trait]
impl QueueSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            {
                let mut inner = self.queue.inner.lock().await;
                if let Some(queue) = inner.pending.get_mut(&self.key) {
                    if let Some((sequence, payload)) = queue.pop_front() {
                        return Ok(Some(Delivery {
                            id: sequence.to_string(),
                            payload,
                        }));
                    }
                } else {
                    return Err(QuiverError::QueueError(format!(
                        "subscription {}:{} was removed",
                        self.key.0, self.key.1
                    )));
                }
            }

            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                    return Ok(None);
                }
            }
        }
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<()> {
        // Popping from the pending queue already consumed the message.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_created_before_publish_competes_for_messages() {
        let queue = MemoryQueue::new();
        let mut first = queue.subscribe("topic", "workers").await.unwrap();
        let mut second = queue.subscribe("topic", "workers").await.unwrap();

        queue.publish("topic", b"one".to_vec()).await.unwrap();
        queue.publish("topic", b"two".to_vec()).await.unwrap();

        let a = first.next().await.unwrap().expect("first message");
        let b = second.next().await.unwrap().expect("second message");
        assert_ne!(a.payload, b.payload);
        assert!(second.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn late_group_observes_retained_messages() {
        let queue = MemoryQueue::new();
        queue.publish("topic", b"early".to_vec()).await.unwrap();

        let mut sub = queue.subscribe("topic", "ingest").await.unwrap();
        let delivery = sub.next().await.unwrap().expect("retained message");
        assert_eq!(delivery.payload, b"early");
        sub.ack(&delivery).await.unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_publish_eventually_lands() {
        let queue = MemoryQueue::new();
        let mut sub = queue.subscribe("topic", "workers").await.unwrap();

        queue.publish_forget("topic", b"later".to_vec());

        let delivery = loop {
            if let Some(delivery) = sub.next().await.unwrap() {
                break delivery;
            }
        };
        assert_eq!(delivery.payload, b"later");
    }

    #[tokio::test]
    async fn groups_do_not_steal_from_each_other() {
        let queue = MemoryQueue::new();
        let mut workers = queue.subscribe("topic", "workers").await.unwrap();
        let mut ingest = queue.subscribe("topic", "ingest").await.unwrap();

        queue.publish("topic", b"shared".to_vec()).await.unwrap();

        assert_eq!(workers.next().await.unwrap().unwrap().payload, b"shared");
        assert_eq!(ingest.next().await.unwrap().unwrap().payload, b"shared");
    }
}
