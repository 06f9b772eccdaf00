#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-bus-core** – Event bus abstraction for Wharf.
//!
//! This crate provides the bus trait the relay publishes to and consumers
//! subscribe from, plus an in-memory implementation that models a partitioned,
//! retentive broker: every topic keeps an ordered log addressable by offset,
//! and live subscribers tail it through broadcast channels. Delivery is
//! at-least-once; per-key ordering follows publish order within a topic.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use wharf_events::CloudEvent;

/// Default broadcast buffer for live topic tails.
const DEFAULT_BUFFER: usize = 1024;

//─────────────────────────────
//  Records and errors
//─────────────────────────────

/// One envelope as it sits in a topic log.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    /// Position in the topic log, dense from zero.
    pub offset: u64,
    /// Partition key, the aggregate id.
    pub key: String,
    /// The wire envelope.
    pub envelope: CloudEvent,
}

/// Errors raised by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publish was rejected.
    #[error("failed to publish to {topic}: {reason}")]
    PublishFailed {
        /// Target topic.
        topic: String,
        /// Failure detail.
        reason: String,
    },
    /// Requested offset is past the end of the log.
    #[error("offset {offset} out of range for topic {topic}")]
    OffsetOutOfRange {
        /// Requested topic.
        topic: String,
        /// Requested offset.
        offset: u64,
    },
}

//─────────────────────────────
//  Event bus trait
//─────────────────────────────

/// Publish-subscribe contract over named topics.
///
/// Implementations must be safe for concurrent use. Publishing appends to
/// the topic log and fans out to live subscribers; a subscriber that falls
/// behind the broadcast buffer can always recover by re-reading the log from
/// its last committed offset.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append an envelope to `topic` under a partition key. Returns the
    /// assigned offset.
    async fn publish(&self, topic: &str, key: &str, envelope: CloudEvent) -> Result<u64>;

    /// Tail a topic live. Only records published after the call are
    /// delivered.
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<PublishedRecord>;

    /// Read the retained log from `offset` and tail the topic live.
    ///
    /// The returned history and receiver do not overlap and have no gap:
    /// every record is either in the snapshot or will arrive on the
    /// receiver, exactly once from this method's perspective.
    async fn subscribe_from(
        &self,
        topic: &str,
        offset: u64,
    ) -> Result<(Vec<PublishedRecord>, broadcast::Receiver<PublishedRecord>)>;

    /// Number of records retained for a topic.
    async fn topic_len(&self, topic: &str) -> u64;
}

//─────────────────────────────
//  In-memory bus implementation
//─────────────────────────────

struct TopicState {
    log: Vec<PublishedRecord>,
    tx: broadcast::Sender<PublishedRecord>,
}

impl TopicState {
    fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer);
        Self {
            log: Vec::new(),
            tx,
        }
    }
}

/// In-memory, fully retentive bus.
///
/// Topics are created lazily on first publish or subscribe. The log is
/// unbounded, which is what lets projections rebuild from offset zero the
/// way a broker with long retention allows.
#[derive(Clone)]
pub struct InMemoryBus {
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
    buffer: usize,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl InMemoryBus {
    /// Create a bus with the given live-tail buffer per topic.
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            buffer,
        }
    }

    /// Snapshot the full retained log of a topic.
    pub async fn records(&self, topic: &str) -> Vec<PublishedRecord> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, envelope: CloudEvent) -> Result<u64> {
        let mut topics = self.topics.write().await;
        let state = topics
            .entry(topic.to_owned())
            .or_insert_with(|| TopicState::new(self.buffer));
        let record = PublishedRecord {
            offset: state.log.len() as u64,
            key: key.to_owned(),
            envelope,
        };
        state.log.push(record.clone());
        // Lagging live subscribers recover through subscribe_from.
        let _ = state.tx.send(record.clone());
        Ok(record.offset)
    }

    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<PublishedRecord> {
        let mut topics = self.topics.write().await;
        let state = topics
            .entry(topic.to_owned())
            .or_insert_with(|| TopicState::new(self.buffer));
        state.tx.subscribe()
    }

    async fn subscribe_from(
        &self,
        topic: &str,
        offset: u64,
    ) -> Result<(Vec<PublishedRecord>, broadcast::Receiver<PublishedRecord>)> {
        // Holding the write lock between subscribing and snapshotting is what
        // guarantees no gap and no overlap: publish also takes this lock.
        let mut topics = self.topics.write().await;
        let state = topics
            .entry(topic.to_owned())
            .or_insert_with(|| TopicState::new(self.buffer));
        let rx = state.tx.subscribe();
        let history: Vec<PublishedRecord> = state
            .log
            .iter()
            .skip(offset as usize)
            .cloned()
            .collect();
        Ok((history, rx))
    }

    async fn topic_len(&self, topic: &str) -> u64 {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.log.len() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_events::{AggregateType, DomainEvent, DomainEventPayload, OrderEvent};
    use wharf_types::CorrelationContext;

    fn envelope(aggregate_id: &str) -> CloudEvent {
        let event = DomainEvent {
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: AggregateType::Order,
            occurred_at: chrono::Utc::now(),
            payload: DomainEventPayload::Order(OrderEvent::Validated),
        };
        CloudEvent::from_domain_event("order-service", &event, &CorrelationContext::new()).unwrap()
    }

    #[tokio::test]
    async fn publish_assigns_dense_offsets() {
        let bus = InMemoryBus::default();
        assert_eq!(bus.publish("t", "ORD-1", envelope("ORD-1")).await.unwrap(), 0);
        assert_eq!(bus.publish("t", "ORD-2", envelope("ORD-2")).await.unwrap(), 1);
        assert_eq!(bus.topic_len("t").await, 2);
        assert_eq!(bus.topic_len("other").await, 0);
    }

    #[tokio::test]
    async fn live_subscribers_see_publish_order() {
        let bus = InMemoryBus::default();
        let mut rx = bus.subscribe("t").await;
        bus.publish("t", "ORD-1", envelope("ORD-1")).await.unwrap();
        bus.publish("t", "ORD-1", envelope("ORD-1")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(first.key, "ORD-1");
    }

    #[tokio::test]
    async fn subscribe_from_replays_history_without_gap_or_overlap() {
        let bus = InMemoryBus::default();
        bus.publish("t", "a", envelope("a")).await.unwrap();
        bus.publish("t", "b", envelope("b")).await.unwrap();

        let (history, mut rx) = bus.subscribe_from("t", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].offset, 1);

        bus.publish("t", "c", envelope("c")).await.unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.offset, 2);
        assert_eq!(live.key, "c");
    }

    #[tokio::test]
    async fn subscribe_from_zero_on_empty_topic() {
        let bus = InMemoryBus::default();
        let (history, mut rx) = bus.subscribe_from("empty", 0).await.unwrap();
        assert!(history.is_empty());
        bus.publish("empty", "k", envelope("k")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().offset, 0);
    }
}
