#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-consumer** – Consumer-group worker for Wharf.
//!
//! Subscribes a handler to its topics from the committed offset and executes
//! the reserve protocol against the dedup store before every invocation, so
//! duplicate deliveries (relay retries, bus redelivery) produce at most one
//! side effect per `(consumer group, event id)`. A handler that keeps
//! failing has its envelope diverted unchanged to the topic's dead-letter
//! companion, and the group continues to advance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wharf_bus_core::{EventBus, PublishedRecord};
use wharf_store_core::{ConsumerDedupStore, OffsetStore, Reservation};
use wharf_types::Clock;

/// Contract for one logical consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Consumer group identity; scopes the dedup and offset records.
    fn group(&self) -> &str;

    /// Topics this consumer subscribes to.
    fn topics(&self) -> Vec<String>;

    /// Apply the side effects for one envelope. Must be safe to call again
    /// when a previous attempt failed before `mark_succeeded`.
    async fn handle(&self, record: &PublishedRecord) -> Result<()>;
}

/// Consumer worker tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Reservation lease while a handler runs.
    pub lease: Duration,
    /// Handler attempts before the envelope is dead-lettered.
    pub max_retries: u32,
    /// Pause between handler attempts.
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Drives one [`EventHandler`] over its subscribed topics.
pub struct ConsumerWorker {
    handler: Arc<dyn EventHandler>,
    bus: Arc<dyn EventBus>,
    dedup: Arc<dyn ConsumerDedupStore>,
    offsets: Arc<dyn OffsetStore>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
}

impl ConsumerWorker {
    /// Create a worker for `handler`.
    pub fn new(
        handler: Arc<dyn EventHandler>,
        bus: Arc<dyn EventBus>,
        dedup: Arc<dyn ConsumerDedupStore>,
        offsets: Arc<dyn OffsetStore>,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            handler,
            bus,
            dedup,
            offsets,
            clock,
            config,
        }
    }

    /// Spawn one loop per subscribed topic; the returned handle resolves
    /// when every loop has observed `cancel` and finished its current
    /// record.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let group = self.handler.group().to_owned();
            info!(group = %group, "consumer worker started");
            let loops: Vec<_> = self
                .handler
                .topics()
                .into_iter()
                .map(|topic| {
                    let worker = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tokio::spawn(async move { worker.run_topic(&topic, cancel).await })
                })
                .collect();
            join_all(loops).await;
            info!(group = %group, "consumer worker stopped");
        })
    }

    async fn run_topic(&self, topic: &str, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.consume_topic(topic, &cancel).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(topic, error = %err, "consumer loop failed, resubscribing");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn consume_topic(&self, topic: &str, cancel: &CancellationToken) -> Result<()> {
        let group = self.handler.group();
        let start = self
            .offsets
            .committed(group, topic)
            .await?
            .unwrap_or(0);
        let (history, mut rx) = self.bus.subscribe_from(topic, start).await?;
        debug!(group, topic, start, backlog = history.len(), "subscribed");

        for record in history {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.process(topic, &record).await?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(record) => self.process(topic, &record).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Fell behind the live tail; recover from the log.
                        warn!(group, topic, skipped, "consumer lagged, recovering from log");
                        return Err(anyhow::anyhow!("lagged {skipped} records"));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Reserve, handle, settle. Retries the handler up to `max_retries`
    /// total attempts, then diverts the envelope to the dead-letter topic
    /// and advances.
    async fn process(&self, topic: &str, record: &PublishedRecord) -> Result<()> {
        let group = self.handler.group();
        let event_id = record.envelope.id;

        loop {
            let reservation = self
                .dedup
                .reserve(group, event_id, self.config.lease, self.clock.now())
                .await?;
            match reservation {
                Reservation::AlreadySucceeded => {
                    debug!(group, %event_id, "duplicate delivery skipped");
                    self.offsets.commit(group, topic, record.offset + 1).await?;
                    return Ok(());
                }
                Reservation::InFlight => {
                    // Another worker in the group owns it; it also owns the
                    // offset commit.
                    debug!(group, %event_id, "reservation held elsewhere, skipping");
                    return Ok(());
                }
                Reservation::Acquired => match self.handler.handle(record).await {
                    Ok(()) => {
                        self.dedup
                            .mark_succeeded(group, event_id, self.clock.now())
                            .await?;
                        self.offsets.commit(group, topic, record.offset + 1).await?;
                        return Ok(());
                    }
                    Err(err) => {
                        let attempts = self
                            .dedup
                            .mark_failed(group, event_id, self.clock.now())
                            .await?;
                        if attempts >= self.config.max_retries {
                            warn!(
                                group, %event_id, attempts, error = %err,
                                "handler exhausted retries, dead-lettering"
                            );
                            self.divert(topic, record).await?;
                            // The diversion is the record's terminal side
                            // effect; further deliveries must skip.
                            self.dedup
                                .mark_succeeded(group, event_id, self.clock.now())
                                .await?;
                            self.offsets.commit(group, topic, record.offset + 1).await?;
                            return Ok(());
                        }
                        warn!(group, %event_id, attempts, error = %err, "handler failed, retrying");
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                },
            }
        }
    }

    async fn divert(&self, topic: &str, record: &PublishedRecord) -> Result<()> {
        let dlq = format!("{topic}.dlq");
        self.bus
            .publish(&dlq, &record.key, record.envelope.clone())
            .await?;
        Ok(())
    }
}
