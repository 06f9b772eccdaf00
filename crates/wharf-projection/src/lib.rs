#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-projection** – CQRS read side for Wharf.
//!
//! Projectors subscribe to their topics from a committed cursor, fold events
//! into denormalized in-memory views, and advance the cursor after each
//! apply. Views are rebuildable: reset and replay from offset zero
//! reconstructs the same state, which is also the recovery story when a view
//! is lost. A failing projector only affects its own view; writes and other
//! projectors continue.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wharf_bus_core::{EventBus, PublishedRecord};
use wharf_store_core::OffsetStore;

mod views;

pub use views::{InventoryBySkuProjection, InventoryView, OrderSummary, OrdersByCustomerProjection};

/// A denormalized read model fed from the event stream.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Cursor scope; also the consumer-group name for offsets.
    fn name(&self) -> &str;

    /// Topics this view folds.
    fn topics(&self) -> Vec<String>;

    /// Fold one record into the view. Applies are executed in offset order
    /// per topic and never concurrently for the same projection.
    async fn apply(&self, record: &PublishedRecord) -> Result<()>;

    /// Drop all view state, ahead of a rebuild.
    async fn reset(&self) -> Result<()>;
}

/// Runs a set of projections against the bus.
pub struct ProjectionEngine {
    bus: Arc<dyn EventBus>,
    offsets: Arc<dyn OffsetStore>,
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionEngine {
    /// Create an engine over `bus` committing cursors into `offsets`.
    pub fn new(bus: Arc<dyn EventBus>, offsets: Arc<dyn OffsetStore>) -> Self {
        Self {
            bus,
            offsets,
            projections: Vec::new(),
        }
    }

    /// Register a projection.
    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Apply every retained record the projections have not seen yet, then
    /// return. Tests and rebuilds use this to quiesce deterministically.
    pub async fn catch_up(&self) -> Result<()> {
        for projection in &self.projections {
            for topic in projection.topics() {
                self.catch_up_topic(projection, &topic).await?;
            }
        }
        Ok(())
    }

    /// Reset one projection and replay it from offset zero.
    pub async fn rebuild(&self, name: &str) -> Result<()> {
        let projection = self
            .projections
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown projection {name}"))?;
        info!(projection = name, "rebuilding view from offset zero");
        projection.reset().await?;
        for topic in projection.topics() {
            self.offsets.commit(projection.name(), &topic, 0).await?;
            self.catch_up_topic(&projection, &topic).await?;
        }
        Ok(())
    }

    /// Spawn one live loop per (projection, topic). Each loop catches up
    /// from its cursor and then follows the live tail until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(projections = self.projections.len(), "projection engine started");
            let mut loops = Vec::new();
            for projection in self.projections.clone() {
                for topic in projection.topics() {
                    let engine = Arc::clone(&self);
                    let projection = Arc::clone(&projection);
                    let cancel = cancel.clone();
                    loops.push(tokio::spawn(async move {
                        engine.run_loop(projection, topic, cancel).await;
                    }));
                }
            }
            join_all(loops).await;
            info!("projection engine stopped");
        })
    }

    async fn run_loop(
        &self,
        projection: Arc<dyn Projection>,
        topic: String,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.follow_topic(&projection, &topic, &cancel).await {
                // Isolation: this projector backs off and resubscribes;
                // nothing else is affected.
                warn!(
                    projection = projection.name(),
                    topic, error = %err,
                    "projector loop failed, resubscribing"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                }
            }
        }
    }

    async fn follow_topic(
        &self,
        projection: &Arc<dyn Projection>,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let start = self
            .offsets
            .committed(projection.name(), topic)
            .await?
            .unwrap_or(0);
        let (history, mut rx) = self.bus.subscribe_from(topic, start).await?;
        debug!(
            projection = projection.name(),
            topic,
            start,
            backlog = history.len(),
            "projector subscribed"
        );
        for record in history {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.apply_one(projection, topic, &record).await?;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(record) => self.apply_one(projection, topic, &record).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        anyhow::bail!("projector lagged {skipped} records");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn catch_up_topic(&self, projection: &Arc<dyn Projection>, topic: &str) -> Result<()> {
        let start = self
            .offsets
            .committed(projection.name(), topic)
            .await?
            .unwrap_or(0);
        let (history, _rx) = self.bus.subscribe_from(topic, start).await?;
        for record in history {
            self.apply_one(projection, topic, &record).await?;
        }
        Ok(())
    }

    async fn apply_one(
        &self,
        projection: &Arc<dyn Projection>,
        topic: &str,
        record: &PublishedRecord,
    ) -> Result<()> {
        projection.apply(record).await?;
        self.offsets
            .commit(projection.name(), topic, record.offset + 1)
            .await?;
        Ok(())
    }
}
