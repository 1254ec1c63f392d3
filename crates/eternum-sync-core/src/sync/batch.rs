//! Update batching queue.
//!
//! Live subscriptions push raw `(entity, patch)` notifications into an
//! unbounded channel. A single consumer task drains that channel into a FIFO
//! pending list and flushes it into the entity store:
//!
//! - the first arrival while idle opens a debounce window so same-tick
//!   updates can coalesce
//! - each flush takes at most `batch_size` of the oldest entries, coalesces
//!   them per entity in arrival order and applies the result in one call
//! - when entries remain, the consumer yields before the next flush
//!
//! One consumer per queue means flushes never overlap. A failed flush is
//! logged and its entries are dropped; the queue keeps running.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::UpdatesConfig;
use crate::error::{StoreError, SyncError};
use crate::merge::{merge_entity_patch, DeletionRepair};
use crate::model::{EntityKey, EntityModels, PendingUpdate};
use crate::observability::SyncMetrics;
use crate::store::EntityStore;
use crate::torii::UpdateSink;

const FLUSH_CHANNEL_CAPACITY: usize = 256;

/// Outcome of one flush step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Pending entries consumed.
    pub entries: usize,
    /// Distinct entities written.
    pub entities: usize,
    /// Entities removed from the store.
    pub deleted: usize,
    /// Deletion-artifact repairs applied.
    pub repaired: usize,
    /// Whether the store rejected the batch.
    pub failed: bool,
}

/// Coalesced state of one entity within a flush.
#[derive(Debug, Default)]
struct Slot {
    /// An entry with no models was seen; the entity is removed before `patch`.
    delete: bool,
    patch: EntityModels,
}

/// Handle to a running batching queue.
pub struct UpdateQueue {
    sink: UpdateSink,
    shutdown: watch::Sender<bool>,
    flushes: broadcast::Sender<FlushReport>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateQueue {
    /// Start the consumer task.
    pub fn spawn(
        store: Arc<dyn EntityStore>,
        repair: DeletionRepair,
        config: &UpdatesConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let (sink, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (flushes, _) = broadcast::channel(FLUSH_CHANNEL_CAPACITY);

        let consumer = Consumer {
            store,
            repair,
            debounce: config.debounce(),
            batch_size: config.batch_size.max(1),
            logging: config.logging,
            metrics,
            flushes: flushes.clone(),
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(consumer.run(rx, shutdown_rx));

        Self {
            sink,
            shutdown,
            flushes,
            task: Mutex::new(Some(task)),
        }
    }

    /// Sender handed to live subscriptions.
    pub fn sink(&self) -> UpdateSink {
        self.sink.clone()
    }

    pub fn enqueue(&self, key: impl Into<EntityKey>, patch: EntityModels) -> Result<(), SyncError> {
        self.sink
            .send(PendingUpdate::new(key, patch))
            .map_err(|_| SyncError::Indexer(crate::error::IndexerError::Closed))
    }

    /// Reports for every flush from now on.
    pub fn subscribe_flushes(&self) -> broadcast::Receiver<FlushReport> {
        self.flushes.subscribe()
    }

    /// Flush what is already pending, then stop the consumer.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Update queue consumer panicked");
            }
        }
    }
}

struct Consumer {
    store: Arc<dyn EntityStore>,
    repair: DeletionRepair,
    debounce: Duration,
    batch_size: usize,
    logging: bool,
    metrics: Arc<SyncMetrics>,
    flushes: broadcast::Sender<FlushReport>,
    pending: VecDeque<PendingUpdate>,
}

impl Consumer {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PendingUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            // Idle: wait for the first arrival.
            let first = tokio::select! {
                update = rx.recv() => update,
                _ = shutdown.changed() => None,
            };
            let Some(first) = first else {
                self.drain(&mut rx);
                self.flush_all().await;
                break;
            };
            self.push(first);

            tokio::time::sleep(self.debounce).await;
            self.drain(&mut rx);
            self.flush_all().await;
        }

        tracing::debug!("Update queue stopped");
    }

    fn push(&mut self, update: PendingUpdate) {
        if self.logging {
            tracing::debug!(entity = %update.key, models = update.patch.len(), "Entity updated");
        }
        self.pending.push_back(update);
    }

    fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<PendingUpdate>) {
        while let Ok(update) = rx.try_recv() {
            self.push(update);
        }
    }

    async fn flush_all(&mut self) {
        while !self.pending.is_empty() {
            let take = self.batch_size.min(self.pending.len());
            let entries: Vec<PendingUpdate> = self.pending.drain(..take).collect();
            let report = self.flush(entries);
            let _ = self.flushes.send(report);

            if !self.pending.is_empty() {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Coalesce `entries` per entity and write them in one pass.
    fn flush(&self, entries: Vec<PendingUpdate>) -> FlushReport {
        let mut report = FlushReport {
            entries: entries.len(),
            ..FlushReport::default()
        };
        tracing::debug!(batch = entries.len(), "Processing batch of updates");

        let mut order: Vec<EntityKey> = Vec::new();
        let mut slots: HashMap<EntityKey, Slot> = HashMap::new();
        let mut stored: HashMap<EntityKey, Option<EntityModels>> = HashMap::new();

        for PendingUpdate { key, mut patch } in entries {
            let slot = slots.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Slot::default()
            });

            if patch.is_empty() {
                slot.delete = true;
                slot.patch = EntityModels::new();
                continue;
            }

            if !self.repair.is_empty() {
                let base = if slot.delete {
                    None
                } else {
                    stored
                        .entry(key.clone())
                        .or_insert_with(|| self.store.get(&key))
                        .clone()
                };
                let view = merge_entity_patch(base.as_ref(), slot.patch.clone());
                report.repaired += self.repair.repair(Some(&view), &mut patch);
            }

            slot.patch = merge_entity_patch(Some(&slot.patch), patch);
        }

        let mut writes = Vec::with_capacity(order.len());
        let mut deletes = Vec::new();
        for key in order {
            let Some(slot) = slots.remove(&key) else {
                continue;
            };
            if slot.delete {
                deletes.push(key.clone());
            }
            if !slot.patch.is_empty() {
                writes.push((key, slot.patch));
            }
        }
        report.entities = writes.len() + deletes.len();

        match self.write(&deletes, writes) {
            Ok(deleted) => {
                report.deleted = deleted;
                self.metrics.record_batch(1);
                self.metrics.record_applied(report.entries as u64);
                self.metrics.record_deleted(deleted as u64);
                self.metrics.record_repairs(report.repaired as u64);
            }
            Err(e) => {
                tracing::error!(error = %e, batch = report.entries, "Error processing entity batch");
                report.failed = true;
                self.metrics.record_dropped(report.entries as u64);
            }
        }

        report
    }

    fn write(
        &self,
        deletes: &[EntityKey],
        writes: Vec<(EntityKey, EntityModels)>,
    ) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in deletes {
            if self.store.delete(key)? {
                deleted += 1;
            }
        }
        if !writes.is_empty() {
            self.store.apply(writes)?;
        }
        Ok(deleted)
    }
}
