use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use eternum_sync_core::model::{EntityModels, ModelValue, PendingUpdate};
use eternum_sync_core::observability::SyncMetrics;
use eternum_sync_core::sync::{BoundsDescriptor, ModelBounds, StreamManager, SwitchOutcome};
use eternum_sync_core::torii::{
    Bounds, BoxedSubscription, Clause, IndexerClient, MemoryIndexer, Page, Query, UpdateSink,
};
use eternum_sync_core::IndexerError;

/// Indexer whose entity subscriptions block until the test releases a permit.
struct GatedClient {
    indexer: MemoryIndexer,
    gate: Semaphore,
}

impl GatedClient {
    fn new(indexer: MemoryIndexer) -> Self {
        Self {
            indexer,
            gate: Semaphore::new(0),
        }
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl IndexerClient for GatedClient {
    async fn subscribe_entities(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError> {
        self.gate.acquire().await.map_err(|_| IndexerError::Closed)?.forget();
        self.indexer.subscribe_entities(clause, sink).await
    }

    async fn subscribe_event_messages(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError> {
        self.indexer.subscribe_event_messages(clause, sink).await
    }

    async fn fetch_entities(&self, query: &Query) -> Result<Page, IndexerError> {
        self.indexer.fetch_entities(query).await
    }

    async fn fetch_event_messages(&self, query: &Query) -> Result<Page, IndexerError> {
        self.indexer.fetch_event_messages(query).await
    }
}

fn tiles(min_col: u32, max_col: u32, min_row: u32, max_row: u32) -> BoundsDescriptor {
    BoundsDescriptor::new(
        Bounds::new(min_col, max_col, min_row, max_row),
        vec![ModelBounds::new("s1_eternum-Tile", "col", "row")],
    )
}

fn tile(col: u32, row: u32) -> EntityModels {
    EntityModels::new().with(
        "s1_eternum-Tile",
        ModelValue::structure(
            "Tile",
            [
                ("col", ModelValue::u32(col).as_key()),
                ("row", ModelValue::u32(row).as_key()),
                ("biome", ModelValue::u8(3)),
            ],
        ),
    )
}

fn manager_for(client: Arc<dyn IndexerClient>) -> (StreamManager, mpsc::UnboundedReceiver<PendingUpdate>) {
    let (sink, rx) = mpsc::unbounded_channel();
    (StreamManager::new(client, sink, Arc::new(SyncMetrics::new())), rx)
}

#[tokio::test]
async fn same_descriptor_twice_subscribes_once() {
    let indexer = MemoryIndexer::new();
    let (manager, _rx) = manager_for(Arc::new(indexer.clone()));
    let descriptor = tiles(0, 10, 0, 10);

    let first = manager.switch_bounds(&descriptor);
    let second = manager.switch_bounds(&descriptor);

    assert_eq!(first.await.unwrap(), SwitchOutcome::Applied);
    assert_eq!(second.await.unwrap(), SwitchOutcome::SkippedSameSignature);
    assert_eq!(indexer.subscribe_calls(), 1);

    // Once applied, the same descriptor is still a no-op.
    let third = manager.switch_bounds(&descriptor).await.unwrap();
    assert_eq!(third, SwitchOutcome::SkippedSameSignature);
    assert_eq!(indexer.subscribe_calls(), 1);
}

#[tokio::test]
async fn older_switch_resolving_late_is_dropped() {
    let indexer = MemoryIndexer::new();
    let client = Arc::new(GatedClient::new(indexer.clone()));
    let (manager, _rx) = manager_for(client.clone());
    let a = tiles(0, 10, 0, 10);
    let b = tiles(40, 50, 40, 50);

    let switch_a = manager.switch_bounds(&a);
    // Let A reach the indexer before B is requested.
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    let switch_b = manager.switch_bounds(&b);
    assert!(manager.is_switching());

    client.release(2);
    assert_eq!(switch_a.await.unwrap(), SwitchOutcome::StaleDropped);
    assert_eq!(switch_b.await.unwrap(), SwitchOutcome::Applied);

    assert_eq!(manager.current_signature(), Some(b.signature()));
    assert_eq!(indexer.subscribe_calls(), 2);
    assert_eq!(indexer.active_subscriptions(), 1);
    assert!(!manager.is_switching());
}

#[tokio::test]
async fn live_updates_follow_the_current_bounds() {
    let indexer = MemoryIndexer::new();
    let (manager, mut rx) = manager_for(Arc::new(indexer.clone()));

    manager.switch_bounds(&tiles(0, 10, 0, 10)).await.unwrap();
    indexer.upsert(vec!["5".into(), "5".into()], tile(5, 5));
    indexer.upsert(vec!["45".into(), "45".into()], tile(45, 45));
    assert_eq!(rx.try_recv().unwrap().key, eternum_sync_core::EntityKey::from_keys(&["5", "5"]));
    assert!(rx.try_recv().is_err());

    manager.switch_bounds(&tiles(40, 50, 40, 50)).await.unwrap();
    indexer.upsert(vec!["5".into(), "5".into()], tile(5, 5));
    indexer.upsert(vec!["45".into(), "45".into()], tile(45, 45));
    assert_eq!(rx.try_recv().unwrap().key, eternum_sync_core::EntityKey::from_keys(&["45", "45"]));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn wait_for_pending_switch_settles_the_queue() {
    let indexer = MemoryIndexer::new();
    let client = Arc::new(GatedClient::new(indexer.clone()));
    let (manager, _rx) = manager_for(client.clone());

    let _a = manager.switch_bounds(&tiles(0, 10, 0, 10));
    let _b = manager.switch_bounds(&tiles(20, 30, 20, 30));
    client.release(2);
    manager.wait_for_pending_switch().await;

    assert!(!manager.is_switching());
    assert!(manager.has_active());
    assert_eq!(manager.current_signature(), Some(tiles(20, 30, 20, 30).signature()));
}
