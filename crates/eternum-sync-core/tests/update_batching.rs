use std::collections::HashSet;
use std::sync::Arc;

use eternum_sync_core::config::UpdatesConfig;
use eternum_sync_core::merge::DeletionRepair;
use eternum_sync_core::model::{EntityKey, EntityModels, ModelValue};
use eternum_sync_core::observability::SyncMetrics;
use eternum_sync_core::store::{EntityStore, MemoryStore};
use eternum_sync_core::sync::UpdateQueue;
use eternum_sync_core::torii::{IndexerClient, MemoryIndexer};

const EXPLORER: &str = "s1_eternum-ExplorerTroops";

fn config(batch_size: usize) -> UpdatesConfig {
    UpdatesConfig {
        debounce_ms: 50,
        batch_size,
        logging: false,
    }
}

fn field(model: &str, field: &str, value: u32) -> EntityModels {
    EntityModels::new().with(
        model,
        ModelValue::structure(
            "M",
            [(field, ModelValue::structure("V", [("value", ModelValue::u32(value))]))],
        ),
    )
}

fn explorer(id: u32, x: u32, y: u32, count: u128) -> EntityModels {
    EntityModels::new().with(
        EXPLORER,
        ModelValue::structure(
            "ExplorerTroops",
            [
                ("explorer_id", ModelValue::u32(id).as_key()),
                ("owner", ModelValue::u32(7)),
                (
                    "coord",
                    ModelValue::structure("Coord", [("x", ModelValue::u32(x)), ("y", ModelValue::u32(y))]),
                ),
                (
                    "troops",
                    ModelValue::structure("Troops", [("count", ModelValue::u128(count))]),
                ),
            ],
        ),
    )
}

fn leaf(store: &MemoryStore, key: &EntityKey, model: &str, path: &str) -> Option<u128> {
    store.model(key, model)?.path(path)?.as_u128()
}

#[tokio::test(start_paused = true)]
async fn flushes_respect_the_batch_cap() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(SyncMetrics::new());
    let queue = UpdateQueue::spawn(store.clone(), DeletionRepair::empty(), &config(3), metrics.clone());
    let mut flushes = queue.subscribe_flushes();

    for i in 0..10u32 {
        queue.enqueue(format!("E{i}"), field("m", "x", i)).unwrap();
    }

    let mut sizes = Vec::new();
    while sizes.iter().sum::<usize>() < 10 {
        let report = flushes.recv().await.unwrap();
        assert!(!report.failed);
        sizes.push(report.entries);
    }

    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(store.len(), 10);
    assert_eq!(metrics.snapshot().updates_applied, 10);
    assert_eq!(metrics.snapshot().batches_flushed, 4);
    assert_eq!(metrics.snapshot().updates_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn updates_to_one_entity_coalesce_in_arrival_order() {
    let store = Arc::new(MemoryStore::new());
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::empty(),
        &config(10),
        Arc::new(SyncMetrics::new()),
    );
    let mut flushes = queue.subscribe_flushes();

    queue.enqueue("A", field("m", "x", 1)).unwrap();
    queue.enqueue("A", field("m", "y", 2)).unwrap();
    queue.enqueue("B", field("m", "x", 5)).unwrap();
    queue.enqueue("B", field("m", "x", 6)).unwrap();

    let report = flushes.recv().await.unwrap();
    assert_eq!(report.entries, 4);
    assert_eq!(report.entities, 2);

    let a = EntityKey::from("A");
    let b = EntityKey::from("B");
    assert_eq!(leaf(&store, &a, "m", "x.value"), Some(1));
    assert_eq!(leaf(&store, &a, "m", "y.value"), Some(2));
    assert_eq!(leaf(&store, &b, "m", "x.value"), Some(6));
}

#[tokio::test(start_paused = true)]
async fn partial_patch_keeps_stored_fields() {
    let store = Arc::new(MemoryStore::new());
    let key = EntityKey::from("A");
    store
        .apply(vec![(key.clone(), field("m", "x", 1).with("n", ModelValue::u32(9)))])
        .unwrap();
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::empty(),
        &config(10),
        Arc::new(SyncMetrics::new()),
    );
    let mut flushes = queue.subscribe_flushes();

    queue.enqueue(key.clone(), field("m", "y", 2)).unwrap();
    flushes.recv().await.unwrap();

    assert_eq!(leaf(&store, &key, "m", "x.value"), Some(1));
    assert_eq!(leaf(&store, &key, "m", "y.value"), Some(2));
    assert!(store.model(&key, "n").is_some());
}

#[tokio::test(start_paused = true)]
async fn delete_then_recreate_in_one_batch() {
    let store = Arc::new(MemoryStore::new());
    let key = EntityKey::from("A");
    store.apply(vec![(key.clone(), field("m", "x", 1))]).unwrap();
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::empty(),
        &config(10),
        Arc::new(SyncMetrics::new()),
    );
    let mut flushes = queue.subscribe_flushes();

    queue.enqueue(key.clone(), EntityModels::new()).unwrap();
    queue.enqueue(key.clone(), field("m", "y", 2)).unwrap();
    let report = flushes.recv().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(leaf(&store, &key, "m", "x.value"), None);
    assert_eq!(leaf(&store, &key, "m", "y.value"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn removed_explorer_arrives_as_zeroed_record() {
    let indexer = MemoryIndexer::new();
    let store = Arc::new(MemoryStore::new());
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::new("s1_eternum"),
        &config(10),
        Arc::new(SyncMetrics::new()),
    );
    let mut flushes = queue.subscribe_flushes();
    let _live = indexer.subscribe_entities(None, queue.sink()).await.unwrap();

    let key = indexer.upsert(vec!["42".into()], explorer(42, 12, 34, 500));
    flushes.recv().await.unwrap();
    assert_eq!(leaf(&store, &key, EXPLORER, "troops.count"), Some(500));

    assert!(indexer.remove_model(&key, EXPLORER));
    let report = flushes.recv().await.unwrap();
    assert_eq!(report.repaired, 1);

    assert_eq!(leaf(&store, &key, EXPLORER, "explorer_id"), Some(42));
    assert_eq!(leaf(&store, &key, EXPLORER, "coord.x"), Some(0));
    assert_eq!(leaf(&store, &key, EXPLORER, "coord.y"), Some(0));
    assert_eq!(leaf(&store, &key, EXPLORER, "troops.count"), Some(0));
    assert_eq!(leaf(&store, &key, EXPLORER, "owner"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn without_repair_an_empty_model_patch_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let key = EntityKey::from_keys(&["42"]);
    store.apply(vec![(key.clone(), explorer(42, 12, 34, 500))]).unwrap();
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::empty(),
        &config(10),
        Arc::new(SyncMetrics::new()),
    );
    let mut flushes = queue.subscribe_flushes();

    queue
        .enqueue(
            key.clone(),
            EntityModels::new().with(EXPLORER, ModelValue::empty_struct("ExplorerTroops")),
        )
        .unwrap();
    flushes.recv().await.unwrap();

    assert_eq!(leaf(&store, &key, EXPLORER, "coord.x"), Some(12));
    assert_eq!(leaf(&store, &key, EXPLORER, "troops.count"), Some(500));
}

#[tokio::test(start_paused = true)]
async fn every_entry_is_applied_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let mut changes = store.subscribe();
    let queue = UpdateQueue::spawn(
        store.clone(),
        DeletionRepair::empty(),
        &config(4),
        Arc::new(SyncMetrics::new()),
    );

    for i in 0..9u32 {
        queue.enqueue(format!("E{i}"), field("m", "x", i)).unwrap();
    }
    queue.shutdown().await;

    let mut seen = HashSet::new();
    while let Ok(change) = changes.try_recv() {
        if let eternum_sync_core::StoreChange::Upserted { key, .. } = change {
            assert!(seen.insert(key), "entity written twice");
        }
    }
    assert_eq!(seen.len(), 9);
}
