//! In-process indexer.
//!
//! Holds entities and event messages in memory, evaluates clauses locally and
//! pushes patches to live subscribers. Used by the traffic simulator and as
//! the indexer in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::clause::Clause;
use super::client::{BoxedSubscription, IndexerClient, Page, Query, SubscriptionHandle, UpdateSink};
use crate::error::IndexerError;
use crate::merge::merge_entity_patch;
use crate::model::{Entity, EntityKey, EntityModels, ModelValue, PendingUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Entities,
    Events,
}

#[derive(Debug, Clone)]
struct Indexed {
    keys: Vec<String>,
    models: EntityModels,
}

struct Subscriber {
    id: u64,
    channel: Channel,
    clause: Option<Clause>,
    sink: UpdateSink,
}

#[derive(Default)]
struct IndexerState {
    entities: BTreeMap<EntityKey, Indexed>,
    events: BTreeMap<EntityKey, Indexed>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    subscribe_calls: usize,
    fetch_calls: usize,
    failing: bool,
}

impl IndexerState {
    fn table(&self, channel: Channel) -> &BTreeMap<EntityKey, Indexed> {
        match channel {
            Channel::Entities => &self.entities,
            Channel::Events => &self.events,
        }
    }

    /// Push `patch` to every subscriber on `channel` whose clause matches `probe`.
    fn notify(&mut self, channel: Channel, key: &EntityKey, probe: &Indexed, patch: &EntityModels) {
        self.subscribers.retain(|sub| {
            if sub.channel != channel {
                return true;
            }
            let wanted = sub
                .clause
                .as_ref()
                .map_or(true, |c| c.matches(&probe.keys, &probe.models));
            if !wanted {
                return true;
            }
            // A closed sink means the consumer is gone.
            sub.sink
                .send(PendingUpdate::new(key.clone(), patch.clone()))
                .is_ok()
        });
    }
}

/// In-memory [`IndexerClient`].
#[derive(Clone, Default)]
pub struct MemoryIndexer {
    state: Arc<Mutex<IndexerState>>,
}

impl MemoryIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into the entity identified by `keys` and notify subscribers.
    pub fn upsert(&self, keys: Vec<String>, patch: EntityModels) -> EntityKey {
        let key = EntityKey::from_keys(&keys);
        let mut state = self.state.lock();

        let merged = merge_entity_patch(state.entities.get(&key).map(|e| &e.models), patch.clone());
        let indexed = Indexed {
            keys,
            models: merged,
        };
        state.notify(Channel::Entities, &key, &indexed, &patch);
        state.entities.insert(key.clone(), indexed);
        key
    }

    /// Delete a whole entity; subscribers receive an update with no models.
    pub fn remove(&self, key: &EntityKey) -> bool {
        let mut state = self.state.lock();
        let Some(indexed) = state.entities.remove(key) else {
            return false;
        };
        state.notify(Channel::Entities, key, &indexed, &EntityModels::new());
        true
    }

    /// Delete one model; subscribers receive it as an empty struct.
    pub fn remove_model(&self, key: &EntityKey, model: &str) -> bool {
        let mut state = self.state.lock();
        let Some(mut indexed) = state.entities.remove(key) else {
            return false;
        };
        let removed = indexed.models.get(model).cloned();
        let Some(removed) = removed else {
            state.entities.insert(key.clone(), indexed);
            return false;
        };

        let type_name = match &removed {
            ModelValue::Struct { name, .. } => name.clone(),
            _ => String::new(),
        };
        let patch = EntityModels::new().with(model, ModelValue::empty_struct(&type_name));
        state.notify(Channel::Entities, key, &indexed, &patch);

        indexed.models.remove(model);
        if !indexed.models.is_empty() {
            state.entities.insert(key.clone(), indexed);
        }
        true
    }

    /// Record an event message and notify event subscribers.
    pub fn emit_event(&self, keys: Vec<String>, models: EntityModels) -> EntityKey {
        let key = EntityKey::from_keys(&keys);
        let mut state = self.state.lock();
        let indexed = Indexed {
            keys,
            models: models.clone(),
        };
        state.notify(Channel::Events, &key, &indexed, &models);
        state.events.insert(key.clone(), indexed);
        key
    }

    /// Make every subscribe and fetch fail until turned off.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<EntityModels> {
        self.state.lock().entities.get(key).map(|e| e.models.clone())
    }

    /// Raw key fields the entity was published under.
    pub fn keys_of(&self, key: &EntityKey) -> Option<Vec<String>> {
        self.state.lock().entities.get(key).map(|e| e.keys.clone())
    }

    fn subscribe(
        &self,
        channel: Channel,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if state.failing {
            return Err(IndexerError::Subscribe("indexer unavailable".into()));
        }

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push(Subscriber {
            id,
            channel,
            clause,
            sink,
        });

        Ok(Box::new(MemorySubscription {
            id,
            state: Arc::downgrade(&self.state),
        }))
    }

    fn fetch(&self, channel: Channel, query: &Query) -> Result<Page, IndexerError> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if state.failing {
            return Err(IndexerError::Fetch("indexer unavailable".into()));
        }

        let offset = match &query.cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| IndexerError::Decode(format!("bad cursor {cursor}")))?,
            None => 0,
        };
        let limit = query.limit.max(1) as usize;

        let mut matching = state.table(channel).iter().filter_map(|(key, indexed)| {
            let wanted = query
                .clause
                .as_ref()
                .map_or(true, |c| c.matches(&indexed.keys, &indexed.models));
            if !wanted {
                return None;
            }
            let mut models = indexed.models.clone();
            models.retain_models(&query.models);
            (!models.is_empty()).then(|| Entity {
                key: key.clone(),
                models,
            })
        });

        let items: Vec<Entity> = matching.by_ref().skip(offset).take(limit).collect();
        let next_cursor = matching
            .next()
            .is_some()
            .then(|| (offset + items.len()).to_string());

        Ok(Page { items, next_cursor })
    }
}

#[async_trait]
impl IndexerClient for MemoryIndexer {
    async fn subscribe_entities(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError> {
        self.subscribe(Channel::Entities, clause, sink)
    }

    async fn subscribe_event_messages(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError> {
        self.subscribe(Channel::Events, clause, sink)
    }

    async fn fetch_entities(&self, query: &Query) -> Result<Page, IndexerError> {
        self.fetch(Channel::Entities, query)
    }

    async fn fetch_event_messages(&self, query: &Query) -> Result<Page, IndexerError> {
        self.fetch(Channel::Events, query)
    }
}

struct MemorySubscription {
    id: u64,
    state: Weak<Mutex<IndexerState>>,
}

impl SubscriptionHandle for MemorySubscription {
    fn cancel(&self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().subscribers.retain(|sub| sub.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torii::clause::{Bounds, PatternMatching};
    use tokio::sync::mpsc;

    fn tile(col: u32, row: u32) -> EntityModels {
        EntityModels::new().with(
            "s1_eternum-Tile",
            ModelValue::structure(
                "Tile",
                [("col", ModelValue::u32(col)), ("row", ModelValue::u32(row))],
            ),
        )
    }

    #[tokio::test]
    async fn subscribers_only_receive_matching_updates() {
        let indexer = MemoryIndexer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let clause = Clause::within_bounds("s1_eternum-Tile", "col", "row", &Bounds::new(0, 10, 0, 10));
        let sub = indexer.subscribe_entities(Some(clause), tx).await.unwrap();

        indexer.upsert(vec!["1".into(), "1".into()], tile(1, 1));
        indexer.upsert(vec!["50".into(), "50".into()], tile(50, 50));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.key, EntityKey::from_keys(&["1", "1"]));
        assert!(rx.try_recv().is_err());

        sub.cancel();
        sub.cancel();
        assert_eq!(indexer.active_subscriptions(), 0);
        indexer.upsert(vec!["2".into(), "2".into()], tile(2, 2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_pages_through_results() {
        let indexer = MemoryIndexer::new();
        for i in 0..5u32 {
            indexer.upsert(vec![i.to_string(), i.to_string()], tile(i, i));
        }

        let mut query = Query::new(
            Some(Clause::wildcard(2, PatternMatching::FixedLen, vec![])),
            vec![],
            2,
        );
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = indexer.fetch_entities(&query).await.unwrap();
            seen += page.items.len();
            pages += 1;
            match page.next_cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn removing_a_model_pushes_an_empty_struct() {
        let indexer = MemoryIndexer::new();
        let key = indexer.upsert(vec!["9".into()], tile(3, 3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = indexer.subscribe_entities(None, tx).await.unwrap();

        assert!(indexer.remove_model(&key, "s1_eternum-Tile"));
        let update = rx.recv().await.unwrap();
        assert!(update.patch.get("s1_eternum-Tile").unwrap().is_empty_struct());
        assert_eq!(indexer.entity_count(), 0);
    }

    #[tokio::test]
    async fn failing_indexer_rejects_requests() {
        let indexer = MemoryIndexer::new();
        indexer.set_failing(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(indexer.subscribe_entities(None, tx).await.is_err());
        assert!(indexer
            .fetch_entities(&Query::new(None, vec![], 10))
            .await
            .is_err());
    }
}
