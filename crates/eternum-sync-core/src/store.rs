//! Entity store - the shared table every sync path writes into.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::merge::merge_entity_patch;
use crate::model::{EntityKey, EntityModels, ModelValue};

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Write target for synchronized entities.
///
/// Implementations do their own indexing and change propagation. Each call is
/// one non-interleaved apply step.
pub trait EntityStore: Send + Sync {
    /// Merge each patch into its entity.
    fn apply(&self, batch: Vec<(EntityKey, EntityModels)>) -> Result<(), StoreError>;

    /// Remove an entity. Returns whether it existed.
    fn delete(&self, key: &EntityKey) -> Result<bool, StoreError>;

    /// Current record for an entity.
    fn get(&self, key: &EntityKey) -> Option<EntityModels>;
}

/// Change notification emitted by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upserted { key: EntityKey, models: Vec<String> },
    Deleted { key: EntityKey },
}

/// In-memory entity table with broadcast change notifications.
pub struct MemoryStore {
    entities: RwLock<HashMap<EntityKey, EntityModels>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entities: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Receive changes applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.entities.read().keys().cloned().collect()
    }

    /// One model of one entity.
    pub fn model(&self, key: &EntityKey, model: &str) -> Option<ModelValue> {
        self.entities.read().get(key)?.get(model).cloned()
    }

    /// Number of entities carrying `model`.
    pub fn count_with_model(&self, model: &str) -> usize {
        self.entities
            .read()
            .values()
            .filter(|models| models.contains(model))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryStore {
    fn apply(&self, batch: Vec<(EntityKey, EntityModels)>) -> Result<(), StoreError> {
        let mut notifications = Vec::with_capacity(batch.len());
        {
            let mut entities = self.entities.write();
            for (key, patch) in batch {
                let models = patch.model_names().map(str::to_string).collect();
                let merged = merge_entity_patch(entities.get(&key), patch);
                entities.insert(key.clone(), merged);
                notifications.push(StoreChange::Upserted { key, models });
            }
        }

        for change in notifications {
            // No receivers is fine.
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    fn delete(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let existed = self.entities.write().remove(key).is_some();
        if existed {
            let _ = self.changes.send(StoreChange::Deleted { key: key.clone() });
        }
        Ok(existed)
    }

    fn get(&self, key: &EntityKey) -> Option<EntityModels> {
        self.entities.read().get(key).cloned()
    }
}
