//! Loading flags for the bulk loads the UI waits on.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LoadingStateKey {
    Config,
    Hyperstructure,
    SingleKey,
    Events,
    SelectedStructure,
    PlayerStructuresOneKey,
    PlayerStructuresTwoKey,
    DonkeysAndArmies,
    Market,
    Bank,
}

/// Shared set of loads currently running.
#[derive(Clone)]
pub struct LoadingState {
    active: Arc<watch::Sender<BTreeSet<LoadingStateKey>>>,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingState {
    pub fn new() -> Self {
        let (active, _) = watch::channel(BTreeSet::new());
        Self {
            active: Arc::new(active),
        }
    }

    pub fn set(&self, key: LoadingStateKey, loading: bool) {
        self.active.send_modify(|active| {
            if loading {
                active.insert(key);
            } else {
                active.remove(&key);
            }
        });
    }

    pub fn is_loading(&self, key: LoadingStateKey) -> bool {
        self.active.borrow().contains(&key)
    }

    pub fn any_loading(&self) -> bool {
        !self.active.borrow().is_empty()
    }

    pub fn active(&self) -> Vec<LoadingStateKey> {
        self.active.borrow().iter().copied().collect()
    }

    /// Observe the set as it changes.
    pub fn watch(&self) -> watch::Receiver<BTreeSet<LoadingStateKey>> {
        self.active.subscribe()
    }
}
