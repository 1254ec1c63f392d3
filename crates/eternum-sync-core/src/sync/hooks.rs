//! Per-feature sync hooks.
//!
//! - [`FeatureSync`]: one-shot loads guarded by a shared "already synced" flag
//! - [`ActiveStructureSync`]: live subscription to a structure the player is viewing but does not own
//! - [`PlayerStructureSync`]: polls the player's structures and keeps one bounded subscription over them

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Result, SyncError};
use crate::sync::orchestrator::SyncContext;
use crate::sync::queries::structure_clause;
use crate::sync::stream_manager::{BoundsDescriptor, ModelBounds, StreamManager, SwitchOutcome};
use crate::torii::{Bounds, BoxedSubscription, IndexerClient, StructureLocation, UpdateSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeatureSyncOutcome {
    /// The load ran and wrote this many entities.
    Synced(usize),
    /// The feature was already synced and `force` was not set.
    AlreadySynced,
    /// The load failed; the feature may be retried.
    Failed,
}

#[derive(Default)]
struct FeatureFlags {
    synced: HashSet<String>,
    syncing: HashSet<String>,
}

/// Clears the in-progress mark for a feature, including when the sync future is dropped.
struct SyncingGuard<'a> {
    flags: Arc<Mutex<FeatureFlags>>,
    feature: &'a str,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.flags.lock().syncing.remove(self.feature);
    }
}

/// Shared registry of features whose one-shot load has run.
#[derive(Clone, Default)]
pub struct FeatureSync {
    flags: Arc<Mutex<FeatureFlags>>,
}

impl FeatureSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `feature` unless it already ran. `force` bypasses the guard.
    ///
    /// Errors never escape; a failed load is logged and reported as
    /// [`FeatureSyncOutcome::Failed`].
    pub async fn sync<F, Fut>(&self, feature: &str, force: bool, fetch: F) -> FeatureSyncOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        {
            let mut flags = self.flags.lock();
            if !force && (flags.synced.contains(feature) || flags.syncing.contains(feature)) {
                tracing::debug!(feature, "Already synced, skipping");
                return FeatureSyncOutcome::AlreadySynced;
            }
            flags.syncing.insert(feature.to_string());
        }
        let _syncing = SyncingGuard {
            flags: self.flags.clone(),
            feature,
        };

        match fetch().await {
            Ok(entities) => {
                self.flags.lock().synced.insert(feature.to_string());
                FeatureSyncOutcome::Synced(entities)
            }
            Err(e) => {
                tracing::error!(feature, error = %e, "Feature sync failed");
                FeatureSyncOutcome::Failed
            }
        }
    }

    pub fn is_synced(&self, feature: &str) -> bool {
        self.flags.lock().synced.contains(feature)
    }

    pub fn is_syncing(&self, feature: &str) -> bool {
        self.flags.lock().syncing.contains(feature)
    }

    /// Forget that `feature` was synced.
    pub fn reset(&self, feature: &str) {
        self.flags.lock().synced.remove(feature);
    }
}

/// What the viewed structure subscription currently covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewKey {
    structure_id: Option<u32>,
    return_position: Option<(u32, u32)>,
}

/// Live subscription to the structure being viewed, when it is not the player's own.
pub struct ActiveStructureSync {
    client: Arc<dyn IndexerClient>,
    sink: UpdateSink,
    current: Option<ViewKey>,
    handle: Option<BoxedSubscription>,
}

impl ActiveStructureSync {
    pub fn new(client: Arc<dyn IndexerClient>, sink: UpdateSink) -> Self {
        Self {
            client,
            sink,
            current: None,
            handle: None,
        }
    }

    /// React to a change of the viewed structure.
    ///
    /// Returns whether a new subscription was opened. Player-owned structures
    /// are covered elsewhere and never get one here.
    pub async fn update(
        &mut self,
        structure_id: Option<u32>,
        return_position: Option<(u32, u32)>,
        owned_by_player: bool,
    ) -> Result<bool> {
        let view = ViewKey {
            structure_id,
            return_position,
        };
        if self.current == Some(view) {
            return Ok(false);
        }

        self.cancel();
        self.current = Some(view);

        let Some(id) = structure_id else {
            return Ok(false);
        };
        if owned_by_player {
            tracing::debug!(structure = id, "Viewing own structure, no extra subscription");
            return Ok(false);
        }

        let positions: Vec<(u32, u32)> = return_position.into_iter().collect();
        let clause = structure_clause(&[id], &positions, &[]);
        match self.client.subscribe_entities(Some(clause), self.sink.clone()).await {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::debug!(structure = id, "Subscribed to viewed structure");
                Ok(true)
            }
            Err(e) => {
                // Let the next update retry.
                self.current = None;
                tracing::error!(structure = id, error = %e, "Failed to subscribe to viewed structure");
                Err(e.into())
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

impl Drop for ActiveStructureSync {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Result of one player-structure poll.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub structures: usize,
    /// Ids seen for the first time; their bulk load was queued.
    pub discovered: Vec<u32>,
    /// Outcome of the subscription rebuild, if the set changed.
    pub switch: Option<SwitchOutcome>,
}

/// Keeps the player's structures loaded and under one live subscription.
pub struct PlayerStructureSync {
    ctx: Arc<SyncContext>,
    player: String,
    manager: StreamManager,
    known: BTreeSet<u32>,
    /// The last switch for `known` failed and must be retried.
    stale_subscription: bool,
}

impl PlayerStructureSync {
    pub fn new(ctx: Arc<SyncContext>, player: impl Into<String>) -> Self {
        let manager = ctx.stream_manager();
        Self {
            ctx,
            player: player.into(),
            manager,
            known: BTreeSet::new(),
            stale_subscription: false,
        }
    }

    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    pub fn known(&self) -> &BTreeSet<u32> {
        &self.known
    }

    /// Fetch the authoritative structure list once and reconcile.
    pub async fn poll_once(&mut self) -> Result<PollReport> {
        let structures = self
            .ctx
            .directory()
            .fetch_structures_by_owner(&self.player)
            .await
            .map_err(|e| SyncError::Directory(e.to_string()))?;

        let ids: BTreeSet<u32> = structures.iter().map(|s| s.entity_id).collect();
        let mut report = PollReport {
            structures: structures.len(),
            ..PollReport::default()
        };

        let fresh: Vec<StructureLocation> = structures
            .iter()
            .filter(|s| !self.known.contains(&s.entity_id))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            report.discovered = fresh.iter().map(|s| s.entity_id).collect();
            tracing::info!(count = fresh.len(), "New player structures discovered");
            self.ctx.sync_player_structures_data(&fresh);
        }

        if ids == self.known && !self.stale_subscription {
            return Ok(report);
        }
        // Loads for `fresh` are already queued; remember them even if the switch fails.
        self.known = ids;
        match player_descriptor(&structures, self.ctx.config().player_sync.padding, &self.ctx.config().namespace) {
            Some(descriptor) => {
                self.stale_subscription = true;
                report.switch = Some(self.manager.switch_bounds(&descriptor).await?);
                self.stale_subscription = false;
            }
            None => {
                self.manager.cancel_current_subscription();
                self.stale_subscription = false;
            }
        }

        Ok(report)
    }

    /// Poll every `interval` until `shutdown` flips to true.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Player structure poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.manager.shutdown();
        tracing::debug!("Player structure sync stopped");
    }
}

/// Bounded subscription covering every structure, padded, plus their keyed models.
pub fn player_descriptor(
    structures: &[StructureLocation],
    padding: u32,
    namespace: &str,
) -> Option<BoundsDescriptor> {
    let bounds = Bounds::covering(structures.iter().map(StructureLocation::position))?.with_padding(padding);
    let model = |name: &str| crate::model::model_name(namespace, name);

    let ids: Vec<u32> = structures
        .iter()
        .map(|s| s.entity_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let descriptor = BoundsDescriptor::new(
        bounds,
        vec![
            ModelBounds::new(model("Structure"), "base.coord_x", "base.coord_y"),
            ModelBounds::new(model("ExplorerTroops"), "coord.x", "coord.y"),
            ModelBounds::new(model("Tile"), "col", "row"),
        ],
    )
    .with_clause(structure_clause(&ids, &[], &[]));

    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(entity_id: u32, x: u32, y: u32) -> StructureLocation {
        StructureLocation {
            entity_id,
            owner: "0x1".into(),
            coord_x: x,
            coord_y: y,
        }
    }

    #[test]
    fn descriptor_covers_all_structures_with_padding() {
        let descriptor = player_descriptor(
            &[location(1, 10, 40), location(2, 30, 20)],
            6,
            "s1_eternum",
        )
        .unwrap();

        assert_eq!(descriptor.bounds, Bounds::new(10, 30, 20, 40).with_padding(6));
        assert_eq!(descriptor.models.len(), 3);
        assert_eq!(descriptor.additional_clauses.len(), 1);
        assert!(player_descriptor(&[], 6, "s1_eternum").is_none());
    }

    #[test]
    fn descriptor_signature_ignores_structure_order() {
        let a = player_descriptor(&[location(1, 10, 40), location(2, 30, 20)], 6, "s1_eternum").unwrap();
        let b = player_descriptor(&[location(2, 30, 20), location(1, 10, 40)], 6, "s1_eternum").unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[tokio::test]
    async fn failed_feature_sync_can_be_retried() {
        let features = FeatureSync::new();
        let outcome = features
            .sync("market", false, || async { Err(SyncError::Directory("sql endpoint down".into())) })
            .await;
        assert_eq!(outcome, FeatureSyncOutcome::Failed);
        assert!(!features.is_synced("market"));
        assert!(!features.is_syncing("market"));

        let outcome = features.sync("market", false, || async { Ok(3) }).await;
        assert_eq!(outcome, FeatureSyncOutcome::Synced(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_feature_sync_can_be_retried() {
        let features = FeatureSync::new();
        let slow = features.sync("bank", false, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
        assert!(!features.is_syncing("bank"));
        assert!(!features.is_synced("bank"));

        let retry = features.sync("bank", false, || async { Ok(2) }).await;
        assert_eq!(retry, FeatureSyncOutcome::Synced(2));
    }
}
