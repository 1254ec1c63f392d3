//! Sync orchestration - bootstrap sequence and fan-out loads.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::merge::DeletionRepair;
use crate::observability::SyncMetrics;
use crate::store::EntityStore;
use crate::sync::batch::UpdateQueue;
use crate::sync::loading::{LoadingState, LoadingStateKey};
use crate::sync::queries;
use crate::sync::request_queue::RequestQueue;
use crate::sync::stream_manager::StreamManager;
use crate::torii::{
    subscribe_entities_and_events, BoxedSubscription, IndexerClient, StructureDirectory,
    StructureLocation,
};

/// What the bootstrap found and which loads failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitialSyncReport {
    pub player_structures: Vec<StructureLocation>,
    /// The player owns nothing and views the map as a spectator.
    pub spectator: bool,
    /// Structure the view is centred on.
    pub selected: Option<StructureLocation>,
    pub failed_loads: Vec<String>,
}

/// Everything one sync session owns: the clients, the store writers and the queues.
pub struct SyncContext {
    config: SyncConfig,
    client: Arc<dyn IndexerClient>,
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn StructureDirectory>,
    updates: UpdateQueue,
    requests: RequestQueue,
    loading: LoadingState,
    metrics: Arc<SyncMetrics>,
    live: Mutex<Option<BoxedSubscription>>,
}

impl SyncContext {
    /// Build the context and start its update queue.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn IndexerClient>,
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn StructureDirectory>,
    ) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let repair = if config.repairs.enabled {
            DeletionRepair::new(&config.namespace)
        } else {
            DeletionRepair::empty()
        };
        let updates = UpdateQueue::spawn(store.clone(), repair, &config.updates, metrics.clone());
        let requests = RequestQueue::new(&config.requests, metrics.clone());

        Self {
            config,
            client,
            store,
            directory,
            updates,
            requests,
            loading: LoadingState::new(),
            metrics,
            live: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn IndexerClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn StructureDirectory> {
        &self.directory
    }

    pub fn updates(&self) -> &UpdateQueue {
        &self.updates
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn loading(&self) -> &LoadingState {
        &self.loading
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// A fresh stream manager feeding this context's update queue.
    pub fn stream_manager(&self) -> StreamManager {
        StreamManager::new(self.client.clone(), self.updates.sink(), self.metrics.clone())
    }

    pub fn has_live_subscription(&self) -> bool {
        self.live.lock().is_some()
    }

    /// Run the game-load sequence for `player`.
    ///
    /// Only a failure to open the live stream is returned; every bulk load
    /// failure is logged and listed in the report.
    pub async fn initial_sync(&self, player: &str) -> Result<InitialSyncReport> {
        let mut report = InitialSyncReport::default();

        let live = subscribe_entities_and_events(self.client.as_ref(), None, self.updates.sink()).await?;
        if let Some(previous) = self.live.lock().replace(live) {
            previous.cancel();
        }
        tracing::debug!("Live update stream open");

        report.player_structures = match self.directory.fetch_structures_by_owner(player).await {
            Ok(structures) => structures,
            Err(e) => {
                tracing::error!(error = %e, player, "Failed to fetch player structures");
                report.failed_loads.push("player_structures".to_string());
                Vec::new()
            }
        };

        if report.player_structures.is_empty() {
            report.spectator = true;
            report.selected = match self.directory.fetch_first_structure().await {
                Ok(Some(structure)) => Some(structure),
                Ok(None) => {
                    tracing::warn!("No structure available for spectator view");
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to fetch first structure");
                    report.failed_loads.push("first_structure".to_string());
                    None
                }
            };
            tracing::info!(
                structure = report.selected.as_ref().map(|s| s.entity_id),
                "No owned structures, entering spectator mode"
            );
        } else {
            report.selected = report.player_structures.first().cloned();
        }

        let client = self.client.as_ref();
        let store = self.store.as_ref();
        let config = &self.config;

        self.timed_load(
            "config",
            Some(LoadingStateKey::Config),
            &mut report,
            queries::fetch_config(client, store, config),
        )
        .await;
        self.timed_load(
            "hyperstructure",
            Some(LoadingStateKey::Hyperstructure),
            &mut report,
            queries::fetch_hyperstructures(client, store, config),
        )
        .await;
        self.timed_load(
            "single_key",
            Some(LoadingStateKey::SingleKey),
            &mut report,
            queries::fetch_single_key_models(client, store, config),
        )
        .await;
        self.timed_load(
            "events",
            Some(LoadingStateKey::Events),
            &mut report,
            queries::fetch_season_events(client, store, config),
        )
        .await;
        self.timed_load("tiles", None, &mut report, queries::fetch_tiles(client, store, config))
            .await;

        Ok(report)
    }

    async fn timed_load<F>(
        &self,
        name: &str,
        key: Option<LoadingStateKey>,
        report: &mut InitialSyncReport,
        load: F,
    ) where
        F: Future<Output = Result<usize>>,
    {
        if let Some(key) = key {
            self.loading.set(key, true);
        }
        let start = Instant::now();

        match load.await {
            Ok(entities) => {
                tracing::info!(
                    query = name,
                    entities,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Bulk query finished"
                );
            }
            Err(e) => {
                tracing::error!(query = name, error = %e, "Bulk query failed");
                report.failed_loads.push(name.to_string());
            }
        }

        if let Some(key) = key {
            self.loading.set(key, false);
        }
    }

    /// Queue the bulk load for the selected structure.
    pub fn sync_structure_data(&self, structure_id: u32, position: Option<(u32, u32)>) {
        self.loading.set(LoadingStateKey::SelectedStructure, true);
        let positions: Vec<(u32, u32)> = position.into_iter().collect();

        self.queue_load(
            "structure",
            move |client, store, config| async move {
                queries::fetch_structure_entities(
                    client.as_ref(),
                    store.as_ref(),
                    &config,
                    &[structure_id],
                    &positions,
                    queries::STRUCTURE_MODELS,
                )
                .await
            },
            &[LoadingStateKey::SelectedStructure],
        );
    }

    /// Queue the bulk loads for the player's own structures.
    pub fn sync_player_structures_data(&self, structures: &[StructureLocation]) {
        for key in [
            LoadingStateKey::PlayerStructuresOneKey,
            LoadingStateKey::PlayerStructuresTwoKey,
            LoadingStateKey::DonkeysAndArmies,
        ] {
            self.loading.set(key, true);
        }

        let ids: Vec<u32> = structures.iter().map(|s| s.entity_id).collect();
        let positions: Vec<(u32, u32)> = structures.iter().map(StructureLocation::position).collect();

        let structure_ids = ids.clone();
        self.queue_load(
            "player_structures",
            move |client, store, config| async move {
                queries::fetch_structure_entities(
                    client.as_ref(),
                    store.as_ref(),
                    &config,
                    &structure_ids,
                    &positions,
                    queries::PLAYER_STRUCTURE_MODELS,
                )
                .await
            },
            &[
                LoadingStateKey::PlayerStructuresOneKey,
                LoadingStateKey::PlayerStructuresTwoKey,
            ],
        );
        self.queue_load(
            "donkeys_and_armies",
            move |client, store, config| async move {
                queries::fetch_donkeys_and_armies(client.as_ref(), store.as_ref(), &config, &ids).await
            },
            &[LoadingStateKey::DonkeysAndArmies],
        );
    }

    /// Queue the bank and market loads.
    pub fn sync_market_and_bank_data(&self) {
        self.loading.set(LoadingStateKey::Market, true);
        self.loading.set(LoadingStateKey::Bank, true);

        self.queue_load(
            "bank",
            |client, store, config| async move {
                queries::fetch_structure_entities(
                    client.as_ref(),
                    store.as_ref(),
                    &config,
                    &[queries::ADMIN_BANK_ENTITY_ID],
                    &[],
                    queries::BANK_MODELS,
                )
                .await
            },
            &[LoadingStateKey::Bank],
        );
        self.queue_load(
            "market",
            |client, store, config| async move {
                queries::fetch_market(client.as_ref(), store.as_ref(), &config).await
            },
            &[LoadingStateKey::Market],
        );
    }

    /// Push a load onto the request queue; its loading flags clear when it settles.
    fn queue_load<F, Fut>(&self, name: &'static str, load: F, clears: &[LoadingStateKey])
    where
        F: FnOnce(Arc<dyn IndexerClient>, Arc<dyn EntityStore>, SyncConfig) -> Fut,
        Fut: Future<Output = Result<usize>> + Send + 'static,
    {
        let task = load(self.client.clone(), self.store.clone(), self.config.clone());
        let loading = self.loading.clone();
        let clears = clears.to_vec();

        self.requests.add(
            async move {
                let start = Instant::now();
                let entities = task.await?;
                tracing::info!(
                    query = name,
                    entities,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Fan-out query finished"
                );
                Ok(())
            },
            Some(Box::new(move || {
                for key in clears {
                    loading.set(key, false);
                }
            })),
        );
    }

    /// Close the live stream, drop queued requests and drain pending updates.
    pub async fn shutdown(&self) {
        let live = self.live.lock().take();
        if let Some(live) = live {
            live.cancel();
        }
        self.requests.shutdown();
        self.updates.shutdown().await;
    }
}
