//! Sync traffic simulator.
//!
//! Generates weighted random model updates and deletions and publishes them
//! through a [`MemoryIndexer`], so they reach the store via the same live
//! subscription and batching queue as real traffic.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::{model_name, EntityKey, EntityModels, ModelValue};
use crate::torii::MemoryIndexer;

const MAX_HISTORY: usize = 100;

/// Chance that an upsert targets an entity that already exists.
const REUSE_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulatedModel {
    ExplorerTroops,
    Structure,
    Resource,
    Building,
    Tile,
    Market,
}

impl SimulatedModel {
    pub fn name(self) -> &'static str {
        match self {
            Self::ExplorerTroops => "ExplorerTroops",
            Self::Structure => "Structure",
            Self::Resource => "Resource",
            Self::Building => "Building",
            Self::Tile => "Tile",
            Self::Market => "Market",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub entities_per_second: u32,
    pub burst_size: u32,
    pub model_weights: Vec<(SimulatedModel, u32)>,
    pub include_deletions: bool,
    pub deletion_ratio: f64,
    pub logging: bool,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            entities_per_second: 100,
            burst_size: 10,
            model_weights: vec![
                (SimulatedModel::ExplorerTroops, 3),
                (SimulatedModel::Structure, 2),
                (SimulatedModel::Resource, 4),
                (SimulatedModel::Building, 1),
                (SimulatedModel::Tile, 5),
                (SimulatedModel::Market, 1),
            ],
            include_deletions: true,
            deletion_ratio: 0.05,
            logging: false,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// Time between bursts for the configured rate.
    pub fn interval(&self) -> Duration {
        let bursts_per_second = self.entities_per_second.max(1) as f64 / self.burst_size.max(1) as f64;
        Duration::from_secs_f64(1.0 / bursts_per_second)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulatorStats {
    pub total_generated: u64,
    pub total_upserts: u64,
    pub total_deletions: u64,
    pub total_published: u64,
    pub active_entities: usize,
    pub last_burst_ms: f64,
    pub last_publish_ms: f64,
    pub average_publish_ms: f64,
    pub peak_publish_ms: f64,
}

struct Tracked {
    key: EntityKey,
    model: SimulatedModel,
}

enum Generated {
    Upsert {
        keys: Vec<String>,
        model: SimulatedModel,
        patch: EntityModels,
    },
    Delete(Tracked),
}

pub struct SyncSimulator {
    indexer: MemoryIndexer,
    namespace: String,
    config: SimulatorConfig,
    weights: Option<WeightedIndex<u32>>,
    rng: StdRng,
    existing: Vec<Tracked>,
    history: VecDeque<f64>,
    stats: SimulatorStats,
}

impl SyncSimulator {
    pub fn new(indexer: MemoryIndexer, namespace: &str, config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let weights = WeightedIndex::new(config.model_weights.iter().map(|(_, w)| *w)).ok();
        if weights.is_none() {
            tracing::warn!("No usable model weights, every update will be a Tile");
        }

        Self {
            indexer,
            namespace: namespace.to_string(),
            config,
            weights,
            rng,
            existing: Vec::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
            stats: SimulatorStats::default(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            active_entities: self.existing.len(),
            ..self.stats.clone()
        }
    }

    /// Generate and publish one burst of `count` updates.
    pub fn burst(&mut self, count: u32) {
        let started = Instant::now();
        let generated: Vec<Generated> = (0..count).map(|_| self.generate()).collect();
        self.stats.total_generated += u64::from(count);

        let publish_started = Instant::now();
        let mut published = 0;
        for item in generated {
            match item {
                Generated::Upsert { keys, model, patch } => {
                    let key = self.indexer.upsert(keys, patch);
                    if !self.existing.iter().any(|t| t.key == key) {
                        self.existing.push(Tracked { key, model });
                    }
                }
                Generated::Delete(tracked) => {
                    // Explorers go away the way the indexer reports them: as an empty model.
                    let removed = if tracked.model == SimulatedModel::ExplorerTroops {
                        self.indexer
                            .remove_model(&tracked.key, &model_name(&self.namespace, tracked.model.name()))
                    } else {
                        self.indexer.remove(&tracked.key)
                    };
                    if !removed {
                        continue;
                    }
                }
            }
            published += 1;
        }
        self.stats.total_published += published;
        self.record_publish(publish_started.elapsed());
        self.stats.last_burst_ms = millis(started.elapsed());

        if self.config.logging && self.stats.total_generated % 100 == 0 {
            self.log_stats();
        }
    }

    /// Publish bursts at the configured rate for `duration`.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        let mut ticker = tokio::time::interval(self.config.interval());
        tracing::info!(
            rate = self.config.entities_per_second,
            burst = self.config.burst_size,
            interval_ms = millis(self.config.interval()),
            "Simulator starting"
        );

        loop {
            ticker.tick().await;
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            self.burst(self.config.burst_size);
        }
        self.log_stats();
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            generated = stats.total_generated,
            upserts = stats.total_upserts,
            deletions = stats.total_deletions,
            published = stats.total_published,
            active = stats.active_entities,
            last_ms = stats.last_publish_ms,
            avg_ms = stats.average_publish_ms,
            peak_ms = stats.peak_publish_ms,
            "Simulator stats"
        );
    }

    fn generate(&mut self) -> Generated {
        let delete = self.config.include_deletions
            && !self.existing.is_empty()
            && self.rng.gen_bool(self.config.deletion_ratio.clamp(0.0, 1.0));
        if delete {
            let index = self.rng.gen_range(0..self.existing.len());
            self.stats.total_deletions += 1;
            return Generated::Delete(self.existing.swap_remove(index));
        }

        self.stats.total_upserts += 1;
        let model = match &self.weights {
            Some(weights) => self.config.model_weights[weights.sample(&mut self.rng)].0,
            None => SimulatedModel::Tile,
        };

        let reuse =
            self.existing.iter().any(|t| t.model == model) && self.rng.gen_bool(REUSE_RATIO);
        let keys = if reuse {
            let candidates: Vec<&Tracked> = self.existing.iter().filter(|t| t.model == model).collect();
            let pick = candidates[self.rng.gen_range(0..candidates.len())];
            match self.indexer_keys(&pick.key) {
                Some(keys) => keys,
                None => self.fresh_keys(model),
            }
        } else {
            self.fresh_keys(model)
        };

        let patch = EntityModels::new().with(model_name(&self.namespace, model.name()), self.model_data(model, &keys));
        Generated::Upsert { keys, model, patch }
    }

    fn indexer_keys(&self, key: &EntityKey) -> Option<Vec<String>> {
        self.indexer.keys_of(key)
    }

    fn fresh_keys(&mut self, model: SimulatedModel) -> Vec<String> {
        match model {
            SimulatedModel::Tile => vec![
                self.rng.gen_range(0..1_000u32).to_string(),
                self.rng.gen_range(0..1_000u32).to_string(),
            ],
            SimulatedModel::Building => vec![
                self.rng.gen_range(0..1_000u32).to_string(),
                self.rng.gen_range(0..1_000u32).to_string(),
                self.rng.gen_range(0..10u32).to_string(),
                self.rng.gen_range(0..10u32).to_string(),
            ],
            SimulatedModel::Resource => vec![
                self.rng.gen_range(1..100_000u32).to_string(),
                self.rng.gen_range(1..30u32).to_string(),
            ],
            _ => vec![self.rng.gen_range(1..100_000u32).to_string()],
        }
    }

    fn model_data(&mut self, model: SimulatedModel, keys: &[String]) -> ModelValue {
        let key = |i: usize| keys.get(i).and_then(|k| k.parse::<u32>().ok()).unwrap_or(0);
        let rng = &mut self.rng;
        match model {
            SimulatedModel::ExplorerTroops => ModelValue::structure(
                "ExplorerTroops",
                [
                    ("explorer_id", ModelValue::u32(key(0)).as_key()),
                    ("owner", ModelValue::u32(rng.gen_range(1..100_000))),
                    (
                        "coord",
                        ModelValue::structure(
                            "Coord",
                            [
                                ("x", ModelValue::u32(rng.gen_range(0..1_000))),
                                ("y", ModelValue::u32(rng.gen_range(0..1_000))),
                            ],
                        ),
                    ),
                    (
                        "troops",
                        ModelValue::structure(
                            "Troops",
                            [("count", ModelValue::u128(rng.gen_range(0..1_000_000)))],
                        ),
                    ),
                ],
            ),
            SimulatedModel::Structure => ModelValue::structure(
                "Structure",
                [
                    ("entity_id", ModelValue::u32(key(0)).as_key()),
                    (
                        "base",
                        ModelValue::structure(
                            "StructureBase",
                            [
                                ("coord_x", ModelValue::u32(rng.gen_range(0..1_000))),
                                ("coord_y", ModelValue::u32(rng.gen_range(0..1_000))),
                                ("level", ModelValue::u8(rng.gen_range(0..4))),
                            ],
                        ),
                    ),
                ],
            ),
            SimulatedModel::Resource => ModelValue::structure(
                "Resource",
                [
                    ("entity_id", ModelValue::u32(key(0)).as_key()),
                    ("resource_type", ModelValue::u8(key(1) as u8).as_key()),
                    ("balance", ModelValue::u128(rng.gen_range(0..1_000_000))),
                ],
            ),
            SimulatedModel::Building => ModelValue::structure(
                "Building",
                [
                    ("outer_col", ModelValue::u32(key(0)).as_key()),
                    ("outer_row", ModelValue::u32(key(1)).as_key()),
                    ("inner_col", ModelValue::u32(key(2)).as_key()),
                    ("inner_row", ModelValue::u32(key(3)).as_key()),
                    ("category", ModelValue::u8(rng.gen_range(0..10))),
                    ("paused", ModelValue::bool(rng.gen_bool(0.1))),
                ],
            ),
            SimulatedModel::Tile => ModelValue::structure(
                "Tile",
                [
                    ("col", ModelValue::u32(key(0)).as_key()),
                    ("row", ModelValue::u32(key(1)).as_key()),
                    ("biome", ModelValue::u8(rng.gen_range(0..16))),
                    ("occupier_id", ModelValue::u32(rng.gen_range(0..100_000))),
                ],
            ),
            SimulatedModel::Market => ModelValue::structure(
                "Market",
                [
                    ("resource_type", ModelValue::u8(key(0) as u8).as_key()),
                    ("lords_amount", ModelValue::u128(rng.gen_range(0..1_000_000))),
                    ("resource_amount", ModelValue::u128(rng.gen_range(0..1_000_000))),
                ],
            ),
        }
    }

    fn record_publish(&mut self, elapsed: Duration) {
        let ms = millis(elapsed);
        self.history.push_back(ms);
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.stats.last_publish_ms = ms;
        self.stats.average_publish_ms = self.history.iter().sum::<f64>() / self.history.len() as f64;
        self.stats.peak_publish_ms = self.stats.peak_publish_ms.max(ms);
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(config: SimulatorConfig) -> (MemoryIndexer, SyncSimulator) {
        let indexer = MemoryIndexer::new();
        let simulator = SyncSimulator::new(
            indexer.clone(),
            "s1_eternum",
            SimulatorConfig {
                seed: Some(7),
                ..config
            },
        );
        (indexer, simulator)
    }

    #[test]
    fn interval_follows_rate_and_burst() {
        let config = SimulatorConfig {
            entities_per_second: 100,
            burst_size: 10,
            ..SimulatorConfig::default()
        };
        assert_eq!(config.interval(), Duration::from_millis(100));
    }

    #[test]
    fn burst_counts_add_up() {
        let (indexer, mut simulator) = seeded(SimulatorConfig {
            deletion_ratio: 0.2,
            ..SimulatorConfig::default()
        });
        for _ in 0..20 {
            simulator.burst(10);
        }

        let stats = simulator.stats();
        assert_eq!(stats.total_generated, 200);
        assert_eq!(stats.total_upserts + stats.total_deletions, 200);
        assert!(stats.total_deletions > 0);
        assert!(stats.peak_publish_ms >= stats.average_publish_ms);
        assert!(stats.active_entities > 0);
        assert!(indexer.entity_count() > 0);
    }

    #[test]
    fn no_deletions_when_disabled() {
        let (_, mut simulator) = seeded(SimulatorConfig {
            include_deletions: false,
            deletion_ratio: 1.0,
            ..SimulatorConfig::default()
        });
        simulator.burst(50);
        assert_eq!(simulator.stats().total_deletions, 0);
    }
}
