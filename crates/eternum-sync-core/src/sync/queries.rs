//! Bounded and clause queries - one-shot bulk loads into the entity store.
//!
//! Each function builds one predicate, pages through the indexer and writes
//! every page straight into the store. Remote failures are logged and
//! returned; callers decide whether to swallow them.

use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::{model_name, Scalar};
use crate::store::EntityStore;
use crate::sync::stream_manager::ModelBounds;
use crate::torii::{
    Bounds, Clause, ComparisonOperator, IndexerClient, MemberValue, PatternMatching, Query,
};

pub const WORLD_CONFIG_ID: u128 = 999_999_999_999_999_999;
pub const BUILDING_CATEGORY_POPULATION_CONFIG_ID: u128 = 999_999_999_999_999_998;
pub const HYPERSTRUCTURE_CONFIG_ID: u128 = 999_999_999_999_999_997;
pub const ADMIN_BANK_ENTITY_ID: u32 = 999_999_999;

const CONFIG_MODELS: &[&str] = &[
    "WorldConfig",
    "HyperstructureConstructConfig",
    "WeightConfig",
    "ResourceFactoryConfig",
    "BuildingCategoryConfig",
    "ResourceBridgeWhitelistConfig",
    "StructureLevelConfig",
    "ResourceList",
    "SeasonPrize",
    "GuildWhitelist",
    "HyperstructureRequirements",
];

const HYPERSTRUCTURE_MODELS: &[&str] = &[
    "HyperstructureGlobals",
    "Hyperstructure",
    "HyperstructureShareholders",
    "PlayerRegisteredPoints",
    "PlayerConstructionPoints",
];

const SINGLE_KEY_MODELS: &[&str] = &["AddressName", "Structure", "Guild", "GuildMember"];

const EVENT_MODELS: &[&str] = &["SeasonEnded", "AcceptOrder", "SwapEvent", "LiquidityEvent"];

/// Models pulled for the selected structure.
pub const STRUCTURE_MODELS: &[&str] = &["Hyperstructure", "Resource", "Building", "StructureBuildings"];

/// Models pulled for each of the player's own structures.
pub const PLAYER_STRUCTURE_MODELS: &[&str] = &[
    "Hyperstructure",
    "Resource",
    "Building",
    "StructureBuildings",
    "ResourceArrival",
];

pub const BANK_MODELS: &[&str] = &["Hyperstructure", "Resource", "Building"];

const MARKET_MODELS: &[&str] = &["Market", "Liquidity"];

fn names(namespace: &str, models: &[&str]) -> Vec<String> {
    models.iter().map(|m| model_name(namespace, m)).collect()
}

/// Page through `query` and write every page into the store.
///
/// Returns the number of entities written.
pub async fn fetch_entities_into(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    query: Query,
) -> Result<usize> {
    fetch_pages(client, store, query, false).await
}

/// Same as [`fetch_entities_into`] for event messages.
pub async fn fetch_events_into(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    query: Query,
) -> Result<usize> {
    fetch_pages(client, store, query, true).await
}

async fn fetch_pages(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    mut query: Query,
    events: bool,
) -> Result<usize> {
    let mut written = 0;
    loop {
        let page = if events {
            client.fetch_event_messages(&query).await
        } else {
            client.fetch_entities(&query).await
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(error = %e, events, "Indexer fetch failed");
                return Err(e.into());
            }
        };

        let count = page.items.len();
        if count > 0 {
            let batch = page.items.into_iter().map(|e| (e.key, e.models)).collect();
            if let Err(e) = store.apply(batch) {
                tracing::error!(error = %e, "Failed to write fetched entities");
                return Err(e.into());
            }
        }
        written += count;
        tracing::debug!(page = count, total = written, "Fetched page");

        match page.next_cursor {
            Some(cursor) if count > 0 => query.cursor = Some(cursor),
            _ => break,
        }
    }
    Ok(written)
}

/// Entities whose single key is one of `keys`.
pub async fn get_entities_by_keys(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    keys: &[String],
    models: Vec<String>,
    limit: u32,
) -> Result<usize> {
    let clause = Clause::or_flat(
        keys.iter()
            .map(|k| Clause::single_key(k.clone(), models.clone()))
            .collect(),
    );
    fetch_entities_into(client, store, Query::new(Some(clause), models, limit)).await
}

/// Entities of any of `models` positioned inside `bounds`.
pub async fn get_entities_in_bounds(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    bounds: &Bounds,
    models: &[ModelBounds],
    limit: u32,
) -> Result<usize> {
    let clause = Clause::or_flat(
        models
            .iter()
            .map(|m| Clause::within_bounds(&m.model, &m.col_field, &m.row_field, bounds))
            .collect(),
    );
    let model_names = models.iter().map(|m| m.model.clone()).collect();
    fetch_entities_into(client, store, Query::new(Some(clause), model_names, limit)).await
}

/// Every entity of `models` with `arity` keys.
pub async fn get_all_entities(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    arity: usize,
    models: Vec<String>,
    limit: u32,
) -> Result<usize> {
    let clause = Clause::wildcard(arity, PatternMatching::FixedLen, models.clone());
    fetch_entities_into(client, store, Query::new(Some(clause), models, limit)).await
}

/// Config entities: the singleton config ids plus wildcarded one and two key configs.
pub fn config_clause() -> Clause {
    Clause::or(vec![
        Clause::keys(
            [Some(WORLD_CONFIG_ID.to_string())],
            PatternMatching::VariableLen,
            vec![],
        ),
        Clause::keys(
            [Some(BUILDING_CATEGORY_POPULATION_CONFIG_ID.to_string()), None],
            PatternMatching::FixedLen,
            vec![],
        ),
        Clause::keys(
            [Some(HYPERSTRUCTURE_CONFIG_ID.to_string())],
            PatternMatching::VariableLen,
            vec![],
        ),
        Clause::wildcard(1, PatternMatching::FixedLen, vec![]),
        Clause::wildcard(2, PatternMatching::VariableLen, vec![]),
    ])
}

pub async fn fetch_config(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    let query = Query::new(
        Some(config_clause()),
        names(&config.namespace, CONFIG_MODELS),
        config.queries.entity_limit,
    );
    fetch_entities_into(client, store, query).await
}

/// Hyperstructure and leaderboard models keyed by one to three keys.
pub async fn fetch_hyperstructures(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    let clause = Clause::or(
        (1..=3)
            .map(|arity| Clause::wildcard(arity, PatternMatching::FixedLen, vec![]))
            .collect(),
    );
    let query = Query::new(
        Some(clause),
        names(&config.namespace, HYPERSTRUCTURE_MODELS),
        config.queries.entity_limit,
    );
    fetch_entities_into(client, store, query).await
}

pub async fn fetch_single_key_models(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    let query = Query::new(
        Some(Clause::wildcard(1, PatternMatching::FixedLen, vec![])),
        names(&config.namespace, SINGLE_KEY_MODELS),
        config.queries.entity_limit,
    );
    fetch_entities_into(client, store, query).await
}

/// Season and trade events.
pub async fn fetch_season_events(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    let query = Query::new(
        Some(Clause::wildcard(1, PatternMatching::VariableLen, vec![])),
        names(&config.namespace, EVENT_MODELS),
        config.queries.event_limit,
    );
    fetch_events_into(client, store, query).await
}

pub async fn fetch_tiles(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    get_all_entities(
        client,
        store,
        2,
        vec![config.model("Tile")],
        config.queries.entity_limit,
    )
    .await
}

/// Entities keyed by structure id or by structure position.
pub fn structure_clause(ids: &[u32], positions: &[(u32, u32)], models: &[String]) -> Clause {
    let by_id = ids.iter().map(|id| {
        Clause::keys(
            [Some(id.to_string())],
            PatternMatching::VariableLen,
            models.to_vec(),
        )
    });
    let by_position = positions.iter().map(|(x, y)| {
        Clause::keys(
            [Some(x.to_string()), Some(y.to_string())],
            PatternMatching::VariableLen,
            models.to_vec(),
        )
    });
    Clause::or_flat(by_id.chain(by_position).collect())
}

pub async fn fetch_structure_entities(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
    ids: &[u32],
    positions: &[(u32, u32)],
    models: &[&str],
) -> Result<usize> {
    let models = names(&config.namespace, models);
    let clause = structure_clause(ids, positions, &models);
    fetch_entities_into(
        client,
        store,
        Query::new(Some(clause), models, config.queries.entity_limit),
    )
    .await
}

/// Armies and donkeys owned by any of the structures.
pub async fn fetch_donkeys_and_armies(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
    structure_ids: &[u32],
) -> Result<usize> {
    let owners = structure_ids
        .iter()
        .map(|id| MemberValue::Primitive(Scalar::Unsigned((*id).into())))
        .collect();
    let explorer = config.model("ExplorerTroops");
    let clause = Clause::member(
        explorer.clone(),
        "owner",
        ComparisonOperator::In,
        MemberValue::List(owners),
    );
    fetch_entities_into(
        client,
        store,
        Query::new(
            Some(clause),
            vec![explorer, config.model("Resource")],
            config.queries.entity_limit,
        ),
    )
    .await
}

pub async fn fetch_market(
    client: &dyn IndexerClient,
    store: &dyn EntityStore,
    config: &SyncConfig,
) -> Result<usize> {
    let models = names(&config.namespace, MARKET_MODELS);
    let query = Query::new(
        Some(Clause::wildcard(1, PatternMatching::VariableLen, models.clone())),
        models,
        config.queries.entity_limit,
    );
    fetch_entities_into(client, store, query).await
}
