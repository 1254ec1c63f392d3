//! Eternum Sync CLI - indexer sync tooling.
//!
//! - `eternum-sync init` - write a default `.eternum/sync.yaml`
//! - `eternum-sync config` - print the resolved configuration
//! - `eternum-sync simulate` - drive the sync pipeline with synthetic indexer traffic

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use eternum_sync_core::model::model_name;
use eternum_sync_core::sync::{SimulatorConfig, SyncSimulator};
use eternum_sync_core::torii::{StaticDirectory, StructureLocation};
use eternum_sync_core::{EntityModels, MemoryIndexer, MemoryStore, ModelValue, SyncConfig, SyncContext};

/// Player address used by `simulate`.
const SIMULATED_PLAYER: &str = "0x1";

#[derive(Parser)]
#[command(name = "eternum-sync")]
#[command(about = "Eternum indexer sync tooling", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize sync configuration for a project
    Init,

    /// Print the resolved configuration
    Config,

    /// Run the sync pipeline against simulated indexer traffic
    Simulate {
        /// How long to run
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Updates per second
        #[arg(long, default_value = "100")]
        rate: u32,

        /// Updates per burst
        #[arg(long, default_value = "10")]
        burst: u32,

        /// Share of updates that delete an existing entity (0 disables deletions)
        #[arg(long, default_value = "0.05")]
        deletion_ratio: f64,

        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let project_root = match cli.project {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Init => init_project(&project_root),
        Commands::Config => show_config(&project_root),
        Commands::Simulate {
            seconds,
            rate,
            burst,
            deletion_ratio,
            seed,
            json,
        } => {
            let simulator = SimulatorConfig {
                entities_per_second: rate,
                burst_size: burst,
                include_deletions: deletion_ratio > 0.0,
                deletion_ratio,
                seed,
                ..SimulatorConfig::default()
            };
            simulate(&project_root, Duration::from_secs(seconds), simulator, json).await
        }
    }
}

fn init_project(project_root: &Path) -> Result<()> {
    let config_path = SyncConfig::path_in(project_root);
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let default_config = serde_yaml::to_string(&SyncConfig::default())?;
    std::fs::write(&config_path, format!("# Eternum sync configuration\n\n{default_config}"))?;

    println!("Initialized sync configuration at {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Point torii_url at your indexer");
    println!("  2. Run: eternum-sync simulate --seconds 5");

    Ok(())
}

fn show_config(project_root: &Path) -> Result<()> {
    let config = SyncConfig::load_from_project(project_root)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn simulate(
    project_root: &Path,
    duration: Duration,
    simulator_config: SimulatorConfig,
    json: bool,
) -> Result<()> {
    let config = SyncConfig::load_from_project(project_root)?;
    tracing::info!(namespace = %config.namespace, "Starting simulated sync");

    let indexer = MemoryIndexer::new();
    let structures = seed_structures(&indexer, &config.namespace);
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(StaticDirectory::new(structures));

    let ctx = SyncContext::new(config.clone(), Arc::new(indexer.clone()), store.clone(), directory);
    let bootstrap = ctx.initial_sync(SIMULATED_PLAYER).await?;
    if !bootstrap.failed_loads.is_empty() {
        tracing::warn!(failed = ?bootstrap.failed_loads, "Some bulk loads failed");
    }
    ctx.sync_player_structures_data(&bootstrap.player_structures);

    let mut simulator = SyncSimulator::new(indexer, &config.namespace, simulator_config);
    simulator.run_for(duration).await;

    ctx.requests().idle().await;
    ctx.shutdown().await;

    let stats = simulator.stats();
    let metrics = ctx.metrics().snapshot();

    if json {
        let report = serde_json::json!({
            "simulator": stats,
            "metrics": metrics,
            "store_entities": store.len(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Simulated Sync Report");
    println!("=====================");
    println!();
    println!("Generated:   {}", stats.total_generated);
    println!("Upserts:     {}", stats.total_upserts);
    println!("Deletions:   {}", stats.total_deletions);
    println!("Publish avg: {:.3} ms (peak {:.3} ms)", stats.average_publish_ms, stats.peak_publish_ms);
    println!();
    println!("Batches:     {}", metrics.batches_flushed);
    println!("Applied:     {}", metrics.updates_applied);
    println!("Dropped:     {}", metrics.updates_dropped);
    println!("Repaired:    {}", metrics.repairs_applied);
    println!();
    println!("Store entities: {}", store.len());

    Ok(())
}

/// Register a few player structures with the indexer so bootstrap has something to load.
fn seed_structures(indexer: &MemoryIndexer, namespace: &str) -> Vec<StructureLocation> {
    let structure = model_name(namespace, "Structure");
    (0..3u32)
        .map(|i| {
            let entity_id = 100 + i;
            let (coord_x, coord_y) = (10 + i * 4, 20 + i * 3);
            let base = ModelValue::structure(
                "StructureBase",
                [
                    ("coord_x", ModelValue::u32(coord_x)),
                    ("coord_y", ModelValue::u32(coord_y)),
                ],
            );
            indexer.upsert(
                vec![entity_id.to_string()],
                EntityModels::new().with(
                    structure.clone(),
                    ModelValue::structure(
                        &structure,
                        [
                            ("entity_id", ModelValue::u32(entity_id).as_key()),
                            ("owner", ModelValue::address(SIMULATED_PLAYER)),
                            ("base", base),
                        ],
                    ),
                ),
            );
            StructureLocation {
                entity_id,
                owner: SIMULATED_PLAYER.to_string(),
                coord_x,
                coord_y,
            }
        })
        .collect()
}
