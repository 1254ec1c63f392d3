//! Eternum Sync Core - indexer data synchronization
//!
//! This crate keeps a local entity store in step with the Torii indexer:
//! live updates are batched and deep-merged into the store, bulk loads pull
//! bounded regions and key sets, and a stream manager keeps exactly one live
//! bounded subscription current while the view moves.

pub mod config;
pub mod error;
pub mod merge;
pub mod model;
pub mod observability;
pub mod store;
pub mod sync;
pub mod torii;

pub use config::SyncConfig;
pub use error::{IndexerError, Result, StoreError, SyncError};
pub use merge::{merge_entity_patch, DeletionRepair, RepairRule};
pub use model::{Entity, EntityKey, EntityModels, ModelValue, PendingUpdate, Scalar};
pub use observability::{MetricsSnapshot, SyncMetrics};
pub use store::{EntityStore, MemoryStore, StoreChange};
pub use sync::{StreamManager, SwitchOutcome, SyncContext, UpdateQueue};
pub use torii::{Clause, IndexerClient, MemoryIndexer, StructureDirectory};
