//! Torii - the indexer contract consumed by the sync layer.

pub mod clause;
pub mod client;
pub mod directory;
pub mod memory;

pub use clause::{
    Bounds, Clause, ComparisonOperator, CompositeClause, KeysClause, LogicalOperator,
    MemberClause, MemberValue, PatternMatching,
};
pub use client::{
    subscribe_entities_and_events, BoxedSubscription, CombinedSubscription, IndexerClient, Page,
    Query, SubscriptionHandle, UpdateSink,
};
pub use directory::{
    format_address_for_query, SqlDirectory, StaticDirectory, StructureDirectory,
    StructureLocation,
};
pub use memory::MemoryIndexer;
